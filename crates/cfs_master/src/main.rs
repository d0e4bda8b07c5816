// cfs-master binary entry point.
//
// Wires the raft file log and TCP transport to the master, then serves raft
// and admin traffic on one listener and runs the background schedulers.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cfs_master::config::MasterConfig;
use cfs_master::node_client::TcpNodeClient;
use cfs_master::{rpc_service, scheduler, Master};
use cfs_raft::raft::{Config as RaftConfig, FileLog, Member, NodeId, TcpTransport};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "cfs-master")]
#[command(about = "Control-plane master for the cfs distributed filesystem", long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a master replica.
    Node(NodeArgs),
}

#[derive(clap::Args, Clone, Debug)]
struct NodeArgs {
    #[arg(long, env = "CFS_NODE_ID")]
    node_id: NodeId,

    /// Address for raft and admin traffic.
    #[arg(long, env = "CFS_LISTEN", default_value = "127.0.0.1:17010")]
    listen: SocketAddr,

    /// Initial raft group as `id@host:port,...`.
    #[arg(long, env = "CFS_MEMBERS")]
    members: String,

    #[arg(long, env = "CFS_DATA_DIR", default_value = "cfs-master-data")]
    data_dir: PathBuf,

    #[arg(long, env = "CFS_CLUSTER_NAME", default_value = "cfs")]
    cluster_name: String,

    #[arg(long, env = "CFS_MIN_RAFT_MEMBERS", default_value_t = 3)]
    min_raft_members: usize,

    #[arg(long, env = "CFS_ELECTION_TIMEOUT_MIN_MS", default_value_t = 300)]
    election_timeout_min_ms: u64,

    #[arg(long, env = "CFS_ELECTION_TIMEOUT_MAX_MS", default_value_t = 600)]
    election_timeout_max_ms: u64,

    #[arg(long, env = "CFS_PROPOSE_TIMEOUT_MS", default_value_t = 5000)]
    propose_timeout_ms: u64,

    #[arg(long, env = "CFS_NODE_SET_CAPACITY", default_value_t = 18)]
    node_set_capacity: usize,

    /// Seconds without a heartbeat before a node is marked inactive.
    #[arg(long, env = "CFS_NODE_LIVENESS_TIMEOUT_SECS", default_value_t = 60)]
    node_liveness_timeout_secs: u64,

    #[arg(long, env = "CFS_LIVE_RATIO_THRESHOLD", default_value_t = 0.8)]
    live_ratio_threshold: f64,

    #[arg(long, env = "CFS_MIN_WRITABLE_DATA_PARTITIONS", default_value_t = 20)]
    min_writable_data_partitions: usize,

    #[arg(long, env = "CFS_INITIAL_DATA_PARTITIONS", default_value_t = 10)]
    initial_data_partitions: usize,

    #[arg(long, env = "CFS_META_NODE_THRESHOLD", default_value_t = 0.75)]
    meta_node_threshold: f32,

    #[arg(long, env = "CFS_REPLICA_TIMEOUT_MS", default_value_t = 30_000)]
    replica_timeout_ms: u64,

    #[arg(long, env = "CFS_AUTO_ALLOCATE_INTERVAL_MS", default_value_t = 60_000)]
    auto_allocate_interval_ms: u64,
}

impl NodeArgs {
    fn master_config(&self) -> MasterConfig {
        MasterConfig {
            cluster_name: self.cluster_name.clone(),
            node_set_capacity: self.node_set_capacity,
            node_liveness_timeout: Duration::from_secs(self.node_liveness_timeout_secs),
            live_ratio_threshold: self.live_ratio_threshold,
            min_writable_data_partitions: self.min_writable_data_partitions,
            initial_data_partitions: self.initial_data_partitions.max(1),
            meta_node_threshold: self.meta_node_threshold,
            replica_timeout: Duration::from_millis(self.replica_timeout_ms),
            auto_allocate_interval: Duration::from_millis(self.auto_allocate_interval_ms),
            ..MasterConfig::default()
        }
    }
}

fn parse_members(input: &str) -> anyhow::Result<BTreeMap<NodeId, SocketAddr>> {
    let mut out = BTreeMap::new();
    for part in input.split(',').filter(|s| !s.trim().is_empty()) {
        let (id, addr) = part
            .trim()
            .split_once('@')
            .with_context(|| format!("invalid member entry (expected id@host:port): {part}"))?;
        let id: NodeId = id.parse().context("invalid member id")?;
        let addr: SocketAddr = addr.parse().context("invalid member addr")?;
        out.insert(id, addr);
    }
    anyhow::ensure!(!out.is_empty(), "members is empty");
    Ok(out)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => run_node(args).await,
    }
}

async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    let members = parse_members(&args.members)?;
    match members.get(&args.node_id) {
        Some(addr) if *addr != args.listen => {
            tracing::warn!(node_id = args.node_id, member_addr = %addr, listen = %args.listen, "listen address differs from the advertised member address");
        }
        Some(_) => {}
        None => tracing::info!(node_id = args.node_id, "not in the initial member list; waiting to be added"),
    }

    let mut raft_config = RaftConfig::new(
        args.node_id,
        members
            .iter()
            .map(|(id, addr)| Member {
                id: *id,
                addr: addr.to_string(),
            })
            .collect(),
    );
    raft_config.min_members = args.min_raft_members;
    raft_config.election_timeout_min = Duration::from_millis(args.election_timeout_min_ms);
    raft_config.election_timeout_max = Duration::from_millis(args.election_timeout_max_ms);
    raft_config.propose_timeout = Duration::from_millis(args.propose_timeout_ms);

    let log_dir = args.data_dir.join("raft");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("create data dir {}", log_dir.display()))?;
    let store = Arc::new(FileLog::open_dir(&log_dir)?);
    let config = args.master_config();
    let node_client = Arc::new(TcpNodeClient::new(config.replica_timeout));
    let master = Master::new(
        config,
        raft_config,
        Arc::new(TcpTransport::new()),
        store,
        node_client,
    )?;

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind {}", args.listen))?;
    tracing::info!(node_id = args.node_id, listen = %args.listen, data_dir = %args.data_dir.display(), "cfs master starting");

    master.start();
    scheduler::spawn(master.clone());
    let server = tokio::spawn(rpc_service::serve(listener, master.clone()));

    tokio::select! {
        res = server => {
            res.context("server task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }
    master.shutdown().await;
    Ok(())
}
