//! Shared helpers for integration tests.
//!
//! Masters run in-process over the local raft router with an in-memory log.
//! Data and meta nodes are simulated by `MockNodeClient`, which records every
//! instruction and can be told to fail for a given address.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use cfs_master::config::MasterConfig;
use cfs_master::heartbeat::{
    DataNodeHeartbeat, DataPartitionReport, MetaNodeHeartbeat, MetaPartitionReport,
};
use cfs_master::node_client::{
    BuildDataReplica, BuildMetaReplica, CreateDataReplica, CreateMetaReplica, NodeClient,
    ReplicaChecksum,
};
use cfs_master::partition::PartitionStatus;
use cfs_master::Master;
use cfs_raft::raft::{Config as RaftConfig, LocalRouter, LogStore, MemLog, Member, NodeId};

/// Upper bound for waiting on elections and replication.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeCall {
    CreateData { addr: String, id: u64 },
    BuildData { addr: String, id: u64, source: String },
    DeleteData { addr: String, id: u64 },
    CreateMeta { addr: String, id: u64, start: u64 },
    BuildMeta { addr: String, id: u64, source: String },
    DeleteMeta { addr: String, id: u64 },
    UpdateMetaRange { addr: String, id: u64, end: u64 },
    Load { addr: String, id: u64 },
}

/// In-memory stand-in for data and meta node processes.
#[derive(Default)]
pub struct MockNodeClient {
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<NodeCall>>,
    checksums: Mutex<HashMap<(String, u64), u64>>,
    build_delay: Mutex<Option<Duration>>,
}

impl MockNodeClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every instruction sent to `addr` fails until `heal`.
    pub fn fail(&self, addr: &str) {
        self.failing.lock().unwrap().insert(addr.to_string());
    }

    pub fn heal(&self, addr: &str) {
        self.failing.lock().unwrap().remove(addr);
    }

    /// Create and build instructions take `delay` before answering.
    pub fn slow_builds(&self, delay: Duration) {
        *self.build_delay.lock().unwrap() = Some(delay);
    }

    async fn build_pause(&self) {
        let delay = *self.build_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn calls(&self) -> Vec<NodeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn set_checksum(&self, addr: &str, id: u64, checksum: u64) {
        self.checksums
            .lock()
            .unwrap()
            .insert((addr.to_string(), id), checksum);
    }

    fn record(&self, addr: &str, call: NodeCall) -> anyhow::Result<()> {
        if self.failing.lock().unwrap().contains(addr) {
            return Err(anyhow!("node {addr} is unreachable"));
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn create_data_replica(&self, addr: &str, req: &CreateDataReplica) -> anyhow::Result<()> {
        self.build_pause().await;
        self.record(
            addr,
            NodeCall::CreateData {
                addr: addr.into(),
                id: req.partition_id,
            },
        )
    }

    async fn build_data_replica(&self, addr: &str, req: &BuildDataReplica) -> anyhow::Result<()> {
        self.build_pause().await;
        self.record(
            addr,
            NodeCall::BuildData {
                addr: addr.into(),
                id: req.partition_id,
                source: req.source.clone(),
            },
        )
    }

    async fn delete_data_replica(&self, addr: &str, partition_id: u64) -> anyhow::Result<()> {
        self.record(
            addr,
            NodeCall::DeleteData {
                addr: addr.into(),
                id: partition_id,
            },
        )
    }

    async fn create_meta_replica(&self, addr: &str, req: &CreateMetaReplica) -> anyhow::Result<()> {
        self.build_pause().await;
        self.record(
            addr,
            NodeCall::CreateMeta {
                addr: addr.into(),
                id: req.partition_id,
                start: req.start,
            },
        )
    }

    async fn build_meta_replica(&self, addr: &str, req: &BuildMetaReplica) -> anyhow::Result<()> {
        self.build_pause().await;
        self.record(
            addr,
            NodeCall::BuildMeta {
                addr: addr.into(),
                id: req.partition_id,
                source: req.source.clone(),
            },
        )
    }

    async fn delete_meta_replica(&self, addr: &str, partition_id: u64) -> anyhow::Result<()> {
        self.record(
            addr,
            NodeCall::DeleteMeta {
                addr: addr.into(),
                id: partition_id,
            },
        )
    }

    async fn update_meta_range(&self, addr: &str, partition_id: u64, end: u64) -> anyhow::Result<()> {
        self.record(
            addr,
            NodeCall::UpdateMetaRange {
                addr: addr.into(),
                id: partition_id,
                end,
            },
        )
    }

    async fn load_data_partition(&self, addr: &str, partition_id: u64) -> anyhow::Result<ReplicaChecksum> {
        self.record(
            addr,
            NodeCall::Load {
                addr: addr.into(),
                id: partition_id,
            },
        )?;
        let checksum = self
            .checksums
            .lock()
            .unwrap()
            .get(&(addr.to_string(), partition_id))
            .copied()
            .unwrap_or(partition_id);
        Ok(ReplicaChecksum { checksum, size: 0 })
    }

    async fn load_meta_partition(&self, addr: &str, partition_id: u64) -> anyhow::Result<ReplicaChecksum> {
        self.load_data_partition(addr, partition_id).await
    }
}

/// Master knobs sized for tests: one initial data partition, short
/// timeouts.
pub fn test_config() -> MasterConfig {
    MasterConfig {
        initial_data_partitions: 1,
        replica_timeout: Duration::from_secs(2),
        ..MasterConfig::default()
    }
}

pub fn raft_members(n: u64) -> Vec<Member> {
    (1..=n)
        .map(|id| Member {
            id,
            addr: format!("master-{id}"),
        })
        .collect()
}

pub fn fast_raft_config(node_id: NodeId, members: Vec<Member>) -> RaftConfig {
    let mut cfg = RaftConfig::new(node_id, members);
    cfg.tick_interval = Duration::from_millis(10);
    cfg.election_timeout_min = Duration::from_millis(80);
    cfg.election_timeout_max = Duration::from_millis(160);
    cfg.rpc_timeout = Duration::from_millis(100);
    cfg.propose_timeout = Duration::from_secs(3);
    cfg
}

pub struct TestCluster {
    pub router: Arc<LocalRouter>,
    pub masters: Vec<Arc<Master>>,
    pub stores: Vec<Arc<MemLog>>,
    pub nodes: Arc<MockNodeClient>,
}

impl TestCluster {
    /// Start `n` masters sharing one mock node fleet.
    pub fn start(n: u64, config: MasterConfig) -> Self {
        Self::start_with(n, config, |_| {})
    }

    pub fn start_with(n: u64, config: MasterConfig, tweak: impl Fn(&mut RaftConfig)) -> Self {
        let router = LocalRouter::new();
        let nodes = MockNodeClient::new();
        let mut masters = Vec::new();
        let mut stores = Vec::new();
        for id in 1..=n {
            let store = Arc::new(MemLog::default());
            let mut raft_config = fast_raft_config(id, raft_members(n));
            tweak(&mut raft_config);
            let master = start_master(&router, config.clone(), raft_config, store.clone(), nodes.clone());
            masters.push(master);
            stores.push(store);
        }
        Self {
            router,
            masters,
            stores,
            nodes,
        }
    }

    /// Wait for a leader that accepts proposals.
    pub async fn leader(&self) -> Arc<Master> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            for master in &self.masters {
                if !master.raft().is_shutdown() && master.raft().is_ready_leader().await {
                    return master.clone();
                }
            }
            assert!(Instant::now() < deadline, "no leader elected");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn followers(&self) -> Vec<Arc<Master>> {
        let mut out = Vec::new();
        for master in &self.masters {
            if !master.raft().is_shutdown() && !master.is_leader().await {
                out.push(master.clone());
            }
        }
        out
    }

    /// Wait until every running master has applied at least `index`.
    pub async fn wait_applied(&self, index: u64) {
        for master in self.masters.iter().filter(|m| !m.raft().is_shutdown()) {
            let master = master.clone();
            wait_until("followers catch up", move || master.applied_index() >= index).await;
        }
    }
}

pub fn start_master(
    router: &Arc<LocalRouter>,
    config: MasterConfig,
    raft_config: RaftConfig,
    store: Arc<dyn LogStore>,
    nodes: Arc<MockNodeClient>,
) -> Arc<Master> {
    let id = raft_config.node_id;
    let master = Master::new(config, raft_config, router.transport(id), store, nodes)
        .expect("build master");
    router.register(master.raft());
    master.start();
    master
}

/// Single master with its own router; returns the leader once ready.
pub async fn single_master(config: MasterConfig) -> (Arc<Master>, Arc<MockNodeClient>) {
    let cluster = TestCluster::start(1, config);
    let leader = cluster.leader().await;
    (leader, cluster.nodes)
}

pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn retry<T, E, F, Fut>(mut op: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        match op().await {
            Ok(value) => return value,
            Err(err) => {
                assert!(Instant::now() < deadline, "operation kept failing: {err:?}");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
}

pub fn data_addrs(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("10.0.0.{i}:6000")).collect()
}

pub fn meta_addrs(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("10.0.1.{i}:9021")).collect()
}

/// Register `data` and `meta` nodes on the leader.
pub async fn register_nodes(master: &Master, data: &[String], meta: &[String]) {
    for addr in data {
        master.add_data_node(addr).await.expect("add data node");
    }
    for addr in meta {
        master.add_meta_node(addr).await.expect("add meta node");
    }
}

pub fn data_heartbeat(
    addr: &str,
    seq: u64,
    partitions: Vec<DataPartitionReport>,
) -> DataNodeHeartbeat {
    DataNodeHeartbeat {
        addr: addr.to_string(),
        seq,
        total: 1 << 40,
        used: 1 << 30,
        bad_disks: Vec::new(),
        partitions,
    }
}

pub fn data_report(partition_id: u64, disk_path: &str, is_leader: bool) -> DataPartitionReport {
    DataPartitionReport {
        partition_id,
        status: PartitionStatus::ReadWrite,
        is_leader,
        used: 1 << 20,
        total: 120 << 30,
        disk_path: disk_path.to_string(),
    }
}

pub fn meta_heartbeat(
    addr: &str,
    seq: u64,
    used_percent: u64,
    partitions: Vec<MetaPartitionReport>,
) -> MetaNodeHeartbeat {
    MetaNodeHeartbeat {
        addr: addr.to_string(),
        seq,
        total_memory: 100,
        used_memory: used_percent,
        partitions,
    }
}

pub fn meta_report(partition_id: u64, max_inode_id: u64) -> MetaPartitionReport {
    MetaPartitionReport {
        partition_id,
        status: PartitionStatus::ReadWrite,
        is_leader: false,
        max_inode_id,
    }
}
