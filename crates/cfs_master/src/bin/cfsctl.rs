//! Admin client for the cfs master.

use std::time::Duration;

use cfs_master::rpc_service::{AdminClient, AdminReply, AdminRequest, AdminResponse};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cfsctl")]
#[command(about = "Admin client for the cfs master", long_about = None)]
struct Args {
    /// Any master; requests are redirected to the leader.
    #[arg(long, env = "CFS_MASTER", default_value = "127.0.0.1:17010")]
    target: String,
    #[arg(long, default_value_t = 60_000)]
    timeout_ms: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the cluster summary as JSON.
    Cluster,
    /// Show data and meta nodes with their node sets.
    Topology,
    /// Print raft status of the target master.
    Raft,
    /// List bad disk records.
    BadPartitions,
    CreateVolume {
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = 3)]
        replicas: usize,
        #[arg(long, default_value_t = 100)]
        capacity_gb: u64,
        /// 0 uses the master default.
        #[arg(long, default_value_t = 0)]
        partition_size_gb: u64,
    },
    UpdateVolume {
        #[arg(long)]
        name: String,
        #[arg(long)]
        capacity_gb: u64,
    },
    DeleteVolume {
        #[arg(long)]
        name: String,
    },
    /// Show a volume and its partitions.
    Volume {
        #[arg(long)]
        name: String,
    },
    CreateDataPartitions {
        #[arg(long)]
        volume: String,
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Ask every replica of a data partition for a checksum.
    LoadDataPartition {
        #[arg(long)]
        id: u64,
    },
    /// Move one replica of a data partition off a node.
    DecommissionDataPartition {
        #[arg(long)]
        addr: String,
        #[arg(long)]
        id: u64,
    },
    AddDataNode {
        #[arg(long)]
        addr: String,
    },
    AddMetaNode {
        #[arg(long)]
        addr: String,
    },
    /// Drain a data node and remove it.
    DataNodeOffline {
        #[arg(long)]
        addr: String,
    },
    /// Drain a meta node and remove it.
    MetaNodeOffline {
        #[arg(long)]
        addr: String,
    },
    DecommissionDisk {
        #[arg(long)]
        addr: String,
        #[arg(long)]
        disk: String,
    },
    ClearBadDisk {
        #[arg(long)]
        addr: String,
        #[arg(long)]
        disk: String,
    },
    AutoAllocate {
        #[arg(long, action = clap::ArgAction::Set, value_parser = clap::value_parser!(bool))]
        enabled: bool,
    },
    MetaNodeThreshold {
        #[arg(long)]
        threshold: f32,
    },
    AddRaftNode {
        #[arg(long)]
        id: u64,
        #[arg(long)]
        addr: String,
    },
    RemoveRaftNode {
        #[arg(long)]
        id: u64,
        #[arg(long)]
        addr: String,
    },
}

impl Command {
    fn into_request(self) -> AdminRequest {
        match self {
            Command::Cluster => AdminRequest::ClusterView,
            Command::Topology => AdminRequest::TopologyView,
            Command::Raft => AdminRequest::RaftStatus,
            Command::BadPartitions => AdminRequest::BadPartitions,
            Command::CreateVolume {
                name,
                replicas,
                capacity_gb,
                partition_size_gb,
            } => AdminRequest::CreateVolume {
                name,
                replica_num: replicas,
                data_partition_size_gb: partition_size_gb,
                capacity_gb,
            },
            Command::UpdateVolume { name, capacity_gb } => {
                AdminRequest::UpdateVolume { name, capacity_gb }
            }
            Command::DeleteVolume { name } => AdminRequest::MarkDeleteVolume { name },
            Command::Volume { name } => AdminRequest::GetVolume { name },
            Command::CreateDataPartitions { volume, count } => {
                AdminRequest::CreateDataPartitions { volume, count }
            }
            Command::LoadDataPartition { id } => AdminRequest::LoadDataPartition { partition_id: id },
            Command::DecommissionDataPartition { addr, id } => {
                AdminRequest::DecommissionDataPartition {
                    addr,
                    partition_id: id,
                }
            }
            Command::AddDataNode { addr } => AdminRequest::AddDataNode { addr },
            Command::AddMetaNode { addr } => AdminRequest::AddMetaNode { addr },
            Command::DataNodeOffline { addr } => AdminRequest::DataNodeOffline { addr },
            Command::MetaNodeOffline { addr } => AdminRequest::DecommissionMetaNode { addr },
            Command::DecommissionDisk { addr, disk } => AdminRequest::DecommissionDisk {
                addr,
                disk_path: disk,
            },
            Command::ClearBadDisk { addr, disk } => AdminRequest::ClearBadDisk {
                addr,
                disk_path: disk,
            },
            Command::AutoAllocate { enabled } => AdminRequest::SetAutoAllocate { enabled },
            Command::MetaNodeThreshold { threshold } => {
                AdminRequest::SetMetaNodeThreshold { threshold }
            }
            Command::AddRaftNode { id, addr } => AdminRequest::AddRaftNode { id, addr },
            Command::RemoveRaftNode { id, addr } => AdminRequest::RemoveRaftNode { id, addr },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = AdminClient::new(args.target, Duration::from_millis(args.timeout_ms));
    let resp = client.call(&args.command.into_request()).await?;

    let reply = match resp {
        AdminResponse::Ok(reply) => reply,
        AdminResponse::Error(err) => {
            let mut msg = format!("{}: {}", err.code, err.message);
            if let Some(leader) = err.leader {
                msg.push_str(&format!(" (leader {leader})"));
            }
            anyhow::bail!(msg);
        }
    };

    match reply {
        AdminReply::Done => println!("ok"),
        AdminReply::Id(id) => println!("ok id={id}"),
        AdminReply::Ids(ids) => println!("ok ids={ids:?}"),
        AdminReply::MovedTo(Some(host)) => println!("ok moved to {host}"),
        AdminReply::MovedTo(None) => println!("ok (replica already gone)"),
        AdminReply::Topology(topology) => {
            let mut rows = Vec::new();
            for node in &topology.data_nodes {
                rows.push(vec![
                    "data".to_string(),
                    node.id.to_string(),
                    node.addr.clone(),
                    node.node_set_id.to_string(),
                    node_state(node.is_active, node.decommissioning),
                    node.partitions.len().to_string(),
                ]);
            }
            for node in &topology.meta_nodes {
                rows.push(vec![
                    "meta".to_string(),
                    node.id.to_string(),
                    node.addr.clone(),
                    node.node_set_id.to_string(),
                    node_state(node.is_active, node.decommissioning),
                    node.partitions.len().to_string(),
                ]);
            }
            if rows.is_empty() {
                println!("no nodes registered");
            } else {
                print_ascii_table(
                    &["KIND", "ID", "ADDR", "NODE SET", "STATE", "PARTITIONS"],
                    &rows,
                );
            }
        }
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}

fn node_state(active: bool, decommissioning: bool) -> String {
    match (active, decommissioning) {
        (_, true) => "decommissioning",
        (true, false) => "active",
        (false, false) => "inactive",
    }
    .to_string()
}

fn print_ascii_table(headers: &[&str], rows: &[Vec<String>]) {
    let mut widths = headers.iter().map(|h| h.len()).collect::<Vec<_>>();
    for row in rows {
        for (idx, cell) in row.iter().enumerate() {
            if idx >= widths.len() {
                widths.push(cell.len());
            } else {
                widths[idx] = widths[idx].max(cell.len());
            }
        }
    }

    let mut separator = String::from("+");
    for w in &widths {
        separator.push_str(&"-".repeat(*w + 2));
        separator.push('+');
    }

    println!("{separator}");
    print!("|");
    for (idx, header) in headers.iter().enumerate() {
        print!(" {:width$} |", header, width = widths[idx]);
    }
    println!();
    println!("{separator}");
    for row in rows {
        print!("|");
        for (idx, cell) in row.iter().enumerate() {
            print!(" {:width$} |", cell, width = widths[idx]);
        }
        println!();
    }
    println!("{separator}");
}
