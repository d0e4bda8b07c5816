//! TCP admin and heartbeat service.
//!
//! One listener per master carries both raft traffic from peer masters and
//! admin/ingest requests, so a raft member address is also where clients
//! are redirected on `NotLeader`. Every frame is length-prefixed JSON; the
//! request kind is told apart by shape.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use cfs_raft::raft::{
    read_frame, write_frame, RaftRpc, RaftRpcResponse, RaftStatus, ACCEPT_BACKOFF,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};

use crate::cluster::BadPartitionRecord;
use crate::error::{MasterError, Result};
use crate::heartbeat::{DataNodeHeartbeat, MetaNodeHeartbeat};
use crate::master::Master;
use crate::views::{
    ClusterView, DataNodeView, DataPartitionView, LoadReport, MetaNodeView, MetaPartitionView,
    TopologyView, VolStatInfo, VolumeView,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AdminRequest {
    ClusterView,
    TopologyView,
    BadPartitions,
    RaftStatus,
    CreateVolume {
        name: String,
        replica_num: usize,
        /// 0 picks the configured default.
        #[serde(default)]
        data_partition_size_gb: u64,
        capacity_gb: u64,
    },
    UpdateVolume {
        name: String,
        capacity_gb: u64,
    },
    MarkDeleteVolume {
        name: String,
    },
    GetVolume {
        name: String,
    },
    VolumeStat {
        name: String,
    },
    CreateDataPartitions {
        volume: String,
        count: usize,
    },
    GetDataPartition {
        partition_id: u64,
    },
    GetMetaPartition {
        partition_id: u64,
    },
    LoadDataPartition {
        partition_id: u64,
    },
    LoadMetaPartition {
        partition_id: u64,
    },
    DecommissionDataPartition {
        addr: String,
        partition_id: u64,
    },
    DecommissionMetaPartition {
        addr: String,
        partition_id: u64,
    },
    UpdateInodeIdRange {
        volume: String,
        start: u64,
    },
    AddDataNode {
        addr: String,
    },
    AddMetaNode {
        addr: String,
    },
    GetDataNode {
        addr: String,
    },
    GetMetaNode {
        addr: String,
    },
    DataNodeOffline {
        addr: String,
    },
    DecommissionMetaNode {
        addr: String,
    },
    DecommissionDisk {
        addr: String,
        disk_path: String,
    },
    ClearBadDisk {
        addr: String,
        disk_path: String,
    },
    SetAutoAllocate {
        enabled: bool,
    },
    SetMetaNodeThreshold {
        threshold: f32,
    },
    AddRaftNode {
        id: u64,
        addr: String,
    },
    RemoveRaftNode {
        id: u64,
        addr: String,
    },
    DataNodeHeartbeat(DataNodeHeartbeat),
    MetaNodeHeartbeat(MetaNodeHeartbeat),
}

impl AdminRequest {
    /// Requests that must reach the raft leader.
    fn is_mutation(&self) -> bool {
        !matches!(
            self,
            AdminRequest::ClusterView
                | AdminRequest::TopologyView
                | AdminRequest::BadPartitions
                | AdminRequest::RaftStatus
                | AdminRequest::GetVolume { .. }
                | AdminRequest::VolumeStat { .. }
                | AdminRequest::GetDataPartition { .. }
                | AdminRequest::GetMetaPartition { .. }
                | AdminRequest::GetDataNode { .. }
                | AdminRequest::GetMetaNode { .. }
                | AdminRequest::DataNodeHeartbeat(_)
                | AdminRequest::MetaNodeHeartbeat(_)
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AdminReply {
    Done,
    Id(u64),
    Ids(Vec<u64>),
    /// New host of a migrated replica; `None` when nothing had to move.
    MovedTo(Option<String>),
    Cluster(ClusterView),
    Topology(TopologyView),
    BadPartitions(Vec<BadPartitionRecord>),
    Raft(RaftStatus),
    Volume(VolumeView),
    VolumeStat(VolStatInfo),
    DataPartition(DataPartitionView),
    MetaPartition(MetaPartitionView),
    DataNode(DataNodeView),
    MetaNode(MetaNodeView),
    Load(LoadReport),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub leader: Option<String>,
    #[serde(default)]
    pub remaining: Vec<u64>,
}

impl From<&MasterError> for AdminError {
    fn from(err: &MasterError) -> Self {
        let (leader, remaining) = match err {
            MasterError::NotLeader { leader } => (leader.clone(), Vec::new()),
            MasterError::DecommissionIncomplete { remaining, .. } => (None, remaining.clone()),
            _ => (None, Vec::new()),
        };
        Self {
            code: err.code().to_string(),
            message: format!("{err:#}"),
            leader,
            remaining,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AdminResponse {
    Ok(AdminReply),
    Error(AdminError),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Incoming {
    Raft(RaftRpc),
    Admin(AdminRequest),
}

#[derive(Serialize)]
#[serde(untagged)]
enum Outgoing {
    Raft(RaftRpcResponse),
    Admin(AdminResponse),
}

/// Run one admin request against `master`.
pub async fn dispatch(master: &Master, req: AdminRequest) -> AdminResponse {
    let mutation = req.is_mutation();
    let res = execute(master, req).await;
    match res {
        Ok(reply) => AdminResponse::Ok(reply),
        Err(err) => {
            if mutation {
                tracing::info!(code = err.code(), error = %err, "admin request failed");
            } else {
                tracing::debug!(code = err.code(), error = %err, "admin request failed");
            }
            AdminResponse::Error(AdminError::from(&err))
        }
    }
}

async fn execute(master: &Master, req: AdminRequest) -> Result<AdminReply> {
    use AdminReply::*;
    let reply = match req {
        AdminRequest::ClusterView => Cluster(master.cluster_view().await),
        AdminRequest::TopologyView => Topology(master.topology_view()),
        AdminRequest::BadPartitions => BadPartitions(master.bad_partitions()),
        AdminRequest::RaftStatus => Raft(master.raft_status().await),
        AdminRequest::CreateVolume {
            name,
            replica_num,
            data_partition_size_gb,
            capacity_gb,
        } => {
            master
                .create_volume(&name, replica_num, data_partition_size_gb, capacity_gb)
                .await?;
            Done
        }
        AdminRequest::UpdateVolume { name, capacity_gb } => {
            master.update_volume(&name, capacity_gb).await?;
            Done
        }
        AdminRequest::MarkDeleteVolume { name } => {
            master.mark_delete_volume(&name).await?;
            Done
        }
        AdminRequest::GetVolume { name } => Volume(master.volume_view(&name)?),
        AdminRequest::VolumeStat { name } => VolumeStat(master.volume_stat(&name)?),
        AdminRequest::CreateDataPartitions { volume, count } => {
            Ids(master.create_data_partitions(&volume, count).await?)
        }
        AdminRequest::GetDataPartition { partition_id } => {
            DataPartition(master.data_partition_view(partition_id)?)
        }
        AdminRequest::GetMetaPartition { partition_id } => {
            MetaPartition(master.meta_partition_view(partition_id)?)
        }
        AdminRequest::LoadDataPartition { partition_id } => {
            Load(master.load_data_partition(partition_id).await?)
        }
        AdminRequest::LoadMetaPartition { partition_id } => {
            Load(master.load_meta_partition(partition_id).await?)
        }
        AdminRequest::DecommissionDataPartition { addr, partition_id } => {
            let moved = master
                .decommission_data_partition(&addr, partition_id, |err| {
                    tracing::error!(addr = %addr, partition_id, error = %err, "partition decommission failed");
                })
                .await?;
            MovedTo(moved)
        }
        AdminRequest::DecommissionMetaPartition { addr, partition_id } => {
            MovedTo(master.decommission_meta_partition(&addr, partition_id).await?)
        }
        AdminRequest::UpdateInodeIdRange { volume, start } => {
            Id(master.update_inode_id_range(&volume, start).await?)
        }
        AdminRequest::AddDataNode { addr } => Id(master.add_data_node(&addr).await?),
        AdminRequest::AddMetaNode { addr } => Id(master.add_meta_node(&addr).await?),
        AdminRequest::GetDataNode { addr } => DataNode(master.data_node_view(&addr)?),
        AdminRequest::GetMetaNode { addr } => MetaNode(master.meta_node_view(&addr)?),
        AdminRequest::DataNodeOffline { addr } => {
            master.data_node_offline(&addr).await?;
            Done
        }
        AdminRequest::DecommissionMetaNode { addr } => {
            master.decommission_meta_node(&addr).await?;
            Done
        }
        AdminRequest::DecommissionDisk { addr, disk_path } => {
            Ids(master.decommission_disk(&addr, &disk_path).await?)
        }
        AdminRequest::ClearBadDisk { addr, disk_path } => {
            master.clear_bad_disk(&addr, &disk_path).await?;
            Done
        }
        AdminRequest::SetAutoAllocate { enabled } => {
            master.set_auto_allocate(enabled).await?;
            Done
        }
        AdminRequest::SetMetaNodeThreshold { threshold } => {
            master.set_meta_node_threshold(threshold).await?;
            Done
        }
        AdminRequest::AddRaftNode { id, addr } => {
            master.add_raft_node(id, &addr).await?;
            Done
        }
        AdminRequest::RemoveRaftNode { id, addr } => {
            master.remove_raft_node(id, &addr).await?;
            Done
        }
        AdminRequest::DataNodeHeartbeat(report) => {
            master.handle_data_node_task_response(report)?;
            Done
        }
        AdminRequest::MetaNodeHeartbeat(report) => {
            master.handle_meta_node_task_response(report)?;
            Done
        }
    };
    Ok(reply)
}

/// Serve raft and admin traffic for `master` on `listener`.
pub async fn serve(listener: TcpListener, master: Arc<Master>) -> anyhow::Result<()> {
    let accepts = stream::unfold(listener, |listener| async move {
        let accepted = listener.accept().await;
        Some((accepted, listener))
    });
    serve_connections(accepts, master).await
}

/// Serve every connection `accepts` yields. Accept errors are logged and
/// retried after a short pause.
pub async fn serve_connections<S>(accepts: S, master: Arc<Master>) -> anyhow::Result<()>
where
    S: Stream<Item = io::Result<(TcpStream, SocketAddr)>>,
{
    futures_util::pin_mut!(accepts);
    while let Some(accepted) = accepts.next().await {
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(error = %err, peer = %peer, "set_nodelay failed");
        }
        let master = master.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, &master).await {
                tracing::debug!(error = ?err, peer = %peer, "connection closed with error");
            }
        });
    }
    Ok(())
}

async fn handle_connection(mut stream: TcpStream, master: &Master) -> anyhow::Result<()> {
    while let Some(incoming) = read_frame::<_, Incoming>(&mut stream).await? {
        let raft = master.raft();
        let outgoing = match incoming {
            Incoming::Raft(_) if raft.is_shutdown() => break,
            Incoming::Raft(RaftRpc::RequestVote(req)) => {
                Outgoing::Raft(RaftRpcResponse::RequestVote(raft.handle_request_vote(req).await))
            }
            Incoming::Raft(RaftRpc::AppendEntries(req)) => Outgoing::Raft(
                RaftRpcResponse::AppendEntries(raft.handle_append_entries(req).await),
            ),
            Incoming::Admin(req) => Outgoing::Admin(dispatch(master, req).await),
        };
        write_frame(&mut stream, &outgoing).await?;
    }
    Ok(())
}

/// Client for the admin service. Follows `NotLeader` redirects.
pub struct AdminClient {
    addr: String,
    timeout: Duration,
}

const MAX_REDIRECTS: usize = 3;

impl AdminClient {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    async fn call_once(&self, addr: &str, req: &AdminRequest) -> anyhow::Result<AdminResponse> {
        let exchange = async {
            let mut stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("connect master {addr}"))?;
            write_frame(&mut stream, req).await?;
            read_frame::<_, AdminResponse>(&mut stream)
                .await?
                .ok_or_else(|| anyhow!("master {addr} closed the connection"))
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| anyhow!("request to {addr} timed out"))?
    }

    /// Send `req`, retrying against the advertised leader on redirect.
    pub async fn call(&self, req: &AdminRequest) -> anyhow::Result<AdminResponse> {
        let mut addr = self.addr.clone();
        for _ in 0..MAX_REDIRECTS {
            let resp = self.call_once(&addr, req).await?;
            match &resp {
                AdminResponse::Error(err) if err.code == "NotLeader" => match &err.leader {
                    Some(leader) if *leader != addr => {
                        tracing::debug!(from = %addr, to = %leader, "following leader redirect");
                        addr = leader.clone();
                    }
                    _ => return Ok(resp),
                },
                _ => return Ok(resp),
            }
        }
        self.call_once(&addr, req).await
    }
}
