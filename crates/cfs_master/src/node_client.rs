//! Instructions the master sends to data and meta nodes.
//!
//! The master never moves data itself. It asks nodes to create, build (copy
//! from a peer) and delete replicas, and to report checksums when an
//! operator requests a consistency load.

use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use cfs_raft::raft::{read_frame, write_frame};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateDataReplica {
    pub partition_id: u64,
    pub volume: String,
    pub size_gb: u64,
    pub members: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildDataReplica {
    pub partition_id: u64,
    pub volume: String,
    pub size_gb: u64,
    /// Surviving replica to copy from.
    pub source: String,
    pub members: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateMetaReplica {
    pub partition_id: u64,
    pub volume: String,
    pub start: u64,
    pub end: u64,
    pub members: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildMetaReplica {
    pub partition_id: u64,
    pub volume: String,
    pub start: u64,
    pub end: u64,
    /// Peer whose log the new replica replays.
    pub source: String,
    pub members: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaChecksum {
    pub checksum: u64,
    pub size: u64,
}

#[async_trait]
pub trait NodeClient: Send + Sync + 'static {
    async fn create_data_replica(&self, addr: &str, req: &CreateDataReplica) -> anyhow::Result<()>;
    async fn build_data_replica(&self, addr: &str, req: &BuildDataReplica) -> anyhow::Result<()>;
    async fn delete_data_replica(&self, addr: &str, partition_id: u64) -> anyhow::Result<()>;
    async fn create_meta_replica(&self, addr: &str, req: &CreateMetaReplica) -> anyhow::Result<()>;
    async fn build_meta_replica(&self, addr: &str, req: &BuildMetaReplica) -> anyhow::Result<()>;
    async fn delete_meta_replica(&self, addr: &str, partition_id: u64) -> anyhow::Result<()>;
    /// Tell a meta replica the new upper bound of its inode range.
    async fn update_meta_range(&self, addr: &str, partition_id: u64, end: u64) -> anyhow::Result<()>;
    async fn load_data_partition(&self, addr: &str, partition_id: u64) -> anyhow::Result<ReplicaChecksum>;
    async fn load_meta_partition(&self, addr: &str, partition_id: u64) -> anyhow::Result<ReplicaChecksum>;
}

/// Wire form of an instruction.
#[derive(Debug, Serialize, Deserialize)]
pub enum NodeTask {
    CreateDataReplica(CreateDataReplica),
    BuildDataReplica(BuildDataReplica),
    DeleteDataReplica { partition_id: u64 },
    CreateMetaReplica(CreateMetaReplica),
    BuildMetaReplica(BuildMetaReplica),
    DeleteMetaReplica { partition_id: u64 },
    UpdateMetaRange { partition_id: u64, end: u64 },
    LoadDataPartition { partition_id: u64 },
    LoadMetaPartition { partition_id: u64 },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeTaskResult {
    pub ok: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub checksum: Option<ReplicaChecksum>,
}

/// One connection per instruction, JSON frames both ways.
pub struct TcpNodeClient {
    connect_timeout: Duration,
}

impl TcpNodeClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn send(&self, addr: &str, task: NodeTask) -> anyhow::Result<NodeTaskResult> {
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("connect to {addr} timed out"))?
            .with_context(|| format!("connect to node {addr}"))?;
        write_frame(&mut stream, &task).await?;
        let result: NodeTaskResult = read_frame(&mut stream)
            .await?
            .ok_or_else(|| anyhow!("node {addr} closed the connection"))?;
        if !result.ok {
            return Err(anyhow!("node {addr} refused task: {}", result.message));
        }
        Ok(result)
    }

    async fn send_for_checksum(&self, addr: &str, task: NodeTask) -> anyhow::Result<ReplicaChecksum> {
        self.send(addr, task)
            .await?
            .checksum
            .ok_or_else(|| anyhow!("node {addr} returned no checksum"))
    }
}

#[async_trait]
impl NodeClient for TcpNodeClient {
    async fn create_data_replica(&self, addr: &str, req: &CreateDataReplica) -> anyhow::Result<()> {
        self.send(addr, NodeTask::CreateDataReplica(req.clone())).await?;
        Ok(())
    }

    async fn build_data_replica(&self, addr: &str, req: &BuildDataReplica) -> anyhow::Result<()> {
        self.send(addr, NodeTask::BuildDataReplica(req.clone())).await?;
        Ok(())
    }

    async fn delete_data_replica(&self, addr: &str, partition_id: u64) -> anyhow::Result<()> {
        self.send(addr, NodeTask::DeleteDataReplica { partition_id }).await?;
        Ok(())
    }

    async fn create_meta_replica(&self, addr: &str, req: &CreateMetaReplica) -> anyhow::Result<()> {
        self.send(addr, NodeTask::CreateMetaReplica(req.clone())).await?;
        Ok(())
    }

    async fn build_meta_replica(&self, addr: &str, req: &BuildMetaReplica) -> anyhow::Result<()> {
        self.send(addr, NodeTask::BuildMetaReplica(req.clone())).await?;
        Ok(())
    }

    async fn delete_meta_replica(&self, addr: &str, partition_id: u64) -> anyhow::Result<()> {
        self.send(addr, NodeTask::DeleteMetaReplica { partition_id }).await?;
        Ok(())
    }

    async fn update_meta_range(&self, addr: &str, partition_id: u64, end: u64) -> anyhow::Result<()> {
        self.send(addr, NodeTask::UpdateMetaRange { partition_id, end })
            .await?;
        Ok(())
    }

    async fn load_data_partition(&self, addr: &str, partition_id: u64) -> anyhow::Result<ReplicaChecksum> {
        self.send_for_checksum(addr, NodeTask::LoadDataPartition { partition_id })
            .await
    }

    async fn load_meta_partition(&self, addr: &str, partition_id: u64) -> anyhow::Result<ReplicaChecksum> {
        self.send_for_checksum(addr, NodeTask::LoadMetaPartition { partition_id })
            .await
    }
}
