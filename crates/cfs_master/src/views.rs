//! Read-only snapshots served to admin queries.

use serde::{Deserialize, Serialize};

use crate::cluster::BadPartitionRecord;
use crate::config::GB;
use crate::error::{MasterError, Result};
use crate::master::Master;
use crate::partition::{DataPartition, MetaPartition, PartitionStatus, Replica};
use crate::topology::{DataNode, DataNodeStats, MetaNode, MetaNodeStats, NodeKind, NodeSet};
use crate::volume::VolStatus;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterView {
    pub name: String,
    pub leader_addr: Option<String>,
    pub applied_index: u64,
    pub should_auto_allocate: bool,
    pub meta_node_threshold: f32,
    pub data_node_live_ratio: f64,
    pub meta_node_live_ratio: f64,
    pub volumes: Vec<String>,
    pub data_nodes: usize,
    pub meta_nodes: usize,
    pub data_partitions: usize,
    pub meta_partitions: usize,
    pub bad_partitions: Vec<BadPartitionRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataNodeView {
    pub id: u64,
    pub addr: String,
    pub node_set_id: u64,
    pub is_active: bool,
    pub decommissioning: bool,
    pub stats: DataNodeStats,
    pub partitions: Vec<u64>,
}

impl From<&DataNode> for DataNodeView {
    fn from(node: &DataNode) -> Self {
        Self {
            id: node.id,
            addr: node.addr.clone(),
            node_set_id: node.node_set_id,
            is_active: node.is_active(),
            decommissioning: node.is_decommissioning(),
            stats: node.stats(),
            partitions: node.partition_ids(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaNodeView {
    pub id: u64,
    pub addr: String,
    pub node_set_id: u64,
    pub is_active: bool,
    pub decommissioning: bool,
    pub stats: MetaNodeStats,
    pub partitions: Vec<u64>,
}

impl From<&MetaNode> for MetaNodeView {
    fn from(node: &MetaNode) -> Self {
        Self {
            id: node.id,
            addr: node.addr.clone(),
            node_set_id: node.node_set_id,
            is_active: node.is_active(),
            decommissioning: node.is_decommissioning(),
            stats: node.stats(),
            partitions: node.partition_ids(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologyView {
    pub node_sets: Vec<NodeSet>,
    pub data_nodes: Vec<DataNodeView>,
    pub meta_nodes: Vec<MetaNodeView>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataPartitionView {
    pub partition_id: u64,
    pub volume: String,
    pub replica_num: usize,
    pub status: PartitionStatus,
    pub leader_addr: Option<String>,
    pub replicas: Vec<Replica>,
}

impl From<&DataPartition> for DataPartitionView {
    fn from(dp: &DataPartition) -> Self {
        let state = dp.snapshot();
        Self {
            partition_id: dp.id,
            volume: dp.volume.clone(),
            replica_num: dp.replica_num,
            status: state.status,
            leader_addr: state.leader_addr,
            replicas: state.replicas,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaPartitionView {
    pub partition_id: u64,
    pub volume: String,
    pub start: u64,
    pub end: u64,
    pub max_inode_id: u64,
    pub status: PartitionStatus,
    pub leader_addr: Option<String>,
    pub replicas: Vec<Replica>,
}

impl From<&MetaPartition> for MetaPartitionView {
    fn from(mp: &MetaPartition) -> Self {
        let state = mp.snapshot();
        Self {
            partition_id: mp.id,
            volume: mp.volume.clone(),
            start: state.start,
            end: state.end,
            max_inode_id: state.max_inode_id,
            status: state.status,
            leader_addr: state.leader_addr,
            replicas: state.replicas,
        }
    }
}

/// Partition lists are empty, and `withheld` set, while too few nodes of
/// the relevant kind are live for placement data to be trusted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeView {
    pub name: String,
    pub status: VolStatus,
    pub replica_num: usize,
    pub capacity_gb: u64,
    pub data_partition_size_gb: u64,
    pub data_partitions: Vec<DataPartitionView>,
    pub meta_partitions: Vec<MetaPartitionView>,
    pub withheld: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolStatInfo {
    pub name: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaLoad {
    pub addr: String,
    pub checksum: Option<u64>,
    pub size: Option<u64>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadReport {
    pub partition_id: u64,
    /// Every replica answered and all checksums match.
    pub consistent: bool,
    pub replicas: Vec<ReplicaLoad>,
}

impl Master {
    pub async fn cluster_view(&self) -> ClusterView {
        let settings = self.cluster.settings();
        let topology = &self.cluster.topology;
        ClusterView {
            name: self.cluster.name.clone(),
            leader_addr: self.leader_addr().await,
            applied_index: self.cluster.applied_index(),
            should_auto_allocate: settings.should_auto_allocate,
            meta_node_threshold: settings.meta_node_threshold,
            data_node_live_ratio: topology.live_ratio(NodeKind::Data),
            meta_node_live_ratio: topology.live_ratio(NodeKind::Meta),
            volumes: self.cluster.volumes().iter().map(|v| v.name.clone()).collect(),
            data_nodes: topology.data_nodes().len(),
            meta_nodes: topology.meta_nodes().len(),
            data_partitions: self.cluster.partitions.data_partitions().len(),
            meta_partitions: self.cluster.partitions.meta_partitions().len(),
            bad_partitions: self.cluster.bad_partitions(),
        }
    }

    pub fn topology_view(&self) -> TopologyView {
        let topology = &self.cluster.topology;
        TopologyView {
            node_sets: topology.node_sets(),
            data_nodes: topology.data_nodes().iter().map(|n| n.as_ref().into()).collect(),
            meta_nodes: topology.meta_nodes().iter().map(|n| n.as_ref().into()).collect(),
        }
    }

    pub fn data_node_view(&self, addr: &str) -> Result<DataNodeView> {
        self.cluster
            .topology
            .data_node(addr)
            .map(|n| n.as_ref().into())
            .ok_or_else(|| MasterError::NotFound(format!("data node {addr}")))
    }

    pub fn meta_node_view(&self, addr: &str) -> Result<MetaNodeView> {
        self.cluster
            .topology
            .meta_node(addr)
            .map(|n| n.as_ref().into())
            .ok_or_else(|| MasterError::NotFound(format!("meta node {addr}")))
    }

    fn views_trusted(&self, kind: NodeKind) -> bool {
        self.cluster.topology.live_ratio(kind) >= self.config.live_ratio_threshold
    }

    pub fn volume_view(&self, name: &str) -> Result<VolumeView> {
        let vol = self
            .cluster
            .volume(name)
            .ok_or_else(|| MasterError::NotFound(format!("volume {name}")))?;
        let state = vol.read().clone();
        let partitions = &self.cluster.partitions;
        let data_trusted = self.views_trusted(NodeKind::Data);
        let meta_trusted = self.views_trusted(NodeKind::Meta);
        let data_partitions = if data_trusted {
            partitions
                .data_partitions_by_id(&state.data_partitions)
                .iter()
                .map(|dp| dp.as_ref().into())
                .collect()
        } else {
            Vec::new()
        };
        let meta_partitions = if meta_trusted {
            partitions
                .meta_partitions_by_id(&state.meta_partitions)
                .iter()
                .map(|mp| mp.as_ref().into())
                .collect()
        } else {
            Vec::new()
        };
        Ok(VolumeView {
            name: vol.name.clone(),
            status: state.status,
            replica_num: vol.replica_num,
            capacity_gb: state.capacity_gb,
            data_partition_size_gb: vol.data_partition_size_gb,
            data_partitions,
            meta_partitions,
            withheld: !(data_trusted && meta_trusted),
        })
    }

    pub fn volume_stat(&self, name: &str) -> Result<VolStatInfo> {
        let vol = self
            .cluster
            .volume(name)
            .ok_or_else(|| MasterError::NotFound(format!("volume {name}")))?;
        let total_bytes = vol.capacity_gb().saturating_mul(GB);
        let used: u64 = self
            .cluster
            .partitions
            .data_partitions_by_id(&vol.data_partition_ids())
            .iter()
            .map(|dp| dp.used())
            .fold(0u64, u64::saturating_add);
        Ok(VolStatInfo {
            name: vol.name.clone(),
            total_bytes,
            used_bytes: used.min(total_bytes),
        })
    }

    pub fn data_partition_view(&self, partition_id: u64) -> Result<DataPartitionView> {
        self.cluster
            .partitions
            .data_partition(partition_id)
            .map(|dp| dp.as_ref().into())
            .ok_or_else(|| MasterError::NotFound(format!("data partition {partition_id}")))
    }

    pub fn meta_partition_view(&self, partition_id: u64) -> Result<MetaPartitionView> {
        self.cluster
            .partitions
            .meta_partition(partition_id)
            .map(|mp| mp.as_ref().into())
            .ok_or_else(|| MasterError::NotFound(format!("meta partition {partition_id}")))
    }

    pub fn bad_partitions(&self) -> Vec<BadPartitionRecord> {
        self.cluster.bad_partitions()
    }

    pub fn applied_index(&self) -> u64 {
        self.cluster.applied_index()
    }
}
