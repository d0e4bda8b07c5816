//! Heartbeat ingest from data and meta nodes.
//!
//! Reports refresh node liveness and stats, then per-partition replica
//! state under each partition's own lock. Nothing here is replicated: every
//! master that receives heartbeats builds the same picture independently.
//! A node's claim to lead a partition is taken at face value.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{MasterError, Result};
use crate::master::Master;
use crate::partition::{PartitionStatus, Replica};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataPartitionReport {
    pub partition_id: u64,
    pub status: PartitionStatus,
    pub is_leader: bool,
    pub used: u64,
    pub total: u64,
    pub disk_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataNodeHeartbeat {
    pub addr: String,
    /// Monotonic per node; older reports only refresh liveness.
    pub seq: u64,
    pub total: u64,
    pub used: u64,
    #[serde(default)]
    pub bad_disks: Vec<String>,
    #[serde(default)]
    pub partitions: Vec<DataPartitionReport>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaPartitionReport {
    pub partition_id: u64,
    pub status: PartitionStatus,
    pub is_leader: bool,
    pub max_inode_id: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaNodeHeartbeat {
    pub addr: String,
    pub seq: u64,
    pub total_memory: u64,
    pub used_memory: u64,
    #[serde(default)]
    pub partitions: Vec<MetaPartitionReport>,
}

/// Point `leader_addr` at `addr` or away from it, keeping replica flags
/// consistent with it.
fn apply_leader_flag(
    replicas: &mut [Replica],
    leader_addr: &mut Option<String>,
    addr: &str,
    is_leader: bool,
) {
    if is_leader {
        *leader_addr = Some(addr.to_string());
        for replica in replicas.iter_mut() {
            replica.is_leader = replica.addr == addr;
        }
    } else {
        if leader_addr.as_deref() == Some(addr) {
            *leader_addr = None;
        }
        for replica in replicas.iter_mut().filter(|r| r.addr == addr) {
            replica.is_leader = false;
        }
    }
}

impl Master {
    pub fn handle_data_node_task_response(&self, report: DataNodeHeartbeat) -> Result<()> {
        let node = self
            .cluster
            .topology
            .data_node(&report.addr)
            .ok_or_else(|| MasterError::NotFound(format!("data node {}", report.addr)))?;
        let was_active = node.is_active();

        let mut disks: BTreeMap<String, BTreeSet<u64>> = BTreeMap::new();
        for p in report.partitions.iter().filter(|p| !p.disk_path.is_empty()) {
            disks
                .entry(p.disk_path.clone())
                .or_default()
                .insert(p.partition_id);
        }
        let fresh = node.accept_heartbeat(report.seq, |stats| {
            stats.total = report.total;
            stats.used = report.used;
            stats.disks = disks;
            stats.bad_disks = report.bad_disks.clone();
        });
        if !fresh {
            tracing::debug!(addr = %report.addr, seq = report.seq, "stale data node heartbeat");
            return Ok(());
        }
        if !report.bad_disks.is_empty() {
            tracing::warn!(addr = %report.addr, disks = ?report.bad_disks, "data node reports bad disks");
        }

        for p in &report.partitions {
            let Some(dp) = self.cluster.partitions.data_partition(p.partition_id) else {
                tracing::debug!(addr = %report.addr, partition_id = p.partition_id, "heartbeat for unknown data partition");
                continue;
            };
            let mut guard = dp.lock();
            let state = &mut *guard;
            let Some(replica) = state.replicas.iter_mut().find(|r| r.addr == report.addr) else {
                continue;
            };
            replica.status = p.status;
            replica.used = p.used;
            replica.total = p.total;
            replica.disk_path = p.disk_path.clone();
            apply_leader_flag(&mut state.replicas, &mut state.leader_addr, &report.addr, p.is_leader);
        }

        if was_active {
            let hosted = self
                .cluster
                .partitions
                .data_partitions_by_id(&node.partition_ids());
            self.refresh_data_partitions(&hosted);
        } else {
            tracing::info!(addr = %report.addr, "data node back online");
            self.refresh_partition_statuses();
        }
        Ok(())
    }

    pub fn handle_meta_node_task_response(&self, report: MetaNodeHeartbeat) -> Result<()> {
        let node = self
            .cluster
            .topology
            .meta_node(&report.addr)
            .ok_or_else(|| MasterError::NotFound(format!("meta node {}", report.addr)))?;
        let was_active = node.is_active();

        let fresh = node.accept_heartbeat(report.seq, |stats| {
            stats.total_memory = report.total_memory;
            stats.used_memory = report.used_memory;
        });
        if !fresh {
            tracing::debug!(addr = %report.addr, seq = report.seq, "stale meta node heartbeat");
            return Ok(());
        }
        let threshold = f64::from(self.cluster.settings().meta_node_threshold);
        let ratio = node.stats().memory_ratio();
        if ratio >= threshold {
            tracing::warn!(addr = %report.addr, ratio, threshold, "meta node over memory threshold");
        }

        for p in &report.partitions {
            let Some(mp) = self.cluster.partitions.meta_partition(p.partition_id) else {
                tracing::debug!(addr = %report.addr, partition_id = p.partition_id, "heartbeat for unknown meta partition");
                continue;
            };
            let mut guard = mp.lock();
            let state = &mut *guard;
            let Some(replica) = state.replicas.iter_mut().find(|r| r.addr == report.addr) else {
                continue;
            };
            replica.status = p.status;
            replica.max_inode_id = p.max_inode_id;
            apply_leader_flag(&mut state.replicas, &mut state.leader_addr, &report.addr, p.is_leader);
            state.max_inode_id = state.max_inode_id.max(p.max_inode_id);
        }

        if was_active {
            let hosted = self
                .cluster
                .partitions
                .meta_partitions_by_id(&node.partition_ids());
            self.refresh_meta_partitions(&hosted);
        } else {
            tracing::info!(addr = %report.addr, "meta node back online");
            self.refresh_partition_statuses();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_flag_moves_between_replicas() {
        let mut replicas = vec![Replica::new("a"), Replica::new("b")];
        let mut leader = None;
        apply_leader_flag(&mut replicas, &mut leader, "a", true);
        assert_eq!(leader.as_deref(), Some("a"));
        assert!(replicas[0].is_leader);

        apply_leader_flag(&mut replicas, &mut leader, "b", true);
        assert_eq!(leader.as_deref(), Some("b"));
        assert!(!replicas[0].is_leader);
        assert!(replicas[1].is_leader);

        // A stale denial from the old leader leaves the new one alone.
        apply_leader_flag(&mut replicas, &mut leader, "a", false);
        assert_eq!(leader.as_deref(), Some("b"));

        apply_leader_flag(&mut replicas, &mut leader, "b", false);
        assert_eq!(leader, None);
    }
}
