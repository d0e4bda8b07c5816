//! Data and meta partition objects and the registry that owns them.
//!
//! Each partition carries its own lock; heartbeat updates for different
//! partitions never contend. The registry itself is a pair of concurrent
//! maps keyed by partition id. Volumes reference partitions by id only.

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStatus {
    /// Replica confirmed created but not yet reported by its node.
    Creating,
    ReadWrite,
    ReadOnly,
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub addr: String,
    pub is_leader: bool,
    pub status: PartitionStatus,
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub disk_path: String,
    #[serde(default)]
    pub max_inode_id: u64,
}

impl Replica {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            is_leader: false,
            status: PartitionStatus::Creating,
            used: 0,
            total: 0,
            disk_path: String::new(),
            max_inode_id: 0,
        }
    }
}

/// ⌈(replica_num + 1) / 2⌉
pub fn quorum(replica_num: usize) -> usize {
    (replica_num + 2) / 2
}

/// Inputs to status recomputation that live outside the partition.
pub struct StatusInputs<'a> {
    pub is_node_active: &'a dyn Fn(&str) -> bool,
    pub live_ratio: f64,
    pub live_ratio_threshold: f64,
    pub used_ceiling: f64,
    /// Meta only: whether the hosting meta node is over its memory threshold.
    pub is_node_overloaded: &'a dyn Fn(&str) -> bool,
}

fn healthy_replicas(replicas: &[Replica], inputs: &StatusInputs<'_>) -> usize {
    replicas
        .iter()
        .filter(|r| r.status != PartitionStatus::Unavailable && (inputs.is_node_active)(&r.addr))
        .count()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Debug)]
pub struct DataPartitionState {
    pub status: PartitionStatus,
    pub replicas: Vec<Replica>,
    pub leader_addr: Option<String>,
}

pub struct DataPartition {
    pub id: u64,
    pub volume: String,
    pub replica_num: usize,
    state: Mutex<DataPartitionState>,
}

impl DataPartition {
    pub fn new(id: u64, volume: String, replica_num: usize, hosts: &[String]) -> Self {
        Self {
            id,
            volume,
            replica_num,
            state: Mutex::new(DataPartitionState {
                status: PartitionStatus::ReadWrite,
                replicas: hosts.iter().map(Replica::new).collect(),
                leader_addr: None,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, DataPartitionState> {
        lock(&self.state)
    }

    pub fn snapshot(&self) -> DataPartitionState {
        self.lock().clone()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.lock().replicas.iter().map(|r| r.addr.clone()).collect()
    }

    pub fn status(&self) -> PartitionStatus {
        self.lock().status
    }

    /// Largest usage reported by any replica.
    pub fn used(&self) -> u64 {
        self.lock().replicas.iter().map(|r| r.used).max().unwrap_or(0)
    }

    /// Swap `old` for `new` in place, keeping replica order.
    pub(crate) fn replace_replica(&self, old: &str, new: &str) -> bool {
        let mut state = self.lock();
        let Some(replica) = state.replicas.iter_mut().find(|r| r.addr == old) else {
            return false;
        };
        *replica = Replica::new(new);
        if state.leader_addr.as_deref() == Some(old) {
            state.leader_addr = None;
        }
        true
    }

    pub fn refresh_status(&self, inputs: &StatusInputs<'_>) -> PartitionStatus {
        let mut state = self.lock();
        let healthy = healthy_replicas(&state.replicas, inputs);
        let used = state.replicas.iter().map(|r| r.used).max().unwrap_or(0);
        let total = state.replicas.iter().map(|r| r.total).max().unwrap_or(0);
        state.status = if healthy < quorum(self.replica_num) {
            PartitionStatus::Unavailable
        } else if total > 0 && used as f64 / total as f64 >= inputs.used_ceiling {
            PartitionStatus::ReadOnly
        } else if inputs.live_ratio < inputs.live_ratio_threshold {
            PartitionStatus::ReadOnly
        } else if state
            .replicas
            .iter()
            .any(|r| r.status == PartitionStatus::ReadOnly)
        {
            PartitionStatus::ReadOnly
        } else {
            PartitionStatus::ReadWrite
        };
        state.status
    }
}

#[derive(Clone, Debug)]
pub struct MetaPartitionState {
    pub start: u64,
    /// Inclusive. `u64::MAX` on the highest partition of a volume.
    pub end: u64,
    pub status: PartitionStatus,
    pub replicas: Vec<Replica>,
    pub leader_addr: Option<String>,
    pub max_inode_id: u64,
}

pub struct MetaPartition {
    pub id: u64,
    pub volume: String,
    pub replica_num: usize,
    state: Mutex<MetaPartitionState>,
}

impl MetaPartition {
    pub fn new(id: u64, volume: String, start: u64, end: u64, hosts: &[String]) -> Self {
        Self {
            id,
            volume,
            replica_num: hosts.len(),
            state: Mutex::new(MetaPartitionState {
                start,
                end,
                status: PartitionStatus::ReadWrite,
                replicas: hosts.iter().map(Replica::new).collect(),
                leader_addr: None,
                max_inode_id: start,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, MetaPartitionState> {
        lock(&self.state)
    }

    pub fn snapshot(&self) -> MetaPartitionState {
        self.lock().clone()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.lock().replicas.iter().map(|r| r.addr.clone()).collect()
    }

    pub fn range(&self) -> (u64, u64) {
        let state = self.lock();
        (state.start, state.end)
    }

    pub fn status(&self) -> PartitionStatus {
        self.lock().status
    }

    pub(crate) fn set_end(&self, end: u64) {
        self.lock().end = end;
    }

    pub(crate) fn replace_replica(&self, old: &str, new: &str) -> bool {
        let mut state = self.lock();
        let Some(replica) = state.replicas.iter_mut().find(|r| r.addr == old) else {
            return false;
        };
        *replica = Replica::new(new);
        if state.leader_addr.as_deref() == Some(old) {
            state.leader_addr = None;
        }
        true
    }

    pub fn refresh_status(&self, inputs: &StatusInputs<'_>) -> PartitionStatus {
        let mut state = self.lock();
        let healthy = healthy_replicas(&state.replicas, inputs);
        state.status = if healthy < quorum(self.replica_num) {
            PartitionStatus::Unavailable
        } else if inputs.live_ratio < inputs.live_ratio_threshold {
            PartitionStatus::ReadOnly
        } else if state
            .replicas
            .iter()
            .any(|r| (inputs.is_node_overloaded)(&r.addr) || r.status == PartitionStatus::ReadOnly)
        {
            PartitionStatus::ReadOnly
        } else {
            PartitionStatus::ReadWrite
        };
        state.status
    }
}

#[derive(Default)]
pub struct PartitionRegistry {
    data: DashMap<u64, Arc<DataPartition>>,
    meta: DashMap<u64, Arc<MetaPartition>>,
}

impl PartitionRegistry {
    pub fn data_partition(&self, id: u64) -> Option<Arc<DataPartition>> {
        self.data.get(&id).map(|e| e.value().clone())
    }

    pub fn meta_partition(&self, id: u64) -> Option<Arc<MetaPartition>> {
        self.meta.get(&id).map(|e| e.value().clone())
    }

    pub fn data_partitions(&self) -> Vec<Arc<DataPartition>> {
        let mut out: Vec<_> = self.data.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|p| p.id);
        out
    }

    pub fn meta_partitions(&self) -> Vec<Arc<MetaPartition>> {
        let mut out: Vec<_> = self.meta.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|p| p.id);
        out
    }

    /// Look up `ids` in the given order, skipping unknown ones.
    pub fn data_partitions_by_id(&self, ids: &[u64]) -> Vec<Arc<DataPartition>> {
        ids.iter().filter_map(|id| self.data_partition(*id)).collect()
    }

    pub fn meta_partitions_by_id(&self, ids: &[u64]) -> Vec<Arc<MetaPartition>> {
        ids.iter().filter_map(|id| self.meta_partition(*id)).collect()
    }

    pub(crate) fn insert_data(&self, partition: Arc<DataPartition>) {
        self.data.insert(partition.id, partition);
    }

    pub(crate) fn insert_meta(&self, partition: Arc<MetaPartition>) {
        self.meta.insert(partition.id, partition);
    }

    pub(crate) fn remove_data(&self, id: u64) -> Option<Arc<DataPartition>> {
        self.data.remove(&id).map(|(_, p)| p)
    }

    pub(crate) fn remove_meta(&self, id: u64) -> Option<Arc<MetaPartition>> {
        self.meta.remove(&id).map(|(_, p)| p)
    }
}
