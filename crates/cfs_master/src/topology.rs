//! Registry of data nodes, meta nodes and node sets.
//!
//! Registration and removal happen only on the replicated apply path.
//! Liveness and stats are local to each master and are refreshed from
//! heartbeats.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{MasterError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Data,
    Meta,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Data => "data node",
            NodeKind::Meta => "meta node",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DataNodeStats {
    pub total: u64,
    pub used: u64,
    /// disk path -> partitions reported on it.
    pub disks: BTreeMap<String, BTreeSet<u64>>,
    pub bad_disks: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetaNodeStats {
    pub total_memory: u64,
    pub used_memory: u64,
}

impl MetaNodeStats {
    pub fn memory_ratio(&self) -> f64 {
        if self.total_memory == 0 {
            return 0.0;
        }
        self.used_memory as f64 / self.total_memory as f64
    }
}

#[derive(Debug)]
struct Liveness {
    last_seq: u64,
    last_heartbeat: Instant,
}

/// A registered node. `S` is the kind-specific stats block.
#[derive(Debug)]
pub struct Node<S> {
    pub id: u64,
    pub addr: String,
    pub node_set_id: u64,
    active: AtomicBool,
    decommissioning: AtomicBool,
    liveness: RwLock<Liveness>,
    stats: RwLock<S>,
    /// Partitions with a replica on this node; maintained by apply.
    partitions: RwLock<BTreeSet<u64>>,
}

pub type DataNode = Node<DataNodeStats>;
pub type MetaNode = Node<MetaNodeStats>;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<S: Clone + Default> Node<S> {
    fn new(id: u64, addr: String, node_set_id: u64) -> Self {
        Self {
            id,
            addr,
            node_set_id,
            active: AtomicBool::new(true),
            decommissioning: AtomicBool::new(false),
            liveness: RwLock::new(Liveness {
                last_seq: 0,
                last_heartbeat: Instant::now(),
            }),
            stats: RwLock::new(S::default()),
            partitions: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_decommissioning(&self) -> bool {
        self.decommissioning.load(Ordering::SeqCst)
    }

    pub(crate) fn set_decommissioning(&self) {
        self.decommissioning.store(true, Ordering::SeqCst);
    }

    pub fn stats(&self) -> S {
        read(&self.stats).clone()
    }

    /// Record a heartbeat. Returns false when `seq` is older than the last
    /// accepted report, in which case only liveness was refreshed.
    pub(crate) fn accept_heartbeat(&self, seq: u64, update: impl FnOnce(&mut S)) -> bool {
        let mut liveness = write(&self.liveness);
        liveness.last_heartbeat = Instant::now();
        self.active.store(true, Ordering::SeqCst);
        if seq != 0 && seq < liveness.last_seq {
            return false;
        }
        liveness.last_seq = liveness.last_seq.max(seq);
        let mut stats = write(&self.stats);
        update(&mut *stats);
        true
    }

    pub fn last_heartbeat(&self) -> Instant {
        read(&self.liveness).last_heartbeat
    }

    /// Flip to inactive when the heartbeat is older than `timeout`.
    fn expire(&self, timeout: Duration, now: Instant) -> bool {
        let stale = now.saturating_duration_since(self.last_heartbeat()) > timeout;
        stale && self.active.swap(false, Ordering::SeqCst)
    }

    pub fn partition_ids(&self) -> Vec<u64> {
        read(&self.partitions).iter().copied().collect()
    }

    pub fn partition_count(&self) -> usize {
        read(&self.partitions).len()
    }

    pub fn hosts_partition(&self, id: u64) -> bool {
        read(&self.partitions).contains(&id)
    }

    pub(crate) fn attach_partition(&self, id: u64) {
        write(&self.partitions).insert(id);
    }

    pub(crate) fn detach_partition(&self, id: u64) {
        write(&self.partitions).remove(&id);
    }
}

impl DataNode {
    pub fn disk_partitions(&self, disk_path: &str) -> Vec<u64> {
        read(&self.stats)
            .disks
            .get(disk_path)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn forget_disk_partition(&self, id: u64) {
        for ids in write(&self.stats).disks.values_mut() {
            ids.remove(&id);
        }
    }

    /// No space left to host another replica.
    pub fn is_full(&self) -> bool {
        let stats = read(&self.stats);
        stats.total > 0 && stats.used >= stats.total
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSet {
    pub id: u64,
    pub capacity: usize,
    pub data_nodes: BTreeSet<String>,
    pub meta_nodes: BTreeSet<String>,
}

impl NodeSet {
    fn members(&self, kind: NodeKind) -> &BTreeSet<String> {
        match kind {
            NodeKind::Data => &self.data_nodes,
            NodeKind::Meta => &self.meta_nodes,
        }
    }

    fn members_mut(&mut self, kind: NodeKind) -> &mut BTreeSet<String> {
        match kind {
            NodeKind::Data => &mut self.data_nodes,
            NodeKind::Meta => &mut self.meta_nodes,
        }
    }
}

pub struct Topology {
    data_nodes: DashMap<String, Arc<DataNode>>,
    meta_nodes: DashMap<String, Arc<MetaNode>>,
    node_sets: RwLock<BTreeMap<u64, NodeSet>>,
    node_set_capacity: usize,
}

impl Topology {
    pub fn new(node_set_capacity: usize) -> Self {
        Self {
            data_nodes: DashMap::new(),
            meta_nodes: DashMap::new(),
            node_sets: RwLock::new(BTreeMap::new()),
            node_set_capacity: node_set_capacity.max(1),
        }
    }

    pub fn data_node(&self, addr: &str) -> Option<Arc<DataNode>> {
        self.data_nodes.get(addr).map(|entry| entry.value().clone())
    }

    pub fn meta_node(&self, addr: &str) -> Option<Arc<MetaNode>> {
        self.meta_nodes.get(addr).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, kind: NodeKind, addr: &str) -> bool {
        match kind {
            NodeKind::Data => self.data_nodes.contains_key(addr),
            NodeKind::Meta => self.meta_nodes.contains_key(addr),
        }
    }

    /// All data nodes ordered by address.
    pub fn data_nodes(&self) -> Vec<Arc<DataNode>> {
        let mut nodes: Vec<_> = self.data_nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.addr.cmp(&b.addr));
        nodes
    }

    pub fn meta_nodes(&self) -> Vec<Arc<MetaNode>> {
        let mut nodes: Vec<_> = self.meta_nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.addr.cmp(&b.addr));
        nodes
    }

    pub fn node_sets(&self) -> Vec<NodeSet> {
        read(&self.node_sets).values().cloned().collect()
    }

    pub fn is_node_active(&self, kind: NodeKind, addr: &str) -> bool {
        match kind {
            NodeKind::Data => self.data_node(addr).is_some_and(|n| n.is_active()),
            NodeKind::Meta => self.meta_node(addr).is_some_and(|n| n.is_active()),
        }
    }

    pub fn is_node_decommissioning(&self, kind: NodeKind, addr: &str) -> bool {
        match kind {
            NodeKind::Data => self.data_node(addr).is_some_and(|n| n.is_decommissioning()),
            NodeKind::Meta => self.meta_node(addr).is_some_and(|n| n.is_decommissioning()),
        }
    }

    pub fn node_set_of(&self, kind: NodeKind, addr: &str) -> Option<u64> {
        match kind {
            NodeKind::Data => self.data_node(addr).map(|n| n.node_set_id),
            NodeKind::Meta => self.meta_node(addr).map(|n| n.node_set_id),
        }
    }

    /// Fraction of nodes of `kind` that are active. An empty registry
    /// counts as fully live.
    pub fn live_ratio(&self, kind: NodeKind) -> f64 {
        let (total, active) = match kind {
            NodeKind::Data => (
                self.data_nodes.len(),
                self.data_nodes.iter().filter(|e| e.value().is_active()).count(),
            ),
            NodeKind::Meta => (
                self.meta_nodes.len(),
                self.meta_nodes.iter().filter(|e| e.value().is_active()).count(),
            ),
        };
        if total == 0 {
            return 1.0;
        }
        active as f64 / total as f64
    }

    /// Mark nodes without a recent heartbeat inactive. Returns the addresses
    /// that flipped.
    pub fn sweep(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut expired = Vec::new();
        for entry in self.data_nodes.iter() {
            if entry.value().expire(timeout, now) {
                expired.push(entry.key().clone());
            }
        }
        for entry in self.meta_nodes.iter() {
            if entry.value().expire(timeout, now) {
                expired.push(entry.key().clone());
            }
        }
        expired
    }

    /// Pick the first node set with room for one more node of `kind`,
    /// creating `max + 1` when all are full. Depends only on prior state.
    fn assign_node_set(&self, kind: NodeKind, addr: &str) -> u64 {
        let mut sets = write(&self.node_sets);
        let chosen = sets
            .values()
            .find(|set| set.members(kind).len() < set.capacity)
            .map(|set| set.id);
        let id = match chosen {
            Some(id) => id,
            None => {
                let id = sets.keys().next_back().copied().unwrap_or(0) + 1;
                sets.insert(
                    id,
                    NodeSet {
                        id,
                        capacity: self.node_set_capacity,
                        data_nodes: BTreeSet::new(),
                        meta_nodes: BTreeSet::new(),
                    },
                );
                id
            }
        };
        if let Some(set) = sets.get_mut(&id) {
            set.members_mut(kind).insert(addr.to_string());
        }
        id
    }

    fn release_node_set(&self, kind: NodeKind, node_set_id: u64, addr: &str) {
        let mut sets = write(&self.node_sets);
        if let Some(set) = sets.get_mut(&node_set_id) {
            set.members_mut(kind).remove(addr);
        }
    }

    pub(crate) fn register_data_node(&self, id: u64, addr: &str) -> Result<Arc<DataNode>> {
        if self.data_nodes.contains_key(addr) {
            return Err(MasterError::DuplicateNode(addr.to_string()));
        }
        let node_set_id = self.assign_node_set(NodeKind::Data, addr);
        let node = Arc::new(DataNode::new(id, addr.to_string(), node_set_id));
        self.data_nodes.insert(addr.to_string(), node.clone());
        Ok(node)
    }

    pub(crate) fn register_meta_node(&self, id: u64, addr: &str) -> Result<Arc<MetaNode>> {
        if self.meta_nodes.contains_key(addr) {
            return Err(MasterError::DuplicateNode(addr.to_string()));
        }
        let node_set_id = self.assign_node_set(NodeKind::Meta, addr);
        let node = Arc::new(MetaNode::new(id, addr.to_string(), node_set_id));
        self.meta_nodes.insert(addr.to_string(), node.clone());
        Ok(node)
    }

    /// Forget a node. Refused while it still hosts partitions.
    pub(crate) fn remove_node(&self, kind: NodeKind, addr: &str) -> Result<()> {
        let (node_set_id, hosted) = match kind {
            NodeKind::Data => {
                let node = self
                    .data_node(addr)
                    .ok_or_else(|| MasterError::NotFound(format!("data node {addr}")))?;
                (node.node_set_id, node.partition_ids())
            }
            NodeKind::Meta => {
                let node = self
                    .meta_node(addr)
                    .ok_or_else(|| MasterError::NotFound(format!("meta node {addr}")))?;
                (node.node_set_id, node.partition_ids())
            }
        };
        if !hosted.is_empty() {
            return Err(MasterError::DecommissionIncomplete {
                addr: addr.to_string(),
                remaining: hosted,
            });
        }
        match kind {
            NodeKind::Data => {
                self.data_nodes.remove(addr);
            }
            NodeKind::Meta => {
                self.meta_nodes.remove(addr);
            }
        }
        self.release_node_set(kind, node_set_id, addr);
        Ok(())
    }

    pub(crate) fn begin_decommission(&self, kind: NodeKind, addr: &str) -> Result<()> {
        let found = match kind {
            NodeKind::Data => self.data_node(addr).map(|n| n.set_decommissioning()),
            NodeKind::Meta => self.meta_node(addr).map(|n| n.set_decommissioning()),
        };
        found.ok_or_else(|| MasterError::NotFound(format!("{} {addr}", kind.as_str())))
    }

    pub(crate) fn attach(&self, kind: NodeKind, addr: &str, partition_id: u64) {
        match kind {
            NodeKind::Data => {
                if let Some(node) = self.data_node(addr) {
                    node.attach_partition(partition_id);
                }
            }
            NodeKind::Meta => {
                if let Some(node) = self.meta_node(addr) {
                    node.attach_partition(partition_id);
                }
            }
        }
    }

    pub(crate) fn detach(&self, kind: NodeKind, addr: &str, partition_id: u64) {
        match kind {
            NodeKind::Data => {
                if let Some(node) = self.data_node(addr) {
                    node.detach_partition(partition_id);
                    node.forget_disk_partition(partition_id);
                }
            }
            NodeKind::Meta => {
                if let Some(node) = self.meta_node(addr) {
                    node.detach_partition(partition_id);
                }
            }
        }
    }
}
