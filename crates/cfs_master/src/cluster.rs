//! Control-plane cluster state and its replicated command set.
//!
//! Every mutation that must survive a master failover is a
//! `ClusterCommand`. Commands are proposed through raft and applied here in
//! log order by a single thread. Apply validates each command against the
//! current state and either applies it fully or rejects it without touching
//! anything. It never consults wall-clock time or heartbeat-derived state,
//! so every master ends up with identical registries.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use cfs_raft::raft::{LogIndex, StateMachine};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::MasterConfig;
use crate::error::{MasterError, Result};
use crate::id_alloc::{IdCounters, IdKind};
use crate::partition::{DataPartition, MetaPartition, PartitionRegistry};
use crate::topology::{NodeKind, Topology};
use crate::volume::{validate_volume_name, VolStatus, Volume};

/// Rejections kept for proposers to pick up; older ones are dropped.
const MAX_TRACKED_REJECTIONS: usize = 1024;

/// Replicated cluster-wide policy.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ClusterSettings {
    pub should_auto_allocate: bool,
    pub meta_node_threshold: f32,
}

/// Partitions that lived on a disk when it was marked bad.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadPartitionRecord {
    pub addr: String,
    pub disk_path: String,
    pub partition_ids: Vec<u64>,
    /// Subset of `partition_ids` still hosted on `addr`.
    pub pending: Vec<u64>,
}

pub fn bad_disk_key(addr: &str, disk_path: &str) -> String {
    format!("{addr}:{disk_path}")
}

/// Cluster metadata commands replicated through raft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterCommand {
    AllocateId {
        kind: IdKind,
        value: u64,
    },
    AddDataNode {
        id: u64,
        addr: String,
    },
    AddMetaNode {
        id: u64,
        addr: String,
    },
    /// Exclude the node from placement while its partitions drain.
    BeginNodeDecommission {
        kind: NodeKind,
        addr: String,
    },
    RemoveDataNode {
        addr: String,
    },
    RemoveMetaNode {
        addr: String,
    },
    CreateVolume {
        name: String,
        replica_num: usize,
        capacity_gb: u64,
        data_partition_size_gb: u64,
    },
    UpdateVolume {
        name: String,
        capacity_gb: u64,
    },
    MarkDeleteVolume {
        name: String,
    },
    /// Drop the volume along with any partitions it still references.
    RemoveVolume {
        name: String,
    },
    AddDataPartition {
        id: u64,
        volume: String,
        hosts: Vec<String>,
    },
    /// First meta partition of a volume, covering `[0, u64::MAX]`.
    AddMetaPartition {
        id: u64,
        volume: String,
        start: u64,
        end: u64,
        hosts: Vec<String>,
    },
    /// Cap the highest meta partition, `parent`, at `start - 1` and open
    /// `[start, MAX]`. Rejected when `parent` is no longer the highest.
    SplitMetaPartition {
        volume: String,
        parent: u64,
        id: u64,
        start: u64,
        hosts: Vec<String>,
    },
    ReplaceDataReplica {
        id: u64,
        old_addr: String,
        new_addr: String,
    },
    ReplaceMetaReplica {
        id: u64,
        old_addr: String,
        new_addr: String,
    },
    RemoveDataPartition {
        id: u64,
    },
    RemoveMetaPartition {
        id: u64,
    },
    RecordBadDisk {
        addr: String,
        disk_path: String,
        partition_ids: Vec<u64>,
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
}

pub struct Cluster {
    pub name: String,
    pub topology: Topology,
    pub partitions: PartitionRegistry,
    pub ids: IdCounters,
    volumes: DashMap<String, Arc<Volume>>,
    bad_partitions: DashMap<String, BadPartitionRecord>,
    settings: RwLock<ClusterSettings>,
    applied: AtomicU64,
    rejections: Mutex<BTreeMap<LogIndex, MasterError>>,
}

impl Cluster {
    pub fn new(config: &MasterConfig) -> Self {
        Self {
            name: config.cluster_name.clone(),
            topology: Topology::new(config.node_set_capacity),
            partitions: PartitionRegistry::default(),
            ids: IdCounters::default(),
            volumes: DashMap::new(),
            bad_partitions: DashMap::new(),
            settings: RwLock::new(ClusterSettings {
                should_auto_allocate: true,
                meta_node_threshold: config.meta_node_threshold,
            }),
            applied: AtomicU64::new(0),
            rejections: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn volume(&self, name: &str) -> Option<Arc<Volume>> {
        self.volumes.get(name).map(|e| e.value().clone())
    }

    /// All volumes ordered by name.
    pub fn volumes(&self) -> Vec<Arc<Volume>> {
        let mut out: Vec<_> = self.volumes.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn bad_partitions(&self) -> Vec<BadPartitionRecord> {
        let mut out: Vec<_> = self.bad_partitions.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| (&a.addr, &a.disk_path).cmp(&(&b.addr, &b.disk_path)));
        out
    }

    pub fn bad_partition_record(&self, addr: &str, disk_path: &str) -> Option<BadPartitionRecord> {
        self.bad_partitions
            .get(&bad_disk_key(addr, disk_path))
            .map(|e| e.value().clone())
    }

    pub fn settings(&self) -> ClusterSettings {
        *self
            .settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn applied_index(&self) -> LogIndex {
        self.applied.load(Ordering::SeqCst)
    }

    fn record_rejection(&self, index: LogIndex, err: MasterError) {
        let mut rejections = self
            .rejections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        rejections.insert(index, err);
        while rejections.len() > MAX_TRACKED_REJECTIONS {
            rejections.pop_first();
        }
    }

    /// Why the command at `index` was rejected, if it was.
    pub(crate) fn take_rejection(&self, index: LogIndex) -> Option<MasterError> {
        self.rejections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&index)
    }

    fn existing_volume(&self, name: &str) -> Result<Arc<Volume>> {
        self.volume(name)
            .ok_or_else(|| MasterError::NotFound(format!("volume {name}")))
    }

    fn writable_volume(&self, name: &str) -> Result<Arc<Volume>> {
        let vol = self.existing_volume(name)?;
        if vol.status() == VolStatus::MarkDelete {
            return Err(MasterError::Validation(format!(
                "volume {name} is marked for deletion"
            )));
        }
        Ok(vol)
    }

    fn check_hosts(&self, kind: NodeKind, hosts: &[String]) -> Result<()> {
        if hosts.is_empty() {
            return Err(MasterError::Validation("partition has no hosts".into()));
        }
        for (i, host) in hosts.iter().enumerate() {
            if !self.topology.contains(kind, host) {
                return Err(MasterError::NotFound(format!("{} {host}", kind.as_str())));
            }
            if hosts[..i].contains(host) {
                return Err(MasterError::Validation(format!("duplicate host {host}")));
            }
        }
        Ok(())
    }

    /// Validate and apply one command.
    pub fn apply_command(&self, cmd: ClusterCommand) -> Result<()> {
        match cmd {
            ClusterCommand::AllocateId { kind, value } => self.ids.advance(kind, value),
            ClusterCommand::AddDataNode { id, addr } => {
                let node = self.topology.register_data_node(id, &addr)?;
                tracing::info!(node_id = id, addr = %addr, node_set = node.node_set_id, "data node registered");
                Ok(())
            }
            ClusterCommand::AddMetaNode { id, addr } => {
                let node = self.topology.register_meta_node(id, &addr)?;
                tracing::info!(node_id = id, addr = %addr, node_set = node.node_set_id, "meta node registered");
                Ok(())
            }
            ClusterCommand::BeginNodeDecommission { kind, addr } => {
                self.topology.begin_decommission(kind, &addr)
            }
            ClusterCommand::RemoveDataNode { addr } => {
                self.topology.remove_node(NodeKind::Data, &addr)?;
                tracing::info!(addr = %addr, "data node removed");
                Ok(())
            }
            ClusterCommand::RemoveMetaNode { addr } => {
                self.topology.remove_node(NodeKind::Meta, &addr)?;
                tracing::info!(addr = %addr, "meta node removed");
                Ok(())
            }
            ClusterCommand::CreateVolume {
                name,
                replica_num,
                capacity_gb,
                data_partition_size_gb,
            } => {
                validate_volume_name(&name)?;
                if replica_num < 2 {
                    return Err(MasterError::Validation(format!(
                        "replica number {replica_num} is below 2"
                    )));
                }
                if self.volumes.contains_key(&name) {
                    return Err(MasterError::Validation(format!("volume {name} already exists")));
                }
                let vol = Volume::new(name.clone(), replica_num, data_partition_size_gb, capacity_gb);
                self.volumes.insert(name, Arc::new(vol));
                Ok(())
            }
            ClusterCommand::UpdateVolume { name, capacity_gb } => {
                let vol = self.writable_volume(&name)?;
                let mut state = vol.write();
                if capacity_gb < state.capacity_gb {
                    return Err(MasterError::Validation(format!(
                        "capacity {capacity_gb}GB is below the current {}GB",
                        state.capacity_gb
                    )));
                }
                state.capacity_gb = capacity_gb;
                Ok(())
            }
            ClusterCommand::MarkDeleteVolume { name } => {
                let vol = self.existing_volume(&name)?;
                vol.write().status = VolStatus::MarkDelete;
                Ok(())
            }
            ClusterCommand::RemoveVolume { name } => {
                let vol = self.existing_volume(&name)?;
                for id in vol.data_partition_ids() {
                    self.drop_data_partition(id);
                }
                for id in vol.meta_partition_ids() {
                    self.drop_meta_partition(id);
                }
                self.volumes.remove(&name);
                Ok(())
            }
            ClusterCommand::AddDataPartition { id, volume, hosts } => {
                let vol = self.writable_volume(&volume)?;
                if self.partitions.data_partition(id).is_some() {
                    return Err(MasterError::Validation(format!("data partition {id} exists")));
                }
                if hosts.len() != vol.replica_num {
                    return Err(MasterError::Validation(format!(
                        "data partition {id} has {} hosts, volume needs {}",
                        hosts.len(),
                        vol.replica_num
                    )));
                }
                self.check_hosts(NodeKind::Data, &hosts)?;
                let dp = DataPartition::new(id, volume, vol.replica_num, &hosts);
                self.partitions.insert_data(Arc::new(dp));
                vol.write().data_partitions.push(id);
                for host in &hosts {
                    self.topology.attach(NodeKind::Data, host, id);
                }
                Ok(())
            }
            ClusterCommand::AddMetaPartition {
                id,
                volume,
                start,
                end,
                hosts,
            } => {
                let vol = self.writable_volume(&volume)?;
                if !vol.meta_partition_ids().is_empty() {
                    return Err(MasterError::InvalidRange(format!(
                        "volume {volume} already has meta partitions; split the highest instead"
                    )));
                }
                if start != 0 || end != u64::MAX {
                    return Err(MasterError::InvalidRange(format!(
                        "first meta partition must cover [0, max], got [{start}, {end}]"
                    )));
                }
                self.insert_meta_partition(&vol, id, start, &hosts)
            }
            ClusterCommand::SplitMetaPartition {
                volume,
                parent,
                id,
                start,
                hosts,
            } => {
                let vol = self.writable_volume(&volume)?;
                let highest = vol
                    .highest_meta_partition()
                    .and_then(|highest_id| self.partitions.meta_partition(highest_id))
                    .ok_or_else(|| {
                        MasterError::InvalidRange(format!("volume {volume} has no meta partition"))
                    })?;
                if highest.id != parent {
                    return Err(MasterError::InvalidRange(format!(
                        "meta partition {parent} is no longer the highest of {volume}, {} is",
                        highest.id
                    )));
                }
                let (highest_start, highest_end) = highest.range();
                if highest_end != u64::MAX {
                    return Err(MasterError::InvalidRange(format!(
                        "highest meta partition {} is capped at {highest_end}",
                        highest.id
                    )));
                }
                if start <= highest_start {
                    return Err(MasterError::InvalidRange(format!(
                        "split point {start} must be above {highest_start}"
                    )));
                }
                self.insert_meta_partition(&vol, id, start, &hosts)?;
                highest.set_end(start - 1);
                tracing::info!(vol = %volume, old = highest.id, new = id, start, "meta partition split");
                Ok(())
            }
            ClusterCommand::ReplaceDataReplica {
                id,
                old_addr,
                new_addr,
            } => {
                let dp = self
                    .partitions
                    .data_partition(id)
                    .ok_or_else(|| MasterError::NotFound(format!("data partition {id}")))?;
                self.check_replacement(NodeKind::Data, &dp.hosts(), id, &old_addr, &new_addr)?;
                dp.replace_replica(&old_addr, &new_addr);
                self.topology.detach(NodeKind::Data, &old_addr, id);
                self.topology.attach(NodeKind::Data, &new_addr, id);
                for mut record in self.bad_partitions.iter_mut() {
                    if record.addr == old_addr {
                        record.pending.retain(|pending| *pending != id);
                    }
                }
                Ok(())
            }
            ClusterCommand::ReplaceMetaReplica {
                id,
                old_addr,
                new_addr,
            } => {
                let mp = self
                    .partitions
                    .meta_partition(id)
                    .ok_or_else(|| MasterError::NotFound(format!("meta partition {id}")))?;
                self.check_replacement(NodeKind::Meta, &mp.hosts(), id, &old_addr, &new_addr)?;
                mp.replace_replica(&old_addr, &new_addr);
                self.topology.detach(NodeKind::Meta, &old_addr, id);
                self.topology.attach(NodeKind::Meta, &new_addr, id);
                Ok(())
            }
            ClusterCommand::RemoveDataPartition { id } => {
                if !self.drop_data_partition(id) {
                    return Err(MasterError::NotFound(format!("data partition {id}")));
                }
                Ok(())
            }
            ClusterCommand::RemoveMetaPartition { id } => {
                let mp = self
                    .partitions
                    .meta_partition(id)
                    .ok_or_else(|| MasterError::NotFound(format!("meta partition {id}")))?;
                // Removing a live volume's meta partition would open a gap.
                if self
                    .volume(&mp.volume)
                    .is_some_and(|vol| vol.status() == VolStatus::Normal)
                {
                    return Err(MasterError::Validation(format!(
                        "meta partition {id} belongs to live volume {}",
                        mp.volume
                    )));
                }
                self.drop_meta_partition(id);
                Ok(())
            }
            ClusterCommand::RecordBadDisk {
                addr,
                disk_path,
                partition_ids,
            } => {
                let still_hosted: Vec<u64> = partition_ids
                    .iter()
                    .copied()
                    .filter(|id| {
                        self.partitions
                            .data_partition(*id)
                            .is_some_and(|dp| dp.hosts().contains(&addr))
                    })
                    .collect();
                let mut record = self
                    .bad_partitions
                    .entry(bad_disk_key(&addr, &disk_path))
                    .or_insert_with(|| BadPartitionRecord {
                        addr: addr.clone(),
                        disk_path: disk_path.clone(),
                        partition_ids: Vec::new(),
                        pending: Vec::new(),
                    });
                for id in partition_ids {
                    if !record.partition_ids.contains(&id) {
                        record.partition_ids.push(id);
                    }
                }
                for id in still_hosted {
                    if !record.pending.contains(&id) {
                        record.pending.push(id);
                    }
                }
                tracing::warn!(addr = %addr, disk = %disk_path, partitions = ?record.partition_ids, "bad disk recorded");
                Ok(())
            }
            ClusterCommand::ClearBadDisk { addr, disk_path } => {
                self.bad_partitions
                    .remove(&bad_disk_key(&addr, &disk_path))
                    .map(|_| ())
                    .ok_or_else(|| {
                        MasterError::NotFound(format!("bad disk record {addr}:{disk_path}"))
                    })
            }
            ClusterCommand::SetAutoAllocate { enabled } => {
                self.update_settings(|s| s.should_auto_allocate = enabled);
                Ok(())
            }
            ClusterCommand::SetMetaNodeThreshold { threshold } => {
                if !(threshold > 0.0 && threshold <= 1.0) {
                    return Err(MasterError::Validation(format!(
                        "meta node threshold {threshold} must be in (0, 1]"
                    )));
                }
                self.update_settings(|s| s.meta_node_threshold = threshold);
                Ok(())
            }
        }
    }

    fn update_settings(&self, f: impl FnOnce(&mut ClusterSettings)) {
        let mut settings = self
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut settings);
    }

    fn insert_meta_partition(&self, vol: &Volume, id: u64, start: u64, hosts: &[String]) -> Result<()> {
        if self.partitions.meta_partition(id).is_some() {
            return Err(MasterError::Validation(format!("meta partition {id} exists")));
        }
        self.check_hosts(NodeKind::Meta, hosts)?;
        let mp = MetaPartition::new(id, vol.name.clone(), start, u64::MAX, hosts);
        self.partitions.insert_meta(Arc::new(mp));
        vol.write().meta_partitions.push(id);
        for host in hosts {
            self.topology.attach(NodeKind::Meta, host, id);
        }
        Ok(())
    }

    fn check_replacement(
        &self,
        kind: NodeKind,
        hosts: &[String],
        id: u64,
        old_addr: &str,
        new_addr: &str,
    ) -> Result<()> {
        if !hosts.iter().any(|h| h == old_addr) {
            return Err(MasterError::NotFound(format!(
                "replica of partition {id} on {old_addr}"
            )));
        }
        if hosts.iter().any(|h| h == new_addr) {
            return Err(MasterError::Validation(format!(
                "{new_addr} already hosts partition {id}"
            )));
        }
        if !self.topology.contains(kind, new_addr) {
            return Err(MasterError::NotFound(format!("{} {new_addr}", kind.as_str())));
        }
        Ok(())
    }

    fn drop_data_partition(&self, id: u64) -> bool {
        let Some(dp) = self.partitions.remove_data(id) else {
            return false;
        };
        for host in dp.hosts() {
            self.topology.detach(NodeKind::Data, &host, id);
        }
        if let Some(vol) = self.volume(&dp.volume) {
            vol.write().data_partitions.retain(|p| *p != id);
        }
        true
    }

    fn drop_meta_partition(&self, id: u64) -> bool {
        let Some(mp) = self.partitions.meta_partition(id) else {
            return false;
        };
        self.partitions.remove_meta(id);
        for host in mp.hosts() {
            self.topology.detach(NodeKind::Meta, &host, id);
        }
        if let Some(vol) = self.volume(&mp.volume) {
            vol.write().meta_partitions.retain(|p| *p != id);
        }
        true
    }
}

/// Raft state machine adapter over `Cluster`.
pub struct ClusterStateMachine {
    cluster: Arc<Cluster>,
}

impl ClusterStateMachine {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }

    pub fn encode_command(cmd: &ClusterCommand) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(cmd)?)
    }

    pub fn decode_command(data: &[u8]) -> anyhow::Result<ClusterCommand> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl StateMachine for ClusterStateMachine {
    fn apply(&self, index: LogIndex, data: &[u8]) {
        match Self::decode_command(data) {
            Ok(cmd) => {
                if let Err(err) = self.cluster.apply_command(cmd) {
                    tracing::error!(error = %err, index, "cluster command rejected");
                    self.cluster.record_rejection(index, err);
                }
            }
            Err(err) => {
                tracing::error!(error = ?err, index, "cluster command decode failed");
                self.cluster.record_rejection(index, MasterError::Internal(err));
            }
        }
        self.cluster.applied.store(index, Ordering::SeqCst);
    }

    fn advance(&self, index: LogIndex) {
        self.cluster.applied.store(index, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> Cluster {
        let cluster = Cluster::new(&MasterConfig::default());
        for (i, addr) in ["d1:1", "d2:1", "d3:1", "d4:1"].iter().enumerate() {
            cluster
                .apply_command(ClusterCommand::AddDataNode {
                    id: i as u64 + 1,
                    addr: addr.to_string(),
                })
                .unwrap();
        }
        for (i, addr) in ["m1:1", "m2:1", "m3:1", "m4:1"].iter().enumerate() {
            cluster
                .apply_command(ClusterCommand::AddMetaNode {
                    id: i as u64 + 10,
                    addr: addr.to_string(),
                })
                .unwrap();
        }
        cluster
            .apply_command(ClusterCommand::CreateVolume {
                name: "vol1".into(),
                replica_num: 3,
                capacity_gb: 100,
                data_partition_size_gb: 120,
            })
            .unwrap();
        cluster
    }

    fn hosts(prefix: &str) -> Vec<String> {
        (1..=3).map(|i| format!("{prefix}{i}:1")).collect()
    }

    /// Ranges of the volume's meta partitions in order.
    fn ranges(cluster: &Cluster, vol: &str) -> Vec<(u64, u64)> {
        let vol = cluster.volume(vol).unwrap();
        cluster
            .partitions
            .meta_partitions_by_id(&vol.meta_partition_ids())
            .iter()
            .map(|mp| mp.range())
            .collect()
    }

    fn assert_tiles(ranges: &[(u64, u64)]) {
        assert_eq!(ranges.first().map(|r| r.0), Some(0));
        assert_eq!(ranges.last().map(|r| r.1), Some(u64::MAX));
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0, "gap or overlap in {ranges:?}");
        }
    }

    #[test]
    fn meta_ranges_tile_across_splits() {
        let cluster = cluster();
        cluster
            .apply_command(ClusterCommand::AddMetaPartition {
                id: 1,
                volume: "vol1".into(),
                start: 0,
                end: u64::MAX,
                hosts: hosts("m"),
            })
            .unwrap();
        assert_tiles(&ranges(&cluster, "vol1"));

        for (id, start) in [(2, 1000), (3, 5000)] {
            cluster
                .apply_command(ClusterCommand::SplitMetaPartition {
                    volume: "vol1".into(),
                    parent: id - 1,
                    id,
                    start,
                    hosts: hosts("m"),
                })
                .unwrap();
            assert_tiles(&ranges(&cluster, "vol1"));
        }
        assert_eq!(
            ranges(&cluster, "vol1"),
            vec![(0, 999), (1000, 4999), (5000, u64::MAX)]
        );
    }

    #[test]
    fn split_below_highest_start_is_invalid_range() {
        let cluster = cluster();
        cluster
            .apply_command(ClusterCommand::AddMetaPartition {
                id: 1,
                volume: "vol1".into(),
                start: 0,
                end: u64::MAX,
                hosts: hosts("m"),
            })
            .unwrap();
        cluster
            .apply_command(ClusterCommand::SplitMetaPartition {
                volume: "vol1".into(),
                parent: 1,
                id: 2,
                start: 100,
                hosts: hosts("m"),
            })
            .unwrap();
        let err = cluster
            .apply_command(ClusterCommand::SplitMetaPartition {
                volume: "vol1".into(),
                parent: 2,
                id: 3,
                start: 50,
                hosts: hosts("m"),
            })
            .unwrap_err();
        assert!(matches!(err, MasterError::InvalidRange(_)));
        // A second "first" partition is refused too.
        let err = cluster
            .apply_command(ClusterCommand::AddMetaPartition {
                id: 4,
                volume: "vol1".into(),
                start: 0,
                end: u64::MAX,
                hosts: hosts("m"),
            })
            .unwrap_err();
        assert!(matches!(err, MasterError::InvalidRange(_)));
        assert_tiles(&ranges(&cluster, "vol1"));
        assert!(cluster.partitions.meta_partition(3).is_none());
    }

    #[test]
    fn split_of_a_partition_that_is_no_longer_highest_is_refused() {
        let cluster = cluster();
        cluster
            .apply_command(ClusterCommand::AddMetaPartition {
                id: 1,
                volume: "vol1".into(),
                start: 0,
                end: u64::MAX,
                hosts: hosts("m"),
            })
            .unwrap();
        cluster
            .apply_command(ClusterCommand::SplitMetaPartition {
                volume: "vol1".into(),
                parent: 1,
                id: 2,
                start: 1000,
                hosts: hosts("m"),
            })
            .unwrap();
        // Computed against partition 1 before the first split landed.
        let err = cluster
            .apply_command(ClusterCommand::SplitMetaPartition {
                volume: "vol1".into(),
                parent: 1,
                id: 3,
                start: 2000,
                hosts: hosts("m"),
            })
            .unwrap_err();
        assert!(matches!(err, MasterError::InvalidRange(_)));
        assert_eq!(ranges(&cluster, "vol1"), vec![(0, 999), (1000, u64::MAX)]);
        assert!(cluster.partitions.meta_partition(3).is_none());
    }

    #[test]
    fn replica_replacement_updates_indices_and_bad_disk_pending() {
        let cluster = cluster();
        cluster
            .apply_command(ClusterCommand::AddDataPartition {
                id: 5,
                volume: "vol1".into(),
                hosts: hosts("d"),
            })
            .unwrap();
        cluster
            .apply_command(ClusterCommand::RecordBadDisk {
                addr: "d2:1".into(),
                disk_path: "/data0".into(),
                partition_ids: vec![5],
            })
            .unwrap();
        assert_eq!(
            cluster.bad_partition_record("d2:1", "/data0").unwrap().pending,
            vec![5]
        );

        cluster
            .apply_command(ClusterCommand::ReplaceDataReplica {
                id: 5,
                old_addr: "d2:1".into(),
                new_addr: "d4:1".into(),
            })
            .unwrap();
        let dp = cluster.partitions.data_partition(5).unwrap();
        assert_eq!(dp.hosts(), vec!["d1:1", "d4:1", "d3:1"]);
        assert!(!cluster.topology.data_node("d2:1").unwrap().hosts_partition(5));
        assert!(cluster.topology.data_node("d4:1").unwrap().hosts_partition(5));

        let record = cluster.bad_partition_record("d2:1", "/data0").unwrap();
        assert_eq!(record.partition_ids, vec![5]);
        assert!(record.pending.is_empty());

        // Replacing onto a node that already hosts the partition is refused.
        let err = cluster
            .apply_command(ClusterCommand::ReplaceDataReplica {
                id: 5,
                old_addr: "d1:1".into(),
                new_addr: "d3:1".into(),
            })
            .unwrap_err();
        assert!(matches!(err, MasterError::Validation(_)));
    }

    #[test]
    fn node_removal_waits_for_partitions_to_drain() {
        let cluster = cluster();
        cluster
            .apply_command(ClusterCommand::AddDataPartition {
                id: 1,
                volume: "vol1".into(),
                hosts: hosts("d"),
            })
            .unwrap();
        let err = cluster
            .apply_command(ClusterCommand::RemoveDataNode {
                addr: "d1:1".into(),
            })
            .unwrap_err();
        assert!(matches!(err, MasterError::DecommissionIncomplete { .. }));
        cluster
            .apply_command(ClusterCommand::RemoveDataNode {
                addr: "d4:1".into(),
            })
            .unwrap();
        assert!(cluster.topology.data_node("d4:1").is_none());
    }

    #[test]
    fn removing_volume_cascades_partitions() {
        let cluster = cluster();
        cluster
            .apply_command(ClusterCommand::AddDataPartition {
                id: 1,
                volume: "vol1".into(),
                hosts: hosts("d"),
            })
            .unwrap();
        cluster
            .apply_command(ClusterCommand::AddMetaPartition {
                id: 1,
                volume: "vol1".into(),
                start: 0,
                end: u64::MAX,
                hosts: hosts("m"),
            })
            .unwrap();
        let err = cluster
            .apply_command(ClusterCommand::RemoveMetaPartition { id: 1 })
            .unwrap_err();
        assert!(matches!(err, MasterError::Validation(_)));

        cluster
            .apply_command(ClusterCommand::MarkDeleteVolume {
                name: "vol1".into(),
            })
            .unwrap();
        cluster
            .apply_command(ClusterCommand::RemoveVolume {
                name: "vol1".into(),
            })
            .unwrap();
        assert!(cluster.volume("vol1").is_none());
        assert!(cluster.partitions.data_partition(1).is_none());
        assert!(cluster.partitions.meta_partition(1).is_none());
        assert_eq!(cluster.topology.data_node("d1:1").unwrap().partition_count(), 0);
    }

    #[test]
    fn state_machine_records_rejections_by_index() {
        let cluster = Arc::new(cluster());
        let sm = ClusterStateMachine::new(cluster.clone());
        let bad = ClusterStateMachine::encode_command(&ClusterCommand::AddDataNode {
            id: 99,
            addr: "d1:1".into(),
        })
        .unwrap();
        sm.apply(7, &bad);
        assert_eq!(cluster.applied_index(), 7);
        assert!(matches!(
            cluster.take_rejection(7),
            Some(MasterError::DuplicateNode(_))
        ));
        assert!(cluster.take_rejection(7).is_none());

        sm.apply(8, b"not json");
        assert!(matches!(cluster.take_rejection(8), Some(MasterError::Internal(_))));

        // No-op and membership entries move the index without a command.
        sm.advance(9);
        assert_eq!(cluster.applied_index(), 9);
        assert!(cluster.take_rejection(9).is_none());
    }

    #[test]
    fn settings_are_validated() {
        let cluster = cluster();
        assert!(cluster
            .apply_command(ClusterCommand::SetMetaNodeThreshold { threshold: 1.5 })
            .is_err());
        cluster
            .apply_command(ClusterCommand::SetMetaNodeThreshold { threshold: 0.8 })
            .unwrap();
        cluster
            .apply_command(ClusterCommand::SetAutoAllocate { enabled: false })
            .unwrap();
        let settings = cluster.settings();
        assert_eq!(settings.meta_node_threshold, 0.8);
        assert!(!settings.should_auto_allocate);
    }
}
