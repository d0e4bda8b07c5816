//! The master facade: every admin and ingest operation enters here.
//!
//! Mutations are checked up front (leadership, existence, validation) so
//! callers get fast synchronous errors, then go through `propose`, which
//! waits for the command to apply locally and surfaces any rejection the
//! apply path recorded for it.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use cfs_raft::raft::{Config as RaftConfig, LogStore, Member, RaftNode, RaftStatus, Transport};
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::cluster::{Cluster, ClusterCommand, ClusterStateMachine};
use crate::config::MasterConfig;
use crate::error::{MasterError, Result};
use crate::id_alloc::IdAllocator;
use crate::node_client::NodeClient;
use crate::partition::{DataPartition, MetaPartition, StatusInputs};
use crate::topology::NodeKind;
use crate::views::{LoadReport, ReplicaLoad};
use crate::volume::{validate_volume_name, VolStatus};

pub struct Master {
    pub(crate) config: MasterConfig,
    pub(crate) cluster: Arc<Cluster>,
    pub(crate) raft: Arc<RaftNode>,
    pub(crate) nodes: Arc<dyn NodeClient>,
    pub(crate) id_alloc: IdAllocator,
    /// Held across build, propose and delete of one replica migration.
    pub(crate) migrations: KeyedLocks<(NodeKind, u64)>,
    /// Held across one meta range split of a volume.
    pub(crate) splits: KeyedLocks<String>,
}

/// Async locks created on first use, one per key.
pub(crate) struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash> KeyedLocks<K> {
    pub(crate) async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(key).or_default().clone();
        lock.lock_owned().await
    }
}

impl Master {
    pub fn new(
        config: MasterConfig,
        raft_config: RaftConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn LogStore>,
        nodes: Arc<dyn NodeClient>,
    ) -> anyhow::Result<Arc<Self>> {
        let cluster = Arc::new(Cluster::new(&config));
        let sm = Arc::new(ClusterStateMachine::new(cluster.clone()));
        let raft = RaftNode::new(raft_config, transport, sm, store)?;
        Ok(Arc::new(Self {
            config,
            cluster,
            raft,
            nodes,
            id_alloc: IdAllocator::default(),
            migrations: KeyedLocks::default(),
            splits: KeyedLocks::default(),
        }))
    }

    /// Start the raft ticker. Schedulers are spawned separately.
    pub fn start(&self) {
        self.raft.start();
    }

    pub async fn shutdown(&self) {
        self.raft.shutdown().await;
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub async fn is_leader(&self) -> bool {
        self.raft.is_leader().await
    }

    pub async fn leader_addr(&self) -> Option<String> {
        self.raft.leader().await.map(|member| member.addr)
    }

    pub async fn raft_status(&self) -> RaftStatus {
        self.raft.status().await
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String> {
        Ok(self.raft.wait_for_leader(timeout).await?.addr)
    }

    pub(crate) async fn ensure_leader(&self) -> Result<()> {
        if self.raft.is_leader().await {
            return Ok(());
        }
        Err(MasterError::NotLeader {
            leader: self.leader_addr().await,
        })
    }

    /// Replicate `cmd` and wait for it to apply on this master.
    pub(crate) async fn propose(&self, cmd: ClusterCommand) -> Result<u64> {
        let payload = ClusterStateMachine::encode_command(&cmd)?;
        let index = self.raft.propose(payload).await?;
        match self.cluster.take_rejection(index) {
            Some(err) => Err(err),
            None => Ok(index),
        }
    }

    /// Run a remote node instruction under the replica timeout.
    pub(crate) async fn node_call<T, F>(&self, what: String, fut: F) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.config.replica_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(MasterError::Internal(err.context(what))),
            Err(_) => Err(MasterError::Timeout(what)),
        }
    }

    pub async fn create_volume(
        &self,
        name: &str,
        replica_num: usize,
        data_partition_size_gb: u64,
        capacity_gb: u64,
    ) -> Result<()> {
        validate_volume_name(name)?;
        if replica_num < 2 {
            return Err(MasterError::Validation(format!(
                "replica number {replica_num} is below 2"
            )));
        }
        self.ensure_leader().await?;
        if self.cluster.volume(name).is_some() {
            return Err(MasterError::Validation(format!("volume {name} already exists")));
        }
        let data_partition_size_gb = if data_partition_size_gb == 0 {
            self.config.default_data_partition_size_gb
        } else {
            data_partition_size_gb
        };
        let capacity_gb = if capacity_gb == 0 {
            self.config.default_volume_capacity_gb
        } else {
            capacity_gb
        };
        self.propose(ClusterCommand::CreateVolume {
            name: name.to_string(),
            replica_num,
            capacity_gb,
            data_partition_size_gb,
        })
        .await?;

        if let Err(err) = self.create_initial_meta_partition(name).await {
            tracing::warn!(vol = %name, error = %err, "initial meta partition failed; rolling back volume");
            self.rollback_volume(name).await;
            return Err(err);
        }

        let wanted = self.config.initial_data_partitions.max(1);
        let mut created = 0usize;
        let mut last_err = None;
        for _ in 0..wanted {
            match self.create_data_partition(name).await {
                Ok(_) => created += 1,
                Err(err) => {
                    last_err = Some(err);
                    break;
                }
            }
        }
        if created == 0 {
            let err = last_err
                .unwrap_or_else(|| MasterError::Internal(anyhow!("no data partition created")));
            tracing::warn!(vol = %name, error = %err, "initial data partitions failed; rolling back volume");
            self.rollback_volume(name).await;
            return Err(err);
        }
        if let Some(err) = last_err {
            tracing::warn!(vol = %name, created, wanted, error = %err, "volume created with fewer data partitions");
        }
        tracing::info!(vol = %name, replica_num, capacity_gb, data_partitions = created, "volume created");
        Ok(())
    }

    /// Undo a half-created volume: drop remote meta replicas and the
    /// volume record. Failures are logged; reclamation retries later.
    async fn rollback_volume(&self, name: &str) {
        if let Some(vol) = self.cluster.volume(name) {
            for mp in self.cluster.partitions.meta_partitions_by_id(&vol.meta_partition_ids()) {
                let deletes = mp.hosts().into_iter().map(|host| {
                    let id = mp.id;
                    async move {
                        let res = self
                            .node_call(
                                format!("delete meta replica {id} on {host}"),
                                self.nodes.delete_meta_replica(&host, id),
                            )
                            .await;
                        if let Err(err) = res {
                            tracing::warn!(error = %err, "rollback delete failed");
                        }
                    }
                });
                join_all(deletes).await;
            }
        }
        if let Err(err) = self
            .propose(ClusterCommand::RemoveVolume {
                name: name.to_string(),
            })
            .await
        {
            tracing::warn!(vol = %name, error = %err, "volume rollback failed");
        }
    }

    pub async fn update_volume(&self, name: &str, capacity_gb: u64) -> Result<()> {
        self.ensure_leader().await?;
        if self.cluster.volume(name).is_none() {
            return Err(MasterError::NotFound(format!("volume {name}")));
        }
        self.propose(ClusterCommand::UpdateVolume {
            name: name.to_string(),
            capacity_gb,
        })
        .await?;
        Ok(())
    }

    /// Logical delete. Partitions are reclaimed in the background.
    pub async fn mark_delete_volume(&self, name: &str) -> Result<()> {
        self.ensure_leader().await?;
        let vol = self
            .cluster
            .volume(name)
            .ok_or_else(|| MasterError::NotFound(format!("volume {name}")))?;
        if vol.status() == VolStatus::MarkDelete {
            return Ok(());
        }
        self.propose(ClusterCommand::MarkDeleteVolume {
            name: name.to_string(),
        })
        .await?;
        tracing::info!(vol = %name, "volume marked for deletion");
        Ok(())
    }

    pub async fn add_data_node(&self, addr: &str) -> Result<u64> {
        self.add_node(NodeKind::Data, addr).await
    }

    pub async fn add_meta_node(&self, addr: &str) -> Result<u64> {
        self.add_node(NodeKind::Meta, addr).await
    }

    async fn add_node(&self, kind: NodeKind, addr: &str) -> Result<u64> {
        if addr.trim().is_empty() {
            return Err(MasterError::Validation("node address is empty".into()));
        }
        self.ensure_leader().await?;
        if self.cluster.topology.contains(kind, addr) {
            return Err(MasterError::DuplicateNode(addr.to_string()));
        }
        let id = self.next_common_id().await?;
        let addr = addr.to_string();
        let cmd = match kind {
            NodeKind::Data => ClusterCommand::AddDataNode { id, addr },
            NodeKind::Meta => ClusterCommand::AddMetaNode { id, addr },
        };
        self.propose(cmd).await?;
        Ok(id)
    }

    pub async fn set_auto_allocate(&self, enabled: bool) -> Result<()> {
        self.ensure_leader().await?;
        self.propose(ClusterCommand::SetAutoAllocate { enabled }).await?;
        tracing::info!(enabled, "auto allocation toggled");
        Ok(())
    }

    pub async fn set_meta_node_threshold(&self, threshold: f32) -> Result<()> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(MasterError::Validation(format!(
                "meta node threshold {threshold} must be in (0, 1]"
            )));
        }
        self.ensure_leader().await?;
        self.propose(ClusterCommand::SetMetaNodeThreshold { threshold })
            .await?;
        self.refresh_partition_statuses();
        Ok(())
    }

    /// Operator acknowledgement of a bad disk; drops its audit record.
    pub async fn clear_bad_disk(&self, addr: &str, disk_path: &str) -> Result<()> {
        self.ensure_leader().await?;
        self.propose(ClusterCommand::ClearBadDisk {
            addr: addr.to_string(),
            disk_path: disk_path.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn add_raft_node(&self, id: u64, addr: &str) -> Result<()> {
        self.ensure_leader().await?;
        self.raft
            .add_member(Member {
                id,
                addr: addr.to_string(),
            })
            .await?;
        tracing::info!(node_id = id, addr = %addr, "master added to raft group");
        Ok(())
    }

    pub async fn remove_raft_node(&self, id: u64, addr: &str) -> Result<()> {
        self.ensure_leader().await?;
        let members = self.raft.members().await;
        if !members.iter().any(|m| m.id == id && m.addr == addr) {
            return Err(MasterError::NotFound(format!("raft member {id}@{addr}")));
        }
        self.raft.remove_member(id).await?;
        tracing::info!(node_id = id, addr = %addr, "master removed from raft group");
        Ok(())
    }

    /// Ask every replica for a checksum and report whether they agree.
    pub async fn load_data_partition(&self, partition_id: u64) -> Result<LoadReport> {
        let dp = self
            .cluster
            .partitions
            .data_partition(partition_id)
            .ok_or_else(|| MasterError::NotFound(format!("data partition {partition_id}")))?;
        let loads = dp.hosts().into_iter().map(|host| async move {
            let res = self
                .node_call(
                    format!("load data partition {partition_id} on {host}"),
                    self.nodes.load_data_partition(&host, partition_id),
                )
                .await;
            (host, res)
        });
        Ok(self.load_report(partition_id, join_all(loads).await))
    }

    pub async fn load_meta_partition(&self, partition_id: u64) -> Result<LoadReport> {
        let mp = self
            .cluster
            .partitions
            .meta_partition(partition_id)
            .ok_or_else(|| MasterError::NotFound(format!("meta partition {partition_id}")))?;
        let loads = mp.hosts().into_iter().map(|host| async move {
            let res = self
                .node_call(
                    format!("load meta partition {partition_id} on {host}"),
                    self.nodes.load_meta_partition(&host, partition_id),
                )
                .await;
            (host, res)
        });
        Ok(self.load_report(partition_id, join_all(loads).await))
    }

    fn load_report(
        &self,
        partition_id: u64,
        results: Vec<(String, Result<crate::node_client::ReplicaChecksum>)>,
    ) -> LoadReport {
        let replicas: Vec<ReplicaLoad> = results
            .into_iter()
            .map(|(addr, res)| match res {
                Ok(sum) => ReplicaLoad {
                    addr,
                    checksum: Some(sum.checksum),
                    size: Some(sum.size),
                    error: None,
                },
                Err(err) => ReplicaLoad {
                    addr,
                    checksum: None,
                    size: None,
                    error: Some(err.to_string()),
                },
            })
            .collect();
        let first = replicas.first().and_then(|r| r.checksum);
        let consistent = first.is_some() && replicas.iter().all(|r| r.checksum == first);
        if !consistent {
            tracing::warn!(partition_id, replicas = ?replicas, "replica checksums disagree");
        }
        LoadReport {
            partition_id,
            consistent,
            replicas,
        }
    }

    /// Recompute every partition's status from current liveness and stats.
    pub fn refresh_partition_statuses(&self) {
        self.refresh_data_partitions(&self.cluster.partitions.data_partitions());
        self.refresh_meta_partitions(&self.cluster.partitions.meta_partitions());
    }

    pub(crate) fn refresh_data_partitions(&self, partitions: &[Arc<DataPartition>]) {
        let topology = &self.cluster.topology;
        let is_active = |addr: &str| topology.is_node_active(NodeKind::Data, addr);
        let never = |_: &str| false;
        let inputs = StatusInputs {
            is_node_active: &is_active,
            live_ratio: topology.live_ratio(NodeKind::Data),
            live_ratio_threshold: self.config.live_ratio_threshold,
            used_ceiling: self.config.data_partition_used_ceiling,
            is_node_overloaded: &never,
        };
        for dp in partitions {
            dp.refresh_status(&inputs);
        }
    }

    pub(crate) fn refresh_meta_partitions(&self, partitions: &[Arc<MetaPartition>]) {
        let topology = &self.cluster.topology;
        let threshold = f64::from(self.cluster.settings().meta_node_threshold);
        let is_active = |addr: &str| topology.is_node_active(NodeKind::Meta, addr);
        let overloaded = |addr: &str| {
            topology
                .meta_node(addr)
                .is_some_and(|node| node.stats().memory_ratio() >= threshold)
        };
        let inputs = StatusInputs {
            is_node_active: &is_active,
            live_ratio: topology.live_ratio(NodeKind::Meta),
            live_ratio_threshold: self.config.live_ratio_threshold,
            used_ceiling: self.config.data_partition_used_ceiling,
            is_node_overloaded: &overloaded,
        };
        for mp in partitions {
            mp.refresh_status(&inputs);
        }
    }
}
