//! Replica placement and partition creation.
//!
//! `select_hosts` is a pure function over a candidate list so it can be
//! exercised without a cluster. It spreads replicas across node sets first,
//! then prefers nodes carrying fewer of the volume's replicas, then fewer
//! partitions overall. The address breaks the remaining ties so the same
//! inputs always yield the same hosts.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::future::join_all;

use crate::cluster::ClusterCommand;
use crate::error::{MasterError, Result};
use crate::master::Master;
use crate::node_client::{CreateDataReplica, CreateMetaReplica};
use crate::partition::{DataPartition, MetaPartition};
use crate::topology::NodeKind;
use crate::volume::{VolStatus, Volume};

#[derive(Clone, Debug)]
pub struct Candidate {
    pub addr: String,
    pub node_set_id: u64,
    /// Replicas of the target volume already on this node.
    pub volume_replicas: usize,
    /// Partitions of any volume on this node.
    pub load: usize,
}

impl Candidate {
    fn rank(&self) -> (usize, usize, &str) {
        (self.volume_replicas, self.load, self.addr.as_str())
    }
}

/// Choose `count` distinct hosts from `candidates`, skipping `exclude`.
/// `occupied_sets` lists node sets already holding a replica of the
/// partition, so a replacement host lands in a fresh set when possible.
pub fn select_hosts(
    candidates: &[Candidate],
    count: usize,
    exclude: &[String],
    occupied_sets: &[u64],
) -> Result<Vec<String>> {
    let mut groups: BTreeMap<u64, Vec<&Candidate>> = BTreeMap::new();
    for candidate in candidates.iter().filter(|c| !exclude.contains(&c.addr)) {
        groups.entry(candidate.node_set_id).or_default().push(candidate);
    }
    let available = groups.values().map(Vec::len).sum::<usize>();
    if available < count {
        return Err(MasterError::InsufficientReplicas {
            need: count,
            available,
        });
    }
    // Best candidate last so `pop` hands it out.
    for group in groups.values_mut() {
        group.sort_by(|a, b| b.rank().cmp(&a.rank()));
    }
    let mut picks: BTreeMap<u64, usize> = groups
        .keys()
        .map(|id| (*id, occupied_sets.iter().filter(|s| *s == id).count()))
        .collect();

    let mut chosen = Vec::with_capacity(count);
    while chosen.len() < count {
        let next_set = groups
            .iter()
            .filter_map(|(id, group)| group.last().map(|best| (*id, best)))
            .min_by(|(a_id, a), (b_id, b)| {
                let a_picks = picks.get(a_id).copied().unwrap_or(0);
                let b_picks = picks.get(b_id).copied().unwrap_or(0);
                (a_picks, a.rank(), *a_id).cmp(&(b_picks, b.rank(), *b_id))
            })
            .map(|(id, _)| id);
        let Some(set_id) = next_set else { break };
        if let Some(candidate) = groups.get_mut(&set_id).and_then(Vec::pop) {
            chosen.push(candidate.addr.clone());
            *picks.entry(set_id).or_default() += 1;
        }
    }
    Ok(chosen)
}

impl Master {
    fn replicas_per_node(hosts: impl Iterator<Item = Vec<String>>) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for host in hosts.flatten() {
            *counts.entry(host).or_insert(0) += 1;
        }
        counts
    }

    /// Active, non-decommissioning data nodes with free space.
    pub(crate) fn data_candidates(&self, vol: &Volume) -> Vec<Candidate> {
        let counts = Self::replicas_per_node(
            self.cluster
                .partitions
                .data_partitions_by_id(&vol.data_partition_ids())
                .into_iter()
                .map(|dp| dp.hosts()),
        );
        self.cluster
            .topology
            .data_nodes()
            .into_iter()
            .filter(|node| node.is_active() && !node.is_decommissioning() && !node.is_full())
            .map(|node| Candidate {
                volume_replicas: counts.get(&node.addr).copied().unwrap_or(0),
                load: node.partition_count(),
                node_set_id: node.node_set_id,
                addr: node.addr.clone(),
            })
            .collect()
    }

    /// Active, non-decommissioning meta nodes under the memory threshold.
    pub(crate) fn meta_candidates(&self, vol: &Volume) -> Vec<Candidate> {
        let threshold = f64::from(self.cluster.settings().meta_node_threshold);
        let counts = Self::replicas_per_node(
            self.cluster
                .partitions
                .meta_partitions_by_id(&vol.meta_partition_ids())
                .into_iter()
                .map(|mp| mp.hosts()),
        );
        self.cluster
            .topology
            .meta_nodes()
            .into_iter()
            .filter(|node| {
                node.is_active()
                    && !node.is_decommissioning()
                    && node.stats().memory_ratio() < threshold
            })
            .map(|node| Candidate {
                volume_replicas: counts.get(&node.addr).copied().unwrap_or(0),
                load: node.partition_count(),
                node_set_id: node.node_set_id,
                addr: node.addr.clone(),
            })
            .collect()
    }

    pub(crate) fn writable_volume(&self, name: &str) -> Result<Arc<Volume>> {
        let vol = self
            .cluster
            .volume(name)
            .ok_or_else(|| MasterError::NotFound(format!("volume {name}")))?;
        if vol.status() == VolStatus::MarkDelete {
            return Err(MasterError::Validation(format!(
                "volume {name} is marked for deletion"
            )));
        }
        Ok(vol)
    }

    /// Admin entry point: add `count` data partitions to a volume.
    pub async fn create_data_partitions(&self, volume: &str, count: usize) -> Result<Vec<u64>> {
        if count == 0 {
            return Err(MasterError::Validation("count must be at least 1".into()));
        }
        self.ensure_leader().await?;
        self.writable_volume(volume)?;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.create_data_partition(volume).await?.id);
        }
        Ok(ids)
    }

    pub(crate) async fn create_data_partition(&self, volume: &str) -> Result<Arc<DataPartition>> {
        self.ensure_leader().await?;
        let vol = self.writable_volume(volume)?;
        let hosts = select_hosts(&self.data_candidates(&vol), vol.replica_num, &[], &[])?;
        let id = self.next_data_partition_id().await?;
        let req = CreateDataReplica {
            partition_id: id,
            volume: vol.name.clone(),
            size_gb: vol.data_partition_size_gb,
            members: hosts.clone(),
        };

        let creates = hosts.iter().map(|host| {
            let req = &req;
            async move {
                let res = self
                    .node_call(
                        format!("create data replica {id} on {host}"),
                        self.nodes.create_data_replica(host, req),
                    )
                    .await;
                (host.clone(), res)
            }
        });
        let results = join_all(creates).await;
        let created: Vec<String> = results
            .iter()
            .filter(|(_, res)| res.is_ok())
            .map(|(host, _)| host.clone())
            .collect();
        if let Some(err) = results.into_iter().find_map(|(_, res)| res.err()) {
            tracing::warn!(vol = %volume, partition_id = id, error = %err, "data replica creation failed");
            self.delete_data_replicas(id, &created).await;
            return Err(err);
        }

        if let Err(err) = self
            .propose(ClusterCommand::AddDataPartition {
                id,
                volume: vol.name.clone(),
                hosts: hosts.clone(),
            })
            .await
        {
            self.delete_data_replicas(id, &created).await;
            return Err(err);
        }
        tracing::info!(vol = %volume, partition_id = id, hosts = ?hosts, "data partition created");
        self.cluster
            .partitions
            .data_partition(id)
            .ok_or_else(|| MasterError::NotFound(format!("data partition {id}")))
    }

    async fn delete_data_replicas(&self, id: u64, hosts: &[String]) {
        let deletes = hosts.iter().map(|host| async move {
            let res = self
                .node_call(
                    format!("delete data replica {id} on {host}"),
                    self.nodes.delete_data_replica(host, id),
                )
                .await;
            if let Err(err) = res {
                tracing::warn!(partition_id = id, host = %host, error = %err, "cleanup delete failed");
            }
        });
        join_all(deletes).await;
    }

    pub(crate) async fn delete_meta_replicas(&self, id: u64, hosts: &[String]) {
        let deletes = hosts.iter().map(|host| async move {
            let res = self
                .node_call(
                    format!("delete meta replica {id} on {host}"),
                    self.nodes.delete_meta_replica(host, id),
                )
                .await;
            if let Err(err) = res {
                tracing::warn!(partition_id = id, host = %host, error = %err, "cleanup delete failed");
            }
        });
        join_all(deletes).await;
    }

    /// Create remote meta replicas for `[start, MAX]` and commit `cmd` for
    /// them. Created replicas are deleted again if anything fails.
    async fn create_meta_partition(
        &self,
        vol: &Volume,
        start: u64,
        commit: impl FnOnce(u64, Vec<String>) -> ClusterCommand,
    ) -> Result<Arc<MetaPartition>> {
        let hosts = select_hosts(&self.meta_candidates(vol), vol.replica_num, &[], &[])?;
        let id = self.next_meta_partition_id().await?;
        let req = CreateMetaReplica {
            partition_id: id,
            volume: vol.name.clone(),
            start,
            end: u64::MAX,
            members: hosts.clone(),
        };
        let creates = hosts.iter().map(|host| {
            let req = &req;
            async move {
                let res = self
                    .node_call(
                        format!("create meta replica {id} on {host}"),
                        self.nodes.create_meta_replica(host, req),
                    )
                    .await;
                (host.clone(), res)
            }
        });
        let results = join_all(creates).await;
        let created: Vec<String> = results
            .iter()
            .filter(|(_, res)| res.is_ok())
            .map(|(host, _)| host.clone())
            .collect();
        if let Some(err) = results.into_iter().find_map(|(_, res)| res.err()) {
            tracing::warn!(vol = %vol.name, partition_id = id, error = %err, "meta replica creation failed");
            self.delete_meta_replicas(id, &created).await;
            return Err(err);
        }

        if let Err(err) = self.propose(commit(id, hosts.clone())).await {
            self.delete_meta_replicas(id, &created).await;
            return Err(err);
        }
        tracing::info!(vol = %vol.name, partition_id = id, start, hosts = ?hosts, "meta partition created");
        self.cluster
            .partitions
            .meta_partition(id)
            .ok_or_else(|| MasterError::NotFound(format!("meta partition {id}")))
    }

    pub(crate) async fn create_initial_meta_partition(&self, volume: &str) -> Result<Arc<MetaPartition>> {
        self.ensure_leader().await?;
        let vol = self.writable_volume(volume)?;
        let name = vol.name.clone();
        self.create_meta_partition(&vol, 0, move |id, hosts| ClusterCommand::AddMetaPartition {
            id,
            volume: name,
            start: 0,
            end: u64::MAX,
            hosts,
        })
        .await
    }

    /// Cap the volume's highest meta partition at `start - 1` and open a new
    /// one covering `[start, MAX]`. Returns the new partition id.
    pub async fn update_inode_id_range(&self, volume: &str, start: u64) -> Result<u64> {
        self.ensure_leader().await?;
        let _split = self.splits.lock(volume.to_string()).await;
        let vol = self.writable_volume(volume)?;
        let Some(highest_id) = vol.highest_meta_partition() else {
            return Err(MasterError::InvalidRange(format!(
                "volume {volume} has no meta partition to split"
            )));
        };
        let highest = self
            .cluster
            .partitions
            .meta_partition(highest_id)
            .ok_or_else(|| MasterError::NotFound(format!("meta partition {highest_id}")))?;
        let current = highest.snapshot();
        if start <= current.start || start <= current.max_inode_id {
            return Err(MasterError::InvalidRange(format!(
                "split point {start} must exceed start {} and max inode {} of partition {highest_id}",
                current.start, current.max_inode_id
            )));
        }

        let name = vol.name.clone();
        let created = self
            .create_meta_partition(&vol, start, move |id, hosts| {
                ClusterCommand::SplitMetaPartition {
                    volume: name,
                    parent: highest_id,
                    id,
                    start,
                    hosts,
                }
            })
            .await?;

        // Hosts of the capped partition learn the new bound; a miss is
        // corrected when the node next reconciles with the master.
        let end = start - 1;
        let updates = current.replicas.iter().map(|replica| {
            let host = replica.addr.clone();
            async move {
                let res = self
                    .node_call(
                        format!("update range of meta partition {highest_id} on {host}"),
                        self.nodes.update_meta_range(&host, highest_id, end),
                    )
                    .await;
                if let Err(err) = res {
                    tracing::warn!(partition_id = highest_id, host = %host, error = %err, "meta range update failed");
                }
            }
        });
        join_all(updates).await;
        Ok(created.id)
    }

    /// Pick a replacement host for one replica of a partition.
    pub(crate) fn replacement_host(
        &self,
        kind: NodeKind,
        vol: &Volume,
        current_hosts: &[String],
    ) -> Result<String> {
        let occupied: Vec<u64> = current_hosts
            .iter()
            .filter_map(|host| self.cluster.topology.node_set_of(kind, host))
            .collect();
        let candidates = match kind {
            NodeKind::Data => self.data_candidates(vol),
            NodeKind::Meta => self.meta_candidates(vol),
        };
        select_hosts(&candidates, 1, current_hosts, &occupied)?
            .pop()
            .ok_or(MasterError::InsufficientReplicas {
                need: 1,
                available: 0,
            })
    }
}
