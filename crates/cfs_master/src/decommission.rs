//! Moving replicas off failing or retiring hosts.
//!
//! A replica is swapped only after its replacement confirms the build, so
//! the recorded replica set never shrinks below what actually exists. Every
//! entry point is safe to re-run: partitions already moved off the node are
//! skipped.

use crate::cluster::ClusterCommand;
use crate::error::{MasterError, Result};
use crate::master::Master;
use crate::node_client::{BuildDataReplica, BuildMetaReplica};
use crate::topology::NodeKind;

impl Master {
    /// Replace the replica of data partition `partition_id` on `addr`.
    /// Returns the new host, or `None` when `addr` no longer hosts it.
    /// `on_failure` sees the error before it is returned.
    pub async fn decommission_data_partition(
        &self,
        addr: &str,
        partition_id: u64,
        on_failure: impl FnOnce(&MasterError),
    ) -> Result<Option<String>> {
        let res = self.migrate_data_replica(addr, partition_id).await;
        if let Err(err) = &res {
            on_failure(err);
        }
        res
    }

    async fn migrate_data_replica(&self, addr: &str, partition_id: u64) -> Result<Option<String>> {
        self.ensure_leader().await?;
        let _migration = self.migrations.lock((NodeKind::Data, partition_id)).await;
        let dp = self
            .cluster
            .partitions
            .data_partition(partition_id)
            .ok_or_else(|| MasterError::NotFound(format!("data partition {partition_id}")))?;
        let state = dp.snapshot();
        let hosts: Vec<String> = state.replicas.iter().map(|r| r.addr.clone()).collect();
        if !hosts.iter().any(|h| h == addr) {
            return Ok(None);
        }
        let vol = self
            .cluster
            .volume(&dp.volume)
            .ok_or_else(|| MasterError::NotFound(format!("volume {}", dp.volume)))?;

        let source = self
            .copy_source(NodeKind::Data, state.leader_addr.as_deref(), &hosts, addr)
            .ok_or_else(|| {
                MasterError::Unavailable(format!(
                    "data partition {partition_id} has no surviving replica to copy from"
                ))
            })?;
        let new_host = self.replacement_host(NodeKind::Data, &vol, &hosts)?;
        let members: Vec<String> = hosts
            .iter()
            .map(|h| if h == addr { new_host.clone() } else { h.clone() })
            .collect();

        let req = BuildDataReplica {
            partition_id,
            volume: vol.name.clone(),
            size_gb: vol.data_partition_size_gb,
            source: source.clone(),
            members,
        };
        self.node_call(
            format!("build data replica {partition_id} on {new_host}"),
            self.nodes.build_data_replica(&new_host, &req),
        )
        .await?;

        if let Err(err) = self
            .propose(ClusterCommand::ReplaceDataReplica {
                id: partition_id,
                old_addr: addr.to_string(),
                new_addr: new_host.clone(),
            })
            .await
        {
            if dp.hosts().contains(&new_host) {
                tracing::warn!(partition_id, host = %new_host, error = %err, "replacement already recorded, keeping it");
            } else {
                self.discard_data_replica(partition_id, &new_host).await;
            }
            return Err(err);
        }
        tracing::info!(partition_id, from = %addr, to = %new_host, source = %source, "data replica migrated");
        self.discard_data_replica(partition_id, addr).await;
        Ok(Some(new_host))
    }

    async fn discard_data_replica(&self, partition_id: u64, host: &str) {
        let res = self
            .node_call(
                format!("delete data replica {partition_id} on {host}"),
                self.nodes.delete_data_replica(host, partition_id),
            )
            .await;
        if let Err(err) = res {
            tracing::warn!(partition_id, host = %host, error = %err, "replica delete failed");
        }
    }

    /// Replace the replica of meta partition `partition_id` on `addr`. The
    /// new replica replays the range from a peer's log.
    pub async fn decommission_meta_partition(
        &self,
        addr: &str,
        partition_id: u64,
    ) -> Result<Option<String>> {
        self.ensure_leader().await?;
        let _migration = self.migrations.lock((NodeKind::Meta, partition_id)).await;
        let mp = self
            .cluster
            .partitions
            .meta_partition(partition_id)
            .ok_or_else(|| MasterError::NotFound(format!("meta partition {partition_id}")))?;
        let state = mp.snapshot();
        let hosts: Vec<String> = state.replicas.iter().map(|r| r.addr.clone()).collect();
        if !hosts.iter().any(|h| h == addr) {
            return Ok(None);
        }
        let vol = self
            .cluster
            .volume(&mp.volume)
            .ok_or_else(|| MasterError::NotFound(format!("volume {}", mp.volume)))?;
        let source = self
            .copy_source(NodeKind::Meta, state.leader_addr.as_deref(), &hosts, addr)
            .ok_or_else(|| {
                MasterError::Unavailable(format!(
                    "meta partition {partition_id} has no surviving replica"
                ))
            })?;
        let new_host = self.replacement_host(NodeKind::Meta, &vol, &hosts)?;
        let members: Vec<String> = hosts
            .iter()
            .map(|h| if h == addr { new_host.clone() } else { h.clone() })
            .collect();

        let req = BuildMetaReplica {
            partition_id,
            volume: vol.name.clone(),
            start: state.start,
            end: state.end,
            source,
            members,
        };
        self.node_call(
            format!("build meta replica {partition_id} on {new_host}"),
            self.nodes.build_meta_replica(&new_host, &req),
        )
        .await?;

        if let Err(err) = self
            .propose(ClusterCommand::ReplaceMetaReplica {
                id: partition_id,
                old_addr: addr.to_string(),
                new_addr: new_host.clone(),
            })
            .await
        {
            if mp.hosts().contains(&new_host) {
                tracing::warn!(partition_id, host = %new_host, error = %err, "replacement already recorded, keeping it");
            } else {
                self.delete_meta_replicas(partition_id, std::slice::from_ref(&new_host))
                    .await;
            }
            return Err(err);
        }
        tracing::info!(partition_id, from = %addr, to = %new_host, "meta replica migrated");
        self.delete_meta_replicas(partition_id, &[addr.to_string()])
            .await;
        Ok(Some(new_host))
    }

    /// Peer a replacement copies from. Healthy replicas come first, the
    /// reported leader ahead of the rest; retiring but live nodes are the
    /// fallback. `addr` itself is never chosen.
    fn copy_source(
        &self,
        kind: NodeKind,
        leader: Option<&str>,
        hosts: &[String],
        addr: &str,
    ) -> Option<String> {
        let topology = &self.cluster.topology;
        let live: Vec<&str> = leader
            .into_iter()
            .chain(hosts.iter().map(String::as_str))
            .filter(|h| {
                *h != addr
                    && hosts.iter().any(|x| x.as_str() == *h)
                    && topology.is_node_active(kind, h)
            })
            .collect();
        live.iter()
            .find(|h| !topology.is_node_decommissioning(kind, h))
            .or_else(|| live.first())
            .map(|h| h.to_string())
    }

    /// Decommission every partition the node last reported on `disk_path`.
    pub async fn decommission_disk(&self, addr: &str, disk_path: &str) -> Result<Vec<u64>> {
        let node = self
            .cluster
            .topology
            .data_node(addr)
            .ok_or_else(|| MasterError::NotFound(format!("data node {addr}")))?;
        let ids = node.disk_partitions(disk_path);
        self.decommission_disk_partitions(addr, disk_path, &ids).await?;
        Ok(ids)
    }

    /// Record `partition_ids` as bad for `addr:disk_path`, then move each
    /// replica off the node in order. The record stays until cleared.
    pub async fn decommission_disk_partitions(
        &self,
        addr: &str,
        disk_path: &str,
        partition_ids: &[u64],
    ) -> Result<()> {
        self.ensure_leader().await?;
        if !self.cluster.topology.contains(NodeKind::Data, addr) {
            return Err(MasterError::NotFound(format!("data node {addr}")));
        }
        self.propose(ClusterCommand::RecordBadDisk {
            addr: addr.to_string(),
            disk_path: disk_path.to_string(),
            partition_ids: partition_ids.to_vec(),
        })
        .await?;

        let mut remaining = Vec::new();
        for &id in partition_ids {
            let res = self
                .decommission_data_partition(addr, id, |err| {
                    tracing::error!(addr = %addr, disk = %disk_path, partition_id = id, error = %err, "disk partition migration failed");
                })
                .await;
            if res.is_err() {
                remaining.push(id);
            }
        }
        if !remaining.is_empty() {
            return Err(MasterError::DecommissionIncomplete {
                addr: addr.to_string(),
                remaining,
            });
        }
        tracing::info!(addr = %addr, disk = %disk_path, partitions = ?partition_ids, "disk decommissioned");
        Ok(())
    }

    /// Drain every data partition off `addr`, then forget the node.
    pub async fn data_node_offline(&self, addr: &str) -> Result<()> {
        self.ensure_leader().await?;
        let node = self
            .cluster
            .topology
            .data_node(addr)
            .ok_or_else(|| MasterError::NotFound(format!("data node {addr}")))?;
        if !node.is_decommissioning() {
            self.propose(ClusterCommand::BeginNodeDecommission {
                kind: NodeKind::Data,
                addr: addr.to_string(),
            })
            .await?;
        }

        let mut remaining = Vec::new();
        for id in node.partition_ids() {
            let res = self
                .decommission_data_partition(addr, id, |err| {
                    tracing::error!(addr = %addr, partition_id = id, error = %err, "node offline migration failed");
                })
                .await;
            if res.is_err() {
                remaining.push(id);
            }
        }
        if !remaining.is_empty() {
            return Err(MasterError::DecommissionIncomplete {
                addr: addr.to_string(),
                remaining,
            });
        }
        self.propose(ClusterCommand::RemoveDataNode {
            addr: addr.to_string(),
        })
        .await?;
        tracing::info!(addr = %addr, "data node offline");
        Ok(())
    }

    pub async fn decommission_meta_node(&self, addr: &str) -> Result<()> {
        self.ensure_leader().await?;
        let node = self
            .cluster
            .topology
            .meta_node(addr)
            .ok_or_else(|| MasterError::NotFound(format!("meta node {addr}")))?;
        if !node.is_decommissioning() {
            self.propose(ClusterCommand::BeginNodeDecommission {
                kind: NodeKind::Meta,
                addr: addr.to_string(),
            })
            .await?;
        }

        let mut remaining = Vec::new();
        for id in node.partition_ids() {
            if let Err(err) = self.decommission_meta_partition(addr, id).await {
                tracing::error!(addr = %addr, partition_id = id, error = %err, "meta node migration failed");
                remaining.push(id);
            }
        }
        if !remaining.is_empty() {
            return Err(MasterError::DecommissionIncomplete {
                addr: addr.to_string(),
                remaining,
            });
        }
        self.propose(ClusterCommand::RemoveMetaNode {
            addr: addr.to_string(),
        })
        .await?;
        tracing::info!(addr = %addr, "meta node decommissioned");
        Ok(())
    }
}
