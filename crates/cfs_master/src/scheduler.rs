//! Background loops run by every master.
//!
//! Liveness sweeps run everywhere since heartbeat state is local. The loops
//! that propose commands do nothing on followers. Each `*_once` function is
//! public so tests can drive a single pass deterministically.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use crate::cluster::ClusterCommand;
use crate::config::GB;
use crate::error::Result;
use crate::master::Master;
use crate::partition::PartitionStatus;
use crate::volume::VolStatus;

/// Spawn the liveness, auto-allocation, meta-range and reclamation loops.
pub fn spawn(master: Arc<Master>) {
    let cfg = master.config().clone();
    spawn_loop(master.clone(), "liveness check", cfg.liveness_check_interval, |m| {
        Box::pin(async move {
            check_heartbeats(&m);
            Ok(())
        })
    });
    spawn_loop(master.clone(), "auto allocation", cfg.auto_allocate_interval, |m| {
        Box::pin(async move { auto_allocate_once(&m).await.map(|_| ()) })
    });
    spawn_loop(master.clone(), "meta range check", cfg.meta_range_check_interval, |m| {
        Box::pin(async move { check_meta_partition_ranges(&m).await.map(|_| ()) })
    });
    spawn_loop(master, "volume reclamation", cfg.reclaim_interval, |m| {
        Box::pin(async move { reclaim_deleted_volumes(&m).await.map(|_| ()) })
    });
}

type Pass = std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>;

fn spawn_loop(
    master: Arc<Master>,
    name: &'static str,
    interval: Duration,
    pass: impl Fn(Arc<Master>) -> Pass + Send + 'static,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if master.raft().is_shutdown() {
                return;
            }
            if let Err(err) = pass(master.clone()).await {
                tracing::warn!(error = ?err, task = name, "background pass failed");
            }
        }
    });
}

/// Expire silent nodes and recompute every partition's status.
pub fn check_heartbeats(master: &Master) {
    let expired = master
        .cluster()
        .topology
        .sweep(master.config().node_liveness_timeout);
    if !expired.is_empty() {
        tracing::warn!(nodes = ?expired, "nodes missed their heartbeat window");
    }
    master.refresh_partition_statuses();
}

/// Top up volumes below the writable partition floor. Returns how many
/// partitions were created.
pub async fn auto_allocate_once(master: &Master) -> Result<usize> {
    if !master.is_leader().await || !master.cluster().settings().should_auto_allocate {
        return Ok(0);
    }
    let floor = master.config().min_writable_data_partitions;
    let mut created = 0;
    for vol in master.cluster().volumes() {
        if vol.status() != VolStatus::Normal {
            continue;
        }
        let partitions = master
            .cluster()
            .partitions
            .data_partitions_by_id(&vol.data_partition_ids());
        let writable = partitions
            .iter()
            .filter(|dp| dp.status() == PartitionStatus::ReadWrite)
            .count();
        let used: u64 = partitions.iter().map(|dp| dp.used()).fold(0, u64::saturating_add);
        if writable >= floor || used >= vol.capacity_gb().saturating_mul(GB) {
            continue;
        }
        match master.create_data_partition(&vol.name).await {
            Ok(dp) => {
                tracing::info!(vol = %vol.name, partition_id = dp.id, writable, "auto allocated data partition");
                created += 1;
            }
            Err(err) => {
                tracing::warn!(vol = %vol.name, error = %err, "auto allocation failed");
            }
        }
    }
    Ok(created)
}

/// Open a new meta partition for volumes whose highest partition has
/// handed out more than one inode step. Returns the number of splits.
pub async fn check_meta_partition_ranges(master: &Master) -> Result<usize> {
    if !master.is_leader().await {
        return Ok(0);
    }
    let step = master.config().meta_inode_step;
    let mut splits = 0;
    for vol in master.cluster().volumes() {
        if vol.status() != VolStatus::Normal {
            continue;
        }
        let Some(mp) = vol
            .highest_meta_partition()
            .and_then(|id| master.cluster().partitions.meta_partition(id))
        else {
            continue;
        };
        let state = mp.snapshot();
        if state.max_inode_id <= state.start.saturating_add(step) {
            continue;
        }
        let Some(start) = state.max_inode_id.checked_add(step) else {
            continue;
        };
        match master.update_inode_id_range(&vol.name, start).await {
            Ok(id) => {
                tracing::info!(vol = %vol.name, partition_id = id, start, "meta partition opened");
                splits += 1;
            }
            Err(err) => {
                tracing::warn!(vol = %vol.name, error = %err, "meta partition split failed");
            }
        }
    }
    Ok(splits)
}

/// Delete replicas of volumes marked for deletion, then drop the records.
/// A partition whose replicas could not all be deleted is kept for the
/// next pass. Returns the number of volumes fully removed.
pub async fn reclaim_deleted_volumes(master: &Master) -> Result<usize> {
    if !master.is_leader().await {
        return Ok(0);
    }
    let mut removed = 0;
    for vol in master.cluster().volumes() {
        if vol.status() != VolStatus::MarkDelete {
            continue;
        }
        for dp in master
            .cluster()
            .partitions
            .data_partitions_by_id(&vol.data_partition_ids())
        {
            let id = dp.id;
            let deletes = dp.hosts().into_iter().map(|host| async move {
                master
                    .node_call(
                        format!("delete data replica {id} on {host}"),
                        master.nodes.delete_data_replica(&host, id),
                    )
                    .await
            });
            if let Some(err) = join_all(deletes).await.into_iter().find_map(|r| r.err()) {
                tracing::warn!(vol = %vol.name, partition_id = id, error = %err, "reclaim delete failed");
                continue;
            }
            master
                .propose(ClusterCommand::RemoveDataPartition { id })
                .await?;
        }
        for mp in master
            .cluster()
            .partitions
            .meta_partitions_by_id(&vol.meta_partition_ids())
        {
            let id = mp.id;
            let deletes = mp.hosts().into_iter().map(|host| async move {
                master
                    .node_call(
                        format!("delete meta replica {id} on {host}"),
                        master.nodes.delete_meta_replica(&host, id),
                    )
                    .await
            });
            if let Some(err) = join_all(deletes).await.into_iter().find_map(|r| r.err()) {
                tracing::warn!(vol = %vol.name, partition_id = id, error = %err, "reclaim delete failed");
                continue;
            }
            master
                .propose(ClusterCommand::RemoveMetaPartition { id })
                .await?;
        }
        if vol.data_partition_ids().is_empty() && vol.meta_partition_ids().is_empty() {
            master
                .propose(ClusterCommand::RemoveVolume {
                    name: vol.name.clone(),
                })
                .await?;
            tracing::info!(vol = %vol.name, "volume reclaimed");
            removed += 1;
        }
    }
    Ok(removed)
}
