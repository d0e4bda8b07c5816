//! Monotonic identifier allocation.
//!
//! Counters live in the replicated cluster state. An allocation proposes
//! `AllocateId { value: current + 1 }` and hands `value` out only after the
//! entry has been applied, so a crash right after allocation can never
//! cause reuse. A per-kind lock serializes allocations on the leader.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::cluster::ClusterCommand;
use crate::error::{MasterError, Result};
use crate::master::Master;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdKind {
    /// Node ids.
    Common,
    DataPartition,
    MetaPartition,
}

#[derive(Debug, Default)]
pub struct IdCounters {
    common: AtomicU64,
    data_partition: AtomicU64,
    meta_partition: AtomicU64,
}

impl IdCounters {
    fn counter(&self, kind: IdKind) -> &AtomicU64 {
        match kind {
            IdKind::Common => &self.common,
            IdKind::DataPartition => &self.data_partition,
            IdKind::MetaPartition => &self.meta_partition,
        }
    }

    pub fn current(&self, kind: IdKind) -> u64 {
        self.counter(kind).load(Ordering::SeqCst)
    }

    /// Apply-path update. Values that do not advance the counter are
    /// rejected so two proposals racing for the same value cannot both win.
    pub(crate) fn advance(&self, kind: IdKind, value: u64) -> Result<()> {
        let counter = self.counter(kind);
        let current = counter.load(Ordering::SeqCst);
        if value <= current {
            return Err(MasterError::Validation(format!(
                "stale {kind:?} id allocation {value}, counter is at {current}"
            )));
        }
        counter.store(value, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct IdAllocator {
    common: Mutex<()>,
    data_partition: Mutex<()>,
    meta_partition: Mutex<()>,
}

impl IdAllocator {
    fn lock_for(&self, kind: IdKind) -> &Mutex<()> {
        match kind {
            IdKind::Common => &self.common,
            IdKind::DataPartition => &self.data_partition,
            IdKind::MetaPartition => &self.meta_partition,
        }
    }
}

impl Master {
    pub async fn next_common_id(&self) -> Result<u64> {
        self.allocate_id(IdKind::Common).await
    }

    pub async fn next_data_partition_id(&self) -> Result<u64> {
        self.allocate_id(IdKind::DataPartition).await
    }

    pub async fn next_meta_partition_id(&self) -> Result<u64> {
        self.allocate_id(IdKind::MetaPartition).await
    }

    async fn allocate_id(&self, kind: IdKind) -> Result<u64> {
        let _guard = self.id_alloc.lock_for(kind).lock().await;
        let value = self.cluster.ids.current(kind) + 1;
        self.propose(ClusterCommand::AllocateId { kind, value }).await?;
        tracing::debug!(?kind, value, "allocated id");
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_only_move_forward() {
        let ids = IdCounters::default();
        ids.advance(IdKind::DataPartition, 1).unwrap();
        ids.advance(IdKind::DataPartition, 2).unwrap();
        assert!(ids.advance(IdKind::DataPartition, 2).is_err());
        assert_eq!(ids.current(IdKind::DataPartition), 2);
        assert_eq!(ids.current(IdKind::MetaPartition), 0);
    }
}
