use std::sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MasterError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolStatus {
    Normal,
    MarkDelete,
}

#[derive(Clone, Debug)]
pub struct VolumeState {
    pub capacity_gb: u64,
    pub status: VolStatus,
    /// Insertion order.
    pub data_partitions: Vec<u64>,
    /// Ordered by range start; the last entry is the highest partition.
    pub meta_partitions: Vec<u64>,
}

pub struct Volume {
    pub name: String,
    pub replica_num: usize,
    pub data_partition_size_gb: u64,
    state: RwLock<VolumeState>,
}

impl Volume {
    pub fn new(name: String, replica_num: usize, data_partition_size_gb: u64, capacity_gb: u64) -> Self {
        Self {
            name,
            replica_num,
            data_partition_size_gb,
            state: RwLock::new(VolumeState {
                capacity_gb,
                status: VolStatus::Normal,
                data_partitions: Vec::new(),
                meta_partitions: Vec::new(),
            }),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, VolumeState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, VolumeState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> VolStatus {
        self.read().status
    }

    pub fn capacity_gb(&self) -> u64 {
        self.read().capacity_gb
    }

    pub fn data_partition_ids(&self) -> Vec<u64> {
        self.read().data_partitions.clone()
    }

    pub fn meta_partition_ids(&self) -> Vec<u64> {
        self.read().meta_partitions.clone()
    }

    pub fn highest_meta_partition(&self) -> Option<u64> {
        self.read().meta_partitions.last().copied()
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9_-]{3,256}$").expect("static volume name pattern")
    })
}

pub fn validate_volume_name(name: &str) -> Result<()> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(MasterError::Validation(format!(
            "volume name {name:?} must match [a-zA-Z0-9_-]{{3,256}}"
        )))
    }
}
