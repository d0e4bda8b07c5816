//! Runtime knobs for the master.

use std::time::Duration;

pub const GB: u64 = 1 << 30;

#[derive(Clone, Debug)]
pub struct MasterConfig {
    pub cluster_name: String,
    /// Maximum data nodes (and, separately, meta nodes) per node set.
    pub node_set_capacity: usize,
    /// A node with no heartbeat for this long is marked inactive.
    pub node_liveness_timeout: Duration,
    /// Below this live-node ratio partition views are withheld and
    /// partitions are not considered writable.
    pub live_ratio_threshold: f64,
    /// Auto allocation tops a volume up while it has fewer writable
    /// data partitions than this.
    pub min_writable_data_partitions: usize,
    /// Used/total ratio at which a data partition turns read-only.
    pub data_partition_used_ceiling: f64,
    pub initial_data_partitions: usize,
    pub default_data_partition_size_gb: u64,
    pub default_volume_capacity_gb: u64,
    /// Initial meta node memory threshold; replicated once changed.
    pub meta_node_threshold: f32,
    pub meta_inode_step: u64,
    /// Bound on every remote replica instruction.
    pub replica_timeout: Duration,
    pub liveness_check_interval: Duration,
    pub auto_allocate_interval: Duration,
    pub meta_range_check_interval: Duration,
    pub reclaim_interval: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            cluster_name: "cfs".to_string(),
            node_set_capacity: 18,
            node_liveness_timeout: Duration::from_secs(60),
            live_ratio_threshold: 0.8,
            min_writable_data_partitions: 20,
            data_partition_used_ceiling: 0.95,
            initial_data_partitions: 10,
            default_data_partition_size_gb: 120,
            default_volume_capacity_gb: 100,
            meta_node_threshold: 0.75,
            meta_inode_step: 1 << 24,
            replica_timeout: Duration::from_secs(30),
            liveness_check_interval: Duration::from_secs(10),
            auto_allocate_interval: Duration::from_secs(60),
            meta_range_check_interval: Duration::from_secs(30),
            reclaim_interval: Duration::from_secs(60),
        }
    }
}
