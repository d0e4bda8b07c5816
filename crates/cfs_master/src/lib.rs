//! Control plane of a distributed filesystem master.
//!
//! The master tracks data and meta nodes, volumes and their partitions,
//! decides replica placement, drives decommissioning and folds node
//! heartbeats into partition state. Durable control state is replicated
//! across masters through `cfs_raft`.

pub mod cluster;
pub mod config;
pub mod decommission;
pub mod error;
pub mod heartbeat;
pub mod id_alloc;
pub mod master;
pub mod node_client;
pub mod partition;
pub mod placement;
pub mod rpc_service;
pub mod scheduler;
pub mod topology;
pub mod views;
pub mod volume;

pub use config::MasterConfig;
pub use error::{MasterError, Result};
pub use master::Master;
