//! Error taxonomy surfaced by the master to its callers.

use cfs_raft::raft::RaftError;

pub type Result<T> = std::result::Result<T, MasterError>;

#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("node {0} is already registered")]
    DuplicateNode(String),
    #[error("invalid inode range: {0}")]
    InvalidRange(String),
    #[error("insufficient replicas: need {need}, only {available} eligible hosts")]
    InsufficientReplicas { need: usize, available: usize },
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("not leader (leader: {leader:?})")]
    NotLeader { leader: Option<String> },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("decommission of {addr} incomplete, partitions remaining: {remaining:?}")]
    DecommissionIncomplete { addr: String, remaining: Vec<u64> },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MasterError {
    /// Stable code used on the admin wire.
    pub fn code(&self) -> &'static str {
        match self {
            MasterError::NotFound(_) => "NotFound",
            MasterError::DuplicateNode(_) => "DuplicateNode",
            MasterError::InvalidRange(_) => "InvalidRange",
            MasterError::InsufficientReplicas { .. } => "InsufficientReplicas",
            MasterError::Unavailable(_) => "Unavailable",
            MasterError::NotLeader { .. } => "NotLeader",
            MasterError::Timeout(_) => "Timeout",
            MasterError::Validation(_) => "Validation",
            MasterError::DecommissionIncomplete { .. } => "DecommissionIncomplete",
            MasterError::Internal(_) => "Internal",
        }
    }
}

impl From<RaftError> for MasterError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader { leader_addr, .. } => MasterError::NotLeader {
                leader: leader_addr,
            },
            RaftError::Timeout => MasterError::Timeout("raft commit".into()),
            RaftError::MembershipChange(msg) => MasterError::Validation(msg),
            RaftError::Shutdown => MasterError::Unavailable("raft node is shut down".into()),
            RaftError::Storage(err) => MasterError::Internal(err.context("raft log storage")),
        }
    }
}
