use super::types::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("not leader (leader: {leader_addr:?})")]
    NotLeader {
        leader_id: Option<NodeId>,
        leader_addr: Option<String>,
    },
    #[error("proposal timed out")]
    Timeout,
    #[error("membership change rejected: {0}")]
    MembershipChange(String),
    #[error("raft node is shut down")]
    Shutdown,
    #[error("raft log storage failed")]
    Storage(#[source] anyhow::Error),
}
