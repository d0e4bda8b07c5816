//! Shared types for the Raft replication engine.
//!
//! These types are kept free of engine internals so the transport, log
//! store and state machine layers can depend on them directly.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Raft member identifier.
pub type NodeId = u64;
/// Election term.
pub type Term = u64;
/// Position in the replicated log, starting at 1.
pub type LogIndex = u64;

/// A voting member of the replication group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub addr: String,
}

/// Static configuration for one raft node.
#[derive(Clone, Debug)]
pub struct Config {
    pub node_id: NodeId,
    /// Initial membership. Superseded by membership entries once they apply.
    pub members: Vec<Member>,
    pub tick_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub rpc_timeout: Duration,
    pub propose_timeout: Duration,
    /// Removals that would shrink the group below this size are refused.
    pub min_members: usize,
    pub max_append_entries: usize,
}

impl Config {
    pub fn new(node_id: NodeId, members: Vec<Member>) -> Self {
        Self {
            node_id,
            members,
            tick_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            rpc_timeout: Duration::from_millis(500),
            propose_timeout: Duration::from_secs(5),
            min_members: 1,
            max_append_entries: 256,
        }
    }
}

/// Payload carried by a log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by every new leader; proposals wait until it applies.
    Noop,
    Command(Vec<u8>),
    AddMember(Member),
    RemoveMember(NodeId),
}

impl EntryPayload {
    pub fn is_membership(&self) -> bool {
        matches!(self, EntryPayload::AddMember(_) | EntryPayload::RemoveMember(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub payload: EntryPayload,
}

/// State that must hit disk before a node answers an RPC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Follower's last log index, used by the leader to back off quickly.
    pub last_log_index: LogIndex,
}

/// Point-in-time view of a node, used by admin surfaces.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub term: Term,
    pub role: Role,
    pub leader_id: Option<NodeId>,
    pub leader_addr: Option<String>,
    pub commit_index: LogIndex,
    pub applied_index: LogIndex,
    pub last_log_index: LogIndex,
    pub members: Vec<Member>,
}

/// Deterministic state machine fed with committed command entries.
///
/// `apply` is invoked exactly once per committed command, in log order, on
/// every member. Implementations must not fail: invalid commands are
/// recorded and skipped so all replicas stay identical.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, index: LogIndex, command: &[u8]);

    /// Called in log order for applied entries that carry no command
    /// (no-ops and membership changes).
    fn advance(&self, _index: LogIndex) {}
}

/// Peer RPC transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        target: &Member,
        req: RequestVoteRequest,
    ) -> anyhow::Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        target: &Member,
        req: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse>;
}

/// Durable storage for the hard state and the log.
///
/// `append` must be durable when it returns: the engine acknowledges entries
/// to the leader right after.
pub trait LogStore: Send + Sync + 'static {
    fn load(&self) -> anyhow::Result<(HardState, Vec<LogEntry>)>;
    fn save_hard_state(&self, state: HardState) -> anyhow::Result<()>;
    fn append(&self, entries: &[LogEntry]) -> anyhow::Result<()>;
    /// Drop every entry with `index >= from`.
    fn truncate_from(&self, from: LogIndex) -> anyhow::Result<()>;
}
