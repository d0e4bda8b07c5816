//! Raft module wiring.
//!
//! `node` contains election, replication and the apply loop, `state` holds the
//! per-node volatile and persistent state, and `types` defines the shared
//! request/response and trait contracts (transport, log store, state machine).
//! `memory`, `file_log` and `tcp` are the stock implementations of those
//! traits.

mod error;
mod file_log;
mod memory;
mod node;
mod state;
mod tcp;
mod types;

pub use error::RaftError;
pub use file_log::FileLog;
pub use memory::{LocalRouter, LocalTransport, MemLog};
pub use node::RaftNode;
pub use tcp::{
    read_frame, serve, write_frame, RaftRpc, RaftRpcResponse, TcpTransport, ACCEPT_BACKOFF,
};
pub use types::{
    AppendEntriesRequest, AppendEntriesResponse, Config, EntryPayload, HardState, LogEntry,
    LogIndex, LogStore, Member, NodeId, RaftStatus, RequestVoteRequest, RequestVoteResponse, Role,
    StateMachine, Term, Transport,
};
