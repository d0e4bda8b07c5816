//! Raft replication crate.
//!
//! This crate provides the replicated log used by the cfs master. The API
//! surface is intentionally small: higher layers supply a `StateMachine`, a
//! `Transport` and a `LogStore`, then drive proposals through `RaftNode`.
//! Command payloads are opaque bytes, so new control-plane operations are
//! added by extending the caller's command set, never this crate.

pub mod raft;
