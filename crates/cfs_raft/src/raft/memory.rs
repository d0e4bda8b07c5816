//! In-process implementations of the storage and transport traits.
//!
//! `MemLog` keeps the log in memory and is used for tests and single-process
//! deployments. `LocalRouter` wires several `RaftNode`s together without
//! sockets and can cut a node off to simulate partitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};

use anyhow::anyhow;
use async_trait::async_trait;

use super::node::RaftNode;
use super::types::{
    AppendEntriesRequest, AppendEntriesResponse, HardState, LogEntry, LogIndex, LogStore, Member,
    NodeId, RequestVoteRequest, RequestVoteResponse, Transport,
};

#[derive(Default)]
pub struct MemLog {
    inner: Mutex<(HardState, Vec<LogEntry>)>,
}

impl LogStore for MemLog {
    fn load(&self) -> anyhow::Result<(HardState, Vec<LogEntry>)> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("mem log lock poisoned"))?;
        Ok(inner.clone())
    }

    fn save_hard_state(&self, state: HardState) -> anyhow::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("mem log lock poisoned"))?;
        inner.0 = state;
        Ok(())
    }

    fn append(&self, entries: &[LogEntry]) -> anyhow::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("mem log lock poisoned"))?;
        inner.1.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&self, from: LogIndex) -> anyhow::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("mem log lock poisoned"))?;
        inner.1.retain(|entry| entry.index < from);
        Ok(())
    }
}

/// Routes raft RPCs between nodes living in the same process.
#[derive(Default)]
pub struct LocalRouter {
    nodes: RwLock<HashMap<NodeId, Weak<RaftNode>>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl LocalRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: &Arc<RaftNode>) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.insert(node.id(), Arc::downgrade(node));
        }
    }

    /// Transport used by `local` to reach its peers.
    pub fn transport(self: &Arc<Self>, local: NodeId) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            router: self.clone(),
            local,
        })
    }

    /// Drop all traffic to and from `id`.
    pub fn isolate(&self, id: NodeId) {
        if let Ok(mut isolated) = self.isolated.write() {
            isolated.insert(id);
        }
    }

    pub fn heal(&self, id: NodeId) {
        if let Ok(mut isolated) = self.isolated.write() {
            isolated.remove(&id);
        }
    }

    fn route(&self, from: NodeId, to: NodeId) -> anyhow::Result<Arc<RaftNode>> {
        let isolated = self
            .isolated
            .read()
            .map_err(|_| anyhow!("router lock poisoned"))?;
        if isolated.contains(&from) || isolated.contains(&to) {
            return Err(anyhow!("link {from} -> {to} is down"));
        }
        drop(isolated);
        let node = self
            .nodes
            .read()
            .map_err(|_| anyhow!("router lock poisoned"))?
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| anyhow!("node {to} is not registered"))?;
        if node.is_shutdown() {
            return Err(anyhow!("node {to} is shut down"));
        }
        Ok(node)
    }
}

pub struct LocalTransport {
    router: Arc<LocalRouter>,
    local: NodeId,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        target: &Member,
        req: RequestVoteRequest,
    ) -> anyhow::Result<RequestVoteResponse> {
        let node = self.router.route(self.local, target.id)?;
        Ok(node.handle_request_vote(req).await)
    }

    async fn append_entries(
        &self,
        target: &Member,
        req: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse> {
        let node = self.router.route(self.local, target.id)?;
        Ok(node.handle_append_entries(req).await)
    }
}
