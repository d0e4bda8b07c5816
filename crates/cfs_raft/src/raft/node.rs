//! Raft node: election, replication, commit tracking and the apply loop.
//!
//! One `RaftNode` owns the log of a single replicated state machine. The
//! ticker task drives elections on followers and heartbeats on the leader;
//! proposals append on the leader and resolve once the entry has applied
//! locally, so a successful `propose` means the command is visible to reads
//! on this node.
//!
//! Membership entries take effect when applied. Only one membership change
//! may be in flight, which keeps every quorum overlap with the previous one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::{self, Instant};

use super::error::RaftError;
use super::state::{State, Waiter};
use super::types::{
    AppendEntriesRequest, AppendEntriesResponse, Config, EntryPayload, HardState, LogEntry,
    LogIndex, LogStore, Member, NodeId, RaftStatus, RequestVoteRequest, RequestVoteResponse, Role,
    StateMachine, Term, Transport,
};

enum Step {
    Idle,
    Campaign,
    Replicate,
}

pub struct RaftNode {
    config: Config,
    transport: Arc<dyn Transport>,
    sm: Arc<dyn StateMachine>,
    store: Arc<dyn LogStore>,
    state: Mutex<State>,
    apply_lock: Mutex<()>,
    replicate_notify: Notify,
    started: AtomicBool,
    shutdown: AtomicBool,
}

impl RaftNode {
    /// Build a node, replaying whatever the log store holds.
    ///
    /// Replayed entries are re-applied once a leader confirms them as
    /// committed; nothing is applied here.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        sm: Arc<dyn StateMachine>,
        store: Arc<dyn LogStore>,
    ) -> anyhow::Result<Arc<Self>> {
        anyhow::ensure!(
            config.election_timeout_min <= config.election_timeout_max,
            "election timeout range is inverted"
        );
        anyhow::ensure!(config.max_append_entries > 0, "max_append_entries must be > 0");
        let (hard, log) = store.load().context("load raft log")?;
        for (pos, entry) in log.iter().enumerate() {
            anyhow::ensure!(
                entry.index == pos as u64 + 1,
                "raft log is not contiguous at index {}",
                entry.index
            );
        }
        let mut members = config.members.clone();
        members.sort_by_key(|member| member.id);
        members.dedup_by_key(|member| member.id);
        let deadline = Instant::now() + random_election_timeout(&config);
        Ok(Arc::new(Self {
            state: Mutex::new(State::new(hard, log, members, deadline)),
            config,
            transport,
            sm,
            store,
            apply_lock: Mutex::new(()),
            replicate_notify: Notify::new(),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Spawn the ticker task. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(node.config.tick_interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = node.replicate_notify.notified() => {}
                }
                if node.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                node.step().await;
            }
            tracing::debug!(node_id = node.config.node_id, "raft ticker stopped");
        });
    }

    /// Stop ticking and fail outstanding proposals.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.replicate_notify.notify_one();
        let mut st = self.state.lock().await;
        st.role = Role::Follower;
        st.leader_id = None;
        let waiters = std::mem::take(&mut st.waiters);
        for (_, waiter) in waiters {
            let _ = waiter.tx.send(Err(RaftError::Shutdown));
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> RaftStatus {
        let st = self.state.lock().await;
        RaftStatus {
            node_id: self.config.node_id,
            term: st.hard.term,
            role: st.role,
            leader_id: st.leader_id,
            leader_addr: st.leader_id.and_then(|id| st.member_addr(id)),
            commit_index: st.commit_index,
            applied_index: st.last_applied,
            last_log_index: st.last_log_index(),
            members: st.members.clone(),
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == Role::Leader
    }

    /// Leader that has applied its own no-op and accepts proposals.
    pub async fn is_ready_leader(&self) -> bool {
        let st = self.state.lock().await;
        st.role == Role::Leader && st.last_applied >= st.leader_ready_index
    }

    pub async fn leader(&self) -> Option<Member> {
        let st = self.state.lock().await;
        let id = st.leader_id?;
        st.member_addr(id).map(|addr| Member { id, addr })
    }

    pub async fn members(&self) -> Vec<Member> {
        self.state.lock().await.members.clone()
    }

    /// Poll until some leader is known to this node.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<Member, RaftError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                return Err(RaftError::Timeout);
            }
            time::sleep(self.config.tick_interval).await;
        }
    }

    /// Replicate an opaque command and wait until it is applied locally.
    pub async fn propose(&self, command: Vec<u8>) -> Result<LogIndex, RaftError> {
        self.propose_entry(EntryPayload::Command(command)).await
    }

    pub async fn add_member(&self, member: Member) -> Result<LogIndex, RaftError> {
        tracing::info!(node_id = member.id, addr = %member.addr, "proposing raft member add");
        self.propose_entry(EntryPayload::AddMember(member)).await
    }

    pub async fn remove_member(&self, id: NodeId) -> Result<LogIndex, RaftError> {
        tracing::info!(node_id = id, "proposing raft member removal");
        self.propose_entry(EntryPayload::RemoveMember(id)).await
    }

    async fn propose_entry(&self, payload: EntryPayload) -> Result<LogIndex, RaftError> {
        let deadline = Instant::now() + self.config.propose_timeout;
        let rx = loop {
            if self.is_shutdown() {
                return Err(RaftError::Shutdown);
            }
            {
                let mut st = self.state.lock().await;
                if st.role != Role::Leader {
                    return Err(st.not_leader());
                }
                // A fresh leader only accepts work once its no-op has applied,
                // so earlier-term entries are known to be committed first.
                if st.last_applied >= st.leader_ready_index {
                    self.check_membership_change(&st, &payload)?;
                    let index = st.last_log_index() + 1;
                    let term = st.hard.term;
                    let entry = LogEntry {
                        index,
                        term,
                        payload,
                    };
                    self.store
                        .append(std::slice::from_ref(&entry))
                        .map_err(RaftError::Storage)?;
                    if entry.payload.is_membership() {
                        st.pending_membership = Some(index);
                    }
                    st.log.push(entry);
                    let (tx, rx) = oneshot::channel();
                    st.waiters.insert(index, Waiter { term, tx });
                    break rx;
                }
            }
            if Instant::now() >= deadline {
                return Err(RaftError::Timeout);
            }
            time::sleep(self.config.tick_interval.min(Duration::from_millis(10))).await;
        };
        self.replicate_notify.notify_one();
        match time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => Err(RaftError::Timeout),
        }
    }

    fn check_membership_change(&self, st: &State, payload: &EntryPayload) -> Result<(), RaftError> {
        if !payload.is_membership() {
            return Ok(());
        }
        if let Some(index) = st.pending_membership {
            return Err(RaftError::MembershipChange(format!(
                "membership change at index {index} is still in flight"
            )));
        }
        match payload {
            EntryPayload::AddMember(member) => {
                if st.is_member(member.id) {
                    return Err(RaftError::MembershipChange(format!(
                        "node {} is already a member",
                        member.id
                    )));
                }
            }
            EntryPayload::RemoveMember(id) => {
                if !st.is_member(*id) {
                    return Err(RaftError::MembershipChange(format!(
                        "node {id} is not a member"
                    )));
                }
                let remaining = st.members.len() - 1;
                if remaining < self.config.min_members {
                    return Err(RaftError::MembershipChange(format!(
                        "removing node {id} leaves {remaining} members, minimum is {}",
                        self.config.min_members
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn step(self: &Arc<Self>) {
        let step = {
            let st = self.state.lock().await;
            match st.role {
                Role::Leader => Step::Replicate,
                _ if st.is_member(self.config.node_id)
                    && Instant::now() >= st.election_deadline =>
                {
                    Step::Campaign
                }
                _ => Step::Idle,
            }
        };
        match step {
            Step::Idle => {}
            Step::Replicate => self.replicate().await,
            Step::Campaign => {
                if let Err(err) = self.campaign().await {
                    tracing::warn!(error = ?err, node_id = self.config.node_id, "election failed");
                }
            }
        }
    }

    async fn campaign(self: &Arc<Self>) -> Result<(), RaftError> {
        let (term, req, peers, quorum) = {
            let mut st = self.state.lock().await;
            let term = st.hard.term + 1;
            st.hard = HardState {
                term,
                voted_for: Some(self.config.node_id),
            };
            st.role = Role::Candidate;
            st.leader_id = None;
            st.election_deadline = Instant::now() + random_election_timeout(&self.config);
            self.store
                .save_hard_state(st.hard)
                .map_err(RaftError::Storage)?;
            let req = RequestVoteRequest {
                term,
                candidate_id: self.config.node_id,
                last_log_index: st.last_log_index(),
                last_log_term: st.last_log_term(),
            };
            (term, req, st.peers(self.config.node_id), st.quorum())
        };
        tracing::debug!(node_id = self.config.node_id, term, "starting election");

        let mut votes = 1usize;
        if votes >= quorum {
            return self.become_leader(term).await;
        }
        let rpc_timeout = self.config.rpc_timeout;
        let mut pending = peers
            .into_iter()
            .map(|peer| {
                let transport = self.transport.clone();
                let req = req.clone();
                async move { time::timeout(rpc_timeout, transport.request_vote(&peer, req)).await }
            })
            .collect::<FuturesUnordered<_>>();
        while let Some(result) = pending.next().await {
            let resp = match result {
                Ok(Ok(resp)) => resp,
                Ok(Err(err)) => {
                    tracing::trace!(error = ?err, "request vote failed");
                    continue;
                }
                Err(_) => continue,
            };
            if resp.term > term {
                return self.observe_term(resp.term).await;
            }
            if resp.vote_granted {
                votes += 1;
                if votes >= quorum {
                    return self.become_leader(term).await;
                }
            }
        }
        Ok(())
    }

    async fn observe_term(&self, term: Term) -> Result<(), RaftError> {
        let mut st = self.state.lock().await;
        if st.become_follower(term, None) {
            self.store
                .save_hard_state(st.hard)
                .map_err(RaftError::Storage)?;
        }
        Ok(())
    }

    async fn become_leader(&self, term: Term) -> Result<(), RaftError> {
        {
            let mut st = self.state.lock().await;
            if st.hard.term != term || st.role != Role::Candidate {
                return Ok(());
            }
            st.role = Role::Leader;
            st.leader_id = Some(self.config.node_id);
            let next = st.last_log_index() + 1;
            st.next_index.clear();
            st.match_index.clear();
            for peer in st.peers(self.config.node_id) {
                st.next_index.insert(peer.id, next);
                st.match_index.insert(peer.id, 0);
            }
            let entry = LogEntry {
                index: next,
                term,
                payload: EntryPayload::Noop,
            };
            self.store
                .append(std::slice::from_ref(&entry))
                .map_err(RaftError::Storage)?;
            st.log.push(entry);
            st.leader_ready_index = next;
            let last_applied = st.last_applied;
            let pending = st
                .log
                .iter()
                .filter(|entry| entry.index > last_applied && entry.payload.is_membership())
                .map(|entry| entry.index)
                .last();
            st.pending_membership = pending;
        }
        tracing::info!(node_id = self.config.node_id, term, "became raft leader");
        self.replicate_notify.notify_one();
        Ok(())
    }

    async fn replicate(self: &Arc<Self>) {
        let (term, batch) = {
            let st = self.state.lock().await;
            if st.role != Role::Leader {
                return;
            }
            let term = st.hard.term;
            let last = st.last_log_index();
            let batch = st
                .peers(self.config.node_id)
                .into_iter()
                .map(|peer| {
                    let next = st
                        .next_index
                        .get(&peer.id)
                        .copied()
                        .unwrap_or(last + 1)
                        .clamp(1, last + 1);
                    let prev_log_index = next - 1;
                    let req = AppendEntriesRequest {
                        term,
                        leader_id: self.config.node_id,
                        prev_log_index,
                        prev_log_term: st.term_at(prev_log_index).unwrap_or(0),
                        entries: st.entries_from(next, self.config.max_append_entries),
                        leader_commit: st.commit_index,
                    };
                    (peer, req)
                })
                .collect::<Vec<_>>();
            (term, batch)
        };

        let rpc_timeout = self.config.rpc_timeout;
        let mut pending = batch
            .into_iter()
            .map(|(peer, req)| {
                let transport = self.transport.clone();
                async move {
                    let prev = req.prev_log_index;
                    let sent = req.entries.len() as u64;
                    let result =
                        time::timeout(rpc_timeout, transport.append_entries(&peer, req)).await;
                    (peer, prev, sent, result)
                }
            })
            .collect::<FuturesUnordered<_>>();
        while let Some((peer, prev, sent, result)) = pending.next().await {
            match result {
                Ok(Ok(resp)) => {
                    if let Err(err) = self.on_append_response(term, peer.id, prev, sent, resp).await {
                        tracing::warn!(error = ?err, peer = peer.id, "append response handling failed");
                    }
                }
                Ok(Err(err)) => {
                    tracing::trace!(error = ?err, peer = peer.id, "append entries failed");
                }
                Err(_) => {
                    tracing::trace!(peer = peer.id, "append entries timed out");
                }
            }
        }

        self.advance_commit(term).await;
        self.apply_committed().await;
    }

    async fn on_append_response(
        &self,
        term: Term,
        peer: NodeId,
        prev: LogIndex,
        sent: u64,
        resp: AppendEntriesResponse,
    ) -> Result<(), RaftError> {
        let mut st = self.state.lock().await;
        if resp.term > st.hard.term {
            tracing::info!(
                node_id = self.config.node_id,
                term = resp.term,
                "stepping down after seeing newer term"
            );
            st.become_follower(resp.term, None);
            self.store
                .save_hard_state(st.hard)
                .map_err(RaftError::Storage)?;
            return Ok(());
        }
        if st.role != Role::Leader || st.hard.term != term {
            return Ok(());
        }
        if resp.success {
            let matched = st
                .match_index
                .get(&peer)
                .copied()
                .unwrap_or(0)
                .max(prev + sent);
            st.match_index.insert(peer, matched);
            st.next_index.insert(peer, matched + 1);
        } else {
            let next = st.next_index.get(&peer).copied().unwrap_or(1);
            let backed_off = next
                .saturating_sub(1)
                .min(resp.last_log_index + 1)
                .max(1);
            st.next_index.insert(peer, backed_off);
        }
        Ok(())
    }

    async fn advance_commit(&self, term: Term) {
        let mut st = self.state.lock().await;
        if st.role != Role::Leader || st.hard.term != term {
            return;
        }
        let quorum = st.quorum();
        let local = self.config.node_id;
        let mut n = st.last_log_index();
        // Only entries from the current term are committed by counting.
        while n > st.commit_index {
            if st.term_at(n) == Some(term) {
                let acks = st
                    .members
                    .iter()
                    .filter(|member| {
                        member.id == local
                            || st.match_index.get(&member.id).copied().unwrap_or(0) >= n
                    })
                    .count();
                if acks >= quorum {
                    st.commit_index = n;
                    break;
                }
            }
            n -= 1;
        }
    }

    async fn apply_committed(&self) {
        let _apply = self.apply_lock.lock().await;
        loop {
            let entries = {
                let st = self.state.lock().await;
                if st.last_applied >= st.commit_index {
                    return;
                }
                st.slice(st.last_applied + 1, st.commit_index)
            };
            if entries.is_empty() {
                return;
            }
            for entry in &entries {
                match &entry.payload {
                    EntryPayload::Command(data) => self.sm.apply(entry.index, data),
                    _ => self.sm.advance(entry.index),
                }
            }
            let mut st = self.state.lock().await;
            for entry in &entries {
                st.apply_membership(self.config.node_id, entry);
            }
            if let Some(last) = entries.last() {
                st.last_applied = last.index;
            }
            st.resolve_applied_waiters();
        }
    }

    pub async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        let mut st = self.state.lock().await;
        let mut dirty = false;
        if req.term > st.hard.term {
            dirty |= st.become_follower(req.term, None);
        }
        let grant = req.term == st.hard.term
            && st
                .hard
                .voted_for
                .map_or(true, |voted| voted == req.candidate_id)
            && st.log_is_current(req.last_log_term, req.last_log_index);
        if grant {
            dirty |= st.hard.voted_for != Some(req.candidate_id);
            st.hard.voted_for = Some(req.candidate_id);
            st.election_deadline = Instant::now() + random_election_timeout(&self.config);
        }
        if dirty {
            if let Err(err) = self.store.save_hard_state(st.hard) {
                tracing::error!(error = ?err, "persist hard state failed; refusing vote");
                return RequestVoteResponse {
                    term: st.hard.term,
                    vote_granted: false,
                };
            }
        }
        RequestVoteResponse {
            term: st.hard.term,
            vote_granted: grant,
        }
    }

    pub async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let applied_needed = {
            let mut st = self.state.lock().await;
            if req.term < st.hard.term {
                return AppendEntriesResponse {
                    term: st.hard.term,
                    success: false,
                    last_log_index: st.last_log_index(),
                };
            }
            if st.become_follower(req.term, Some(req.leader_id)) {
                if let Err(err) = self.store.save_hard_state(st.hard) {
                    tracing::error!(error = ?err, "persist hard state failed");
                    return AppendEntriesResponse {
                        term: st.hard.term,
                        success: false,
                        last_log_index: st.last_log_index(),
                    };
                }
            }
            st.election_deadline = Instant::now() + random_election_timeout(&self.config);

            if st.term_at(req.prev_log_index) != Some(req.prev_log_term) {
                let last = st.last_log_index().min(req.prev_log_index.saturating_sub(1));
                return AppendEntriesResponse {
                    term: st.hard.term,
                    success: false,
                    last_log_index: last,
                };
            }

            let mut fresh = Vec::new();
            for entry in &req.entries {
                match st.term_at(entry.index) {
                    Some(term) if term == entry.term && fresh.is_empty() => continue,
                    Some(_) if fresh.is_empty() => {
                        tracing::debug!(index = entry.index, "truncating conflicting log suffix");
                        if let Err(err) = self.store.truncate_from(entry.index) {
                            tracing::error!(error = ?err, "log truncate failed");
                            return AppendEntriesResponse {
                                term: st.hard.term,
                                success: false,
                                last_log_index: st.last_log_index(),
                            };
                        }
                        st.log.truncate(entry.index as usize - 1);
                        st.fail_waiters_from(entry.index);
                        if st.pending_membership.is_some_and(|p| p >= entry.index) {
                            st.pending_membership = None;
                        }
                        fresh.push(entry.clone());
                    }
                    _ => fresh.push(entry.clone()),
                }
            }
            if !fresh.is_empty() {
                if let Err(err) = self.store.append(&fresh) {
                    tracing::error!(error = ?err, "log append failed");
                    return AppendEntriesResponse {
                        term: st.hard.term,
                        success: false,
                        last_log_index: st.last_log_index(),
                    };
                }
                st.log.extend(fresh);
            }

            let last_new = req.prev_log_index + req.entries.len() as u64;
            let mut advanced = false;
            if req.leader_commit > st.commit_index {
                let commit = req.leader_commit.min(last_new);
                if commit > st.commit_index {
                    st.commit_index = commit;
                    advanced = true;
                }
            }
            advanced
        };
        if applied_needed {
            self.apply_committed().await;
        }
        let st = self.state.lock().await;
        AppendEntriesResponse {
            term: st.hard.term,
            success: true,
            last_log_index: st.last_log_index(),
        }
    }
}

fn random_election_timeout(config: &Config) -> Duration {
    let min = config.election_timeout_min.as_millis() as u64;
    let max = config.election_timeout_max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min..=max.max(min)))
}
