use std::collections::{BTreeMap, HashMap};

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::error::RaftError;
use super::types::{EntryPayload, HardState, LogEntry, LogIndex, Member, NodeId, Role, Term};

/// Proposal waiting for its entry to apply.
pub(super) struct Waiter {
    pub(super) term: Term,
    pub(super) tx: oneshot::Sender<Result<LogIndex, RaftError>>,
}

/// Mutable per-node state, guarded by the node's mutex.
///
/// Invariant: `log[i].index == i + 1`.
pub(super) struct State {
    pub(super) hard: HardState,
    pub(super) role: Role,
    pub(super) leader_id: Option<NodeId>,
    pub(super) log: Vec<LogEntry>,
    pub(super) commit_index: LogIndex,
    pub(super) last_applied: LogIndex,
    /// Applied membership.
    pub(super) members: Vec<Member>,
    pub(super) next_index: HashMap<NodeId, LogIndex>,
    pub(super) match_index: HashMap<NodeId, LogIndex>,
    pub(super) election_deadline: Instant,
    /// Index of the no-op appended when this node last became leader.
    pub(super) leader_ready_index: LogIndex,
    pub(super) pending_membership: Option<LogIndex>,
    pub(super) waiters: BTreeMap<LogIndex, Waiter>,
}

impl State {
    pub(super) fn new(
        hard: HardState,
        log: Vec<LogEntry>,
        members: Vec<Member>,
        election_deadline: Instant,
    ) -> Self {
        Self {
            hard,
            role: Role::Follower,
            leader_id: None,
            log,
            commit_index: 0,
            last_applied: 0,
            members,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_deadline,
            leader_ready_index: 0,
            pending_membership: None,
            waiters: BTreeMap::new(),
        }
    }

    pub(super) fn last_log_index(&self) -> LogIndex {
        self.log.last().map(|entry| entry.index).unwrap_or(0)
    }

    pub(super) fn last_log_term(&self) -> Term {
        self.log.last().map(|entry| entry.term).unwrap_or(0)
    }

    pub(super) fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.log.get(index as usize - 1).map(|entry| entry.term)
    }

    /// Entries in `[from, to]`, clamped to the log.
    pub(super) fn slice(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry> {
        let start = from.max(1) as usize - 1;
        let end = (to as usize).min(self.log.len());
        if start >= end {
            return Vec::new();
        }
        self.log[start..end].to_vec()
    }

    pub(super) fn entries_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        let to = from.saturating_add(max as u64).saturating_sub(1);
        self.slice(from, to)
    }

    pub(super) fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub(super) fn is_member(&self, id: NodeId) -> bool {
        self.members.iter().any(|member| member.id == id)
    }

    pub(super) fn member_addr(&self, id: NodeId) -> Option<String> {
        self.members
            .iter()
            .find(|member| member.id == id)
            .map(|member| member.addr.clone())
    }

    pub(super) fn peers(&self, local: NodeId) -> Vec<Member> {
        self.members
            .iter()
            .filter(|member| member.id != local)
            .cloned()
            .collect()
    }

    /// Whether a candidate's log is at least as current as ours.
    pub(super) fn log_is_current(&self, last_term: Term, last_index: LogIndex) -> bool {
        let our_term = self.last_log_term();
        last_term > our_term || (last_term == our_term && last_index >= self.last_log_index())
    }

    /// Step down, adopting `term` if it is newer. Returns whether the hard
    /// state changed and must be persisted.
    pub(super) fn become_follower(&mut self, term: Term, leader: Option<NodeId>) -> bool {
        let changed = term > self.hard.term;
        if changed {
            self.hard.term = term;
            self.hard.voted_for = None;
        }
        self.role = Role::Follower;
        self.leader_id = leader;
        changed
    }

    pub(super) fn not_leader(&self) -> RaftError {
        RaftError::NotLeader {
            leader_id: self.leader_id,
            leader_addr: self.leader_id.and_then(|id| self.member_addr(id)),
        }
    }

    pub(super) fn apply_membership(&mut self, local: NodeId, entry: &LogEntry) {
        match &entry.payload {
            EntryPayload::AddMember(member) => {
                if !self.is_member(member.id) {
                    self.members.push(member.clone());
                    self.members.sort_by_key(|member| member.id);
                }
                if self.role == Role::Leader && member.id != local {
                    let next = self.last_log_index() + 1;
                    self.next_index.entry(member.id).or_insert(next);
                    self.match_index.entry(member.id).or_insert(0);
                }
            }
            EntryPayload::RemoveMember(id) => {
                self.members.retain(|member| member.id != *id);
                self.next_index.remove(id);
                self.match_index.remove(id);
                if *id == local && self.role == Role::Leader {
                    self.role = Role::Follower;
                    self.leader_id = None;
                }
            }
            _ => return,
        }
        if self
            .pending_membership
            .is_some_and(|pending| pending <= entry.index)
        {
            self.pending_membership = None;
        }
    }

    /// Resolve every waiter at or below `last_applied`.
    pub(super) fn resolve_applied_waiters(&mut self) {
        let rest = self.waiters.split_off(&(self.last_applied + 1));
        let done = std::mem::replace(&mut self.waiters, rest);
        for (index, waiter) in done {
            let result = if self.term_at(index) == Some(waiter.term) {
                Ok(index)
            } else {
                Err(self.not_leader())
            };
            let _ = waiter.tx.send(result);
        }
    }

    /// Fail waiters whose entries were overwritten by a newer leader.
    pub(super) fn fail_waiters_from(&mut self, from: LogIndex) {
        let dropped = self.waiters.split_off(&from);
        for (_, waiter) in dropped {
            let _ = waiter.tx.send(Err(self.not_leader()));
        }
    }
}
