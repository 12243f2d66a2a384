//! In-memory consensus state for a single group.
//!
//! This module holds the mutable state protected by the group's mutex plus
//! the replication progress table. It is intentionally separate from the
//! consensus logic so that state transitions remain testable and easy to
//! reason about.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::types::{
    HardState, LogEntry, LogIndex, Membership, NodeId, RaftError, Role, Term,
};
use super::LogStore;

/// Leader-side view of one peer's replication progress.
#[derive(Clone, Copy, Debug)]
pub(super) struct Progress {
    /// Next log index to send.
    pub(super) next_index: LogIndex,
    /// Highest index known to match the leader's log.
    pub(super) match_index: LogIndex,
    /// One outstanding append/snapshot round per peer.
    pub(super) inflight: bool,
}

impl Progress {
    fn new(next_index: LogIndex) -> Self {
        Self {
            next_index,
            match_index: 0,
            inflight: false,
        }
    }
}

/// Waiter completed once `last_applied` reaches its index.
pub(super) struct ApplyWaiter {
    pub(super) index: LogIndex,
    pub(super) tx: oneshot::Sender<Result<LogIndex, RaftError>>,
}

/// Partially received snapshot stream on a catching-up replica.
#[derive(Default)]
pub(super) struct PendingSnapshot {
    pub(super) buf: Vec<u8>,
    pub(super) snapshot_index: LogIndex,
    pub(super) snapshot_term: Term,
}

/// Mutable group state (protected by a mutex in the consensus engine).
pub(super) struct RaftState {
    pub(super) term: Term,
    pub(super) voted_for: Option<NodeId>,
    pub(super) role: Role,
    pub(super) leader_hint: Option<NodeId>,
    pub(super) membership: Membership,

    /// Routing epoch installed by the control plane. Monotone; proposals
    /// presenting an older epoch are fenced.
    pub(super) routing_epoch: u64,

    pub(super) commit_index: LogIndex,
    pub(super) last_applied: LogIndex,

    pub(super) election_deadline: Instant,
    pub(super) last_heartbeat: Instant,

    pub(super) progress: HashMap<NodeId, Progress>,
    pub(super) apply_waiters: Vec<ApplyWaiter>,
    pub(super) pending_snapshot: Option<PendingSnapshot>,

    /// Set when the apply loop hits unreadable log state. The group refuses
    /// all further work until the control plane reconstitutes the replica.
    pub(super) corrupt_at: Option<LogIndex>,
}

impl RaftState {
    pub(super) fn new(
        hs: HardState,
        membership: Membership,
        applied: LogIndex,
        timeout_band: (Duration, Duration),
    ) -> Self {
        let now = Instant::now();
        Self {
            term: hs.term,
            voted_for: hs.voted_for,
            role: Role::Follower,
            leader_hint: None,
            membership,
            routing_epoch: 0,
            commit_index: applied,
            last_applied: applied,
            election_deadline: now + random_timeout(timeout_band),
            last_heartbeat: now,
            progress: HashMap::new(),
            apply_waiters: Vec::new(),
            pending_snapshot: None,
            corrupt_at: None,
        }
    }

    pub(super) fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            voted_for: self.voted_for,
        }
    }

    pub(super) fn reset_election_deadline(&mut self, band: (Duration, Duration)) {
        self.election_deadline = Instant::now() + random_timeout(band);
    }

    /// Step down into the follower (or non-voter) role for `term`.
    pub(super) fn step_down(&mut self, self_id: NodeId, term: Term, band: (Duration, Duration)) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }
        self.role = if self.membership.is_voter(self_id) {
            Role::Follower
        } else {
            Role::NonVoter
        };
        self.reset_election_deadline(band);
    }

    pub(super) fn become_leader(&mut self, self_id: NodeId, last_log_index: LogIndex) {
        self.role = Role::Leader;
        self.leader_hint = Some(self_id);
        self.progress.clear();
        for id in self.membership.members() {
            if id != self_id {
                self.progress.insert(id, Progress::new(last_log_index + 1));
            }
        }
        self.last_heartbeat = Instant::now();
    }

    /// Quorum-committed index given current voter match state. The leader's
    /// own log counts as a voter when it is one.
    pub(super) fn quorum_index(&self, self_id: NodeId, self_last: LogIndex) -> LogIndex {
        let mut acked: Vec<LogIndex> = self
            .membership
            .voters
            .iter()
            .map(|id| {
                if *id == self_id {
                    self_last
                } else {
                    self.progress.get(id).map(|p| p.match_index).unwrap_or(0)
                }
            })
            .collect();
        if acked.is_empty() {
            return 0;
        }
        acked.sort_unstable_by(|a, b| b.cmp(a));
        acked[self.membership.quorum() - 1]
    }

    /// Fail every registered waiter; used on step-down and shutdown.
    pub(super) fn fail_waiters(&mut self, mk: impl Fn() -> RaftError) {
        for w in self.apply_waiters.drain(..) {
            let _ = w.tx.send(Err(mk()));
        }
    }

    /// Complete waiters satisfied by the new applied cursor.
    pub(super) fn wake_applied(&mut self, applied: LogIndex) {
        let mut kept = Vec::with_capacity(self.apply_waiters.len());
        for w in self.apply_waiters.drain(..) {
            if w.index <= applied {
                let _ = w.tx.send(Ok(applied));
            } else {
                kept.push(w);
            }
        }
        self.apply_waiters = kept;
    }
}

fn random_timeout((min, max): (Duration, Duration)) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis().max(1) as u64;
    let jitter = rand::thread_rng().gen_range(0..span);
    min + Duration::from_millis(jitter)
}

/// In-memory `LogStore` used by unit tests and volatile groups.
pub struct MemLogStore {
    inner: RwLock<MemLogInner>,
}

struct MemLogInner {
    entries: Vec<LogEntry>,
    compacted_index: LogIndex,
    compacted_term: Term,
    hard_state: Option<HardState>,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemLogInner {
                entries: Vec::new(),
                compacted_index: 0,
                compacted_term: 0,
                hard_state: None,
            }),
        }
    }
}

impl Default for MemLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemLogInner {
    fn pos(&self, index: LogIndex) -> Option<usize> {
        if index <= self.compacted_index {
            return None;
        }
        let pos = (index - self.compacted_index - 1) as usize;
        (pos < self.entries.len()).then_some(pos)
    }

    fn last_index(&self) -> LogIndex {
        self.compacted_index + self.entries.len() as LogIndex
    }
}

impl LogStore for MemLogStore {
    fn append(&self, entries: &[LogEntry], _sync: bool) -> anyhow::Result<()> {
        let mut inner = self.inner.write().unwrap();
        for entry in entries {
            let expected = inner.last_index() + 1;
            anyhow::ensure!(
                entry.index == expected,
                "non-contiguous append: got {}, expected {expected}",
                entry.index
            );
            inner.entries.push(entry.clone());
        }
        Ok(())
    }

    fn entry(&self, index: LogIndex) -> anyhow::Result<Option<LogEntry>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.pos(index).map(|p| inner.entries[p].clone()))
    }

    fn entries(&self, from: LogIndex, to: LogIndex, max_bytes: usize) -> anyhow::Result<Vec<LogEntry>> {
        let inner = self.inner.read().unwrap();
        let mut out = Vec::new();
        let mut bytes = 0usize;
        let mut index = from;
        while index <= to {
            let Some(pos) = inner.pos(index) else { break };
            let entry = inner.entries[pos].clone();
            bytes += entry.command.len();
            out.push(entry);
            if bytes >= max_bytes {
                break;
            }
            index += 1;
        }
        Ok(out)
    }

    fn first_index(&self) -> LogIndex {
        self.inner.read().unwrap().compacted_index + 1
    }

    fn last_index(&self) -> LogIndex {
        self.inner.read().unwrap().last_index()
    }

    fn term_of(&self, index: LogIndex) -> anyhow::Result<Option<Term>> {
        let inner = self.inner.read().unwrap();
        if index == 0 {
            return Ok(Some(0));
        }
        if index == inner.compacted_index {
            return Ok(Some(inner.compacted_term));
        }
        Ok(inner.pos(index).map(|p| inner.entries[p].term))
    }

    fn truncate_from(&self, index: LogIndex) -> anyhow::Result<()> {
        let mut inner = self.inner.write().unwrap();
        if index <= inner.compacted_index {
            anyhow::bail!("cannot truncate into compacted prefix at {index}");
        }
        let keep = (index - inner.compacted_index - 1) as usize;
        let len = inner.entries.len();
        inner.entries.truncate(keep.min(len));
        Ok(())
    }

    fn compact_to(&self, index: LogIndex, term: Term) -> anyhow::Result<()> {
        let mut inner = self.inner.write().unwrap();
        if index <= inner.compacted_index {
            return Ok(());
        }
        let drop = ((index - inner.compacted_index) as usize).min(inner.entries.len());
        inner.entries.drain(..drop);
        inner.compacted_index = index;
        inner.compacted_term = term;
        Ok(())
    }

    fn compacted(&self) -> (LogIndex, Term) {
        let inner = self.inner.read().unwrap();
        (inner.compacted_index, inner.compacted_term)
    }

    fn save_hard_state(&self, hs: &HardState) -> anyhow::Result<()> {
        self.inner.write().unwrap().hard_state = Some(*hs);
        Ok(())
    }

    fn load_hard_state(&self) -> anyhow::Result<Option<HardState>> {
        Ok(self.inner.read().unwrap().hard_state)
    }
}
