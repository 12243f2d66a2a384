//! Shared types for the tessera consensus engine.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the consensus engine and the transport/state-machine layers.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Logical identifier for a consensus group (one per partition).
pub type GroupId = u64;
/// Logical node identifier within the cluster.
pub type NodeId = u64;
/// Leader term. Strictly increases across leader changes.
pub type Term = u64;
/// 1-based position in the replicated log. 0 means "before the first entry".
pub type LogIndex = u64;

/// Chunk size used for snapshot transfer.
pub const SNAPSHOT_CHUNK_BYTES: usize = 64 * 1024;

/// Node role within a group.
///
/// `NonVoter` replicas receive log entries and snapshots but never vote,
/// never campaign, and never count toward quorum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    NonVoter,
}

/// Durability discipline for the write path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Ack only after a majority has fsynced the entry (durability-first).
    GroupCommit,
    /// Fsync on the leader only; followers buffer. Latency-first, with an
    /// at-most-one-node-loss durability window.
    LeaderOnly,
}

impl SyncPolicy {
    /// Whether a follower must fsync before acknowledging an append.
    pub fn follower_sync(self) -> bool {
        matches!(self, SyncPolicy::GroupCommit)
    }
}

/// Kind tag for a log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Opaque state-machine command.
    Normal,
    /// Serialized `Membership` taking effect when the entry applies.
    ConfigChange,
    /// Appended by a fresh leader so earlier-term entries commit without
    /// waiting for client traffic.
    Noop,
}

/// One replicated log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub kind: EntryKind,
    pub command: Vec<u8>,
}

/// Persisted vote state. Must be durable before responding to any RPC that
/// observes the new term.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// Voting and learner sets for a group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub voters: Vec<NodeId>,
    pub learners: Vec<NodeId>,
}

impl Membership {
    pub fn new(voters: Vec<NodeId>, learners: Vec<NodeId>) -> Self {
        let mut m = Self { voters, learners };
        m.normalize();
        m
    }

    pub fn normalize(&mut self) {
        self.voters.sort_unstable();
        self.voters.dedup();
        self.learners.sort_unstable();
        self.learners.dedup();
        self.learners.retain(|id| !self.voters.contains(id));
    }

    pub fn quorum(&self) -> usize {
        (self.voters.len() / 2) + 1
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.voters.contains(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.voters.contains(&id) || self.learners.contains(&id)
    }

    /// All replicas, voting or not.
    pub fn members(&self) -> Vec<NodeId> {
        let mut out = self.voters.clone();
        out.extend_from_slice(&self.learners);
        out.sort_unstable();
        out.dedup();
        out
    }

    /// A membership change is safe when at most one voter differs from the
    /// current set. Larger jumps could form two disjoint majorities.
    pub fn voter_delta(&self, next: &Membership) -> usize {
        let added = next
            .voters
            .iter()
            .filter(|id| !self.voters.contains(id))
            .count();
        let removed = self
            .voters
            .iter()
            .filter(|id| !next.voters.contains(id))
            .count();
        added + removed
    }
}

/// Per-group configuration and operational tuning.
///
/// The `*timeout` values guard against slow/failed peers and are distinct
/// from the election timeout band that drives leader failover.
#[derive(Clone, Debug)]
pub struct Config {
    pub group_id: GroupId,
    pub node_id: NodeId,
    pub membership: Membership,

    /// Lower bound of the randomized election timeout band.
    pub election_timeout_min: Duration,
    /// Upper bound of the randomized election timeout band.
    pub election_timeout_max: Duration,
    /// Leader heartbeat interval. Must be well under the election band.
    pub heartbeat_interval: Duration,
    /// Upper bound for point-to-point RPC waits used by protocol steps.
    pub rpc_timeout: Duration,
    /// End-to-end timeout for one propose attempt (append/replicate/apply).
    pub propose_timeout: Duration,
    /// Fsync discipline for the write path.
    pub sync_policy: SyncPolicy,
    /// Replication batch cap per append round, in bytes.
    pub max_append_bytes: usize,
}

impl Config {
    pub fn new(group_id: GroupId, node_id: NodeId, membership: Membership) -> Self {
        Self {
            group_id,
            node_id,
            membership,
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_millis(500),
            propose_timeout: Duration::from_secs(5),
            sync_policy: SyncPolicy::GroupCommit,
            max_append_bytes: 1 << 20,
        }
    }
}

/// Typed failure surface for proposals and reads.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    /// This replica is not the leader. Carries the best-known leader and the
    /// group's installed routing epoch so callers can refresh and retry.
    #[error("not leader for group {group}: leader hint {leader:?}, epoch {current_epoch}")]
    NotLeader {
        group: GroupId,
        leader: Option<NodeId>,
        current_epoch: u64,
    },

    /// The caller's routing epoch no longer matches the group's.
    #[error("epoch conflict: presented {presented}, current {current}")]
    EpochConflict { presented: u64, current: u64 },

    /// A majority could not be reached within the attempt window.
    #[error("quorum unavailable for group {group}")]
    QuorumUnavailable { group: GroupId },

    /// The operation exceeded its explicit timeout policy.
    #[error("operation timed out")]
    Timeout,

    /// Leadership was lost while the proposal was in flight.
    #[error("leadership lost during proposal")]
    LeadershipLost,

    /// The group detected local log corruption and halted. Fatal to this
    /// replica: the control plane must reconstitute it from a peer.
    #[error("log corrupt in group {group} at index {index}")]
    LogCorrupt { group: GroupId, index: LogIndex },

    /// The group is shutting down.
    #[error("group stopped")]
    Stopped,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Application-specific state machine driven by the apply loop.
///
/// The consensus layer treats commands as opaque bytes. `apply` must be
/// idempotent per log index: implementations track `applied_index` and skip
/// anything at or below it, so a replayed entry has no visible effect.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, index: LogIndex, command: &[u8]);

    /// Highest log index whose effects are reflected in derived state.
    fn applied_index(&self) -> LogIndex;

    /// Produce a self-contained image of derived state at `applied_index`.
    fn snapshot(&self) -> anyhow::Result<Vec<u8>>;

    /// Replace derived state with a snapshot covering `index`.
    fn restore(&self, index: LogIndex, data: &[u8]) -> anyhow::Result<()>;
}

/// Durable log storage interface.
///
/// Implementations persist entries and hard state, and support prefix
/// compaction below a stable snapshot. All methods are synchronous; batching
/// and fsync scheduling are the implementation's concern.
pub trait LogStore: Send + Sync + 'static {
    fn append(&self, entries: &[LogEntry], sync: bool) -> anyhow::Result<()>;
    fn entry(&self, index: LogIndex) -> anyhow::Result<Option<LogEntry>>;
    /// Entries in `[from, to]`, stopping early once `max_bytes` is exceeded.
    fn entries(
        &self,
        from: LogIndex,
        to: LogIndex,
        max_bytes: usize,
    ) -> anyhow::Result<Vec<LogEntry>>;
    /// Lowest retained index (compacted prefix + 1). 1 for a fresh log.
    fn first_index(&self) -> LogIndex;
    /// Highest appended index. 0 for an empty log.
    fn last_index(&self) -> LogIndex;
    fn term_of(&self, index: LogIndex) -> anyhow::Result<Option<Term>>;
    /// Drop all entries at `index` and above (conflict truncation).
    fn truncate_from(&self, index: LogIndex) -> anyhow::Result<()>;
    /// Drop all entries at `index` and below, recording the boundary term so
    /// log-matching checks keep working across the compaction point.
    fn compact_to(&self, index: LogIndex, term: Term) -> anyhow::Result<()>;
    /// Boundary left by the last compaction or installed snapshot.
    fn compacted(&self) -> (LogIndex, Term);
    fn save_hard_state(&self, hs: &HardState) -> anyhow::Result<()>;
    fn load_hard_state(&self) -> anyhow::Result<Option<HardState>>;
}

#[derive(Clone, Debug)]
pub struct VoteRequest {
    pub group_id: GroupId,
    pub term: Term,
    pub candidate: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Clone, Copy, Debug)]
pub struct VoteResponse {
    pub term: Term,
    pub granted: bool,
}

#[derive(Clone, Debug)]
pub struct AppendEntriesRequest {
    pub group_id: GroupId,
    pub term: Term,
    pub leader: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
    /// Routing epoch installed on the leader, forwarded so followers converge
    /// on the freshest fence without a control-plane round-trip.
    pub epoch: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// On success, the highest index now matching the leader's log.
    pub match_index: LogIndex,
    /// On failure, where the leader should back up to.
    pub conflict_index: LogIndex,
}

/// One chunk of a snapshot stream. Transfers are resumable: the receiver
/// answers with the offset it wants next, and the sender continues from
/// there. The digest covers the complete image and is verified on `done`.
#[derive(Clone, Debug)]
pub struct SnapshotChunkRequest {
    pub group_id: GroupId,
    pub term: Term,
    pub leader: NodeId,
    pub snapshot_index: LogIndex,
    pub snapshot_term: Term,
    pub membership: Membership,
    pub offset: u64,
    pub data: Vec<u8>,
    pub total_len: u64,
    pub digest: [u8; 32],
    pub done: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct SnapshotChunkResponse {
    pub term: Term,
    pub ok: bool,
    /// Offset the receiver expects next (resume point on mismatch).
    pub next_offset: u64,
}

/// Transport interface for consensus RPCs.
///
/// The consensus engine is transport-agnostic; concrete implementations can
/// use a network stack, in-memory channels, or test harnesses.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(&self, target: NodeId, req: VoteRequest) -> anyhow::Result<VoteResponse>;

    async fn append_entries(
        &self,
        target: NodeId,
        req: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        target: NodeId,
        req: SnapshotChunkRequest,
    ) -> anyhow::Result<SnapshotChunkResponse>;

    /// Leadership transfer: tell a caught-up voter to campaign immediately
    /// without waiting out its election timer.
    async fn timeout_now(&self, target: NodeId, group_id: GroupId, term: Term)
        -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_quorum_and_delta() {
        let m = Membership::new(vec![1, 2, 3], vec![4]);
        assert_eq!(m.quorum(), 2);
        assert!(m.is_voter(2));
        assert!(!m.is_voter(4));
        assert!(m.contains(4));
        assert_eq!(m.members(), vec![1, 2, 3, 4]);

        let next = Membership::new(vec![1, 2, 4], vec![]);
        assert_eq!(m.voter_delta(&next), 2);
        let safe = Membership::new(vec![1, 2, 3, 4], vec![]);
        assert_eq!(m.voter_delta(&safe), 1);
    }

    #[test]
    fn learners_never_overlap_voters() {
        let m = Membership::new(vec![1, 2], vec![2, 3]);
        assert_eq!(m.voters, vec![1, 2]);
        assert_eq!(m.learners, vec![3]);
    }
}
