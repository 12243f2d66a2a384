//! Caller-visible error taxonomy.
//!
//! Retryability is a property of the error class, not the call site: routers
//! consult `is_retryable`/`refreshes_map` to decide between backoff, map
//! refresh, and surfacing the failure.

use tessera_raft::raft::{GroupId, LogIndex, NodeId, RaftError};

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The addressed replica does not lead the partition. Retryable after a
    /// shard-map refresh; carries the replica's best leader hint.
    #[error("not leader for group {group}: leader hint {leader:?}, epoch {current_epoch}")]
    NotLeader {
        group: GroupId,
        leader: Option<NodeId>,
        current_epoch: u64,
    },

    /// The epoch presented with the request no longer matches the
    /// partition's authoritative epoch. Retryable after a map refresh.
    #[error("epoch conflict: presented {presented}, current {current}")]
    EpochConflict { presented: u64, current: u64 },

    /// A majority could not be reached. Retryable with backoff; surfaced as
    /// unavailable once the retry budget is spent.
    #[error("quorum unavailable: {reason}")]
    QuorumUnavailable { reason: String },

    /// A precondition failed. Not retryable without new input.
    #[error("version conflict on {object}: expected {expected}, found {actual}")]
    VersionConflict {
        object: String,
        expected: u64,
        actual: u64,
    },

    #[error("operation timed out")]
    Timeout,

    /// Operation not implemented under the current configuration. Always a
    /// structured error, never a crash.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("actor {actor} not authorized for {action} on {scope}")]
    Unauthorized {
        actor: String,
        action: String,
        scope: String,
    },

    /// Consensus-internal corruption. Fatal to the partition replica; the
    /// control plane must reconstitute it from a peer.
    #[error("log corrupt in group {group} at index {index}")]
    LogCorrupt { group: GroupId, index: LogIndex },

    #[error("no shard map for {namespace}/{object}")]
    UnknownObject { namespace: String, object: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ClusterError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::NotLeader { .. }
                | ClusterError::EpochConflict { .. }
                | ClusterError::QuorumUnavailable { .. }
                | ClusterError::Timeout
        )
    }

    /// Errors that mean the caller's shard map is stale.
    pub fn refreshes_map(&self) -> bool {
        matches!(
            self,
            ClusterError::NotLeader { .. } | ClusterError::EpochConflict { .. }
        )
    }
}

impl From<RaftError> for ClusterError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader {
                group,
                leader,
                current_epoch,
            } => ClusterError::NotLeader {
                group,
                leader,
                current_epoch,
            },
            RaftError::EpochConflict { presented, current } => {
                ClusterError::EpochConflict { presented, current }
            }
            RaftError::QuorumUnavailable { group } => ClusterError::QuorumUnavailable {
                reason: format!("group {group}"),
            },
            RaftError::Timeout => ClusterError::Timeout,
            RaftError::LeadershipLost => ClusterError::QuorumUnavailable {
                reason: "leadership lost mid-proposal".to_string(),
            },
            RaftError::LogCorrupt { group, index } => ClusterError::LogCorrupt { group, index },
            RaftError::Stopped => ClusterError::QuorumUnavailable {
                reason: "replica stopped".to_string(),
            },
            RaftError::Internal(err) => ClusterError::Internal(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
