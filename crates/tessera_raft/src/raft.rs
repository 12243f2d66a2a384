//! Raft module wiring.
//!
//! `group` contains the replication engine and apply loop, `state` holds the
//! in-memory consensus state and replication progress, and `types` defines
//! the shared request/response and trait contracts (transport, log store,
//! state machine).

mod group;
mod state;
mod types;

pub use group::{Group, GroupStatus, Handle};
pub use state::MemLogStore;
pub use types::{
    AppendEntriesRequest, AppendEntriesResponse, Config, EntryKind, GroupId, HardState, LogEntry,
    LogIndex, LogStore, Membership, NodeId, RaftError, Role, SnapshotChunkRequest,
    SnapshotChunkResponse, StateMachine, SyncPolicy, Term, Transport, VoteRequest, VoteResponse,
    SNAPSHOT_CHUNK_BYTES,
};
