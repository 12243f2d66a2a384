//! tessera_cluster: a horizontally partitioned, replicated data-cluster
//! core.
//!
//! Three planes cooperate here:
//! - the **shard directory** (`directory`), a consensus-backed control plane
//!   owning node registry, shard maps, leases, and schema logs;
//! - **partition groups** (`partition` + `tessera_raft`), one replicated
//!   state machine per partition with its own log, snapshots, and apply
//!   path;
//! - the **router** (`router`), a stateless scatter/gather layer resolving
//!   partitions through a TTL-bounded, push-updated map cache.
//!
//! Cross-partition writes go through two-phase commit (`txn`); tenancy-wide
//! schema changes go through the per-scope ordered log (`schema`). The
//! client wire protocol, query planning, and access-control decisioning are
//! external collaborators behind the narrow seams in `transport` and
//! `auth`.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod admin;
pub mod auth;
pub mod directory;
pub mod error;
pub mod map_cache;
pub mod namespace;
pub mod node;
pub mod partition;
pub mod placement;
pub mod rebalance;
pub mod router;
pub mod schema;
pub mod snapshot;
pub mod transport;
pub mod txn;
pub mod wal;

pub use error::{ClusterError, Result};

/// Wall-clock milliseconds since the Unix epoch, saturating on clock
/// weirdness rather than panicking.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
