//! Schema-change coordination.
//!
//! Schema operations are ordered, idempotent-by-identifier units appended to
//! a per-scope log held in the shard directory. Every member applies the
//! log in order, exactly once per operation, and reports its applied cursor
//! back through the directory; the coordinator waits on those cursors
//! according to the operation's apply mode.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time;

use tessera_raft::raft::NodeId;

use crate::directory::{Directory, DirectoryCommand, DirectoryEvent, WatchItem};
use crate::error::{ClusterError, Result};

/// Globally unique schema operation id: issuing node plus a local counter.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SchemaOpId {
    pub node_id: NodeId,
    pub counter: u64,
}

impl std::fmt::Display for SchemaOpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}-{}", self.node_id, self.counter)
    }
}

/// How many members must apply before the coordinator reports success.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyMode {
    /// Every current member must apply within the wait window.
    AllMembers,
    /// A fixed number of members suffices.
    Quorum(usize),
    /// A quorum must apply before the deadline; stragglers converge later.
    TimeBoxedQuorum { quorum: usize, wait_ms: u64 },
}

/// One ordered, idempotent schema change.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaOp {
    pub id: SchemaOpId,
    /// Scope-log epoch this op was issued against; a mismatch at append time
    /// means the submission raced another change and is rejected as stale.
    pub scope_epoch: u64,
    /// Intermediate-representation payload, opaque to the core.
    pub payload: Vec<u8>,
    /// Objects whose schema version this op advances.
    pub objects: Vec<String>,
    /// Expected prior version per object; any mismatch rejects the append
    /// without mutating anything.
    pub preconditions: BTreeMap<String, u64>,
    pub apply_mode: ApplyMode,
}

/// Per-scope ordered log with member cursors and object versions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SchemaLog {
    /// Bumps on every successful append; submissions carry the epoch they
    /// were issued against.
    pub epoch: u64,
    pub ops: Vec<SchemaOp>,
    /// Per-member applied cursor: number of ops applied, in log order.
    pub cursors: BTreeMap<NodeId, u64>,
    /// Current schema version per object.
    pub versions: BTreeMap<String, u64>,
}

impl SchemaLog {
    /// Deterministic append used by the directory state machine. Returns
    /// whether the op was accepted.
    pub fn try_append(&mut self, op: SchemaOp) -> bool {
        if self.ops.iter().any(|o| o.id == op.id) {
            return false;
        }
        if op.scope_epoch != self.epoch {
            return false;
        }
        for (object, expected) in &op.preconditions {
            let current = self.versions.get(object).copied().unwrap_or(0);
            if current != *expected {
                return false;
            }
        }
        for object in &op.objects {
            let v = self.versions.entry(object.clone()).or_insert(0);
            *v += 1;
        }
        self.ops.push(op);
        self.epoch += 1;
        true
    }

    /// Record a member's applied cursor. Cursors only move forward.
    pub fn report_cursor(&mut self, node_id: NodeId, cursor: u64) -> bool {
        let cursor = cursor.min(self.ops.len() as u64);
        let entry = self.cursors.entry(node_id).or_insert(0);
        if cursor > *entry {
            *entry = cursor;
            true
        } else {
            false
        }
    }

    /// Position (1-based cursor value) an op must be covered by.
    pub fn position_of(&self, id: SchemaOpId) -> Option<u64> {
        self.ops
            .iter()
            .position(|o| o.id == id)
            .map(|p| (p + 1) as u64)
    }

    pub fn members_applied(&self, position: u64) -> usize {
        self.cursors.values().filter(|c| **c >= position).count()
    }
}

/// Outcome reported to the schema submitter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaOutcome {
    pub id: SchemaOpId,
    pub position: u64,
    pub applied_members: usize,
}

/// Coordinates multi-member schema changes through the directory.
#[derive(Clone)]
pub struct SchemaCoordinator {
    directory: Directory,
    poll_interval: Duration,
}

impl SchemaCoordinator {
    pub fn new(directory: Directory) -> Self {
        Self {
            directory,
            poll_interval: Duration::from_millis(25),
        }
    }

    /// Current epoch of a scope log, for building submissions.
    pub fn scope_epoch(&self, scope: &str) -> u64 {
        self.directory
            .state()
            .schema_logs
            .get(scope)
            .map(|l| l.epoch)
            .unwrap_or(0)
    }

    /// Validate, append, and wait per the op's apply mode.
    ///
    /// `members` is the set of nodes that must converge on the op; the
    /// caller derives it from the scope's shard maps. `wait` bounds the
    /// overall wait for `AllMembers` and plain `Quorum` modes.
    pub async fn submit(
        &self,
        scope: &str,
        op: SchemaOp,
        members: &[NodeId],
        wait: Duration,
    ) -> Result<SchemaOutcome> {
        self.precheck(scope, &op)?;

        let id = op.id;
        self.directory
            .propose(&DirectoryCommand::SchemaAppend {
                scope: scope.to_string(),
                op: op.clone(),
            })
            .await?;

        let log = self
            .directory
            .state()
            .schema_logs
            .get(scope)
            .cloned()
            .unwrap_or_default();
        let Some(position) = log.position_of(id) else {
            // The deterministic append rejected the op; reconstruct why.
            return Err(self.rejection_reason(scope, &op));
        };

        let (required, deadline) = match op.apply_mode {
            ApplyMode::AllMembers => (members.len().max(1), wait),
            ApplyMode::Quorum(n) => (n.max(1), wait),
            ApplyMode::TimeBoxedQuorum { quorum, wait_ms } => {
                (quorum.max(1), Duration::from_millis(wait_ms))
            }
        };

        let start = time::Instant::now();
        loop {
            let state = self.directory.state();
            let applied = state
                .schema_logs
                .get(scope)
                .map(|l| {
                    members
                        .iter()
                        .filter(|m| l.cursors.get(*m).copied().unwrap_or(0) >= position)
                        .count()
                })
                .unwrap_or(0);
            if applied >= required {
                return Ok(SchemaOutcome {
                    id,
                    position,
                    applied_members: applied,
                });
            }
            if start.elapsed() >= deadline {
                return Err(ClusterError::Timeout);
            }
            time::sleep(self.poll_interval).await;
        }
    }

    fn precheck(&self, scope: &str, op: &SchemaOp) -> Result<()> {
        let state = self.directory.state();
        let log = state.schema_logs.get(scope).cloned().unwrap_or_default();
        if op.scope_epoch != log.epoch {
            return Err(ClusterError::EpochConflict {
                presented: op.scope_epoch,
                current: log.epoch,
            });
        }
        for (object, expected) in &op.preconditions {
            let actual = log.versions.get(object).copied().unwrap_or(0);
            if actual != *expected {
                return Err(ClusterError::VersionConflict {
                    object: object.clone(),
                    expected: *expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    fn rejection_reason(&self, scope: &str, op: &SchemaOp) -> ClusterError {
        let state = self.directory.state();
        let log = state.schema_logs.get(scope).cloned().unwrap_or_default();
        for (object, expected) in &op.preconditions {
            let actual = log.versions.get(object).copied().unwrap_or(0);
            if actual != *expected {
                return ClusterError::VersionConflict {
                    object: object.clone(),
                    expected: *expected,
                    actual,
                };
            }
        }
        ClusterError::EpochConflict {
            presented: op.scope_epoch,
            current: log.epoch,
        }
    }
}

/// Node-local schema state produced by applying scope logs in order.
///
/// The durable resume point is the member's cursor in the directory; the
/// applied-id set makes re-delivery harmless while a cursor report is in
/// flight.
pub struct SchemaCatalog {
    inner: RwLock<SchemaCatalogInner>,
}

#[derive(Default)]
struct SchemaCatalogInner {
    applied: BTreeSet<SchemaOpId>,
    versions: BTreeMap<String, u64>,
    payloads: Vec<(SchemaOpId, Vec<u8>)>,
}

impl SchemaCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(SchemaCatalogInner::default()),
        })
    }

    /// Apply one op. Returns false when the op was already applied.
    pub fn apply(&self, op: &SchemaOp) -> bool {
        let mut inner = self.inner.write().unwrap();
        if !inner.applied.insert(op.id) {
            return false;
        }
        for object in &op.objects {
            let v = inner.versions.entry(object.clone()).or_insert(0);
            *v += 1;
        }
        let payload = (op.id, op.payload.clone());
        inner.payloads.push(payload);
        true
    }

    pub fn applied_count(&self) -> usize {
        self.inner.read().unwrap().applied.len()
    }

    pub fn version_of(&self, object: &str) -> u64 {
        self.inner
            .read()
            .unwrap()
            .versions
            .get(object)
            .copied()
            .unwrap_or(0)
    }
}

/// Background loop applying scope logs on one member node.
///
/// Resumes from the member's durable cursor, applies strictly in log order,
/// and reports progress through the directory leader. A member that
/// reconnects after missing operations converges here.
pub fn spawn_applier(
    directory: Directory,
    node_id: NodeId,
    catalog: Arc<SchemaCatalog>,
    client: Arc<dyn crate::transport::DataClient>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut watch = directory.watch_all();
        loop {
            if let Err(err) = apply_pending(&directory, node_id, &catalog, client.as_ref()).await {
                tracing::warn!(node = node_id, error = ?err, "schema apply pass failed");
            }
            match watch.recv().await {
                WatchItem::Event(DirectoryEvent::Schema { .. }) => {}
                WatchItem::Event(_) => {}
                WatchItem::Lagged => {
                    // Dropped deliveries; the next pass re-reads full state.
                }
                WatchItem::Closed => return,
            }
        }
    })
}

async fn apply_pending(
    directory: &Directory,
    node_id: NodeId,
    catalog: &Arc<SchemaCatalog>,
    client: &dyn crate::transport::DataClient,
) -> Result<()> {
    let state = directory.state();
    for (scope, log) in &state.schema_logs {
        let cursor = log.cursors.get(&node_id).copied().unwrap_or(0);
        let total = log.ops.len() as u64;
        if cursor >= total {
            continue;
        }
        for position in cursor..total {
            let op = &log.ops[position as usize];
            let fresh = catalog.apply(op);
            tracing::debug!(
                node = node_id,
                scope = scope.as_str(),
                op = %op.id,
                fresh,
                "schema op applied"
            );
        }
        let cmd = DirectoryCommand::SchemaReport {
            scope: scope.clone(),
            node_id,
            cursor: total,
        };
        // Cursor reports must land on the directory leader.
        let leader = directory.leader_hint().await;
        match leader {
            Some(leader) if leader != node_id => {
                client.dir_propose(leader, cmd).await?;
            }
            _ => {
                directory.propose(&cmd).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(counter: u64, scope_epoch: u64) -> SchemaOp {
        SchemaOp {
            id: SchemaOpId {
                node_id: 1,
                counter,
            },
            scope_epoch,
            payload: b"ALTER".to_vec(),
            objects: vec!["users".to_string()],
            preconditions: BTreeMap::new(),
            apply_mode: ApplyMode::Quorum(2),
        }
    }

    #[test]
    fn append_is_idempotent_and_epoch_fenced() {
        let mut log = SchemaLog::default();
        assert!(log.try_append(op(1, 0)));
        assert_eq!(log.epoch, 1);
        assert_eq!(log.versions.get("users"), Some(&1));

        // Same id again: rejected.
        assert!(!log.try_append(op(1, 1)));
        // Stale scope epoch: rejected.
        assert!(!log.try_append(op(2, 0)));
        // Fresh id at the current epoch: accepted.
        assert!(log.try_append(op(2, 1)));
        assert_eq!(log.ops.len(), 2);
    }

    #[test]
    fn preconditions_reject_without_mutation() {
        let mut log = SchemaLog::default();
        assert!(log.try_append(op(1, 0)));

        let mut bad = op(2, 1);
        bad.preconditions.insert("users".to_string(), 7);
        assert!(!log.try_append(bad));
        assert_eq!(log.versions.get("users"), Some(&1));
        assert_eq!(log.epoch, 1);
    }

    #[test]
    fn cursors_are_monotone() {
        let mut log = SchemaLog::default();
        assert!(log.try_append(op(1, 0)));
        assert!(log.report_cursor(2, 1));
        assert!(!log.report_cursor(2, 0));
        assert_eq!(log.members_applied(1), 1);
    }

    #[test]
    fn catalog_applies_exactly_once() {
        let catalog = SchemaCatalog::new();
        let o = op(1, 0);
        assert!(catalog.apply(&o));
        assert!(!catalog.apply(&o));
        assert_eq!(catalog.applied_count(), 1);
        assert_eq!(catalog.version_of("users"), 1);
    }
}
