//! Cross-partition transactions: two-phase commit.
//!
//! The coordinator records every state change in a durable transaction
//! store before acting on it. Participants record their vote inside their
//! partition's replicated log at prepare; an indeterminate transaction is
//! resolved by consulting the store — never by a participant-local timeout.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};

use tessera_raft::raft::NodeId;

use crate::auth::{Action, AuthGate};
use crate::directory::MapKey;
use crate::error::{ClusterError, Result};
use crate::map_cache::ShardMapCache;
use crate::partition::{DataCommand, TxnId, Vote, WriteOp};
use crate::router::Router;
use crate::unix_time_ms;

/// Coordinator-side transaction lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    /// Prepares may be in flight; no decision recorded.
    Pending,
    /// Decision recorded; commits may still need delivery.
    Committed,
    /// Decision recorded; aborts may still need delivery.
    Aborted,
    /// Decision fully delivered; retained for the recovery window.
    Done,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxnParticipant {
    pub key: MapKey,
    pub partition: u32,
}

/// Durable transaction record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxnRecord {
    pub txn_id: TxnId,
    pub state: TxnState,
    pub participants: Vec<TxnParticipant>,
    /// Vote per participant index, filled during prepare.
    pub votes: BTreeMap<usize, Vote>,
    pub deadline_unix_ms: u64,
    pub updated_unix_ms: u64,
}

/// Durable transaction-state store.
pub trait TxnStore: Send + Sync + 'static {
    fn save(&self, record: &TxnRecord) -> anyhow::Result<()>;
    fn load(&self, txn_id: TxnId) -> anyhow::Result<Option<TxnRecord>>;
    fn remove(&self, txn_id: TxnId) -> anyhow::Result<()>;
    fn all(&self) -> anyhow::Result<Vec<TxnRecord>>;
}

/// In-memory store for tests and embedded setups.
pub struct MemTxnStore {
    inner: RwLock<BTreeMap<TxnId, TxnRecord>>,
}

impl MemTxnStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(BTreeMap::new()),
        })
    }
}

impl TxnStore for MemTxnStore {
    fn save(&self, record: &TxnRecord) -> anyhow::Result<()> {
        self.inner
            .write()
            .unwrap()
            .insert(record.txn_id, record.clone());
        Ok(())
    }

    fn load(&self, txn_id: TxnId) -> anyhow::Result<Option<TxnRecord>> {
        Ok(self.inner.read().unwrap().get(&txn_id).cloned())
    }

    fn remove(&self, txn_id: TxnId) -> anyhow::Result<()> {
        self.inner.write().unwrap().remove(&txn_id);
        Ok(())
    }

    fn all(&self) -> anyhow::Result<Vec<TxnRecord>> {
        Ok(self.inner.read().unwrap().values().cloned().collect())
    }
}

/// One JSON file per transaction, swapped in atomically.
pub struct FileTxnStore {
    dir: PathBuf,
}

impl FileTxnStore {
    pub fn open_dir(path: impl AsRef<Path>) -> anyhow::Result<Arc<Self>> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create txn store dir")?;
        Ok(Arc::new(Self { dir }))
    }

    fn path_of(&self, txn_id: TxnId) -> PathBuf {
        self.dir
            .join(format!("txn_{}_{}.json", txn_id.node_id, txn_id.counter))
    }
}

impl TxnStore for FileTxnStore {
    fn save(&self, record: &TxnRecord) -> anyhow::Result<()> {
        let path = self.path_of(record.txn_id);
        let tmp = path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(record).context("encode txn record")?;
        fs::write(&tmp, data).context("write txn tmp")?;
        fs::rename(&tmp, &path).context("publish txn record")?;
        Ok(())
    }

    fn load(&self, txn_id: TxnId) -> anyhow::Result<Option<TxnRecord>> {
        match fs::read(self.path_of(txn_id)) {
            Ok(data) => Ok(Some(
                serde_json::from_slice(&data).context("decode txn record")?,
            )),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(anyhow::Error::from(err).context("read txn record")),
        }
    }

    fn remove(&self, txn_id: TxnId) -> anyhow::Result<()> {
        match fs::remove_file(self.path_of(txn_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(anyhow::Error::from(err).context("remove txn record")),
        }
    }

    fn all(&self) -> anyhow::Result<Vec<TxnRecord>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir).context("list txn store")? {
            let path = entry.context("txn store entry")?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path)
                .ok()
                .and_then(|data| serde_json::from_slice::<TxnRecord>(&data).ok())
            {
                Some(record) => out.push(record),
                None => tracing::warn!(path = %path.display(), "skipping unreadable txn record"),
            }
        }
        Ok(out)
    }
}

/// One branch of a cross-partition transaction.
#[derive(Clone, Debug)]
pub struct TxnBranch {
    pub key: MapKey,
    pub routing_key: Vec<u8>,
    pub writes: Vec<WriteOp>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed,
    Aborted,
}

pub struct TxnCoordinatorConfig {
    pub deadline: Duration,
    /// How long terminal records stay in the store for recovery queries.
    pub retention: Duration,
}

impl Default for TxnCoordinatorConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(10),
            retention: Duration::from_secs(300),
        }
    }
}

pub struct TxnCoordinator {
    node_id: NodeId,
    counter: AtomicU64,
    store: Arc<dyn TxnStore>,
    router: Arc<Router>,
    cache: Arc<ShardMapCache>,
    auth: AuthGate,
    config: TxnCoordinatorConfig,
}

impl TxnCoordinator {
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn TxnStore>,
        router: Arc<Router>,
        cache: Arc<ShardMapCache>,
        auth: AuthGate,
        config: TxnCoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            counter: AtomicU64::new(1),
            store,
            router,
            cache,
            auth,
            config,
        })
    }

    fn next_txn_id(&self) -> TxnId {
        TxnId {
            node_id: self.node_id,
            counter: self.counter.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Run one cross-partition transaction to a terminal outcome.
    ///
    /// Prepares fan out concurrently; a single abort vote (or an exhausted
    /// prepare) aborts everything. The decision is durable in the store
    /// before any commit or abort is delivered.
    pub async fn execute(&self, actor: &str, branches: Vec<TxnBranch>) -> Result<TxnOutcome> {
        if branches.is_empty() {
            return Err(ClusterError::Unsupported("empty transaction"));
        }
        for branch in &branches {
            self.auth
                .check(actor, Action::Write, &branch.key.scope())
                .await?;
        }

        // Group writes per (map, partition).
        let mut grouped: BTreeMap<(MapKey, u32), Vec<WriteOp>> = BTreeMap::new();
        for branch in branches {
            let map = self.cache.get(&branch.key)?;
            let partition = map.desc.compute_partition(&branch.routing_key);
            grouped
                .entry((branch.key, partition))
                .or_default()
                .extend(branch.writes);
        }

        let txn_id = self.next_txn_id();
        let participants: Vec<TxnParticipant> = grouped
            .keys()
            .map(|(key, partition)| TxnParticipant {
                key: key.clone(),
                partition: *partition,
            })
            .collect();
        let mut record = TxnRecord {
            txn_id,
            state: TxnState::Pending,
            participants: participants.clone(),
            votes: BTreeMap::new(),
            deadline_unix_ms: unix_time_ms()
                + self.config.deadline.as_millis().min(u128::from(u64::MAX)) as u64,
            updated_unix_ms: unix_time_ms(),
        };
        self.store.save(&record).map_err(ClusterError::Internal)?;

        // Phase one: prepare everywhere, collecting durable votes.
        let mut futs = FuturesUnordered::new();
        for (index, ((key, partition), writes)) in grouped.into_iter().enumerate() {
            let router = Arc::clone(&self.router);
            futs.push(async move {
                let ack = router
                    .write_partition(
                        &key,
                        partition,
                        DataCommand::TxnPrepare { txn_id, writes },
                    )
                    .await;
                (index, ack)
            });
        }
        while let Some((index, ack)) = futs.next().await {
            let vote = match ack {
                Ok(ack) => ack.txn_vote.unwrap_or(Vote::Abort),
                Err(err) => {
                    tracing::warn!(txn = %txn_id, participant = index, error = %err,
                        "prepare failed; treating as abort vote");
                    Vote::Abort
                }
            };
            record.votes.insert(index, vote);
        }
        drop(futs);

        let unanimous = record.participants.len() == record.votes.len()
            && record.votes.values().all(|v| *v == Vote::Commit);
        record.state = if unanimous {
            TxnState::Committed
        } else {
            TxnState::Aborted
        };
        record.updated_unix_ms = unix_time_ms();
        // The decision must be durable before any participant learns it.
        self.store.save(&record).map_err(ClusterError::Internal)?;

        self.finalize(&mut record).await?;
        Ok(if unanimous {
            TxnOutcome::Committed
        } else {
            TxnOutcome::Aborted
        })
    }

    /// Deliver the recorded decision to every participant. Participants
    /// apply commits and aborts idempotently, so redelivery is safe.
    async fn finalize(&self, record: &mut TxnRecord) -> Result<()> {
        let command = match record.state {
            TxnState::Committed => DataCommand::TxnCommit {
                txn_id: record.txn_id,
            },
            TxnState::Aborted => DataCommand::TxnAbort {
                txn_id: record.txn_id,
            },
            TxnState::Pending | TxnState::Done => return Ok(()),
        };

        let mut failed = 0usize;
        for participant in record.participants.clone() {
            if let Err(err) = self
                .router
                .write_partition(&participant.key, participant.partition, command.clone())
                .await
            {
                failed += 1;
                tracing::warn!(txn = %record.txn_id, key = %participant.key,
                    partition = participant.partition, error = %err,
                    "decision delivery failed; recovery will redeliver");
            }
        }
        if failed == 0 {
            record.state = TxnState::Done;
            record.updated_unix_ms = unix_time_ms();
            self.store.save(record).map_err(ClusterError::Internal)?;
        }
        Ok(())
    }

    /// Resolve an indeterminate transaction from the durable store. Used by
    /// participants and by recovery after a coordinator crash.
    pub async fn resolve(&self, txn_id: TxnId) -> Result<TxnState> {
        let Some(mut record) = self.store.load(txn_id).map_err(ClusterError::Internal)? else {
            // Never recorded: no participant can have seen a commit.
            return Ok(TxnState::Aborted);
        };
        match record.state {
            TxnState::Done => Ok(TxnState::Done),
            TxnState::Committed | TxnState::Aborted => {
                self.finalize(&mut record).await?;
                Ok(record.state)
            }
            TxnState::Pending => {
                if unix_time_ms() >= record.deadline_unix_ms {
                    record.state = TxnState::Aborted;
                    record.updated_unix_ms = unix_time_ms();
                    self.store.save(&record).map_err(ClusterError::Internal)?;
                    self.finalize(&mut record).await?;
                    Ok(TxnState::Aborted)
                } else {
                    Ok(TxnState::Pending)
                }
            }
        }
    }

    /// Re-drive every undelivered decision; run at coordinator startup.
    pub async fn recover(&self) -> Result<usize> {
        let mut resumed = 0;
        for record in self.store.all().map_err(ClusterError::Internal)? {
            if matches!(record.state, TxnState::Committed | TxnState::Aborted)
                || (record.state == TxnState::Pending
                    && unix_time_ms() >= record.deadline_unix_ms)
            {
                self.resolve(record.txn_id).await?;
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Drop terminal records past the retention window.
    pub fn gc(&self) -> Result<usize> {
        let cutoff = unix_time_ms()
            .saturating_sub(self.config.retention.as_millis().min(u128::from(u64::MAX)) as u64);
        let mut removed = 0;
        for record in self.store.all().map_err(ClusterError::Internal)? {
            if record.state == TxnState::Done && record.updated_unix_ms < cutoff {
                self.store
                    .remove(record.txn_id)
                    .map_err(ClusterError::Internal)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;

    fn record(counter: u64, state: TxnState) -> TxnRecord {
        TxnRecord {
            txn_id: TxnId {
                node_id: 1,
                counter,
            },
            state,
            participants: vec![TxnParticipant {
                key: MapKey::new(Namespace::Table, "users"),
                partition: 0,
            }],
            votes: BTreeMap::new(),
            deadline_unix_ms: 0,
            updated_unix_ms: 0,
        }
    }

    #[test]
    fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTxnStore::open_dir(dir.path()).unwrap();
        let r = record(1, TxnState::Committed);
        store.save(&r).unwrap();

        let loaded = store.load(r.txn_id).unwrap().unwrap();
        assert_eq!(loaded.state, TxnState::Committed);
        assert_eq!(loaded.participants, r.participants);

        assert_eq!(store.all().unwrap().len(), 1);
        store.remove(r.txn_id).unwrap();
        assert!(store.load(r.txn_id).unwrap().is_none());
        // Removing again is idempotent.
        store.remove(r.txn_id).unwrap();
    }

    #[test]
    fn mem_store_tracks_records() {
        let store = MemTxnStore::new();
        store.save(&record(1, TxnState::Pending)).unwrap();
        store.save(&record(2, TxnState::Done)).unwrap();
        assert_eq!(store.all().unwrap().len(), 2);
    }
}
