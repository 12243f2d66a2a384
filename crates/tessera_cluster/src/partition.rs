//! Per-partition state machine and storage engines.
//!
//! The state machine applies opaque, serde-encoded commands in log order.
//! Apply is idempotent per log index, idempotency tokens absorb client
//! retries, and two-phase-commit writes stage in a side table until the
//! coordinator's decision arrives.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use tessera_raft::raft::{GroupId, LogIndex, NodeId, StateMachine};

/// One visible row. `version` is the log index of the write that produced
/// it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: u64,
}

/// Cross-partition transaction identity: issuing node plus local counter.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxnId {
    pub node_id: NodeId,
    pub counter: u64,
}

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}-{}", self.node_id, self.counter)
    }
}

/// One write within a command or transaction branch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Conditional put validated against the stored row version at prepare
    /// time; a mismatch turns the participant's vote into abort.
    PutIf {
        key: Vec<u8>,
        value: Vec<u8>,
        expected_version: u64,
    },
    Delete { key: Vec<u8> },
}

impl WriteOp {
    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Put { key, .. } | WriteOp::PutIf { key, .. } | WriteOp::Delete { key } => key,
        }
    }
}

/// Commands replicated through a partition's log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DataCommand {
    Write {
        ops: Vec<WriteOp>,
        /// Client idempotency token; a replayed token is absorbed without
        /// re-applying effects.
        token: Option<u64>,
    },
    TxnPrepare {
        txn_id: TxnId,
        writes: Vec<WriteOp>,
    },
    TxnCommit {
        txn_id: TxnId,
    },
    TxnAbort {
        txn_id: TxnId,
    },
}

impl DataCommand {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).context("encode data command")
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(data).context("decode data command")
    }
}

/// Participant vote recorded durably at prepare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Commit,
    Abort,
}

/// Derived-state storage behind the state machine.
pub trait StoreEngine: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Option<Row>;
    /// Key-ordered scan over `[start, end)`; an empty `end` is unbounded.
    fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Vec<Row>;
    fn put(&self, key: Vec<u8>, value: Vec<u8>, version: u64);
    fn delete(&self, key: &[u8]);
    fn row_count(&self) -> u64;
    fn export(&self) -> anyhow::Result<Vec<Row>>;
    fn import(&self, rows: Vec<Row>) -> anyhow::Result<()>;
}

/// In-memory engine used by tests and volatile partitions.
pub struct MemEngine {
    inner: RwLock<BTreeMap<Vec<u8>, (Vec<u8>, u64)>>,
}

impl MemEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(BTreeMap::new()),
        })
    }
}

impl StoreEngine for MemEngine {
    fn get(&self, key: &[u8]) -> Option<Row> {
        let inner = self.inner.read().unwrap();
        inner.get(key).map(|(value, version)| Row {
            key: key.to_vec(),
            value: value.clone(),
            version: *version,
        })
    }

    fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Vec<Row> {
        let inner = self.inner.read().unwrap();
        let iter: Box<dyn Iterator<Item = (&Vec<u8>, &(Vec<u8>, u64))>> = if end.is_empty() {
            Box::new(inner.range(start.to_vec()..))
        } else {
            Box::new(inner.range(start.to_vec()..end.to_vec()))
        };
        iter.take(limit)
            .map(|(key, (value, version))| Row {
                key: key.clone(),
                value: value.clone(),
                version: *version,
            })
            .collect()
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>, version: u64) {
        self.inner.write().unwrap().insert(key, (value, version));
    }

    fn delete(&self, key: &[u8]) {
        self.inner.write().unwrap().remove(key);
    }

    fn row_count(&self) -> u64 {
        self.inner.read().unwrap().len() as u64
    }

    fn export(&self) -> anyhow::Result<Vec<Row>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .iter()
            .map(|(key, (value, version))| Row {
                key: key.clone(),
                value: value.clone(),
                version: *version,
            })
            .collect())
    }

    fn import(&self, rows: Vec<Row>) -> anyhow::Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.clear();
        for row in rows {
            inner.insert(row.key, (row.value, row.version));
        }
        Ok(())
    }
}

/// Fjall-backed engine: one keyspace partition per consensus group.
///
/// Values are stored as an 8-byte big-endian version prefix followed by the
/// payload, so scans stay allocation-light.
pub struct FjallStoreEngine {
    part: fjall::PartitionHandle,
}

impl FjallStoreEngine {
    pub fn open(keyspace: &fjall::Keyspace, group_id: GroupId) -> anyhow::Result<Self> {
        let name = format!("data_{group_id}");
        let part = keyspace
            .open_partition(&name, fjall::PartitionCreateOptions::default())
            .context("open data partition")?;
        Ok(Self { part })
    }

    fn decode_value(raw: &[u8]) -> Option<(Vec<u8>, u64)> {
        if raw.len() < 8 {
            return None;
        }
        let mut version_bytes = [0u8; 8];
        version_bytes.copy_from_slice(&raw[..8]);
        Some((raw[8..].to_vec(), u64::from_be_bytes(version_bytes)))
    }

    fn encode_value(value: &[u8], version: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + value.len());
        out.extend_from_slice(&version.to_be_bytes());
        out.extend_from_slice(value);
        out
    }
}

impl StoreEngine for FjallStoreEngine {
    fn get(&self, key: &[u8]) -> Option<Row> {
        let raw = self.part.get(key).ok().flatten()?;
        let (value, version) = Self::decode_value(&raw)?;
        Some(Row {
            key: key.to_vec(),
            value,
            version,
        })
    }

    fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Vec<Row> {
        let mut out = Vec::new();
        let iter: Box<dyn Iterator<Item = fjall::Result<fjall::KvPair>>> = if end.is_empty() {
            Box::new(self.part.range(start.to_vec()..))
        } else {
            Box::new(self.part.range(start.to_vec()..end.to_vec()))
        };
        for item in iter {
            let Ok((key, raw)) = item else { break };
            let Some((value, version)) = Self::decode_value(&raw) else {
                continue;
            };
            out.push(Row {
                key: key.to_vec(),
                value,
                version,
            });
            if out.len() >= limit {
                break;
            }
        }
        out
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>, version: u64) {
        if let Err(err) = self.part.insert(key, Self::encode_value(&value, version)) {
            tracing::warn!(error = ?err, "fjall insert failed");
        }
    }

    fn delete(&self, key: &[u8]) {
        if let Err(err) = self.part.remove(key) {
            tracing::warn!(error = ?err, "fjall remove failed");
        }
    }

    fn row_count(&self) -> u64 {
        self.part.approximate_len() as u64
    }

    fn export(&self) -> anyhow::Result<Vec<Row>> {
        let mut out = Vec::new();
        for item in self.part.iter() {
            let (key, raw) = item.context("iterate data partition")?;
            if let Some((value, version)) = Self::decode_value(&raw) {
                out.push(Row {
                    key: key.to_vec(),
                    value,
                    version,
                });
            }
        }
        Ok(out)
    }

    fn import(&self, rows: Vec<Row>) -> anyhow::Result<()> {
        let existing: Vec<Vec<u8>> = self
            .part
            .iter()
            .filter_map(|item| item.ok().map(|(key, _)| key.to_vec()))
            .collect();
        for key in existing {
            self.part.remove(key).context("clear data partition")?;
        }
        for row in rows {
            self.part
                .insert(row.key, Self::encode_value(&row.value, row.version))
                .context("import row")?;
        }
        Ok(())
    }
}

const TOKEN_WINDOW: usize = 4096;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StagedTxn {
    writes: Vec<WriteOp>,
    vote: Vote,
}

#[derive(Default)]
struct SmMeta {
    applied_index: LogIndex,
    staged: BTreeMap<TxnId, StagedTxn>,
    recent_tokens: VecDeque<u64>,
    token_set: HashSet<u64>,
}

impl SmMeta {
    fn rebuild_token_set(&mut self) {
        self.token_set = self.recent_tokens.iter().copied().collect();
    }

    fn remember_token(&mut self, token: u64) {
        if self.token_set.insert(token) {
            self.recent_tokens.push_back(token);
            while self.recent_tokens.len() > TOKEN_WINDOW {
                if let Some(old) = self.recent_tokens.pop_front() {
                    self.token_set.remove(&old);
                }
            }
        }
    }
}

// Staged transactions travel as pairs: JSON map keys must be strings.
#[derive(Serialize, Deserialize)]
struct SmSnapshot {
    format_version: u32,
    applied_index: LogIndex,
    rows: Vec<Row>,
    staged: Vec<(TxnId, StagedTxn)>,
    recent_tokens: VecDeque<u64>,
}

/// The data-plane state machine for one partition.
pub struct PartitionStateMachine {
    group_id: GroupId,
    engine: Arc<dyn StoreEngine>,
    meta: RwLock<SmMeta>,
}

impl PartitionStateMachine {
    pub fn new(group_id: GroupId, engine: Arc<dyn StoreEngine>) -> Arc<Self> {
        Arc::new(Self {
            group_id,
            engine,
            meta: RwLock::new(SmMeta::default()),
        })
    }

    pub fn engine(&self) -> &Arc<dyn StoreEngine> {
        &self.engine
    }

    /// Vote recorded for a prepared transaction, if any.
    pub fn vote_of(&self, txn_id: TxnId) -> Option<Vote> {
        self.meta
            .read()
            .unwrap()
            .staged
            .get(&txn_id)
            .map(|s| s.vote)
    }

    /// Keys currently locked by prepared transactions.
    fn conflicts_with_staged(meta: &SmMeta, writes: &[WriteOp], txn_id: TxnId) -> bool {
        for (other_id, staged) in &meta.staged {
            if *other_id == txn_id || staged.vote == Vote::Abort {
                continue;
            }
            for theirs in &staged.writes {
                if writes.iter().any(|w| w.key() == theirs.key()) {
                    return true;
                }
            }
        }
        false
    }

    fn apply_ops(&self, ops: &[WriteOp], version: u64) {
        for op in ops {
            match op {
                WriteOp::Put { key, value } | WriteOp::PutIf { key, value, .. } => {
                    self.engine.put(key.clone(), value.clone(), version);
                }
                WriteOp::Delete { key } => self.engine.delete(key),
            }
        }
    }

    fn validate(&self, writes: &[WriteOp]) -> Vote {
        for op in writes {
            if let WriteOp::PutIf {
                key,
                expected_version,
                ..
            } = op
            {
                let current = self.engine.get(key).map(|r| r.version).unwrap_or(0);
                if current != *expected_version {
                    return Vote::Abort;
                }
            }
        }
        Vote::Commit
    }
}

impl StateMachine for PartitionStateMachine {
    fn apply(&self, index: LogIndex, command: &[u8]) {
        let cmd = match DataCommand::decode(command) {
            Ok(cmd) => cmd,
            Err(err) => {
                tracing::warn!(group = self.group_id, index, error = ?err,
                    "undecodable data command skipped");
                let mut meta = self.meta.write().unwrap();
                meta.applied_index = meta.applied_index.max(index);
                return;
            }
        };

        let mut meta = self.meta.write().unwrap();
        if index <= meta.applied_index {
            return;
        }

        match cmd {
            DataCommand::Write { ops, token } => {
                let replay = token.map(|t| meta.token_set.contains(&t)).unwrap_or(false);
                if !replay {
                    self.apply_ops(&ops, index);
                    if let Some(token) = token {
                        meta.remember_token(token);
                    }
                }
            }
            DataCommand::TxnPrepare { txn_id, writes } => {
                if !meta.staged.contains_key(&txn_id) {
                    let vote = if Self::conflicts_with_staged(&meta, &writes, txn_id) {
                        Vote::Abort
                    } else {
                        self.validate(&writes)
                    };
                    meta.staged.insert(txn_id, StagedTxn { writes, vote });
                }
            }
            DataCommand::TxnCommit { txn_id } => {
                if let Some(staged) = meta.staged.remove(&txn_id) {
                    if staged.vote == Vote::Commit {
                        self.apply_ops(&staged.writes, index);
                    } else {
                        tracing::warn!(group = self.group_id, txn = %txn_id,
                            "commit for txn that voted abort; dropping staged writes");
                    }
                }
                // Unknown txn id: already finalized. Idempotent no-op.
            }
            DataCommand::TxnAbort { txn_id } => {
                meta.staged.remove(&txn_id);
            }
        }
        meta.applied_index = index;
    }

    fn applied_index(&self) -> LogIndex {
        self.meta.read().unwrap().applied_index
    }

    fn snapshot(&self) -> anyhow::Result<Vec<u8>> {
        let meta = self.meta.read().unwrap();
        let snapshot = SmSnapshot {
            format_version: 1,
            applied_index: meta.applied_index,
            rows: self.engine.export()?,
            staged: meta
                .staged
                .iter()
                .map(|(id, staged)| (*id, staged.clone()))
                .collect(),
            recent_tokens: meta.recent_tokens.clone(),
        };
        serde_json::to_vec(&snapshot).context("encode partition snapshot")
    }

    fn restore(&self, index: LogIndex, data: &[u8]) -> anyhow::Result<()> {
        let snapshot: SmSnapshot =
            serde_json::from_slice(data).context("decode partition snapshot")?;
        anyhow::ensure!(
            snapshot.format_version == 1,
            "unsupported partition snapshot version {}",
            snapshot.format_version
        );
        self.engine.import(snapshot.rows)?;
        let mut meta = self.meta.write().unwrap();
        meta.applied_index = snapshot.applied_index.max(index);
        meta.staged = snapshot.staged.into_iter().collect();
        meta.recent_tokens = snapshot.recent_tokens;
        meta.rebuild_token_set();
        Ok(())
    }
}
