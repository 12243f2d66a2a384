//! File-backed log storage for consensus groups.
//!
//! A dedicated worker thread owns the log file and batches appends to
//! amortize write and fsync costs. Entries are crc32-framed; replay stops at
//! the first torn or corrupt frame and truncates the tail. An in-memory
//! mirror serves reads so the hot path never touches the file.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use crc32fast::Hasher;

use tessera_raft::raft::{HardState, LogEntry, LogIndex, LogStore, MemLogStore, Term};

/// Log file name within the WAL directory.
const WAL_LOG_FILE: &str = "wal.log";
/// Hard-state (term/vote) file name.
const HARD_STATE_FILE: &str = "hard_state.json";
/// Compaction boundary file name.
const WAL_META_FILE: &str = "wal_meta.json";

/// Default maximum number of appends batched into one write.
const WAL_BATCH_MAX: usize = 64;
/// Default batching window.
const WAL_BATCH_WAIT: Duration = Duration::from_micros(200);

/// Sync strategy used when persisting WAL data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// Never fsync; durability rides on the OS page cache.
    None,
    /// `fdatasync` on entries requiring durability.
    Data,
    /// Full `fsync` including metadata.
    All,
}

/// Batching and persistence knobs for one WAL directory.
#[derive(Clone, Copy, Debug)]
pub struct WalConfig {
    pub sync: SyncMode,
    pub batch_max: usize,
    pub batch_wait: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync: SyncMode::Data,
            batch_max: WAL_BATCH_MAX,
            batch_wait: WAL_BATCH_WAIT,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Default, Clone, Copy)]
struct WalMeta {
    compacted_index: LogIndex,
    compacted_term: Term,
}

struct AppendWork {
    frames: Vec<Vec<u8>>,
    sync: bool,
    reply: mpsc::Sender<anyhow::Result<()>>,
}

struct RewriteWork {
    frames: Vec<Vec<u8>>,
    reply: mpsc::Sender<anyhow::Result<()>>,
}

enum WalCommand {
    Append(AppendWork),
    Rewrite(RewriteWork),
}

/// Durable `LogStore` with a worker thread and an in-memory read mirror.
pub struct FileWal {
    dir: PathBuf,
    mem: MemLogStore,
    tx: mpsc::Sender<WalCommand>,
}

impl FileWal {
    /// Open or create a WAL directory, replay retained entries, and spawn
    /// the worker thread.
    pub fn open_dir(path: impl AsRef<Path>, config: WalConfig) -> anyhow::Result<Arc<Self>> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create wal dir")?;
        let log_path = dir.join(WAL_LOG_FILE);

        let meta: WalMeta = read_json(&dir.join(WAL_META_FILE))?.unwrap_or_default();
        let mem = MemLogStore::new();
        if meta.compacted_index > 0 {
            mem.compact_to(meta.compacted_index, meta.compacted_term)?;
        }
        if let Some(hs) = read_json::<HardState>(&dir.join(HARD_STATE_FILE))? {
            mem.save_hard_state(&hs)?;
        }

        replay_log(&log_path, &mem, meta.compacted_index)?;

        let (tx, rx) = mpsc::channel();
        let worker_path = log_path.clone();
        let batch_max = config.batch_max.max(1);
        let batch_wait = config.batch_wait;
        let sync = config.sync;
        thread::Builder::new()
            .name("tessera-wal".to_string())
            .spawn(move || wal_worker(&worker_path, rx, sync, batch_max, batch_wait))
            .context("spawn wal worker")?;

        Ok(Arc::new(Self { dir, mem, tx }))
    }

    fn send_append(&self, frames: Vec<Vec<u8>>, sync: bool) -> anyhow::Result<()> {
        let (reply, done) = mpsc::channel();
        self.tx
            .send(WalCommand::Append(AppendWork {
                frames,
                sync,
                reply,
            }))
            .map_err(|_| anyhow::anyhow!("wal worker gone"))?;
        done.recv().map_err(|_| anyhow::anyhow!("wal worker gone"))?
    }

    fn send_rewrite(&self) -> anyhow::Result<()> {
        let mut frames = Vec::new();
        let last = self.mem.last_index();
        let first = self.mem.first_index();
        if last >= first {
            for entry in self.mem.entries(first, last, usize::MAX)? {
                frames.push(encode_frame(&entry)?);
            }
        }
        let (reply, done) = mpsc::channel();
        self.tx
            .send(WalCommand::Rewrite(RewriteWork { frames, reply }))
            .map_err(|_| anyhow::anyhow!("wal worker gone"))?;
        done.recv().map_err(|_| anyhow::anyhow!("wal worker gone"))?
    }

    fn write_meta(&self) -> anyhow::Result<()> {
        let (compacted_index, compacted_term) = self.mem.compacted();
        write_json(
            &self.dir.join(WAL_META_FILE),
            &WalMeta {
                compacted_index,
                compacted_term,
            },
        )
    }
}

impl LogStore for FileWal {
    fn append(&self, entries: &[LogEntry], sync: bool) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.mem.append(entries, sync)?;
        let mut frames = Vec::with_capacity(entries.len());
        for entry in entries {
            frames.push(encode_frame(entry)?);
        }
        self.send_append(frames, sync)
    }

    fn entry(&self, index: LogIndex) -> anyhow::Result<Option<LogEntry>> {
        self.mem.entry(index)
    }

    fn entries(
        &self,
        from: LogIndex,
        to: LogIndex,
        max_bytes: usize,
    ) -> anyhow::Result<Vec<LogEntry>> {
        self.mem.entries(from, to, max_bytes)
    }

    fn first_index(&self) -> LogIndex {
        self.mem.first_index()
    }

    fn last_index(&self) -> LogIndex {
        self.mem.last_index()
    }

    fn term_of(&self, index: LogIndex) -> anyhow::Result<Option<Term>> {
        self.mem.term_of(index)
    }

    fn truncate_from(&self, index: LogIndex) -> anyhow::Result<()> {
        self.mem.truncate_from(index)?;
        self.send_rewrite()
    }

    fn compact_to(&self, index: LogIndex, term: Term) -> anyhow::Result<()> {
        self.mem.compact_to(index, term)?;
        self.write_meta()?;
        self.send_rewrite()
    }

    fn compacted(&self) -> (LogIndex, Term) {
        self.mem.compacted()
    }

    fn save_hard_state(&self, hs: &HardState) -> anyhow::Result<()> {
        self.mem.save_hard_state(hs)?;
        write_json(&self.dir.join(HARD_STATE_FILE), hs)
    }

    fn load_hard_state(&self) -> anyhow::Result<Option<HardState>> {
        self.mem.load_hard_state()
    }
}

fn encode_frame(entry: &LogEntry) -> anyhow::Result<Vec<u8>> {
    let payload = serde_json::to_vec(entry).context("encode log entry")?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Replay frames into the mirror, truncating a torn or corrupt tail.
fn replay_log(path: &Path, mem: &MemLogStore, compacted: LogIndex) -> anyhow::Result<()> {
    let Ok(mut file) = File::open(path) else {
        return Ok(());
    };
    let mut data = Vec::new();
    file.read_to_end(&mut data).context("read wal")?;

    let mut offset = 0usize;
    let mut valid_end = 0usize;
    while offset + 8 <= data.len() {
        let len = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        let crc = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);
        let start = offset + 8;
        let end = start + len;
        if end > data.len() {
            break;
        }
        let payload = &data[start..end];
        let mut hasher = Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != crc {
            tracing::warn!(?path, offset, "crc mismatch in wal; truncating tail");
            break;
        }
        let entry: LogEntry = match serde_json::from_slice(payload) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(?path, offset, error = ?err, "undecodable wal frame; truncating tail");
                break;
            }
        };
        if entry.index > compacted {
            // Frames below the boundary linger until the next rewrite.
            mem.append(&[entry], false)?;
        }
        offset = end;
        valid_end = end;
    }

    if valid_end < data.len() {
        let file = OpenOptions::new().write(true).open(path).context("open wal for truncate")?;
        file.set_len(valid_end as u64).context("truncate torn wal tail")?;
    }
    Ok(())
}

fn wal_worker(
    path: &Path,
    rx: mpsc::Receiver<WalCommand>,
    sync_mode: SyncMode,
    batch_max: usize,
    batch_wait: Duration,
) {
    let mut file = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => file,
        Err(err) => {
            tracing::error!(?path, error = ?err, "wal worker failed to open log");
            return;
        }
    };

    while let Ok(first) = rx.recv() {
        let mut batch = vec![first];
        let deadline = Instant::now() + batch_wait;
        while batch.len() < batch_max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(cmd) => batch.push(cmd),
                Err(_) => break,
            }
        }

        // Rewrites restructure the whole file; run them alone, in order.
        for cmd in batch {
            match cmd {
                WalCommand::Append(work) => {
                    let mut result = Ok(());
                    for frame in &work.frames {
                        if let Err(err) = file.write_all(frame) {
                            result = Err(anyhow::Error::from(err).context("append wal frame"));
                            break;
                        }
                    }
                    if result.is_ok() && work.sync {
                        result = persist(&file, sync_mode);
                    }
                    let _ = work.reply.send(result);
                }
                WalCommand::Rewrite(work) => {
                    let result = rewrite_file(path, &work.frames, sync_mode).and_then(|new_file| {
                        file = new_file;
                        Ok(())
                    });
                    let _ = work.reply.send(result);
                }
            }
        }
    }
}

fn persist(file: &File, mode: SyncMode) -> anyhow::Result<()> {
    match mode {
        SyncMode::None => Ok(()),
        SyncMode::Data => file.sync_data().context("wal sync_data"),
        SyncMode::All => file.sync_all().context("wal sync_all"),
    }
}

fn rewrite_file(path: &Path, frames: &[Vec<u8>], mode: SyncMode) -> anyhow::Result<File> {
    let tmp = path.with_extension("tmp");
    {
        let mut out = File::create(&tmp).context("create wal tmp")?;
        for frame in frames {
            out.write_all(frame).context("write wal tmp")?;
        }
        persist(&out, mode)?;
    }
    fs::rename(&tmp, path).context("swap wal file")?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("reopen wal")?;
    Ok(file)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(
            serde_json::from_slice(&data).with_context(|| format!("decode {}", path.display()))?,
        )),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(anyhow::Error::from(err).context("read json file")),
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("encode json file")?;
    fs::write(&tmp, data).context("write json tmp")?;
    fs::rename(&tmp, path).context("swap json file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_raft::raft::EntryKind;

    fn entry(index: LogIndex, term: Term, data: &[u8]) -> LogEntry {
        LogEntry {
            term,
            index,
            kind: EntryKind::Normal,
            command: data.to_vec(),
        }
    }

    #[test]
    fn append_and_reopen_replays_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let wal = FileWal::open_dir(dir.path(), WalConfig::default()).unwrap();
            for i in 1..=10 {
                wal.append(&[entry(i, 1, format!("cmd{i}").as_bytes())], true)
                    .unwrap();
            }
            wal.save_hard_state(&HardState {
                term: 3,
                voted_for: Some(2),
            })
            .unwrap();
        }

        let wal = FileWal::open_dir(dir.path(), WalConfig::default()).unwrap();
        assert_eq!(wal.last_index(), 10);
        assert_eq!(wal.entry(5).unwrap().unwrap().command, b"cmd5");
        let hs = wal.load_hard_state().unwrap().unwrap();
        assert_eq!(hs.term, 3);
        assert_eq!(hs.voted_for, Some(2));
    }

    #[test]
    fn torn_tail_is_truncated_on_replay() {
        let dir = tempfile::tempdir().unwrap();
        {
            let wal = FileWal::open_dir(dir.path(), WalConfig::default()).unwrap();
            for i in 1..=3 {
                wal.append(&[entry(i, 1, b"x")], true).unwrap();
            }
        }
        // Corrupt the tail mid-frame.
        let log_path = dir.path().join(WAL_LOG_FILE);
        let mut data = fs::read(&log_path).unwrap();
        let cut = data.len() - 3;
        data.truncate(cut);
        data.extend_from_slice(&[0xde, 0xad]);
        fs::write(&log_path, data).unwrap();

        let wal = FileWal::open_dir(dir.path(), WalConfig::default()).unwrap();
        assert_eq!(wal.last_index(), 2);
        // The log remains appendable after truncation.
        wal.append(&[entry(3, 2, b"fresh")], true).unwrap();
        assert_eq!(wal.entry(3).unwrap().unwrap().command, b"fresh");
    }

    #[test]
    fn compaction_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let wal = FileWal::open_dir(dir.path(), WalConfig::default()).unwrap();
            for i in 1..=8 {
                wal.append(&[entry(i, 1, b"x")], true).unwrap();
            }
            wal.compact_to(5, 1).unwrap();
            assert_eq!(wal.first_index(), 6);
        }
        let wal = FileWal::open_dir(dir.path(), WalConfig::default()).unwrap();
        assert_eq!(wal.first_index(), 6);
        assert_eq!(wal.last_index(), 8);
        assert_eq!(wal.term_of(5).unwrap(), Some(1));
        assert!(wal.entry(5).unwrap().is_none());
    }

    #[test]
    fn truncate_from_drops_suffix_durably() {
        let dir = tempfile::tempdir().unwrap();
        {
            let wal = FileWal::open_dir(dir.path(), WalConfig::default()).unwrap();
            for i in 1..=5 {
                wal.append(&[entry(i, 1, b"x")], true).unwrap();
            }
            wal.truncate_from(4).unwrap();
            assert_eq!(wal.last_index(), 3);
        }
        let wal = FileWal::open_dir(dir.path(), WalConfig::default()).unwrap();
        assert_eq!(wal.last_index(), 3);
    }
}
