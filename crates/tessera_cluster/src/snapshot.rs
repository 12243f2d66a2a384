//! Versioned, self-describing snapshot files.
//!
//! Layout: a little-endian u32 header length, a JSON header, then the body.
//! The header carries the format version, the covered log position, a crc32
//! and a blake3 digest of the body, so readers can verify integrity and
//! newer writers can evolve the format without breaking old files. Writes
//! go through a temp file and rename, so a crash never leaves a torn
//! snapshot in place.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use tessera_raft::raft::{GroupId, LogIndex, Term};

use crate::error::ClusterError;

/// Current snapshot format version.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub format_version: u32,
    pub group_id: GroupId,
    pub covered_index: LogIndex,
    pub covered_term: Term,
    pub body_len: u64,
    pub body_crc32: u32,
    pub body_digest_hex: String,
}

fn snapshot_file_name(group_id: GroupId, index: LogIndex) -> String {
    format!("snap_{group_id}_{index:020}.snap")
}

/// Write a snapshot atomically, returning its path.
pub fn write_snapshot(
    dir: impl AsRef<Path>,
    group_id: GroupId,
    covered_index: LogIndex,
    covered_term: Term,
    body: &[u8],
) -> anyhow::Result<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).context("create snapshot dir")?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    let meta = SnapshotMeta {
        format_version: SNAPSHOT_FORMAT_VERSION,
        group_id,
        covered_index,
        covered_term,
        body_len: body.len() as u64,
        body_crc32: hasher.finalize(),
        body_digest_hex: blake3::hash(body).to_hex().to_string(),
    };
    let header = serde_json::to_vec(&meta).context("encode snapshot header")?;

    let path = dir.join(snapshot_file_name(group_id, covered_index));
    let tmp = path.with_extension("tmp");
    {
        let mut out = File::create(&tmp).context("create snapshot tmp")?;
        out.write_all(&(header.len() as u32).to_le_bytes())
            .context("write snapshot header len")?;
        out.write_all(&header).context("write snapshot header")?;
        out.write_all(body).context("write snapshot body")?;
        out.sync_all().context("sync snapshot")?;
    }
    fs::rename(&tmp, &path).context("publish snapshot")?;
    Ok(path)
}

/// Read and verify one snapshot file.
pub fn read_snapshot(path: impl AsRef<Path>) -> Result<(SnapshotMeta, Bytes), ClusterError> {
    let path = path.as_ref();
    let mut file = File::open(path)
        .with_context(|| format!("open snapshot {}", path.display()))
        .map_err(ClusterError::Internal)?;
    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)
        .context("read snapshot header len")
        .map_err(ClusterError::Internal)?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    let mut header = vec![0u8; header_len];
    file.read_exact(&mut header)
        .context("read snapshot header")
        .map_err(ClusterError::Internal)?;
    let meta: SnapshotMeta = serde_json::from_slice(&header)
        .context("decode snapshot header")
        .map_err(ClusterError::Internal)?;

    if meta.format_version > SNAPSHOT_FORMAT_VERSION {
        // A rolling upgrade may leave newer files behind; refuse cleanly.
        return Err(ClusterError::Unsupported("snapshot format version"));
    }

    let mut body = Vec::with_capacity(meta.body_len as usize);
    file.read_to_end(&mut body)
        .context("read snapshot body")
        .map_err(ClusterError::Internal)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    if body.len() as u64 != meta.body_len || hasher.finalize() != meta.body_crc32 {
        return Err(ClusterError::Internal(anyhow::anyhow!(
            "snapshot {} failed checksum verification",
            path.display()
        )));
    }
    if blake3::hash(&body).to_hex().to_string() != meta.body_digest_hex {
        return Err(ClusterError::Internal(anyhow::anyhow!(
            "snapshot {} failed digest verification",
            path.display()
        )));
    }
    Ok((meta, Bytes::from(body)))
}

/// Latest verifiable snapshot for a group, if any.
pub fn latest_snapshot(
    dir: impl AsRef<Path>,
    group_id: GroupId,
) -> anyhow::Result<Option<(SnapshotMeta, Bytes)>> {
    let dir = dir.as_ref();
    let prefix = format!("snap_{group_id}_");
    let mut candidates: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix) && n.ends_with(".snap"))
                    .unwrap_or(false)
            })
            .collect(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(anyhow::Error::from(err).context("list snapshot dir")),
    };
    candidates.sort();

    // Newest first; fall back past corrupt files rather than failing.
    for path in candidates.iter().rev() {
        match read_snapshot(path) {
            Ok(found) => return Ok(Some(found)),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable snapshot");
            }
        }
    }
    Ok(None)
}

/// Remove snapshots older than the newest `keep` for a group.
pub fn gc_snapshots(dir: impl AsRef<Path>, group_id: GroupId, keep: usize) -> anyhow::Result<usize> {
    let dir = dir.as_ref();
    let prefix = format!("snap_{group_id}_");
    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix) && n.ends_with(".snap"))
                    .unwrap_or(false)
            })
            .collect(),
        Err(_) => return Ok(0),
    };
    files.sort();
    let mut removed = 0;
    while files.len() > keep {
        let victim = files.remove(0);
        if fs::remove_file(&victim).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_verifies_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let body = b"derived state image".to_vec();
        write_snapshot(dir.path(), 7, 42, 3, &body).unwrap();

        let (meta, read) = latest_snapshot(dir.path(), 7).unwrap().unwrap();
        assert_eq!(meta.covered_index, 42);
        assert_eq!(meta.covered_term, 3);
        assert_eq!(read.as_ref(), body.as_slice());
    }

    #[test]
    fn corrupt_body_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_snapshot(dir.path(), 7, 42, 3, b"payload").unwrap();

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, data).unwrap();

        assert!(read_snapshot(&path).is_err());
        // latest_snapshot skips the corrupt file instead of failing.
        assert!(latest_snapshot(dir.path(), 7).unwrap().is_none());
    }

    #[test]
    fn newer_format_version_is_unsupported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_snapshot(dir.path(), 7, 1, 1, b"x").unwrap();

        // Rewrite the header with a future format version.
        let data = fs::read(&path).unwrap();
        let header_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let mut meta: SnapshotMeta = serde_json::from_slice(&data[4..4 + header_len]).unwrap();
        meta.format_version = SNAPSHOT_FORMAT_VERSION + 1;
        let header = serde_json::to_vec(&meta).unwrap();
        let mut out = Vec::new();
        out.extend_from_slice(&(header.len() as u32).to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&data[4 + header_len..]);
        fs::write(&path, out).unwrap();

        match read_snapshot(&path) {
            Err(ClusterError::Unsupported(_)) => {}
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }

    #[test]
    fn gc_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for index in [10u64, 20, 30] {
            write_snapshot(dir.path(), 7, index, 1, b"x").unwrap();
        }
        let removed = gc_snapshots(dir.path(), 7, 1).unwrap();
        assert_eq!(removed, 2);
        let (meta, _) = latest_snapshot(dir.path(), 7).unwrap().unwrap();
        assert_eq!(meta.covered_index, 30);
    }
}
