// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Durable storage for commit files, checkpoints and checkpoint markers.
//!
//! Layout under the store root, per table:
//!
//! ```text
//! <table>/_delta_log/<first_version:020>.parquet
//! <table>/_delta_log/_last_checkpoint
//! <table>/_delta_log/_checkpoints/<version:020>.checkpoint.parquet
//! ```
//!
//! Commit files are created with create-if-absent semantics. Two writers
//! racing for the same version cannot both succeed: the loser gets
//! [`DeltaLogError::PreconditionFailed`].

use crate::catalog::{decode_commit, encode_commit};
use crate::checkpoint::{CheckpointMarker, decode_checkpoint, encode_checkpoint, sha256_hex};
use crate::entry::Commit;
use crate::error::{DeltaLogError, Result};
use crate::parquet_io::{sync_dir, write_new_file_synced};
use crate::schema::TableId;
use crate::snapshot::Snapshot;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const LOG_DIR: &str = "_delta_log";
pub const CHECKPOINT_DIR: &str = "_checkpoints";
pub const LAST_CHECKPOINT: &str = "_last_checkpoint";

#[must_use]
pub fn commit_file_name(first_version: i64) -> String {
    format!("{first_version:020}.parquet")
}

#[must_use]
pub fn checkpoint_file_name(version: i64) -> String {
    format!("{version:020}.checkpoint.parquet")
}

fn parse_commit_file_name(name: &str) -> Option<i64> {
    let digits = name.strip_suffix(".parquet")?;
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Where commits and checkpoints live.
#[async_trait]
pub trait LogStore: Send + Sync + Debug {
    /// Tables that have a log directory.
    async fn list_tables(&self) -> Result<Vec<TableId>>;

    /// First versions of the table's commit files, ascending.
    async fn list_commits(&self, table: &TableId) -> Result<Vec<i64>>;

    async fn read_commit(&self, table: &TableId, first_version: i64) -> Result<Commit>;

    /// Persist a commit, failing with `PreconditionFailed` if a commit file
    /// with the same first version already exists.
    async fn write_commit(&self, table: &TableId, commit: &Commit) -> Result<()>;

    async fn delete_commit(&self, table: &TableId, first_version: i64) -> Result<()>;

    /// Persist a checkpoint and advance the marker (never backwards).
    async fn write_checkpoint(&self, snapshot: &Snapshot) -> Result<CheckpointMarker>;

    async fn read_last_checkpoint(&self, table: &TableId) -> Result<Option<CheckpointMarker>>;

    /// Load and verify the checkpoint named by `marker`.
    async fn read_checkpoint(&self, table: &TableId, marker: &CheckpointMarker) -> Result<Snapshot>;
}

fn verify_checkpoint(table: &TableId, marker: &CheckpointMarker, data: Bytes) -> Result<Snapshot> {
    let digest = sha256_hex(&data);
    if digest != marker.sha256 {
        return Err(DeltaLogError::Checkpoint {
            table: table.clone(),
            message: format!(
                "checkpoint {} checksum mismatch: expected {}, found {digest}",
                marker.version, marker.sha256
            ),
        });
    }
    let snapshot = decode_checkpoint(table, data)?;
    if snapshot.version() != marker.version {
        return Err(DeltaLogError::Checkpoint {
            table: table.clone(),
            message: format!(
                "checkpoint file holds version {}, marker says {}",
                snapshot.version(),
                marker.version
            ),
        });
    }
    Ok(snapshot)
}

fn marker_for(snapshot: &Snapshot, data: &[u8]) -> CheckpointMarker {
    CheckpointMarker {
        table_id: snapshot.table_id().to_string(),
        version: snapshot.version(),
        num_files: snapshot.num_files() as i64,
        size_in_bytes: data.len() as i64,
        sha256: sha256_hex(data),
        created_at: now_micros(),
    }
}

/// Local-filesystem log store.
#[derive(Debug, Clone)]
pub struct FileLogStore {
    root: PathBuf,
}

impl FileLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn table_dir(&self, table: &TableId) -> PathBuf {
        self.root.join(table.as_str())
    }

    fn log_dir(&self, table: &TableId) -> PathBuf {
        self.table_dir(table).join(LOG_DIR)
    }

    fn commit_path(&self, table: &TableId, first_version: i64) -> PathBuf {
        self.log_dir(table).join(commit_file_name(first_version))
    }

    fn checkpoint_path(&self, table: &TableId, version: i64) -> PathBuf {
        self.log_dir(table)
            .join(CHECKPOINT_DIR)
            .join(checkpoint_file_name(version))
    }

    fn temp_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!(".{name}.{}.tmp", uuid7::uuid7()))
    }

    /// Write via a synced temp file and rename into place.
    async fn replace_file(path: &Path, data: &[u8]) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| DeltaLogError::InvalidArgument(format!("no parent: {}", path.display())))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = Self::temp_path(dir, &name);
        write_new_file_synced(&temp, data).await?;
        if let Err(e) = tokio::fs::rename(&temp, path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        sync_dir(dir).await?;
        Ok(())
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn list_tables(&self) -> Result<Vec<TableId>> {
        let mut tables = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(tables),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !tokio::fs::try_exists(entry.path().join(LOG_DIR)).await? {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match TableId::new(name.as_str()) {
                Ok(id) => tables.push(id),
                Err(e) => {
                    diagnostics::log_warn!(
                        "Ignoring directory {name} under the store root: {error}",
                        name: name,
                        error: e.to_string()
                    );
                }
            }
        }
        tables.sort();
        Ok(tables)
    }

    async fn list_commits(&self, table: &TableId) -> Result<Vec<i64>> {
        let mut versions = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.log_dir(table)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(version) = parse_commit_file_name(&entry.file_name().to_string_lossy()) {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    async fn read_commit(&self, table: &TableId, first_version: i64) -> Result<Commit> {
        let data = tokio::fs::read(self.commit_path(table, first_version)).await?;
        decode_commit(table, first_version, Bytes::from(data))
    }

    async fn write_commit(&self, table: &TableId, commit: &Commit) -> Result<()> {
        let data = encode_commit(commit)?;
        let path = self.commit_path(table, commit.first_version());
        let dir = self.log_dir(table);
        tokio::fs::create_dir_all(&dir).await?;

        // The commit file must appear complete or not at all, and must never
        // replace a competitor's. Write a synced temp file, then hard-link it
        // into place: link creation fails if the target exists.
        let temp = Self::temp_path(&dir, &commit_file_name(commit.first_version()));
        write_new_file_synced(&temp, &data).await?;
        let linked = tokio::fs::hard_link(&temp, &path).await;
        let _ = tokio::fs::remove_file(&temp).await;

        match linked {
            // An acknowledged commit must survive a crash, so its directory
            // entry is synced too
            Ok(()) => Ok(sync_dir(&dir).await?),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(DeltaLogError::PreconditionFailed {
                    path: path.display().to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_commit(&self, table: &TableId, first_version: i64) -> Result<()> {
        tokio::fs::remove_file(self.commit_path(table, first_version)).await?;
        Ok(())
    }

    async fn write_checkpoint(&self, snapshot: &Snapshot) -> Result<CheckpointMarker> {
        let table = snapshot.table_id();
        let data = encode_checkpoint(snapshot)?;
        let marker = marker_for(snapshot, &data);

        Self::replace_file(&self.checkpoint_path(table, snapshot.version()), &data).await?;

        if let Some(current) = self.read_last_checkpoint(table).await.ok().flatten() {
            if current.version >= marker.version {
                return Ok(marker);
            }
        }
        let json = serde_json::to_vec_pretty(&marker)?;
        Self::replace_file(&self.log_dir(table).join(LAST_CHECKPOINT), &json).await?;
        Ok(marker)
    }

    async fn read_last_checkpoint(&self, table: &TableId) -> Result<Option<CheckpointMarker>> {
        match tokio::fs::read(self.log_dir(table).join(LAST_CHECKPOINT)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_checkpoint(&self, table: &TableId, marker: &CheckpointMarker) -> Result<Snapshot> {
        let data = tokio::fs::read(self.checkpoint_path(table, marker.version))
            .await
            .map_err(|e| DeltaLogError::Checkpoint {
                table: table.clone(),
                message: format!("checkpoint {} unreadable: {e}", marker.version),
            })?;
        verify_checkpoint(table, marker, Bytes::from(data))
    }
}

#[derive(Debug, Default)]
struct MemoryTable {
    commits: BTreeMap<i64, Vec<u8>>,
    checkpoints: BTreeMap<i64, Vec<u8>>,
    marker: Option<CheckpointMarker>,
}

/// In-memory log store for tests. Holds encoded bytes, so the same codecs
/// run as with [`FileLogStore`].
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    tables: Mutex<HashMap<TableId, MemoryTable>>,
    failing_commits: AtomicUsize,
}

impl MemoryLogStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commit writes fail with an I/O error.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Overwrite a stored checkpoint's bytes, bypassing the marker.
    pub fn corrupt_checkpoint(&self, table: &TableId, version: i64) {
        if let Ok(mut tables) = self.tables.lock() {
            if let Some(cp) = tables
                .get_mut(table)
                .and_then(|t| t.checkpoints.get_mut(&version))
            {
                *cp = b"not a parquet file".to_vec();
            }
        }
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut HashMap<TableId, MemoryTable>) -> T) -> Result<T> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| DeltaLogError::InvalidArgument("memory store lock poisoned".to_string()))?;
        Ok(f(&mut tables))
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn list_tables(&self) -> Result<Vec<TableId>> {
        let mut tables = self.with_tables(|t| t.keys().cloned().collect::<Vec<_>>())?;
        tables.sort();
        Ok(tables)
    }

    async fn list_commits(&self, table: &TableId) -> Result<Vec<i64>> {
        self.with_tables(|t| {
            t.get(table)
                .map(|mt| mt.commits.keys().copied().collect())
                .unwrap_or_default()
        })
    }

    async fn read_commit(&self, table: &TableId, first_version: i64) -> Result<Commit> {
        let data = self
            .with_tables(|t| t.get(table).and_then(|mt| mt.commits.get(&first_version).cloned()))?
            .ok_or_else(|| {
                DeltaLogError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no commit {first_version} for {table}"),
                ))
            })?;
        decode_commit(table, first_version, Bytes::from(data))
    }

    async fn write_commit(&self, table: &TableId, commit: &Commit) -> Result<()> {
        if self.take_injected_failure() {
            return Err(DeltaLogError::Io(std::io::Error::other("injected commit failure")));
        }
        let data = encode_commit(commit)?;
        let first = commit.first_version();
        self.with_tables(|t| {
            let mt = t.entry(table.clone()).or_default();
            if mt.commits.contains_key(&first) {
                return Err(DeltaLogError::PreconditionFailed {
                    path: format!("{table}/{LOG_DIR}/{}", commit_file_name(first)),
                });
            }
            let _ = mt.commits.insert(first, data);
            Ok(())
        })?
    }

    async fn delete_commit(&self, table: &TableId, first_version: i64) -> Result<()> {
        self.with_tables(|t| {
            if let Some(mt) = t.get_mut(table) {
                let _ = mt.commits.remove(&first_version);
            }
        })
    }

    async fn write_checkpoint(&self, snapshot: &Snapshot) -> Result<CheckpointMarker> {
        let data = encode_checkpoint(snapshot)?;
        let marker = marker_for(snapshot, &data);
        self.with_tables(|t| {
            let mt = t.entry(snapshot.table_id().clone()).or_default();
            let _ = mt.checkpoints.insert(snapshot.version(), data);
            if mt.marker.as_ref().is_none_or(|m| m.version < marker.version) {
                mt.marker = Some(marker.clone());
            }
        })?;
        Ok(marker)
    }

    async fn read_last_checkpoint(&self, table: &TableId) -> Result<Option<CheckpointMarker>> {
        self.with_tables(|t| t.get(table).and_then(|mt| mt.marker.clone()))
    }

    async fn read_checkpoint(&self, table: &TableId, marker: &CheckpointMarker) -> Result<Snapshot> {
        let data = self
            .with_tables(|t| {
                t.get(table)
                    .and_then(|mt| mt.checkpoints.get(&marker.version).cloned())
            })?
            .ok_or_else(|| DeltaLogError::Checkpoint {
                table: table.clone(),
                message: format!("checkpoint {} missing", marker.version),
            })?;
        verify_checkpoint(table, marker, Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Action, LogEntry, Provenance};

    fn table() -> TableId {
        TableId::new("store_t").expect("valid")
    }

    fn commit(first: i64, len: i64) -> Commit {
        Commit {
            table_id: table(),
            entries: (first..first + len)
                .map(|version| LogEntry {
                    version,
                    timestamp: version * 10,
                    table_id: table(),
                    provenance: Provenance::user("tester"),
                    action: Action::remove(format!("data/{version}"), version, true),
                })
                .collect(),
        }
    }

    #[test]
    fn test_commit_file_names() {
        assert_eq!(commit_file_name(7), "00000000000000000007.parquet");
        assert_eq!(parse_commit_file_name("00000000000000000007.parquet"), Some(7));
        assert_eq!(parse_commit_file_name(".00000000000000000007.parquet.x.tmp"), None);
        assert_eq!(parse_commit_file_name("7.parquet"), None);
    }

    #[tokio::test]
    async fn test_file_store_commit_create_if_absent() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = FileLogStore::new(dir.path());

        store.write_commit(&table(), &commit(1, 2)).await.expect("first");
        let err = store
            .write_commit(&table(), &commit(1, 1))
            .await
            .expect_err("duplicate version");
        assert!(matches!(err, DeltaLogError::PreconditionFailed { .. }));

        store.write_commit(&table(), &commit(3, 1)).await.expect("next");
        assert_eq!(store.list_commits(&table()).await.expect("list"), vec![1, 3]);
        assert_eq!(store.read_commit(&table(), 1).await.expect("read"), commit(1, 2));
        assert_eq!(store.list_tables().await.expect("tables"), vec![table()]);
    }

    #[tokio::test]
    async fn test_file_store_checkpoint_marker_only_advances() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = FileLogStore::new(dir.path());

        let mut later = Snapshot::empty(table());
        later.apply_commit(&commit(1, 20));
        let mut earlier = Snapshot::empty(table());
        earlier.apply_commit(&commit(1, 10));

        let marker = store.write_checkpoint(&later).await.expect("write 20");
        let _ = store.write_checkpoint(&earlier).await.expect("write 10");

        let current = store
            .read_last_checkpoint(&table())
            .await
            .expect("read marker")
            .expect("marker present");
        assert_eq!(current, marker);
        assert_eq!(current.version, 20);
        let loaded = store.read_checkpoint(&table(), &current).await.expect("load");
        assert_eq!(loaded, later);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_detected() {
        let store = MemoryLogStore::new();
        let mut snapshot = Snapshot::empty(table());
        snapshot.apply_commit(&commit(1, 3));
        let marker = store.write_checkpoint(&snapshot).await.expect("write");

        store.corrupt_checkpoint(&table(), marker.version);
        let err = store
            .read_checkpoint(&table(), &marker)
            .await
            .expect_err("corrupt checkpoint");
        assert!(matches!(err, DeltaLogError::Checkpoint { .. }));
    }

    #[tokio::test]
    async fn test_memory_store_injected_failure() {
        let store = MemoryLogStore::new();
        store.fail_next_commits(1);
        assert!(store.write_commit(&table(), &commit(1, 1)).await.is_err());
        store.write_commit(&table(), &commit(1, 1)).await.expect("second try");
        assert_eq!(store.list_commits(&table()).await.expect("list"), vec![1]);
    }
}
