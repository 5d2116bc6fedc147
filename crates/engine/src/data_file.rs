// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Immutable data files under `<root>/<table>/data/`.
//!
//! Every file is written once, synced, and only then referenced by an ADD.
//! Until its commit succeeds a new file is "staged": owned by a
//! [`StagedFiles`] guard that deletes it if the commit never happens. The
//! store remembers which paths are staged so vacuum leaves them alone.

use crate::error::Result;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use deltalog::parquet_io::{decode_single_batch, sync_dir, write_new_file_synced};
use deltalog::{AddFile, FileStats, TableId};
use parquet::arrow::{ArrowWriter, arrow_writer::ArrowWriterOptions};
use parquet::basic::Compression;
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

pub const DATA_DIR: &str = "data";
pub const DELTA_PREFIX: &str = "delta-";

/// Encode a data file.
///
/// Statistics live in the log, so Parquet's own page statistics and the
/// embedded Arrow schema are left out; small files stay small.
pub fn encode_data_file(schema: SchemaRef, batches: &[RecordBatch]) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    {
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_statistics_enabled(EnabledStatistics::None)
            .build();
        let options = ArrowWriterOptions::new()
            .with_properties(props)
            .with_skip_arrow_metadata(true);
        let mut writer = ArrowWriter::try_new_with_options(&mut buffer, schema, options)?;
        for batch in batches {
            writer.write(batch)?;
        }
        let _ = writer.close()?;
    }
    Ok(buffer)
}

/// Absolute paths of files written but not yet committed or discarded.
#[derive(Debug, Clone, Default)]
struct StagingSet(Arc<Mutex<HashSet<PathBuf>>>);

impl StagingSet {
    fn insert(&self, path: PathBuf) {
        let _ = self.0.lock().unwrap_or_else(PoisonError::into_inner).insert(path);
    }

    fn remove(&self, path: &Path) {
        let _ = self.0.lock().unwrap_or_else(PoisonError::into_inner).remove(path);
    }

    fn contains(&self, path: &Path) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).contains(path)
    }
}

/// Reads and writes the data files of every table under one root.
///
/// Clones share the set of staged files.
#[derive(Debug, Clone)]
pub struct DataFileStore {
    root: PathBuf,
    staging: StagingSet,
}

impl DataFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            staging: StagingSet::default(),
        }
    }

    /// True while a writer holds `path` staged for a commit.
    #[must_use]
    pub fn is_staged(&self, table: &TableId, path: &str) -> bool {
        self.staging.contains(&self.absolute(table, path))
    }

    /// Absolute path of a table-relative file path.
    #[must_use]
    pub fn absolute(&self, table: &TableId, path: &str) -> PathBuf {
        self.root.join(table.as_str()).join(path)
    }

    #[must_use]
    pub fn data_dir(&self, table: &TableId) -> PathBuf {
        self.root.join(table.as_str()).join(DATA_DIR)
    }

    /// Write `batch` as a new file and stage it in `staged`.
    ///
    /// Returns the ADD describing it; the file is synced before return.
    pub async fn write(
        &self,
        table: &TableId,
        batch: &RecordBatch,
        is_delta: bool,
        data_change: bool,
        staged: &mut StagedFiles,
    ) -> Result<AddFile> {
        let name = if is_delta {
            format!("{DELTA_PREFIX}{}.parquet", uuid7::uuid7())
        } else {
            format!("{}.parquet", uuid7::uuid7())
        };
        let path = format!("{DATA_DIR}/{name}");
        let absolute = self.absolute(table, &path);

        let data = encode_data_file(batch.schema(), std::slice::from_ref(batch))?;
        staged.push(absolute.clone(), &self.staging);
        write_new_file_synced(&absolute, &data).await?;
        sync_dir(&self.data_dir(table)).await?;

        diagnostics::log_debug!(
            "Staged {path} for {table}: {rows} rows, {bytes} bytes",
            path: path.as_str(),
            table: table.as_str(),
            rows: batch.num_rows(),
            bytes: data.len()
        );

        Ok(AddFile {
            path,
            size: data.len() as i64,
            row_count: batch.num_rows() as i64,
            stats: FileStats::from_batch(batch),
            data_change,
            is_delta,
        })
    }

    pub async fn read(&self, table: &TableId, path: &str) -> Result<RecordBatch> {
        let data = tokio::fs::read(self.absolute(table, path)).await?;
        Ok(decode_single_batch(Bytes::from(data))?)
    }

    /// Delete a file; a file that is already gone is not an error.
    pub async fn delete(&self, table: &TableId, path: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.absolute(table, path)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Files written for a commit that has not happened yet.
///
/// Dropping the guard deletes them. [`StagedFiles::commit`] releases them
/// once an ADD references them.
#[derive(Debug, Default)]
pub struct StagedFiles {
    paths: Vec<(PathBuf, StagingSet)>,
}

impl StagedFiles {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered before the file exists, so no scan of the data
    /// directory can see it unstaged and unreferenced.
    fn push(&mut self, path: PathBuf, staging: &StagingSet) {
        staging.insert(path.clone());
        self.paths.push((path, staging.clone()));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Take ownership of another guard's files.
    pub fn absorb(&mut self, mut other: StagedFiles) {
        self.paths.append(&mut other.paths);
    }

    /// The files are now referenced by the log; keep them.
    pub fn commit(mut self) {
        for (path, staging) in self.paths.drain(..) {
            staging.remove(&path);
        }
    }

    /// Delete staged files now.
    pub async fn discard(mut self) {
        for (path, staging) in std::mem::take(&mut self.paths) {
            remove_staged(&path, tokio::fs::remove_file(&path).await);
            staging.remove(&path);
        }
    }
}

fn remove_staged(path: &Path, result: std::io::Result<()>) {
    match result {
        Ok(()) => {
            diagnostics::log_debug!("Discarded staged file {path}", path: path.display().to_string());
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            diagnostics::log_warn!(
                "Could not discard staged file {path}: {error}",
                path: path.display().to_string(),
                error: e.to_string()
            );
        }
    }
}

impl Drop for StagedFiles {
    fn drop(&mut self) {
        for (path, staging) in self.paths.drain(..) {
            let result = std::fs::remove_file(&path);
            remove_staged(&path, result);
            staging.remove(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::record_batch;

    fn table() -> TableId {
        TableId::new("files_t").expect("valid")
    }

    #[tokio::test]
    async fn test_write_read_and_stats() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = DataFileStore::new(dir.path());
        let batch = record_batch!(("id", Int64, [3, 1, 2]), ("name", Utf8, ["c", "a", "b"]))
            .expect("batch");

        let mut staged = StagedFiles::new();
        let add = store
            .write(&table(), &batch, false, true, &mut staged)
            .await
            .expect("write");
        staged.commit();

        assert!(add.path.starts_with("data/"));
        assert!(!add.is_delta);
        assert_eq!(add.row_count, 3);
        assert_eq!(add.stats.min("id"), Some(&deltalog::ScalarValue::Int64(1)));
        assert_eq!(add.stats.max("name"), Some(&"c".into()));

        let back = store.read(&table(), &add.path).await.expect("read");
        assert_eq!(back.columns(), batch.columns());
    }

    #[tokio::test]
    async fn test_dropped_guard_deletes_files() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = DataFileStore::new(dir.path());
        let batch = record_batch!(("id", Int64, [1])).expect("batch");

        let mut staged = StagedFiles::new();
        let add = store
            .write(&table(), &batch, true, true, &mut staged)
            .await
            .expect("write");
        assert!(add.path.starts_with("data/delta-"));
        let absolute = store.absolute(&table(), &add.path);
        assert!(absolute.exists());

        drop(staged);
        assert!(!absolute.exists());
    }

    #[tokio::test]
    async fn test_store_tracks_staged_paths() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = DataFileStore::new(dir.path());
        let shared = store.clone();
        let batch = record_batch!(("id", Int64, [1])).expect("batch");

        let mut committed = StagedFiles::new();
        let kept = store
            .write(&table(), &batch, false, true, &mut committed)
            .await
            .expect("write");
        let mut discarded = StagedFiles::new();
        let dropped = store
            .write(&table(), &batch, false, true, &mut discarded)
            .await
            .expect("write");
        assert!(shared.is_staged(&table(), &kept.path));
        assert!(shared.is_staged(&table(), &dropped.path));

        committed.commit();
        discarded.discard().await;
        assert!(!shared.is_staged(&table(), &kept.path));
        assert!(!shared.is_staged(&table(), &dropped.path));
        assert!(store.absolute(&table(), &kept.path).exists());
        assert!(!store.absolute(&table(), &dropped.path).exists());
    }

    #[test]
    fn test_single_row_file_is_small() {
        let batch = record_batch!(("id", Int64, [7]), ("value", Utf8, ["seven"])).expect("batch");
        let data = encode_data_file(batch.schema(), &[batch]).expect("encode");
        assert!(data.len() < 1024, "{} bytes", data.len());
    }
}
