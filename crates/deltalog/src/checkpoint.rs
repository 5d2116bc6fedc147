// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Checkpoints: materialized snapshots that bound recovery time.
//!
//! A checkpoint at version C is a Parquet file with one row per active file
//! of the snapshot at C. The schema, table id and version ride along in the
//! Parquet key-value metadata. A small JSON marker (`_last_checkpoint`)
//! names the newest checkpoint and carries its SHA-256.
//!
//! Checkpoints are an optimization only. The log alone always reconstructs
//! every snapshot, so a failed or corrupt checkpoint costs time, not data.

use crate::catalog::ForArrow;
use crate::entry::{AddFile, Commit};
use crate::error::{DeltaLogError, Result};
use crate::parquet_io::{decode_batches, encode_batches};
use crate::schema::{TableId, TableMetadata, TableSchema};
use crate::snapshot::{FileInfo, Snapshot};
use crate::stats::FileStats;
use crate::store::LogStore;
use arrow::datatypes::{DataType, Field, FieldRef};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const META_TABLE_ID: &str = "deltacore.table_id";
const META_VERSION: &str = "deltacore.version";
const META_TIMESTAMP: &str = "deltacore.timestamp";
const META_METADATA: &str = "deltacore.metadata";

/// Contents of `_last_checkpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMarker {
    pub table_id: String,
    pub version: i64,
    pub num_files: i64,
    pub size_in_bytes: i64,
    pub sha256: String,
    /// Microseconds since the Unix epoch
    pub created_at: i64,
}

/// One row of a checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CheckpointRow {
    path: String,
    size: i64,
    row_count: i64,
    min_values: String,
    max_values: String,
    null_counts: String,
    data_change: bool,
    is_delta: bool,
    added_version: i64,
}

impl ForArrow for CheckpointRow {
    fn for_arrow() -> Vec<FieldRef> {
        vec![
            Arc::new(Field::new("path", DataType::Utf8, false)),
            Arc::new(Field::new("size", DataType::Int64, false)),
            Arc::new(Field::new("row_count", DataType::Int64, false)),
            Arc::new(Field::new("min_values", DataType::Utf8, false)),
            Arc::new(Field::new("max_values", DataType::Utf8, false)),
            Arc::new(Field::new("null_counts", DataType::Utf8, false)),
            Arc::new(Field::new("data_change", DataType::Boolean, false)),
            Arc::new(Field::new("is_delta", DataType::Boolean, false)),
            Arc::new(Field::new("added_version", DataType::Int64, false)),
        ]
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedMetadata {
    schema: TableSchema,
    properties: BTreeMap<String, String>,
}

#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Serialize a snapshot into checkpoint bytes.
pub fn encode_checkpoint(snapshot: &Snapshot) -> Result<Vec<u8>> {
    let rows = snapshot
        .files()
        .map(|f| {
            Ok(CheckpointRow {
                path: f.add.path.clone(),
                size: f.add.size,
                row_count: f.add.row_count,
                min_values: f.add.stats.min_values_json()?,
                max_values: f.add.stats.max_values_json()?,
                null_counts: f.add.stats.null_counts_json()?,
                data_change: f.add.data_change,
                is_delta: f.add.is_delta,
                added_version: f.added_version,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut kv = HashMap::new();
    let _ = kv.insert(META_TABLE_ID.to_string(), snapshot.table_id().to_string());
    let _ = kv.insert(META_VERSION.to_string(), snapshot.version().to_string());
    let _ = kv.insert(META_TIMESTAMP.to_string(), snapshot.timestamp().to_string());
    if let Some(metadata) = snapshot.metadata() {
        let persisted = PersistedMetadata {
            schema: metadata.schema.clone(),
            properties: metadata.properties.clone(),
        };
        let _ = kv.insert(META_METADATA.to_string(), serde_json::to_string(&persisted)?);
    }

    let schema = Arc::new(CheckpointRow::arrow_schema().as_ref().clone().with_metadata(kv));
    let batch = serde_arrow::to_record_batch(&CheckpointRow::for_arrow(), &rows)?
        .with_schema(schema.clone())?;
    encode_batches(schema, &[batch])
}

/// Rebuild a snapshot from checkpoint bytes.
pub fn decode_checkpoint(table: &TableId, data: Bytes) -> Result<Snapshot> {
    let bad = |message: String| DeltaLogError::Checkpoint {
        table: table.clone(),
        message,
    };

    let (schema, batches) = decode_batches(data)?;
    let kv = schema.metadata();

    let stored_table = kv
        .get(META_TABLE_ID)
        .ok_or_else(|| bad("missing table id".to_string()))?;
    if stored_table != table.as_str() {
        return Err(bad(format!("checkpoint belongs to {stored_table}")));
    }
    let version: i64 = kv
        .get(META_VERSION)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| bad("missing version".to_string()))?;
    let timestamp: i64 = kv
        .get(META_TIMESTAMP)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let metadata = match kv.get(META_METADATA) {
        Some(json) => {
            let persisted: PersistedMetadata = serde_json::from_str(json)?;
            Some(TableMetadata {
                schema: persisted.schema,
                properties: persisted.properties,
            })
        }
        None => None,
    };

    let mut files = Vec::new();
    for batch in &batches {
        let rows: Vec<CheckpointRow> = serde_arrow::from_record_batch(batch)?;
        for row in rows {
            files.push(FileInfo {
                add: AddFile {
                    stats: FileStats::from_json(&row.min_values, &row.max_values, &row.null_counts)?,
                    path: row.path,
                    size: row.size,
                    row_count: row.row_count,
                    data_change: row.data_change,
                    is_delta: row.is_delta,
                },
                added_version: row.added_version,
            });
        }
    }

    Ok(Snapshot::from_parts(
        table.clone(),
        version,
        timestamp,
        metadata,
        files,
    ))
}

/// What recovery produced for one table: a starting snapshot (from the
/// newest usable checkpoint, if any) and the commits after it.
#[derive(Debug, Clone)]
pub struct Recovered {
    pub base: Option<Snapshot>,
    pub commits: Vec<Commit>,
    /// True when `commits` start at version 1 (the whole history is in memory)
    pub history_complete: bool,
}

/// Decides when to checkpoint and how to recover from checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    store: Arc<dyn LogStore>,
    interval: i64,
    log_retention: bool,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(store: Arc<dyn LogStore>, interval: i64, log_retention: bool) -> Self {
        Self {
            store,
            interval,
            log_retention,
        }
    }

    #[must_use]
    pub fn interval(&self) -> i64 {
        self.interval
    }

    #[must_use]
    pub fn log_retention(&self) -> bool {
        self.log_retention
    }

    /// True when a commit spanning `first..=last` crosses a multiple of the
    /// interval. For single-entry commits this is `last % interval == 0`.
    #[must_use]
    pub fn should_checkpoint(&self, first: i64, last: i64) -> bool {
        if self.interval <= 0 || last < first {
            return false;
        }
        last / self.interval > (first - 1) / self.interval
    }

    /// Persist `snapshot` and move the marker forward.
    pub async fn write(&self, snapshot: &Snapshot) -> Result<CheckpointMarker> {
        let marker = self.store.write_checkpoint(snapshot).await?;
        diagnostics::log_info!(
            "Checkpoint for {table} written at version {version} ({files} files)",
            table: snapshot.table_id().as_str(),
            version: marker.version,
            files: marker.num_files
        );
        Ok(marker)
    }

    /// Remove commit files fully covered by the checkpoint at `marker`.
    ///
    /// The marker's checkpoint is re-read and verified first, so coverage
    /// is never given up for a checkpoint that cannot be loaded.
    pub async fn cleanup_log(&self, table: &TableId, marker: &CheckpointMarker) -> Result<usize> {
        let _ = self.store.read_checkpoint(table, marker).await?;

        let firsts = self.store.list_commits(table).await?;
        let mut removed = 0;
        // A commit ends where the next one begins. The newest commit file
        // always stays so the latest version is visible without the marker.
        for pair in firsts.windows(2) {
            let (first, next_first) = (pair[0], pair[1]);
            if next_first - 1 > marker.version {
                break;
            }
            self.store.delete_commit(table, first).await?;
            removed += 1;
        }
        if removed > 0 {
            diagnostics::log_info!(
                "Removed {removed} log files of {table} covered by checkpoint {version}",
                removed: removed,
                table: table.as_str(),
                version: marker.version
            );
        }
        Ok(removed)
    }

    /// Load a table from its newest checkpoint plus the commits after it.
    ///
    /// A missing marker means a full replay. An unreadable checkpoint falls
    /// back to a full replay when the log still starts at version 1, and is
    /// an error otherwise.
    pub async fn load_with_checkpoint(&self, table: &TableId) -> Result<Recovered> {
        let firsts = self.store.list_commits(table).await?;
        let log_starts_at_one = firsts.first().is_none_or(|first| *first == 1);

        let base = match self.store.read_last_checkpoint(table).await {
            Ok(Some(marker)) => match self.store.read_checkpoint(table, &marker).await {
                Ok(snapshot) => Some(snapshot),
                Err(e) if log_starts_at_one => {
                    diagnostics::log_warn!(
                        "Checkpoint {version} of {table} unusable, replaying the full log: {error}",
                        version: marker.version,
                        table: table.as_str(),
                        error: e.to_string()
                    );
                    None
                }
                Err(e) => return Err(e),
            },
            Ok(None) => None,
            Err(e) if log_starts_at_one => {
                diagnostics::log_warn!(
                    "Checkpoint marker of {table} unreadable, replaying the full log: {error}",
                    table: table.as_str(),
                    error: e.to_string()
                );
                None
            }
            Err(e) => return Err(e),
        };

        let base_version = base.as_ref().map_or(0, Snapshot::version);

        // Commits after the checkpoint; the one straddling it is not possible
        // because checkpoints are taken at commit boundaries.
        let mut commits = Vec::new();
        for (idx, first) in firsts.iter().enumerate() {
            let last_hint = firsts.get(idx + 1).map(|next| next - 1);
            if last_hint.is_some_and(|last| last <= base_version) {
                continue;
            }
            let commit = self.store.read_commit(table, *first).await?;
            if commit.last_version() <= base_version {
                continue;
            }
            commits.push(commit);
        }

        validate_sequence(table, base_version, &commits)?;

        if base.is_none() && !log_starts_at_one {
            let first = firsts.first().copied().unwrap_or(1);
            return Err(DeltaLogError::corrupt(
                table,
                first,
                "log does not start at version 1 and no checkpoint covers the gap",
            ));
        }

        diagnostics::log_debug!(
            "Recovered {table}: checkpoint {base_version}, {count} commits replayed",
            table: table.as_str(),
            base_version: base_version,
            count: commits.len()
        );

        Ok(Recovered {
            history_complete: base.is_none() && log_starts_at_one,
            base,
            commits,
        })
    }
}

/// Check that commits continue `after` without gaps or overlaps.
pub(crate) fn validate_sequence(table: &TableId, after: i64, commits: &[Commit]) -> Result<()> {
    let mut expected = after + 1;
    for commit in commits {
        if commit.first_version() != expected {
            return Err(DeltaLogError::corrupt(
                table,
                expected,
                format!(
                    "log gap: expected version {expected}, found commit starting at {}",
                    commit.first_version()
                ),
            ));
        }
        expected = commit.last_version() + 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Action, LogEntry, Provenance};
    use crate::scalar::ScalarValue;
    use crate::schema::{ColumnDef, ColumnType};
    use crate::store::MemoryLogStore;

    fn table() -> TableId {
        TableId::new("cp").expect("valid")
    }

    fn snapshot_with_files() -> Snapshot {
        let mut stats = FileStats::default();
        let _ = stats.min_values.insert("id".into(), ScalarValue::Int64(1));
        let _ = stats.max_values.insert("id".into(), ScalarValue::Int64(9));
        let _ = stats.null_counts.insert("id".into(), 0);
        let file = |path: &str, is_delta: bool, added_version: i64| FileInfo {
            add: AddFile {
                path: path.into(),
                size: 1024,
                row_count: 9,
                stats: stats.clone(),
                data_change: true,
                is_delta,
            },
            added_version,
        };
        Snapshot::from_parts(
            table(),
            10,
            123,
            Some(TableMetadata::table(TableSchema::new(vec![ColumnDef::new(
                "id",
                ColumnType::Int64,
                false,
            )]))),
            vec![file("data/a", false, 2), file("data/delta-b", true, 9)],
        )
    }

    #[test]
    fn test_checkpoint_bytes_roundtrip() {
        let snapshot = snapshot_with_files();
        let bytes = encode_checkpoint(&snapshot).expect("encode");
        let decoded = decode_checkpoint(&table(), Bytes::from(bytes)).expect("decode");
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_checkpoint_of_other_table_rejected() {
        let bytes = encode_checkpoint(&snapshot_with_files()).expect("encode");
        let other = TableId::new("other").expect("valid");
        assert!(decode_checkpoint(&other, Bytes::from(bytes)).is_err());
    }

    #[test]
    fn test_should_checkpoint_boundaries() {
        let store: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
        let manager = CheckpointManager::new(store, 10, false);
        assert!(!manager.should_checkpoint(9, 9));
        assert!(manager.should_checkpoint(10, 10));
        assert!(manager.should_checkpoint(8, 12));
        assert!(!manager.should_checkpoint(11, 19));
        assert!(manager.should_checkpoint(20, 20));
    }

    #[tokio::test]
    async fn test_load_replays_only_after_checkpoint() {
        let store = Arc::new(MemoryLogStore::new());
        let manager = CheckpointManager::new(store.clone(), 10, false);

        let mut snapshot = Snapshot::empty(table());
        let mut all = Vec::new();
        for version in 1..=5 {
            let action = Action::remove(format!("p{version}"), version, true);
            let commit = Commit {
                table_id: table(),
                entries: vec![LogEntry {
                    version,
                    timestamp: version,
                    table_id: table(),
                    provenance: Provenance::default(),
                    action,
                }],
            };
            store.write_commit(&table(), &commit).await.expect("write");
            snapshot.apply_commit(&commit);
            all.push(commit);
            if version == 3 {
                let _ = manager.write(&snapshot).await.expect("checkpoint");
            }
        }

        let recovered = manager.load_with_checkpoint(&table()).await.expect("load");
        assert_eq!(recovered.base.as_ref().map(Snapshot::version), Some(3));
        assert_eq!(
            recovered.commits.iter().map(Commit::first_version).collect::<Vec<_>>(),
            vec![4, 5]
        );
        assert!(!recovered.history_complete);
    }
}
