// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Catalog row format: how log entries are persisted.
//!
//! Each commit file is a Parquet file with one row per entry. The row shape
//! is flat and mostly nullable; [`CatalogRow::into_entry`] validates it back
//! into the typed [`LogEntry`] and reports malformed rows as corrupt.

use crate::entry::{Action, AddFile, Commit, LogEntry, Operation, Provenance, RemoveFile};
use crate::error::{DeltaLogError, Result};
use crate::parquet_io::{decode_batches, encode_batches};
use crate::schema::{TableId, TableMetadata, TableSchema};
use crate::stats::FileStats;
use arrow::datatypes::{DataType, Field, FieldRef, Schema, TimeUnit};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Trait for converting data structures to Arrow schemas
pub trait ForArrow {
    fn for_arrow() -> Vec<FieldRef>;

    fn arrow_schema() -> Arc<Schema> {
        Arc::new(Schema::new(Self::for_arrow()))
    }
}

/// One persisted log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRow {
    pub version: i64,
    /// Microseconds since the Unix epoch
    pub timestamp: i64,
    pub table_id: String,
    /// `ADD`, `REMOVE` or `METADATA`
    pub operation: String,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub row_count: Option<i64>,
    /// JSON object column -> value
    pub min_values: Option<String>,
    pub max_values: Option<String>,
    /// JSON object column -> count
    pub null_counts: Option<String>,
    pub data_change: Option<bool>,
    pub deletion_timestamp: Option<i64>,
    pub schema_json: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub query_id: Option<String>,
    pub is_delta: Option<bool>,
    pub properties_json: Option<String>,
}

impl ForArrow for CatalogRow {
    fn for_arrow() -> Vec<FieldRef> {
        vec![
            Arc::new(Field::new("version", DataType::Int64, false)),
            Arc::new(Field::new(
                "timestamp",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            )),
            Arc::new(Field::new("table_id", DataType::Utf8, false)),
            Arc::new(Field::new("operation", DataType::Utf8, false)),
            Arc::new(Field::new("file_path", DataType::Utf8, true)),
            Arc::new(Field::new("file_size", DataType::Int64, true)),
            Arc::new(Field::new("row_count", DataType::Int64, true)),
            Arc::new(Field::new("min_values", DataType::Utf8, true)),
            Arc::new(Field::new("max_values", DataType::Utf8, true)),
            Arc::new(Field::new("null_counts", DataType::Utf8, true)),
            Arc::new(Field::new("data_change", DataType::Boolean, true)),
            Arc::new(Field::new("deletion_timestamp", DataType::Int64, true)),
            Arc::new(Field::new("schema_json", DataType::Utf8, true)),
            Arc::new(Field::new("user_id", DataType::Utf8, true)),
            Arc::new(Field::new("session_id", DataType::Utf8, true)),
            Arc::new(Field::new("query_id", DataType::Utf8, true)),
            Arc::new(Field::new("is_delta", DataType::Boolean, true)),
            Arc::new(Field::new("properties_json", DataType::Utf8, true)),
        ]
    }
}

impl CatalogRow {
    fn empty(entry: &LogEntry) -> Self {
        Self {
            version: entry.version,
            timestamp: entry.timestamp,
            table_id: entry.table_id.to_string(),
            operation: entry.action.operation().as_str().to_string(),
            file_path: None,
            file_size: None,
            row_count: None,
            min_values: None,
            max_values: None,
            null_counts: None,
            data_change: None,
            deletion_timestamp: None,
            schema_json: None,
            user_id: entry.provenance.user_id.clone(),
            session_id: entry.provenance.session_id.clone(),
            query_id: entry.provenance.query_id.clone(),
            is_delta: None,
            properties_json: None,
        }
    }

    pub fn from_entry(entry: &LogEntry) -> Result<Self> {
        let mut row = Self::empty(entry);
        match &entry.action {
            Action::Add(add) => {
                row.file_path = Some(add.path.clone());
                row.file_size = Some(add.size);
                row.row_count = Some(add.row_count);
                row.min_values = Some(add.stats.min_values_json()?);
                row.max_values = Some(add.stats.max_values_json()?);
                row.null_counts = Some(add.stats.null_counts_json()?);
                row.data_change = Some(add.data_change);
                row.is_delta = Some(add.is_delta);
            }
            Action::Remove(remove) => {
                row.file_path = Some(remove.path.clone());
                row.deletion_timestamp = Some(remove.deletion_timestamp);
                row.data_change = Some(remove.data_change);
            }
            Action::Metadata(metadata) => {
                row.schema_json = Some(metadata.schema.to_json()?);
                row.properties_json = Some(serde_json::to_string(&metadata.properties)?);
            }
        }
        Ok(row)
    }

    /// Validate a persisted row back into an entry.
    pub fn into_entry(self) -> Result<LogEntry> {
        let table_id = TableId::new(self.table_id.clone())?;
        let version = self.version;
        let corrupt = |message: String| DeltaLogError::corrupt(&table_id, version, message);

        let operation = Operation::parse(&self.operation)
            .ok_or_else(|| corrupt(format!("unknown operation '{}'", self.operation)))?;

        let action = match operation {
            Operation::Add => {
                let path = self
                    .file_path
                    .ok_or_else(|| corrupt("ADD without file_path".to_string()))?;
                if self.deletion_timestamp.is_some() {
                    return Err(corrupt("ADD with deletion_timestamp".to_string()));
                }
                let (Some(size), Some(row_count)) = (self.file_size, self.row_count) else {
                    return Err(corrupt(format!("ADD {path} without size or row_count")));
                };
                let stats = FileStats::from_json(
                    self.min_values.as_deref().unwrap_or("{}"),
                    self.max_values.as_deref().unwrap_or("{}"),
                    self.null_counts.as_deref().unwrap_or("{}"),
                )
                .map_err(|e| corrupt(format!("ADD {path} has unreadable stats: {e}")))?;
                Action::Add(AddFile {
                    path,
                    size,
                    row_count,
                    stats,
                    data_change: self.data_change.unwrap_or(true),
                    is_delta: self.is_delta.unwrap_or(false),
                })
            }
            Operation::Remove => {
                let path = self
                    .file_path
                    .ok_or_else(|| corrupt("REMOVE without file_path".to_string()))?;
                let deletion_timestamp = self
                    .deletion_timestamp
                    .ok_or_else(|| corrupt(format!("REMOVE {path} without deletion_timestamp")))?;
                Action::Remove(RemoveFile {
                    path,
                    deletion_timestamp,
                    data_change: self.data_change.unwrap_or(true),
                })
            }
            Operation::Metadata => {
                let schema_json = self
                    .schema_json
                    .ok_or_else(|| corrupt("METADATA without schema_json".to_string()))?;
                let schema = TableSchema::from_json(&schema_json)
                    .map_err(|e| corrupt(format!("METADATA schema unreadable: {e}")))?;
                let properties: BTreeMap<String, String> = match self.properties_json {
                    Some(json) => serde_json::from_str(&json)
                        .map_err(|e| corrupt(format!("METADATA properties unreadable: {e}")))?,
                    None => BTreeMap::new(),
                };
                Action::Metadata(TableMetadata { schema, properties })
            }
        };

        Ok(LogEntry {
            version,
            timestamp: self.timestamp,
            table_id,
            provenance: Provenance {
                user_id: self.user_id,
                session_id: self.session_id,
                query_id: self.query_id,
            },
            action,
        })
    }
}

/// Encode a commit as Parquet bytes, one catalog row per entry.
pub fn encode_commit(commit: &Commit) -> Result<Vec<u8>> {
    let rows = commit
        .entries
        .iter()
        .map(CatalogRow::from_entry)
        .collect::<Result<Vec<_>>>()?;
    let batch = serde_arrow::to_record_batch(&CatalogRow::for_arrow(), &rows)?;
    encode_batches(CatalogRow::arrow_schema(), &[batch])
}

/// Decode and validate a commit file. `first_version` is the version the
/// file name promises; any mismatch or gap is reported as corruption.
pub fn decode_commit(table: &TableId, first_version: i64, data: Bytes) -> Result<Commit> {
    let (_, batches) = decode_batches(data)
        .map_err(|e| DeltaLogError::corrupt(table, first_version, format!("unreadable: {e}")))?;

    let mut entries = Vec::new();
    for batch in &batches {
        let rows: Vec<CatalogRow> = serde_arrow::from_record_batch(batch).map_err(|e| {
            DeltaLogError::corrupt(table, first_version, format!("bad row shape: {e}"))
        })?;
        for row in rows {
            entries.push(row.into_entry()?);
        }
    }

    if entries.is_empty() {
        return Err(DeltaLogError::corrupt(
            table,
            first_version,
            "commit file has no entries",
        ));
    }
    for (offset, entry) in entries.iter().enumerate() {
        let expected = first_version + offset as i64;
        if entry.version != expected {
            return Err(DeltaLogError::corrupt(
                table,
                expected,
                format!("found version {} where {expected} was expected", entry.version),
            ));
        }
        if &entry.table_id != table {
            return Err(DeltaLogError::corrupt(
                table,
                expected,
                format!("entry belongs to table {}", entry.table_id),
            ));
        }
    }

    Ok(Commit {
        table_id: table.clone(),
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::ScalarValue;
    use crate::schema::{ColumnDef, ColumnType};

    fn table() -> TableId {
        TableId::new("t1").expect("valid id")
    }

    fn sample_commit() -> Commit {
        let mut stats = FileStats::default();
        let _ = stats.min_values.insert("id".into(), ScalarValue::Int64(1));
        let _ = stats.max_values.insert("id".into(), ScalarValue::Int64(4));
        let _ = stats.null_counts.insert("id".into(), 0);

        let entry = |version: i64, action: Action| LogEntry {
            version,
            timestamp: 1_700_000_000_000_000 + version,
            table_id: table(),
            provenance: Provenance::user("alice").with_query("q-1"),
            action,
        };

        Commit {
            table_id: table(),
            entries: vec![
                entry(
                    3,
                    Action::Metadata(TableMetadata::table(TableSchema::new(vec![
                        ColumnDef::new("id", ColumnType::Int64, false),
                    ]))),
                ),
                entry(
                    4,
                    Action::Add(AddFile {
                        path: "data/a.parquet".into(),
                        size: 512,
                        row_count: 4,
                        stats,
                        data_change: false,
                        is_delta: false,
                    }),
                ),
                entry(5, Action::remove("data/old.parquet", 99, false)),
            ],
        }
    }

    #[test]
    fn test_commit_survives_parquet() {
        let commit = sample_commit();
        let bytes = encode_commit(&commit).expect("encode");
        let decoded = decode_commit(&table(), 3, Bytes::from(bytes)).expect("decode");
        assert_eq!(decoded, commit);
    }

    #[test]
    fn test_version_mismatch_is_corrupt() {
        let bytes = encode_commit(&sample_commit()).expect("encode");
        let err = decode_commit(&table(), 4, Bytes::from(bytes)).expect_err("wrong start");
        assert!(matches!(err, DeltaLogError::CorruptLogEntry { version: 4, .. }));
    }

    #[test]
    fn test_garbage_bytes_are_corrupt() {
        let err = decode_commit(&table(), 1, Bytes::from_static(b"not parquet"))
            .expect_err("garbage");
        assert!(matches!(err, DeltaLogError::CorruptLogEntry { .. }));
    }

    #[test]
    fn test_add_row_without_size_is_corrupt() {
        let mut row = CatalogRow::from_entry(&sample_commit().entries[1]).expect("row");
        row.file_size = None;
        let err = row.into_entry().expect_err("missing size");
        assert!(matches!(err, DeltaLogError::CorruptLogEntry { version: 4, .. }));
    }
}
