// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

// Error types for DeltaLog operations
use crate::schema::TableId;

pub type Result<T> = std::result::Result<T, DeltaLogError>;

#[derive(Debug, thiserror::Error)]
pub enum DeltaLogError {
    #[error("Table not found: {table}")]
    TableNotFound { table: TableId },

    #[error("Table already exists: {table}")]
    TableAlreadyExists { table: TableId },

    #[error("Invalid table id '{id}': {reason}")]
    InvalidTableId { id: String, reason: String },

    /// A conditional write lost a race (create-if-absent on an existing path).
    #[error("Precondition failed: {path} already exists")]
    PreconditionFailed { path: String },

    /// Another writer committed first; the caller may re-read and try again.
    #[error("Conflict on {table}: read version {read_version}, latest is {latest_version}: {reason}")]
    RetryableConflict {
        table: TableId,
        read_version: i64,
        latest_version: i64,
        reason: String,
    },

    #[error("Conflict on {table} not resolved after {attempts} attempts")]
    RetryableConflictExhausted { table: TableId, attempts: u32 },

    #[error("Corrupt log entry for {table} at version {version}: {message}")]
    CorruptLogEntry {
        table: TableId,
        version: i64,
        message: String,
    },

    #[error("No version of {table} at or before timestamp {timestamp}")]
    NoVersionBeforeTimestamp { table: TableId, timestamp: i64 },

    #[error("Version {version} of {table} is not available (latest is {latest})")]
    VersionNotFound {
        table: TableId,
        version: i64,
        latest: i64,
    },

    #[error("Checkpoint error for {table}: {message}")]
    Checkpoint { table: TableId, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_arrow::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl DeltaLogError {
    /// True for version conflicts that a fresh read-prepare-commit cycle can resolve.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            DeltaLogError::RetryableConflict { .. } | DeltaLogError::PreconditionFailed { .. }
        )
    }

    pub(crate) fn corrupt(table: &TableId, version: i64, message: impl Into<String>) -> Self {
        DeltaLogError::CorruptLogEntry {
            table: table.clone(),
            version,
            message: message.into(),
        }
    }
}
