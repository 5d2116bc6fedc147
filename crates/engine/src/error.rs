// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use deltalog::{DeltaLogError, TableId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Log(#[from] DeltaLogError),

    #[error("Schema mismatch for {table}: {message}")]
    SchemaMismatch { table: TableId, message: String },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Corrupt data file {path}: {message}")]
    CorruptFile { path: String, message: String },

    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// True for version conflicts, including exhausted retries.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            EngineError::Log(e) => {
                e.is_conflict() || matches!(e, DeltaLogError::RetryableConflictExhausted { .. })
            }
            _ => false,
        }
    }

    pub(crate) fn table_not_found(table: &TableId) -> Self {
        EngineError::Log(DeltaLogError::TableNotFound {
            table: table.clone(),
        })
    }

    pub(crate) fn corrupt_file(path: &str, message: impl Into<String>) -> Self {
        EngineError::CorruptFile {
            path: path.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn schema_mismatch(table: &TableId, message: impl Into<String>) -> Self {
        EngineError::SchemaMismatch {
            table: table.clone(),
            message: message.into(),
        }
    }
}
