// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! DeltaLog - a versioned transaction log over immutable Parquet files
//!
//! Set DELTACORE_LOG to control logging:
//! - DELTACORE_LOG=off (default) - silent
//! - DELTACORE_LOG=info - commits and checkpoints
//! - DELTACORE_LOG=debug - detailed diagnostics

// Error types
pub mod error;

/// Table ids, schemas and metadata
pub mod schema;

pub mod scalar;

/// Column statistics for data skipping
pub mod stats;

/// Log entries and the commit unit
pub mod entry;

// Persisted row format of log entries
pub mod catalog;

pub mod parquet_io;

/// Snapshot model and the pure fold over commits
pub mod snapshot;

/// Commit, checkpoint and marker storage
pub mod store;

pub mod checkpoint;

/// The per-table log and its commit slot
pub mod log;

// Optimistic concurrency control
pub mod occ;

// Re-export key types
pub use catalog::{CatalogRow, ForArrow};
pub use checkpoint::{CheckpointManager, CheckpointMarker};
pub use entry::{Action, AddFile, Commit, LogEntry, Operation, Provenance, RemoveFile};
pub use error::{DeltaLogError, Result};
pub use log::{CommitOutcome, ConflictScope, DeltaLog, DeltaLogOptions};
pub use occ::{
    BackoffPolicy, Committed, ConcurrencyController, ExponentialBackoff, NoBackoff, Prepared,
};
pub use scalar::ScalarValue;
pub use schema::{ColumnDef, ColumnType, TableId, TableMetadata, TableSchema};
pub use snapshot::{FileInfo, Snapshot};
pub use stats::FileStats;
pub use store::{FileLogStore, LogStore, MemoryLogStore};
