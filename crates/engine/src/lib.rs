// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Storage engine over the delta log
//!
//! Tables are Parquet files plus a [`deltalog::DeltaLog`]. Writes append,
//! UPDATE and DELETE go through merge-on-read deltas (or copy-on-write),
//! and maintenance rewrites files without changing what a scan returns.

// Error types
pub mod error;

/// Engine configuration, loadable from YAML
pub mod config;

/// Immutable data files and the staging guard
pub mod data_file;

/// Filters, min/max skipping and row evaluation
pub mod predicate;

/// Merged reads of base and delta files
pub mod scan;

mod rewrite;

/// UPDATE and DELETE
pub mod merge_on_read;

pub mod compaction;

/// Z-order clustering
pub mod zorder;

pub mod transaction;

pub mod vacuum;

pub mod engine;

// Re-export key types
pub use compaction::{AutoCompactor, CompactionMetrics, Compactor};
pub use config::{
    BackoffConfig, CompactionConfig, EngineConfig, MutationStrategy, ZOrderConfig,
};
pub use engine::StorageEngine;
pub use error::{EngineError, Result};
pub use merge_on_read::{Assignment, MutationResult};
pub use predicate::{Filter, FilterOp, FilterValue};
pub use scan::{ScanMetrics, ScanOptions, ScanResult};
pub use transaction::Transaction;
pub use vacuum::VacuumMetrics;
pub use zorder::{ZOrderMetrics, ZOrderOptimizer};
