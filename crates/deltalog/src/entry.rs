// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Log entries and commits.
//!
//! Every entry carries exactly one [`Action`]. The action enum keeps the
//! per-operation payloads apart, so an ADD can never carry a deletion
//! timestamp and a METADATA entry can never name a file.

use crate::schema::{TableId, TableMetadata};
use crate::stats::FileStats;
use std::fmt;

/// A data file entering the active set.
#[derive(Debug, Clone, PartialEq)]
pub struct AddFile {
    /// Path relative to the table root, e.g. `data/0190....parquet`
    pub path: String,
    pub size: i64,
    pub row_count: i64,
    pub stats: FileStats,
    /// False for rewrites (compaction, clustering) that do not change table contents
    pub data_change: bool,
    /// Merge-on-read overlay rather than a base file
    pub is_delta: bool,
}

/// A tombstone. The file bytes stay on disk until vacuumed.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoveFile {
    pub path: String,
    /// Microseconds since the Unix epoch
    pub deletion_timestamp: i64,
    pub data_change: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Add(AddFile),
    Remove(RemoveFile),
    Metadata(TableMetadata),
}

/// The three persisted operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Add,
    Remove,
    Metadata,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Add => "ADD",
            Operation::Remove => "REMOVE",
            Operation::Metadata => "METADATA",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ADD" => Some(Operation::Add),
            "REMOVE" => Some(Operation::Remove),
            "METADATA" => Some(Operation::Metadata),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Action {
    #[must_use]
    pub fn operation(&self) -> Operation {
        match self {
            Action::Add(_) => Operation::Add,
            Action::Remove(_) => Operation::Remove,
            Action::Metadata(_) => Operation::Metadata,
        }
    }

    /// Path of the file an ADD or REMOVE refers to.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        match self {
            Action::Add(add) => Some(&add.path),
            Action::Remove(remove) => Some(&remove.path),
            Action::Metadata(_) => None,
        }
    }

    #[must_use]
    pub fn remove(path: impl Into<String>, deletion_timestamp: i64, data_change: bool) -> Self {
        Action::Remove(RemoveFile {
            path: path.into(),
            deletion_timestamp,
            data_change,
        })
    }
}

/// Who issued a commit. All fields are optional and informational.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub query_id: Option<String>,
}

impl Provenance {
    #[must_use]
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_query(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }
}

/// One versioned, immutable log record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub version: i64,
    /// Microseconds since the Unix epoch, non-decreasing within a table
    pub timestamp: i64,
    pub table_id: TableId,
    pub provenance: Provenance,
    pub action: Action,
}

/// Entries written together. Versions are consecutive and the whole commit
/// becomes visible at once.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub table_id: TableId,
    pub entries: Vec<LogEntry>,
}

impl Commit {
    #[must_use]
    pub fn first_version(&self) -> i64 {
        self.entries.first().map_or(0, |e| e.version)
    }

    #[must_use]
    pub fn last_version(&self) -> i64 {
        self.entries.last().map_or(0, |e| e.version)
    }

    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.entries.last().map_or(0, |e| e.timestamp)
    }

    /// True when this commit only adds base files.
    #[must_use]
    pub fn is_blind_append(&self) -> bool {
        self.entries
            .iter()
            .all(|e| matches!(&e.action, Action::Add(add) if !add.is_delta))
    }
}
