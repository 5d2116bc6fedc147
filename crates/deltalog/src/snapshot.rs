// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Snapshot model and the fold that derives it from the log.
//!
//! [`fold`] is pure: given an optional starting snapshot and an ordered
//! sequence of commits it produces the same snapshot every time, with no I/O.
//! Everything else (checkpoints, time travel, concurrent readers) relies on
//! that property.

use crate::entry::{Action, AddFile, Commit, LogEntry};
use crate::schema::{TableId, TableMetadata, TableSchema};
use crate::stats::FileStats;
use std::collections::BTreeMap;

/// An active file as seen by a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub add: AddFile,
    /// Version of the ADD entry that made this file active
    pub added_version: i64,
}

impl FileInfo {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.add.path
    }

    #[must_use]
    pub fn size(&self) -> i64 {
        self.add.size
    }

    #[must_use]
    pub fn row_count(&self) -> i64 {
        self.add.row_count
    }

    #[must_use]
    pub fn stats(&self) -> &FileStats {
        &self.add.stats
    }

    #[must_use]
    pub fn is_delta(&self) -> bool {
        self.add.is_delta
    }
}

/// The table at one version: active files plus the latest metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    table_id: TableId,
    version: i64,
    /// Version of the newest entry with timestamp; 0 when empty
    timestamp: i64,
    metadata: Option<TableMetadata>,
    files: BTreeMap<String, FileInfo>,
}

impl Snapshot {
    /// The state before any entry: version 0, no files, no schema.
    #[must_use]
    pub fn empty(table_id: TableId) -> Self {
        Self {
            table_id,
            version: 0,
            timestamp: 0,
            metadata: None,
            files: BTreeMap::new(),
        }
    }

    /// Rebuild from parts, as loaded from a checkpoint.
    #[must_use]
    pub fn from_parts(
        table_id: TableId,
        version: i64,
        timestamp: i64,
        metadata: Option<TableMetadata>,
        files: Vec<FileInfo>,
    ) -> Self {
        Self {
            table_id,
            version,
            timestamp,
            metadata,
            files: files
                .into_iter()
                .map(|f| (f.add.path.clone(), f))
                .collect(),
        }
    }

    #[must_use]
    pub fn table_id(&self) -> &TableId {
        &self.table_id
    }

    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    #[must_use]
    pub fn metadata(&self) -> Option<&TableMetadata> {
        self.metadata.as_ref()
    }

    #[must_use]
    pub fn schema(&self) -> Option<&TableSchema> {
        self.metadata.as_ref().map(|m| &m.schema)
    }

    /// Active files ordered by path.
    pub fn files(&self) -> impl Iterator<Item = &FileInfo> {
        self.files.values()
    }

    #[must_use]
    pub fn file(&self, path: &str) -> Option<&FileInfo> {
        self.files.get(path)
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    #[must_use]
    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn base_files(&self) -> impl Iterator<Item = &FileInfo> {
        self.files.values().filter(|f| !f.is_delta())
    }

    pub fn delta_files(&self) -> impl Iterator<Item = &FileInfo> {
        self.files.values().filter(|f| f.is_delta())
    }

    /// Sum of row counts over base files.
    #[must_use]
    pub fn base_row_count(&self) -> i64 {
        self.base_files().map(FileInfo::row_count).sum()
    }

    /// Sum of sizes over all active files.
    #[must_use]
    pub fn total_size(&self) -> i64 {
        self.files.values().map(FileInfo::size).sum()
    }

    /// True when the table has live (not dropped) metadata.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| !m.is_dropped())
    }

    /// Apply one entry in place.
    pub fn apply(&mut self, entry: &LogEntry) {
        match &entry.action {
            Action::Add(add) => {
                let _ = self.files.insert(
                    add.path.clone(),
                    FileInfo {
                        add: add.clone(),
                        added_version: entry.version,
                    },
                );
            }
            Action::Remove(remove) => {
                // Removing an absent path is a no-op
                let _ = self.files.remove(&remove.path);
            }
            Action::Metadata(metadata) => {
                self.metadata = Some(metadata.clone());
            }
        }
        self.version = entry.version;
        self.timestamp = entry.timestamp;
    }

    /// Apply every entry of a commit.
    pub fn apply_commit(&mut self, commit: &Commit) {
        for entry in &commit.entries {
            self.apply(entry);
        }
    }
}

/// Fold commits onto `base` (or the empty snapshot) up to `target`.
///
/// Only whole commits are applied: a commit whose last version exceeds
/// `target` is excluded, so a target inside a multi-entry commit resolves to
/// the preceding commit boundary. Commits at or below the base version are
/// skipped.
pub fn fold<'a, I>(table_id: &TableId, base: Option<&Snapshot>, commits: I, target: i64) -> Snapshot
where
    I: IntoIterator<Item = &'a Commit>,
{
    let mut snapshot = base
        .cloned()
        .unwrap_or_else(|| Snapshot::empty(table_id.clone()));

    for commit in commits {
        if commit.last_version() <= snapshot.version {
            continue;
        }
        if commit.last_version() > target {
            break;
        }
        snapshot.apply_commit(commit);
    }
    snapshot
}
