// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Single-table transactions.
//!
//! A transaction reads one snapshot and buffers its writes as staged files.
//! Commit appends them through the concurrency controller as one commit;
//! rollback deletes the staged files. Rollback never touches the log: the
//! version does not advance and nothing becomes visible.

use crate::data_file::StagedFiles;
use crate::engine::{StorageEngine, conform_batch, live_schema};
use crate::error::{EngineError, Result};
use crate::predicate::Filter;
use crate::scan::{ScanOptions, ScanResult, scan_snapshot};
use arrow::record_batch::RecordBatch;
use deltalog::{Action, AddFile, ConflictScope, FileInfo, Prepared, Snapshot, TableId};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug)]
pub struct Transaction {
    engine: StorageEngine,
    read_snapshot: Arc<Snapshot>,
    adds: Vec<AddFile>,
    staged: StagedFiles,
    state: State,
}

impl Transaction {
    pub(crate) fn new(engine: StorageEngine, read_snapshot: Arc<Snapshot>) -> Self {
        diagnostics::log_debug!(
            "Begin transaction on {table} at version {version}",
            table: read_snapshot.table_id().as_str(),
            version: read_snapshot.version()
        );
        Self {
            engine,
            read_snapshot,
            adds: Vec::new(),
            staged: StagedFiles::new(),
            state: State::Active,
        }
    }

    #[must_use]
    pub fn table(&self) -> &TableId {
        self.read_snapshot.table_id()
    }

    /// The version this transaction reads.
    #[must_use]
    pub fn read_version(&self) -> i64 {
        self.read_snapshot.version()
    }

    /// Files written so far and not yet committed.
    #[must_use]
    pub fn pending_files(&self) -> usize {
        self.adds.len()
    }

    /// Scan the read snapshot plus this transaction's own writes.
    pub async fn scan(&self, filters: &[Filter]) -> Result<ScanResult> {
        let own: Vec<FileInfo> = self
            .adds
            .iter()
            .map(|add| FileInfo {
                add: add.clone(),
                added_version: self.read_version() + 1,
            })
            .collect();
        let options = ScanOptions {
            data_skipping: self.engine.config().data_skipping,
            ..ScanOptions::default()
        };
        scan_snapshot(
            self.engine.files(),
            &self.read_snapshot,
            &own,
            filters,
            &options,
        )
        .await
    }

    /// Stage `batch` as a new data file. Invisible to others until commit.
    pub async fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        let schema = live_schema(&self.read_snapshot)?;
        if batch.num_rows() == 0 {
            return Ok(());
        }
        let batch = conform_batch(self.table(), &schema, batch)?;
        let add = self
            .engine
            .files()
            .write(self.read_snapshot.table_id(), &batch, false, true, &mut self.staged)
            .await?;
        self.adds.push(add);
        Ok(())
    }

    /// Commit staged writes. Returns the new version, or the read version
    /// when nothing was written.
    pub async fn commit(mut self) -> Result<i64> {
        let table = self.table().clone();
        if self.adds.is_empty() {
            self.state = State::Committed;
            return Ok(self.read_version());
        }

        let schema = live_schema(&self.read_snapshot)?;
        let provenance = self.engine.provenance();
        let (adds, schema) = (&self.adds, &schema);
        let result = self
            .engine
            .controller()
            .run(&table, &provenance, move |snapshot| async move {
                if &live_schema(&snapshot)? != schema {
                    return Err(EngineError::schema_mismatch(
                        snapshot.table_id(),
                        "schema changed during the transaction",
                    ));
                }
                let actions = adds.iter().cloned().map(Action::Add).collect();
                Ok(Prepared::new(actions, ConflictScope::BlindAppend, ()))
            })
            .await;

        let committed = match result {
            Ok(committed) => committed,
            Err(e) => {
                self.state = State::RolledBack;
                std::mem::take(&mut self.staged).discard().await;
                return Err(e);
            }
        };
        std::mem::take(&mut self.staged).commit();
        self.state = State::Committed;

        let version = committed
            .outcome
            .map_or(committed.read_snapshot.version(), |o| o.version);
        diagnostics::log_info!(
            "Committed transaction on {table}: {files} files at version {version}",
            table: table.as_str(),
            files: self.adds.len(),
            version: version
        );
        Ok(version)
    }

    /// Discard staged writes. The log is not touched.
    pub async fn rollback(mut self) -> Result<()> {
        let files = self.adds.len();
        std::mem::take(&mut self.staged).discard().await;
        self.adds.clear();
        self.state = State::RolledBack;
        diagnostics::log_info!(
            "Rolled back transaction on {table}, discarded {files} files",
            table: self.table().as_str(),
            files: files
        );
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == State::Active && !self.adds.is_empty() {
            diagnostics::log_warn!(
                "Transaction on {table} dropped without commit or rollback, discarding {files} staged files",
                table: self.table().as_str(),
                files: self.adds.len()
            );
        }
    }
}
