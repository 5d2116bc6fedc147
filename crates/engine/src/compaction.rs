// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Small-file compaction, on demand and on a timer.

use crate::config::CompactionConfig;
use crate::engine::{StorageEngine, live_schema};
use crate::error::Result;
use crate::rewrite::{Rewrite, now_micros, rows_per_file};
use crate::scan::{MergeReader, strip_row_ids};
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use deltalog::{ConflictScope, FileInfo, Prepared, Snapshot, TableId};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionMetrics {
    pub groups: usize,
    pub files_removed: usize,
    pub files_added: usize,
    pub deltas_removed: usize,
    pub rows_rewritten: usize,
    /// `None` when there was nothing to compact
    pub version: Option<i64>,
}

#[derive(Debug)]
struct Compaction {
    rewrite: Rewrite,
    metrics: CompactionMetrics,
}

#[derive(Debug, Clone)]
pub struct Compactor {
    config: CompactionConfig,
}

impl Compactor {
    #[must_use]
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }

    /// Groups of small base files, oldest first. Groups of one are dropped.
    #[must_use]
    pub fn plan(&self, snapshot: &Snapshot) -> Vec<Vec<FileInfo>> {
        let mut small: Vec<FileInfo> = snapshot
            .base_files()
            .filter(|f| u64::try_from(f.size()).is_ok_and(|s| s < self.config.min_file_size))
            .cloned()
            .collect();
        small.sort_by(|a, b| {
            a.added_version
                .cmp(&b.added_version)
                .then_with(|| a.path().cmp(b.path()))
        });
        small
            .chunks(self.config.max_files_to_compact.max(2))
            .filter(|group| group.len() > 1)
            .map(<[FileInfo]>::to_vec)
            .collect()
    }

    /// Rewrite every group into files near the target size, as one commit.
    ///
    /// Groups bound how many files are read together.
    pub async fn compact_table(
        &self,
        engine: &StorageEngine,
        table: &TableId,
    ) -> Result<CompactionMetrics> {
        let provenance = engine.provenance();
        let committed = engine
            .controller()
            .run(table, &provenance, move |snapshot| async move {
                self.attempt(engine, snapshot).await
            })
            .await?;

        let Compaction {
            rewrite,
            mut metrics,
        } = committed.payload;
        rewrite.staged.commit();
        metrics.version = committed.outcome.map(|o| o.version);

        if let Some(version) = metrics.version {
            diagnostics::log_info!(
                "Compacted {table}: {removed} files into {added} at version {version}",
                table: table.as_str(),
                removed: metrics.files_removed,
                added: metrics.files_added,
                version: version
            );
        }
        Ok(metrics)
    }

    async fn attempt(
        &self,
        engine: &StorageEngine,
        snapshot: Arc<Snapshot>,
    ) -> Result<Prepared<Compaction>> {
        let schema = live_schema(&snapshot)?;
        let table = snapshot.table_id();
        let groups = self.plan(&snapshot);
        if groups.is_empty() {
            return Ok(Prepared::nothing(Compaction {
                rewrite: Rewrite::new(),
                metrics: CompactionMetrics::default(),
            }));
        }

        let store = engine.files();
        let mut reader = MergeReader::for_snapshot(store.clone(), &snapshot, schema.clone());
        let mut rewrite = Rewrite::new();
        let mut consumed = BTreeSet::new();
        let mut metrics = CompactionMetrics {
            groups: groups.len(),
            ..CompactionMetrics::default()
        };

        let inputs = || groups.iter().flatten();
        let per_file = rows_per_file(
            self.config.target_file_size,
            inputs().map(FileInfo::size).sum(),
            inputs().map(FileInfo::row_count).sum(),
        );

        // Rows are packed across groups: only the last output file may fall
        // short of the target, so a second pass finds at most one small file
        let mut carry: Option<RecordBatch> = None;
        for group in &groups {
            let mut batches: Vec<RecordBatch> = carry.take().into_iter().collect();
            for file in group {
                let merged = reader.materialize(file).await?;
                batches.push(strip_row_ids(&schema, &merged)?);
                rewrite.remove(file.path());
                let _ = consumed.insert(file.path().to_string());
            }
            let rows = concat_batches(&schema.to_arrow(), &batches)?;
            let full = rows.num_rows() / per_file * per_file;
            if full > 0 {
                rewrite
                    .write_chunks(store, table, &rows.slice(0, full), per_file, false)
                    .await?;
            }
            if full < rows.num_rows() {
                carry = Some(rows.slice(full, rows.num_rows() - full));
            }
        }
        if let Some(rest) = carry {
            rewrite
                .write_chunks(store, table, &rest, per_file, false)
                .await?;
        }

        let active: BTreeSet<String> = snapshot.base_files().map(|f| f.path().to_string()).collect();
        let deltas = reader.removable_deltas(&consumed, &active);
        metrics.deltas_removed = deltas.len();
        for path in deltas {
            rewrite.remove(path);
        }

        metrics.files_removed = consumed.len();
        metrics.files_added = rewrite.adds.len();
        metrics.rows_rewritten = rewrite.rows_written;

        // Conflicts only with commits touching what this rewrite consumed
        let scope = ConflictScope::files(rewrite.removes.iter().cloned(), true);
        let actions = rewrite.actions(now_micros(), false);
        Ok(Prepared::new(actions, scope, Compaction { rewrite, metrics }))
    }
}

/// Background compaction of every table.
///
/// Cancellation is checked between tables: a table's compaction either
/// commits or is abandoned before its commit, never half done.
#[derive(Debug)]
pub struct AutoCompactor {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    runs: Arc<AtomicUsize>,
}

impl AutoCompactor {
    pub fn start(engine: StorageEngine, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn(run_loop(engine, interval, cancel.clone(), runs.clone()));
        diagnostics::log_debug!(
            "Auto-compaction started, every {interval_ms} ms",
            interval_ms: interval.as_millis() as u64
        );
        Self {
            cancel,
            handle: Some(handle),
            runs,
        }
    }

    /// Completed passes over all tables.
    #[must_use]
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel and wait for the current unit of work to finish.
    pub async fn stop(mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await?;
        }
        diagnostics::log_debug!("Auto-compaction stopped");
        Ok(())
    }
}

impl Drop for AutoCompactor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_loop(
    engine: StorageEngine,
    interval: Duration,
    cancel: CancellationToken,
    runs: Arc<AtomicUsize>,
) {
    let compactor = Compactor::new(engine.config().compaction.clone());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let tables = match engine.list_tables().await {
            Ok(tables) => tables,
            Err(e) => {
                diagnostics::log_warn!("Auto-compaction could not list tables: {error}", error: e.to_string());
                continue;
            }
        };
        for table in tables {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(e) = compactor.compact_table(&engine, &table).await {
                diagnostics::log_warn!(
                    "Auto-compaction of {table} failed: {error}",
                    table: table.as_str(),
                    error: e.to_string()
                );
            }
        }
        let _ = runs.fetch_add(1, Ordering::SeqCst);
    }
}
