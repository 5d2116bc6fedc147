// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! The per-table append-only transaction log.
//!
//! [`DeltaLog`] owns the version counter of every table. All mutation goes
//! through [`DeltaLog::commit`] (or the single-entry `append_*` helpers),
//! which holds the table's commit slot while it assigns versions and
//! persists the commit file. Readers only ever see `Arc<Snapshot>` values
//! derived from already-committed entries, so reads never wait on writers.
//!
//! Tables load lazily on first access: newest checkpoint plus the commits
//! after it. A table whose log is corrupt fails with
//! [`DeltaLogError::CorruptLogEntry`] on access; other tables are unaffected.

use crate::checkpoint::{CheckpointManager, CheckpointMarker, Recovered, validate_sequence};
use crate::entry::{Action, AddFile, Commit, LogEntry, Provenance};
use crate::error::{DeltaLogError, Result};
use crate::schema::{TableId, TableMetadata};
use crate::snapshot::{Snapshot, fold};
use crate::store::LogStore;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Which intervening commits invalidate a prepared change.
///
/// A commit prepared against version `R` is checked against every commit
/// in `R+1..=latest`. Commits outside the scope are rebased: the change is
/// appended after them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictScope {
    /// Pure appends. Only a schema change in between conflicts.
    BlindAppend,
    /// The change depends on `read_paths` staying active.
    Files {
        read_paths: BTreeSet<String>,
        /// Also conflict when a merge-on-read delta file was added
        deltas_conflict: bool,
    },
    /// Any intervening commit conflicts.
    Table,
}

impl ConflictScope {
    #[must_use]
    pub fn files<I, S>(paths: I, deltas_conflict: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ConflictScope::Files {
            read_paths: paths.into_iter().map(Into::into).collect(),
            deltas_conflict,
        }
    }

    /// Why `entry` conflicts with this scope, if it does.
    fn conflict_reason(&self, entry: &LogEntry) -> Option<String> {
        match (&entry.action, self) {
            (Action::Metadata(_), _) => Some(format!("metadata changed at version {}", entry.version)),
            (_, ConflictScope::Table) => Some(format!("table changed at version {}", entry.version)),
            (_, ConflictScope::BlindAppend) => None,
            (Action::Remove(remove), ConflictScope::Files { read_paths, .. })
                if read_paths.contains(&remove.path) =>
            {
                Some(format!("{} removed at version {}", remove.path, entry.version))
            }
            (Action::Add(add), ConflictScope::Files { deltas_conflict: true, .. }) if add.is_delta => {
                Some(format!("delta {} added at version {}", add.path, entry.version))
            }
            _ => None,
        }
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub first_version: i64,
    /// Last version of the commit, the new latest version
    pub version: i64,
    pub timestamp: i64,
}

/// Log-wide settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaLogOptions {
    pub checkpoint_interval: i64,
    /// Delete commit files covered by a verified checkpoint
    pub log_retention: bool,
}

impl Default for DeltaLogOptions {
    fn default() -> Self {
        Self {
            checkpoint_interval: 10,
            log_retention: false,
        }
    }
}

#[derive(Debug)]
struct TableState {
    /// Commits after `base` (or from version 1 when `history_complete`)
    commits: Vec<Arc<Commit>>,
    base: Option<Arc<Snapshot>>,
    history_complete: bool,
    latest: Arc<Snapshot>,
    last_timestamp: i64,
}

#[derive(Debug)]
struct TableLog {
    id: TableId,
    /// The commit slot: held while assigning versions and persisting
    commit_slot: Mutex<()>,
    checkpoint_lock: Mutex<()>,
    state: RwLock<TableState>,
}

impl TableLog {
    fn from_recovered(id: TableId, recovered: Recovered) -> Self {
        let base = recovered.base.map(Arc::new);
        let latest = fold(&id, base.as_deref(), &recovered.commits, i64::MAX);
        let state = TableState {
            commits: recovered.commits.into_iter().map(Arc::new).collect(),
            base,
            history_complete: recovered.history_complete,
            last_timestamp: latest.timestamp(),
            latest: Arc::new(latest),
        };
        Self {
            id,
            commit_slot: Mutex::new(()),
            checkpoint_lock: Mutex::new(()),
            state: RwLock::new(state),
        }
    }
}

/// Versioned logs for every table under one store.
#[derive(Debug)]
pub struct DeltaLog {
    store: Arc<dyn LogStore>,
    checkpoints: CheckpointManager,
    tables: RwLock<HashMap<TableId, Arc<TableLog>>>,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

impl DeltaLog {
    #[must_use]
    pub fn new(store: Arc<dyn LogStore>, options: DeltaLogOptions) -> Self {
        Self {
            checkpoints: CheckpointManager::new(
                store.clone(),
                options.checkpoint_interval,
                options.log_retention,
            ),
            store,
            tables: RwLock::new(HashMap::new()),
            background: StdMutex::new(Vec::new()),
        }
    }

    /// Open a log and eagerly load every table found in the store.
    ///
    /// Tables that fail to load are reported and left for lazy loading, so
    /// their errors surface on access instead of failing the whole log.
    pub async fn open(store: Arc<dyn LogStore>, options: DeltaLogOptions) -> Result<Self> {
        let log = Self::new(store, options);
        for table in log.store.list_tables().await? {
            if let Err(e) = log.table_log(&table).await {
                diagnostics::log_error!(
                    "Failed to open table {table}: {error}",
                    table: table.as_str(),
                    error: e.to_string()
                );
            }
        }
        Ok(log)
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    #[must_use]
    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    async fn table_log(&self, table: &TableId) -> Result<Arc<TableLog>> {
        if let Some(tl) = self.tables.read().await.get(table) {
            return Ok(tl.clone());
        }

        let recovered = self.checkpoints.load_with_checkpoint(table).await?;
        let loaded = Arc::new(TableLog::from_recovered(table.clone(), recovered));

        let mut tables = self.tables.write().await;
        Ok(tables.entry(table.clone()).or_insert(loaded).clone())
    }

    /// Tables with at least one committed entry.
    pub async fn tables(&self) -> Result<Vec<TableId>> {
        let mut ids: BTreeSet<TableId> = self.store.list_tables().await?.into_iter().collect();
        for (id, tl) in self.tables.read().await.iter() {
            if tl.state.read().await.latest.version() > 0 {
                let _ = ids.insert(id.clone());
            }
        }
        Ok(ids.into_iter().collect())
    }

    /// Latest committed version, 0 for a table with no entries.
    pub async fn latest_version(&self, table: &TableId) -> Result<i64> {
        let tl = self.table_log(table).await?;
        let version = tl.state.read().await.latest.version();
        Ok(version)
    }

    /// The latest snapshot, or the empty snapshot of a table with no entries.
    pub async fn current_snapshot_or_empty(&self, table: &TableId) -> Result<Arc<Snapshot>> {
        let tl = self.table_log(table).await?;
        let latest = tl.state.read().await.latest.clone();
        Ok(latest)
    }

    /// Snapshot at `version`; `-1` means latest.
    ///
    /// A version inside a multi-entry commit resolves to the preceding
    /// commit boundary. Versions older than the loaded checkpoint load the
    /// earlier history on demand.
    pub async fn snapshot(&self, table: &TableId, version: i64) -> Result<Arc<Snapshot>> {
        let tl = self.table_log(table).await?;

        let (latest, needs_history) = {
            let state = tl.state.read().await;
            let latest = state.latest.clone();
            let needs_history = !state.history_complete
                && state.base.as_ref().is_some_and(|b| version >= 0 && version < b.version());
            (latest, needs_history)
        };

        if latest.version() == 0 {
            return Err(DeltaLogError::TableNotFound {
                table: table.clone(),
            });
        }
        if version == -1 || version == latest.version() {
            return Ok(latest);
        }
        if version < 1 || version > latest.version() {
            return Err(DeltaLogError::VersionNotFound {
                table: table.clone(),
                version,
                latest: latest.version(),
            });
        }

        if needs_history {
            self.load_history(&tl).await?;
        }

        let state = tl.state.read().await;
        let base = state
            .base
            .as_deref()
            .filter(|b| b.version() <= version);
        let snapshot = fold(
            table,
            base,
            state.commits.iter().map(Arc::as_ref),
            version,
        );
        Ok(Arc::new(snapshot))
    }

    /// Read the commits the checkpoint made unnecessary at open.
    async fn load_history(&self, tl: &TableLog) -> Result<()> {
        let (base_version, latest) = {
            let state = tl.state.read().await;
            if state.history_complete {
                return Ok(());
            }
            (
                state.base.as_ref().map_or(0, |b| b.version()),
                state.latest.version(),
            )
        };

        let firsts = self.store.list_commits(&tl.id).await?;
        if firsts.first().is_some_and(|first| *first != 1) {
            return Err(DeltaLogError::VersionNotFound {
                table: tl.id.clone(),
                version: base_version,
                latest,
            });
        }

        let mut earlier = Vec::new();
        for first in firsts.into_iter().take_while(|first| *first <= base_version) {
            earlier.push(self.store.read_commit(&tl.id, first).await?);
        }
        validate_sequence(&tl.id, 0, &earlier)?;
        if earlier.last().map_or(0, Commit::last_version) != base_version {
            return Err(DeltaLogError::corrupt(
                &tl.id,
                base_version,
                "log history does not end at the checkpoint version",
            ));
        }

        let mut state = tl.state.write().await;
        if !state.history_complete {
            let tail = std::mem::take(&mut state.commits);
            state.commits = earlier.into_iter().map(Arc::new).chain(tail).collect();
            state.history_complete = true;
            diagnostics::log_debug!(
                "Loaded history of {table} before checkpoint {version}",
                table: tl.id.as_str(),
                version: base_version
            );
        }
        Ok(())
    }

    /// Latest version whose timestamp is at or before `timestamp` (µs).
    pub async fn version_by_timestamp(&self, table: &TableId, timestamp: i64) -> Result<i64> {
        let tl = self.table_log(table).await?;

        let in_tail = {
            let state = tl.state.read().await;
            if state.latest.version() == 0 {
                return Err(DeltaLogError::TableNotFound {
                    table: table.clone(),
                });
            }
            state.history_complete
                || state
                    .commits
                    .first()
                    .is_some_and(|c| c.timestamp() <= timestamp)
        };

        if !in_tail {
            if let Err(e) = self.load_history(&tl).await {
                // History before the checkpoint is gone; the checkpoint
                // itself still answers for timestamps at or after it.
                let state = tl.state.read().await;
                return match state.base.as_ref() {
                    Some(base) if base.timestamp() <= timestamp => Ok(base.version()),
                    _ => Err(e),
                };
            }
        }

        let state = tl.state.read().await;
        state
            .commits
            .iter()
            .take_while(|c| c.timestamp() <= timestamp)
            .last()
            .map(|c| c.last_version())
            .ok_or_else(|| DeltaLogError::NoVersionBeforeTimestamp {
                table: table.clone(),
                timestamp,
            })
    }

    /// Every entry of the table in version order.
    ///
    /// When commit files before the newest checkpoint were cleaned up, only
    /// the entries after it are returned.
    pub async fn entries(&self, table: &TableId) -> Result<Vec<LogEntry>> {
        let tl = self.table_log(table).await?;
        if tl.state.read().await.latest.version() == 0 {
            return Err(DeltaLogError::TableNotFound {
                table: table.clone(),
            });
        }
        if let Err(e) = self.load_history(&tl).await {
            diagnostics::log_debug!(
                "History of {table} is incomplete: {error}",
                table: table.as_str(),
                error: e.to_string()
            );
        }
        let state = tl.state.read().await;
        Ok(state
            .commits
            .iter()
            .flat_map(|c| c.entries.iter().cloned())
            .collect())
    }

    pub async fn append_add(
        &self,
        table: &TableId,
        file: AddFile,
        provenance: &Provenance,
    ) -> Result<LogEntry> {
        self.append(table, Action::Add(file), provenance).await
    }

    pub async fn append_remove(
        &self,
        table: &TableId,
        path: &str,
        provenance: &Provenance,
    ) -> Result<LogEntry> {
        let action = Action::remove(path, chrono::Utc::now().timestamp_micros(), true);
        self.append(table, action, provenance).await
    }

    pub async fn append_metadata(
        &self,
        table: &TableId,
        metadata: TableMetadata,
        provenance: &Provenance,
    ) -> Result<LogEntry> {
        self.append(table, Action::Metadata(metadata), provenance).await
    }

    /// Append one entry at the next version, without a conflict check.
    async fn append(&self, table: &TableId, action: Action, provenance: &Provenance) -> Result<LogEntry> {
        let tl = self.table_log(table).await?;
        let _slot = tl.commit_slot.lock().await;
        let commit = self.commit_in_slot(&tl, None, vec![action], provenance).await?;
        commit
            .entries
            .first()
            .cloned()
            .ok_or_else(|| DeltaLogError::InvalidArgument("empty commit".to_string()))
    }

    /// Compare-and-append: commit `actions` as one unit prepared against
    /// `read_version`.
    ///
    /// Fails with [`DeltaLogError::RetryableConflict`] when a commit after
    /// `read_version` falls inside `scope`; otherwise the actions get the
    /// versions after the current latest.
    pub async fn commit(
        &self,
        table: &TableId,
        read_version: i64,
        scope: &ConflictScope,
        actions: Vec<Action>,
        provenance: &Provenance,
    ) -> Result<CommitOutcome> {
        if actions.is_empty() {
            return Err(DeltaLogError::InvalidArgument(
                "a commit needs at least one action".to_string(),
            ));
        }
        let tl = self.table_log(table).await?;
        let _slot = tl.commit_slot.lock().await;
        let commit = self
            .commit_in_slot(&tl, Some((read_version, scope)), actions, provenance)
            .await?;
        Ok(CommitOutcome {
            first_version: commit.first_version(),
            version: commit.last_version(),
            timestamp: commit.timestamp(),
        })
    }

    /// Must be called with the commit slot held.
    async fn commit_in_slot(
        &self,
        tl: &Arc<TableLog>,
        check: Option<(i64, &ConflictScope)>,
        actions: Vec<Action>,
        provenance: &Provenance,
    ) -> Result<Arc<Commit>> {
        let (latest_version, last_timestamp) = {
            let state = tl.state.read().await;
            if let Some((read_version, scope)) = check {
                check_conflicts(tl, &state, read_version, scope)?;
            }
            (state.latest.version(), state.last_timestamp)
        };

        let timestamp = chrono::Utc::now().timestamp_micros().max(last_timestamp);
        let commit = Commit {
            table_id: tl.id.clone(),
            entries: actions
                .into_iter()
                .zip(latest_version + 1..)
                .map(|(action, version)| LogEntry {
                    version,
                    timestamp,
                    table_id: tl.id.clone(),
                    provenance: provenance.clone(),
                    action,
                })
                .collect(),
        };

        match self.store.write_commit(&tl.id, &commit).await {
            Ok(()) => {}
            Err(DeltaLogError::PreconditionFailed { path }) => {
                // Another process owns this version. Catch up so the retry
                // prepares against what is really there.
                self.catch_up(tl).await?;
                let latest = tl.state.read().await.latest.version();
                return Err(DeltaLogError::RetryableConflict {
                    table: tl.id.clone(),
                    read_version: latest_version,
                    latest_version: latest,
                    reason: format!("{path} was written concurrently"),
                });
            }
            Err(e) => return Err(e),
        }

        let commit = Arc::new(commit);
        let latest = {
            let mut state = tl.state.write().await;
            let mut next = state.latest.as_ref().clone();
            next.apply_commit(&commit);
            state.latest = Arc::new(next);
            state.last_timestamp = timestamp;
            state.commits.push(commit.clone());
            state.latest.clone()
        };

        diagnostics::log_debug!(
            "Committed {table} versions {first}..={last}",
            table: tl.id.as_str(),
            first: commit.first_version(),
            last: commit.last_version()
        );

        if self
            .checkpoints
            .should_checkpoint(commit.first_version(), commit.last_version())
        {
            self.spawn_checkpoint(tl.clone(), latest);
        }
        Ok(commit)
    }

    /// Apply commit files written by other processes.
    async fn catch_up(&self, tl: &TableLog) -> Result<()> {
        let latest = tl.state.read().await.latest.version();
        let mut newer = Vec::new();
        for first in self.store.list_commits(&tl.id).await? {
            if first > latest {
                newer.push(self.store.read_commit(&tl.id, first).await?);
            }
        }
        validate_sequence(&tl.id, latest, &newer)?;

        let mut state = tl.state.write().await;
        let mut next = state.latest.as_ref().clone();
        for commit in newer {
            next.apply_commit(&commit);
            state.commits.push(Arc::new(commit));
        }
        state.last_timestamp = state.last_timestamp.max(next.timestamp());
        state.latest = Arc::new(next);
        Ok(())
    }

    /// Re-read commits that appeared in the store since the table loaded.
    pub async fn refresh(&self, table: &TableId) -> Result<i64> {
        let tl = self.table_log(table).await?;
        let _slot = tl.commit_slot.lock().await;
        self.catch_up(&tl).await?;
        let version = tl.state.read().await.latest.version();
        Ok(version)
    }

    fn spawn_checkpoint(&self, tl: Arc<TableLog>, snapshot: Arc<Snapshot>) {
        let manager = self.checkpoints.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = write_checkpoint(&manager, &tl, &snapshot).await {
                // The next interval boundary tries again
                diagnostics::log_warn!(
                    "Checkpoint of {table} at version {version} failed: {error}",
                    table: tl.id.as_str(),
                    version: snapshot.version(),
                    error: e.to_string()
                );
            }
        });
        if let Ok(mut background) = self.background.lock() {
            background.retain(|h| !h.is_finished());
            background.push(handle);
        }
    }

    /// Wait for checkpoint tasks spawned so far.
    pub async fn wait_for_background(&self) -> Result<()> {
        let handles = match self.background.lock() {
            Ok(mut background) => std::mem::take(&mut *background),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            handle.await?;
        }
        Ok(())
    }

    /// Checkpoint the latest version now.
    pub async fn checkpoint(&self, table: &TableId) -> Result<CheckpointMarker> {
        let tl = self.table_log(table).await?;
        let latest = tl.state.read().await.latest.clone();
        if latest.version() == 0 {
            return Err(DeltaLogError::TableNotFound {
                table: table.clone(),
            });
        }
        write_checkpoint(&self.checkpoints, &tl, &latest).await
    }
}

fn check_conflicts(
    tl: &TableLog,
    state: &TableState,
    read_version: i64,
    scope: &ConflictScope,
) -> Result<()> {
    let latest = state.latest.version();
    let conflict = |reason: String| DeltaLogError::RetryableConflict {
        table: tl.id.clone(),
        read_version,
        latest_version: latest,
        reason,
    };

    if read_version > latest || read_version < 0 {
        return Err(DeltaLogError::InvalidArgument(format!(
            "read version {read_version} of {} is not a committed version (latest {latest})",
            tl.id
        )));
    }
    if read_version == latest {
        return Ok(());
    }

    let covered_from = state.commits.first().map_or(latest + 1, |c| c.first_version());
    if read_version + 1 < covered_from {
        return Err(conflict("read version predates loaded history".to_string()));
    }

    for commit in state.commits.iter().filter(|c| c.last_version() > read_version) {
        for entry in &commit.entries {
            if let Some(reason) = scope.conflict_reason(entry) {
                return Err(conflict(reason));
            }
        }
    }
    Ok(())
}

async fn write_checkpoint(
    manager: &CheckpointManager,
    tl: &TableLog,
    snapshot: &Snapshot,
) -> Result<CheckpointMarker> {
    let _guard = tl.checkpoint_lock.lock().await;
    let marker = manager.write(snapshot).await?;
    if manager.log_retention() {
        let _ = manager.cleanup_log(&tl.id, &marker).await?;
    }
    Ok(marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType, TableSchema};
    use crate::stats::FileStats;
    use crate::store::MemoryLogStore;

    fn table() -> TableId {
        TableId::new("log_t").expect("valid")
    }

    fn add_file(path: &str, is_delta: bool) -> AddFile {
        AddFile {
            path: path.to_string(),
            size: 10,
            row_count: 1,
            stats: FileStats::default(),
            data_change: true,
            is_delta,
        }
    }

    fn add(path: &str, is_delta: bool) -> Action {
        Action::Add(add_file(path, is_delta))
    }

    fn metadata() -> TableMetadata {
        TableMetadata::table(TableSchema::new(vec![ColumnDef::new(
            "id",
            ColumnType::Int64,
            false,
        )]))
    }

    fn new_log() -> (Arc<MemoryLogStore>, DeltaLog) {
        let store = Arc::new(MemoryLogStore::new());
        let log = DeltaLog::new(store.clone(), DeltaLogOptions::default());
        (store, log)
    }

    #[tokio::test]
    async fn test_append_assigns_consecutive_versions() {
        let (_, log) = new_log();
        let p = Provenance::user("u");
        assert_eq!(log.latest_version(&table()).await.expect("latest"), 0);

        let v1 = log.append_metadata(&table(), metadata(), &p).await.expect("meta");
        let v2 = log
            .append_add(&table(), add_file("a", false), &p)
            .await
            .expect("add");
        let v3 = log.append_remove(&table(), "a", &p).await.expect("remove");
        assert_eq!((v1.version, v2.version, v3.version), (1, 2, 3));
        assert!(v1.timestamp <= v2.timestamp && v2.timestamp <= v3.timestamp);
        assert_eq!(log.entries(&table()).await.expect("entries").len(), 3);
    }

    #[tokio::test]
    async fn test_snapshot_of_missing_table() {
        let (_, log) = new_log();
        let err = log.snapshot(&table(), -1).await.expect_err("no entries");
        assert!(matches!(err, DeltaLogError::TableNotFound { .. }));
    }

    #[tokio::test]
    async fn test_blind_append_rebases_over_other_appends() {
        let (_, log) = new_log();
        let p = Provenance::default();
        let _ = log
            .commit(&table(), 0, &ConflictScope::Table, vec![Action::Metadata(metadata())], &p)
            .await
            .expect("create");
        let _ = log
            .commit(&table(), 1, &ConflictScope::BlindAppend, vec![add("a", false)], &p)
            .await
            .expect("first append");
        let outcome = log
            .commit(&table(), 1, &ConflictScope::BlindAppend, vec![add("b", false)], &p)
            .await
            .expect("rebased append");
        assert_eq!(outcome.version, 3);

        let err = log
            .commit(&table(), 1, &ConflictScope::Table, vec![add("c", false)], &p)
            .await
            .expect_err("table scope conflicts");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_file_scope_conflicts_on_removed_read_path() {
        let (_, log) = new_log();
        let p = Provenance::default();
        let _ = log
            .commit(
                &table(),
                0,
                &ConflictScope::Table,
                vec![Action::Metadata(metadata()), add("a", false), add("b", false)],
                &p,
            )
            .await
            .expect("create");
        let _ = log
            .commit(&table(), 3, &ConflictScope::Table, vec![Action::remove("a", 0, true)], &p)
            .await
            .expect("remove a");

        let scope = ConflictScope::files(["b"], false);
        let _ = log
            .commit(&table(), 3, &scope, vec![add("c", false)], &p)
            .await
            .expect("b untouched");

        let scope = ConflictScope::files(["a"], false);
        let err = log
            .commit(&table(), 3, &scope, vec![add("d", false)], &p)
            .await
            .expect_err("a was removed");
        assert!(matches!(err, DeltaLogError::RetryableConflict { .. }));

        let scope = ConflictScope::files(["b"], true);
        let _ = log
            .commit(&table(), 5, &ConflictScope::BlindAppend, vec![add("delta-1", true)], &p)
            .await
            .expect("delta");
        let err = log
            .commit(&table(), 5, &scope, vec![add("e", false)], &p)
            .await
            .expect_err("delta added");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_failed_write_does_not_advance_version() {
        let (store, log) = new_log();
        let p = Provenance::default();
        let _ = log.append_metadata(&table(), metadata(), &p).await.expect("meta");
        store.fail_next_commits(1);
        assert!(log.append_remove(&table(), "x", &p).await.is_err());
        assert_eq!(log.latest_version(&table()).await.expect("latest"), 1);
        let entry = log.append_remove(&table(), "x", &p).await.expect("retry");
        assert_eq!(entry.version, 2);
    }

    #[tokio::test]
    async fn test_checkpoint_every_interval() {
        let (store, log) = new_log();
        let p = Provenance::default();
        let _ = log.append_metadata(&table(), metadata(), &p).await.expect("meta");
        for i in 0..11 {
            let _ = log
                .commit(&table(), 1, &ConflictScope::BlindAppend, vec![add(&format!("f{i}"), false)], &p)
                .await
                .expect("append");
        }
        log.wait_for_background().await.expect("background");
        let marker = store
            .read_last_checkpoint(&table())
            .await
            .expect("marker")
            .expect("present");
        assert_eq!(marker.version, 10);
        assert_eq!(marker.num_files, 9);
    }

    #[tokio::test]
    async fn test_version_by_timestamp() {
        let (_, log) = new_log();
        let p = Provenance::default();
        let first = log.append_metadata(&table(), metadata(), &p).await.expect("meta");
        let second = log.append_remove(&table(), "x", &p).await.expect("remove");

        assert_eq!(
            log.version_by_timestamp(&table(), second.timestamp)
                .await
                .expect("at second"),
            2
        );
        assert!(matches!(
            log.version_by_timestamp(&table(), first.timestamp - 1).await,
            Err(DeltaLogError::NoVersionBeforeTimestamp { .. })
        ));
    }
}
