// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! The storage engine facade.
//!
//! Every write path goes through one [`ConcurrencyController`]: user writes,
//! mutations, transactions, compaction and clustering all commit through it,
//! so the log sees a single arbitrated sequence of versions per table.

use crate::compaction::{AutoCompactor, CompactionMetrics, Compactor};
use crate::config::EngineConfig;
use crate::data_file::{DataFileStore, StagedFiles};
use crate::error::{EngineError, Result};
use crate::merge_on_read::{self, Assignment, MutationResult};
use crate::predicate::Filter;
use crate::scan::{ScanOptions, ScanResult, scan_snapshot};
use crate::transaction::Transaction;
use crate::vacuum::{self, VacuumMetrics};
use crate::zorder::{ZOrderMetrics, ZOrderOptimizer};
use arrow::array::{Array, ArrayRef};
use arrow::record_batch::RecordBatch;
use deltalog::{
    Action, CheckpointMarker, ConcurrencyController, ConflictScope, DeltaLog, DeltaLogError,
    FileLogStore, LogEntry, LogStore, Prepared, Provenance, Snapshot, TableId, TableMetadata,
    TableSchema,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    config: EngineConfig,
    log: Arc<DeltaLog>,
    controller: ConcurrencyController,
    files: DataFileStore,
    session_id: String,
}

/// Tables under one root directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StorageEngine {
    inner: Arc<Inner>,
}

/// Schema of a live table, or `TableNotFound`.
pub(crate) fn live_schema(snapshot: &Snapshot) -> Result<TableSchema> {
    match (snapshot.is_live(), snapshot.schema()) {
        (true, Some(schema)) => Ok(schema.clone()),
        _ => Err(EngineError::table_not_found(snapshot.table_id())),
    }
}

/// Column names must be unique, non-empty, and must not start with `_`
/// (reserved for row identity columns).
pub(crate) fn validate_schema(schema: &TableSchema) -> Result<()> {
    if schema.columns.is_empty() {
        return Err(EngineError::InvalidSchema(
            "a table needs at least one column".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for column in &schema.columns {
        if column.name.is_empty() || column.name.starts_with('_') {
            return Err(EngineError::InvalidSchema(format!(
                "invalid column name '{}'",
                column.name
            )));
        }
        if !seen.insert(column.name.as_str()) {
            return Err(EngineError::InvalidSchema(format!(
                "duplicate column '{}'",
                column.name
            )));
        }
    }
    Ok(())
}

/// Reorder `batch` to the table's columns and check types and nullability.
pub(crate) fn conform_batch(
    table: &TableId,
    schema: &TableSchema,
    batch: &RecordBatch,
) -> Result<RecordBatch> {
    if batch.num_columns() != schema.columns.len() {
        return Err(EngineError::schema_mismatch(
            table,
            format!(
                "expected {} columns, got {}",
                schema.columns.len(),
                batch.num_columns()
            ),
        ));
    }
    let columns = schema
        .columns
        .iter()
        .map(|c| {
            let array: &ArrayRef = batch.column_by_name(&c.name).ok_or_else(|| {
                EngineError::schema_mismatch(table, format!("missing column '{}'", c.name))
            })?;
            if array.data_type() != &c.data_type.to_arrow() {
                return Err(EngineError::schema_mismatch(
                    table,
                    format!(
                        "column '{}' has type {:?}, expected {:?}",
                        c.name,
                        array.data_type(),
                        c.data_type
                    ),
                ));
            }
            if !c.nullable && array.null_count() > 0 {
                return Err(EngineError::schema_mismatch(
                    table,
                    format!("column '{}' is not nullable", c.name),
                ));
            }
            Ok(array.clone())
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(RecordBatch::try_new(schema.to_arrow(), columns)?)
}

impl StorageEngine {
    /// Open (or create) the tables under `root`.
    pub async fn open(root: impl Into<PathBuf>, config: EngineConfig) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let store = Arc::new(FileLogStore::new(root.clone()));
        Self::open_with_log_store(root, store, config).await
    }

    /// Open with a custom log store; data files still live under `root`.
    pub async fn open_with_log_store(
        root: impl Into<PathBuf>,
        store: Arc<dyn LogStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let root = root.into();
        let log = Arc::new(DeltaLog::open(store, config.log_options()).await?);
        let controller = ConcurrencyController::new(log.clone())
            .with_optimistic_lock(config.optimistic_lock)
            .with_max_retries(config.max_retries)
            .with_backoff(config.backoff_policy());
        let session_id = uuid7::uuid7().to_string();

        diagnostics::log_info!(
            "Opened storage engine at {root} (session {session})",
            root: root.display().to_string(),
            session: session_id.as_str()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                files: DataFileStore::new(root.clone()),
                root,
                config,
                log,
                controller,
                session_id,
            }),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn log(&self) -> &Arc<DeltaLog> {
        &self.inner.log
    }

    pub(crate) fn controller(&self) -> &ConcurrencyController {
        &self.inner.controller
    }

    pub(crate) fn files(&self) -> &DataFileStore {
        &self.inner.files
    }

    /// Provenance for one operation: configured user, this session, a fresh query id.
    pub(crate) fn provenance(&self) -> Provenance {
        Provenance {
            user_id: self.inner.config.user_id.clone(),
            session_id: Some(self.inner.session_id.clone()),
            query_id: Some(uuid7::uuid7().to_string()),
        }
    }

    pub async fn create_database(&self, name: &str) -> Result<i64> {
        let id = TableId::new(name)?;
        if id.database().is_some() {
            return Err(EngineError::InvalidSchema(format!(
                "database name '{name}' must not contain '.'"
            )));
        }
        let version = self
            .create_object(&id, TableMetadata::database())
            .await?;
        diagnostics::log_info!("Created database {name}", name: name);
        Ok(version)
    }

    /// Create `table` (optionally `database.table`; the database must exist).
    pub async fn create_table(&self, table: &str, schema: TableSchema) -> Result<i64> {
        let id = TableId::new(table)?;
        validate_schema(&schema)?;
        if let Some(database) = id.database() {
            let db = TableId::new(database)?;
            let snapshot = self.inner.log.current_snapshot_or_empty(&db).await?;
            if !(snapshot.is_live() && snapshot.metadata().is_some_and(TableMetadata::is_database)) {
                return Err(EngineError::DatabaseNotFound(database.to_string()));
            }
        }
        let version = self.create_object(&id, TableMetadata::table(schema)).await?;
        diagnostics::log_info!(
            "Created table {table} at version {version}",
            table: table,
            version: version
        );
        Ok(version)
    }

    async fn create_object(&self, id: &TableId, metadata: TableMetadata) -> Result<i64> {
        let provenance = self.provenance();
        let metadata = &metadata;
        let committed = self
            .inner
            .controller
            .run(id, &provenance, move |snapshot| async move {
                if snapshot.is_live() {
                    return Err(EngineError::from(DeltaLogError::TableAlreadyExists {
                        table: snapshot.table_id().clone(),
                    }));
                }
                Ok(Prepared::new(
                    vec![Action::Metadata(metadata.clone())],
                    ConflictScope::Table,
                    (),
                ))
            })
            .await?;
        Ok(committed
            .outcome
            .map_or(committed.read_snapshot.version(), |o| o.version))
    }

    /// Tombstone every file and mark the table dropped, as one commit.
    pub async fn drop_table(&self, table: &str) -> Result<i64> {
        let id = TableId::new(table)?;
        let provenance = self.provenance();
        let committed = self
            .inner
            .controller
            .run(&id, &provenance, |snapshot| async move {
                let metadata = match snapshot.metadata() {
                    Some(metadata) if snapshot.is_live() => metadata.dropped(),
                    _ => return Err(EngineError::table_not_found(snapshot.table_id())),
                };
                let now = crate::rewrite::now_micros();
                let mut actions: Vec<Action> = snapshot
                    .files()
                    .map(|f| Action::remove(f.path(), now, true))
                    .collect();
                actions.push(Action::Metadata(metadata));
                Ok(Prepared::new(actions, ConflictScope::Table, ()))
            })
            .await?;
        let version = committed
            .outcome
            .map_or(committed.read_snapshot.version(), |o| o.version);
        diagnostics::log_info!("Dropped {table} at version {version}", table: table, version: version);
        Ok(version)
    }

    /// Append `batch` as one new data file. Returns the commit version.
    pub async fn write(&self, table: &str, batch: &RecordBatch) -> Result<i64> {
        let id = TableId::new(table)?;
        let current = self.inner.log.current_snapshot_or_empty(&id).await?;
        let schema = live_schema(&current)?;
        if batch.num_rows() == 0 {
            return Ok(current.version());
        }
        let batch = conform_batch(&id, &schema, batch)?;

        let mut staged = StagedFiles::new();
        let add = self
            .inner
            .files
            .write(&id, &batch, false, true, &mut staged)
            .await?;

        let provenance = self.provenance();
        let (add, schema) = (&add, &schema);
        let committed = self
            .inner
            .controller
            .run(&id, &provenance, move |snapshot| async move {
                if &live_schema(&snapshot)? != schema {
                    return Err(EngineError::schema_mismatch(
                        snapshot.table_id(),
                        "schema changed while writing",
                    ));
                }
                Ok(Prepared::new(
                    vec![Action::Add(add.clone())],
                    ConflictScope::BlindAppend,
                    (),
                ))
            })
            .await?;
        staged.commit();

        let version = committed
            .outcome
            .map_or(committed.read_snapshot.version(), |o| o.version);
        diagnostics::log_debug!(
            "Wrote {rows} rows to {table} at version {version}",
            rows: batch.num_rows(),
            table: table,
            version: version
        );
        Ok(version)
    }

    /// Rows of the latest version matching all `filters`.
    pub async fn scan(&self, table: &str, filters: &[Filter]) -> Result<ScanResult> {
        let options = ScanOptions {
            data_skipping: self.inner.config.data_skipping,
            ..ScanOptions::default()
        };
        self.scan_at(table, -1, filters, &options).await
    }

    /// Rows of `version` (`-1` for latest) matching all `filters`.
    pub async fn scan_at(
        &self,
        table: &str,
        version: i64,
        filters: &[Filter],
        options: &ScanOptions,
    ) -> Result<ScanResult> {
        let id = TableId::new(table)?;
        let snapshot = self.inner.log.snapshot(&id, version).await?;
        let _ = live_schema(&snapshot)?;
        scan_snapshot(&self.inner.files, &snapshot, &[], filters, options).await
    }

    pub async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        assignments: &[Assignment],
    ) -> Result<MutationResult> {
        let id = TableId::new(table)?;
        merge_on_read::update(self, &id, filters, assignments).await
    }

    pub async fn delete(&self, table: &str, filters: &[Filter]) -> Result<MutationResult> {
        let id = TableId::new(table)?;
        merge_on_read::delete(self, &id, filters).await
    }

    /// Start a transaction reading the latest version of `table`.
    pub async fn begin_transaction(&self, table: &str) -> Result<Transaction> {
        let id = TableId::new(table)?;
        let snapshot = self.inner.log.current_snapshot_or_empty(&id).await?;
        let _ = live_schema(&snapshot)?;
        Ok(Transaction::new(self.clone(), snapshot))
    }

    pub async fn compact(&self, table: &str) -> Result<CompactionMetrics> {
        let id = TableId::new(table)?;
        Compactor::new(self.inner.config.compaction.clone())
            .compact_table(self, &id)
            .await
    }

    /// Cluster all base files of `table` by `columns`.
    pub async fn optimize_zorder(&self, table: &str, columns: &[&str]) -> Result<ZOrderMetrics> {
        let id = TableId::new(table)?;
        let columns: Vec<String> = columns.iter().map(ToString::to_string).collect();
        ZOrderOptimizer::new(self.inner.config.zorder.clone())
            .optimize_table(self, &id, &[], &columns)
            .await
    }

    /// Delete files tombstoned longer than `retention` ago.
    pub async fn vacuum(&self, table: &str, retention: Duration) -> Result<VacuumMetrics> {
        let id = TableId::new(table)?;
        vacuum::vacuum(self, &id, retention).await
    }

    pub async fn checkpoint(&self, table: &str) -> Result<CheckpointMarker> {
        let id = TableId::new(table)?;
        Ok(self.inner.log.checkpoint(&id).await?)
    }

    pub async fn history(&self, table: &str) -> Result<Vec<LogEntry>> {
        let id = TableId::new(table)?;
        Ok(self.inner.log.entries(&id).await?)
    }

    /// Snapshot at `version`; `-1` means latest.
    pub async fn snapshot(&self, table: &str, version: i64) -> Result<Arc<Snapshot>> {
        let id = TableId::new(table)?;
        Ok(self.inner.log.snapshot(&id, version).await?)
    }

    /// Latest version committed at or before `timestamp` (µs since the epoch).
    pub async fn version_by_timestamp(&self, table: &str, timestamp: i64) -> Result<i64> {
        let id = TableId::new(table)?;
        Ok(self.inner.log.version_by_timestamp(&id, timestamp).await?)
    }

    pub async fn latest_version(&self, table: &str) -> Result<i64> {
        let id = TableId::new(table)?;
        Ok(self.inner.log.latest_version(&id).await?)
    }

    /// Live tables, excluding databases. Tables that fail to load are
    /// logged and left out.
    pub async fn list_tables(&self) -> Result<Vec<TableId>> {
        let mut live = Vec::new();
        for id in self.inner.log.tables().await? {
            match self.inner.log.current_snapshot_or_empty(&id).await {
                Ok(snapshot) => {
                    if snapshot.is_live()
                        && !snapshot.metadata().is_some_and(TableMetadata::is_database)
                    {
                        live.push(id);
                    }
                }
                Err(e) => {
                    diagnostics::log_warn!(
                        "Skipping table {table}: {error}",
                        table: id.as_str(),
                        error: e.to_string()
                    );
                }
            }
        }
        Ok(live)
    }

    /// Run compaction over every table on the configured interval.
    #[must_use]
    pub fn start_auto_compactor(&self) -> AutoCompactor {
        AutoCompactor::start(self.clone(), self.inner.config.compaction.check_interval())
    }

    /// Wait for background checkpoint writes.
    pub async fn wait_for_background(&self) -> Result<()> {
        Ok(self.inner.log.wait_for_background().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use deltalog::{ColumnDef, ColumnType};

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            ColumnDef::new("id", ColumnType::Int64, false),
            ColumnDef::new("value", ColumnType::Utf8, true),
        ])
    }

    #[test]
    fn test_validate_schema() {
        assert!(validate_schema(&schema()).is_ok());
        assert!(validate_schema(&TableSchema::default()).is_err());
        let reserved = TableSchema::new(vec![ColumnDef::new("_row_idx", ColumnType::Int64, false)]);
        assert!(validate_schema(&reserved).is_err());
        let dup = TableSchema::new(vec![
            ColumnDef::new("a", ColumnType::Int64, false),
            ColumnDef::new("a", ColumnType::Utf8, true),
        ]);
        assert!(validate_schema(&dup).is_err());
    }

    #[test]
    fn test_conform_batch_reorders_and_checks() {
        let table = TableId::new("t").expect("valid");
        let swapped = RecordBatch::try_from_iter(vec![
            ("value", Arc::new(StringArray::from(vec!["a"])) as ArrayRef),
            ("id", Arc::new(Int64Array::from(vec![1])) as ArrayRef),
        ])
        .expect("batch");
        let conformed = conform_batch(&table, &schema(), &swapped).expect("conform");
        assert_eq!(conformed.schema(), schema().to_arrow());

        let nulls = RecordBatch::try_from_iter(vec![
            ("id", Arc::new(Int64Array::from(vec![None, Some(2)])) as ArrayRef),
            ("value", Arc::new(StringArray::from(vec!["a", "b"])) as ArrayRef),
        ])
        .expect("batch");
        let err = conform_batch(&table, &schema(), &nulls).expect_err("null id");
        assert!(matches!(err, EngineError::SchemaMismatch { .. }));

        let wrong = RecordBatch::try_from_iter(vec![
            ("id", Arc::new(StringArray::from(vec!["1"])) as ArrayRef),
            ("value", Arc::new(StringArray::from(vec!["a"])) as ArrayRef),
        ])
        .expect("batch");
        assert!(conform_batch(&table, &schema(), &wrong).is_err());
    }

    #[tokio::test]
    async fn test_create_requires_database_and_rejects_duplicates() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let engine = StorageEngine::open(dir.path(), EngineConfig::default())
            .await
            .expect("open");

        let err = engine
            .create_table("sales.orders", schema())
            .await
            .expect_err("no database");
        assert!(matches!(err, EngineError::DatabaseNotFound(_)));

        let _ = engine.create_database("sales").await.expect("database");
        let v = engine
            .create_table("sales.orders", schema())
            .await
            .expect("table");
        assert_eq!(v, 1);

        let err = engine
            .create_table("sales.orders", schema())
            .await
            .expect_err("duplicate");
        assert!(matches!(
            err,
            EngineError::Log(DeltaLogError::TableAlreadyExists { .. })
        ));

        let tables = engine.list_tables().await.expect("list");
        assert_eq!(tables, vec![TableId::new("sales.orders").expect("valid")]);
    }

    #[tokio::test]
    async fn test_drop_table_then_recreate() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let engine = StorageEngine::open(dir.path(), EngineConfig::default())
            .await
            .expect("open");
        let _ = engine.create_table("t", schema()).await.expect("create");
        let batch = RecordBatch::try_new(
            schema().to_arrow(),
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec!["a", "b"])),
            ],
        )
        .expect("batch");
        let written = engine.write("t", &batch).await.expect("write");

        let dropped = engine.drop_table("t").await.expect("drop");
        assert!(dropped > written);
        assert!(engine.scan("t", &[]).await.is_err());
        assert!(engine.list_tables().await.expect("list").is_empty());

        // History survives the drop
        let old = engine
            .scan_at("t", written, &[], &ScanOptions::default())
            .await
            .expect("time travel");
        assert_eq!(old.num_rows(), 2);

        let _ = engine.create_table("t", schema()).await.expect("recreate");
        assert_eq!(engine.scan("t", &[]).await.expect("scan").num_rows(), 0);
    }
}
