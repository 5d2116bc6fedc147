// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Snapshot scans: base files merged with their merge-on-read deltas.
//!
//! A delta file holds rows keyed by `(_base_path, _row_idx)`, the identity of
//! a row in the base file it changes. `_op` is `U` for a patch carrying the
//! full new row, or `D` for a tombstone whose value columns are NULL.
//! Statistics on `_base_path` tell which bases a delta may touch.

use crate::data_file::DataFileStore;
use crate::error::{EngineError, Result};
use crate::predicate::{Filter, ResolvedFilter, can_skip, filter_batch, resolve};
use arrow::array::{Array, ArrayRef, Int64Array, StringArray, new_null_array};
use arrow::compute::concat_batches;
use arrow::compute::kernels::interleave::interleave;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use deltalog::{FileInfo, ScalarValue, Snapshot, TableId, TableSchema};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub const BASE_PATH_COLUMN: &str = "_base_path";
pub const ROW_IDX_COLUMN: &str = "_row_idx";
pub const OP_COLUMN: &str = "_op";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOp {
    Update,
    Delete,
}

impl DeltaOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DeltaOp::Update => "U",
            DeltaOp::Delete => "D",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "U" => Some(DeltaOp::Update),
            "D" => Some(DeltaOp::Delete),
            _ => None,
        }
    }
}

/// Layout of a delta file: row identity, op, then every table column as nullable.
#[must_use]
pub fn delta_schema(schema: &TableSchema) -> SchemaRef {
    let mut fields = vec![
        Field::new(BASE_PATH_COLUMN, DataType::Utf8, false),
        Field::new(ROW_IDX_COLUMN, DataType::Int64, false),
        Field::new(OP_COLUMN, DataType::Utf8, false),
    ];
    fields.extend(
        schema
            .columns
            .iter()
            .map(|c| Field::new(&c.name, c.data_type.to_arrow(), true)),
    );
    Arc::new(Schema::new(fields))
}

/// Table columns followed by the row identity columns.
#[must_use]
pub fn row_id_schema(schema: &TableSchema) -> SchemaRef {
    let table = schema.to_arrow();
    let mut fields: Vec<Field> = table.fields().iter().map(|f| f.as_ref().clone()).collect();
    fields.push(Field::new(BASE_PATH_COLUMN, DataType::Utf8, false));
    fields.push(Field::new(ROW_IDX_COLUMN, DataType::Int64, false));
    Arc::new(Schema::new(fields))
}

/// Build delta rows from rows carrying their identity (see [`row_id_schema`]).
///
/// Patches keep the row's values; tombstones null them out.
pub fn delta_batch(schema: &TableSchema, rows: &RecordBatch, op: DeltaOp) -> Result<RecordBatch> {
    let n = rows.num_rows();
    let mut columns: Vec<ArrayRef> = vec![
        required_column(rows, BASE_PATH_COLUMN)?,
        required_column(rows, ROW_IDX_COLUMN)?,
        Arc::new(StringArray::from(vec![op.as_str(); n])),
    ];
    for column in &schema.columns {
        columns.push(match op {
            DeltaOp::Update => required_column(rows, &column.name)?,
            DeltaOp::Delete => new_null_array(&column.data_type.to_arrow(), n),
        });
    }
    Ok(RecordBatch::try_new(delta_schema(schema), columns)?)
}

/// Drop the identity columns, keeping the table's column order.
pub fn strip_row_ids(schema: &TableSchema, rows: &RecordBatch) -> Result<RecordBatch> {
    let columns = schema
        .columns
        .iter()
        .map(|c| required_column(rows, &c.name))
        .collect::<Result<Vec<_>>>()?;
    Ok(RecordBatch::try_new(schema.to_arrow(), columns)?)
}

fn required_column(batch: &RecordBatch, name: &str) -> Result<ArrayRef> {
    batch
        .column_by_name(name)
        .cloned()
        .ok_or_else(|| EngineError::InvalidSchema(format!("batch has no column '{name}'")))
}

fn typed_column<'b, A: Array + 'static>(
    batch: &'b RecordBatch,
    name: &str,
    path: &str,
) -> Result<&'b A> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<A>())
        .ok_or_else(|| EngineError::corrupt_file(path, format!("missing or mistyped column {name}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    /// Use file statistics to avoid reading files
    pub data_skipping: bool,
    /// Keep `_base_path` and `_row_idx` in the output
    pub include_row_ids: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            data_skipping: true,
            include_row_ids: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanMetrics {
    /// Base files in the snapshot
    pub files_total: usize,
    pub files_skipped: usize,
    pub files_read: usize,
    pub deltas_read: usize,
    /// Rows after merging, before filtering
    pub rows_scanned: usize,
    pub rows_returned: usize,
}

#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Snapshot version the rows come from
    pub version: i64,
    pub batch: RecordBatch,
    pub metrics: ScanMetrics,
}

impl ScanResult {
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }
}

#[derive(Debug)]
struct DeltaFile {
    batch: RecordBatch,
    /// Distinct `_base_path` values
    references: BTreeSet<String>,
}

/// Reads base files with their deltas applied.
///
/// Delta files are loaded at most once per reader.
#[derive(Debug)]
pub struct MergeReader {
    store: DataFileStore,
    table: TableId,
    schema: TableSchema,
    /// Oldest first, so later patches win
    deltas: Vec<FileInfo>,
    cache: HashMap<String, Arc<DeltaFile>>,
    deltas_read: usize,
}

impl MergeReader {
    pub fn new<'a>(
        store: DataFileStore,
        table: TableId,
        schema: TableSchema,
        deltas: impl IntoIterator<Item = &'a FileInfo>,
    ) -> Self {
        let mut deltas: Vec<FileInfo> = deltas.into_iter().cloned().collect();
        deltas.sort_by_key(|d| d.added_version);
        Self {
            store,
            table,
            schema,
            deltas,
            cache: HashMap::new(),
            deltas_read: 0,
        }
    }

    #[must_use]
    pub fn for_snapshot(store: DataFileStore, snapshot: &Snapshot, schema: TableSchema) -> Self {
        Self::new(store, snapshot.table_id().clone(), schema, snapshot.delta_files())
    }

    #[must_use]
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Deltas whose `_base_path` range covers `base_path`.
    pub fn associated(&self, base_path: &str) -> impl Iterator<Item = &FileInfo> {
        self.deltas.iter().filter(move |d| covers(d, base_path))
    }

    async fn delta(&mut self, info: &FileInfo) -> Result<Arc<DeltaFile>> {
        if let Some(file) = self.cache.get(info.path()) {
            return Ok(file.clone());
        }
        let batch = self.store.read(&self.table, info.path()).await?;
        let paths = typed_column::<StringArray>(&batch, BASE_PATH_COLUMN, info.path())?;
        let references = paths.iter().flatten().map(str::to_string).collect();
        let file = Arc::new(DeltaFile { batch, references });
        let _ = self.cache.insert(info.path().to_string(), file.clone());
        self.deltas_read += 1;
        Ok(file)
    }

    /// Rows of `base` as of the reader's snapshot, with identity columns.
    pub async fn materialize(&mut self, base: &FileInfo) -> Result<RecordBatch> {
        let path = base.path();
        let batch = self.store.read(&self.table, path).await?;
        let rows = batch.num_rows();

        let mut deleted = vec![false; rows];
        let mut patches: Vec<Option<(usize, usize)>> = vec![None; rows];
        let mut sources: Vec<RecordBatch> = Vec::new();

        let associated: Vec<FileInfo> = self.associated(path).cloned().collect();
        for info in &associated {
            let delta = self.delta(info).await?;
            if !delta.references.contains(path) {
                continue;
            }
            let source = sources.len() + 1;
            let bases = typed_column::<StringArray>(&delta.batch, BASE_PATH_COLUMN, info.path())?;
            let idxs = typed_column::<Int64Array>(&delta.batch, ROW_IDX_COLUMN, info.path())?;
            let ops = typed_column::<StringArray>(&delta.batch, OP_COLUMN, info.path())?;

            for j in 0..delta.batch.num_rows() {
                if bases.value(j) != path {
                    continue;
                }
                let idx = usize::try_from(idxs.value(j))
                    .ok()
                    .filter(|i| *i < rows)
                    .ok_or_else(|| {
                        EngineError::corrupt_file(
                            info.path(),
                            format!("row {} out of range for {path}", idxs.value(j)),
                        )
                    })?;
                match DeltaOp::parse(ops.value(j)) {
                    Some(DeltaOp::Delete) => deleted[idx] = true,
                    Some(DeltaOp::Update) => patches[idx] = Some((source, j)),
                    None => {
                        return Err(EngineError::corrupt_file(
                            info.path(),
                            format!("unknown op '{}'", ops.value(j)),
                        ));
                    }
                }
            }
            sources.push(delta.batch.clone());
        }

        let mut indices = Vec::with_capacity(rows);
        let mut row_idx = Vec::with_capacity(rows);
        for (i, patch) in patches.iter().enumerate() {
            if deleted[i] {
                continue;
            }
            indices.push(patch.unwrap_or((0, i)));
            row_idx.push(i as i64);
        }

        let mut columns = Vec::with_capacity(self.schema.columns.len() + 2);
        for column in &self.schema.columns {
            let base_array = batch.column_by_name(&column.name).cloned().ok_or_else(|| {
                EngineError::corrupt_file(path, format!("missing column {}", column.name))
            })?;
            if sources.is_empty() && indices.len() == rows {
                columns.push(base_array);
                continue;
            }
            let mut arrays: Vec<ArrayRef> = vec![base_array];
            for source in &sources {
                arrays.push(required_column(source, &column.name)?);
            }
            let refs: Vec<&dyn Array> = arrays.iter().map(AsRef::as_ref).collect();
            columns.push(interleave(&refs, &indices)?);
        }
        columns.push(Arc::new(StringArray::from(vec![path; indices.len()])));
        columns.push(Arc::new(Int64Array::from(row_idx)));

        Ok(RecordBatch::try_new(row_id_schema(&self.schema), columns)?)
    }

    /// Loaded deltas that only reference bases in `consumed` or bases no
    /// longer active. Removing them together with `consumed` loses nothing.
    #[must_use]
    pub fn removable_deltas(
        &self,
        consumed: &BTreeSet<String>,
        active_bases: &BTreeSet<String>,
    ) -> Vec<String> {
        self.deltas
            .iter()
            .filter_map(|d| {
                let file = self.cache.get(d.path())?;
                file.references
                    .iter()
                    .all(|b| consumed.contains(b) || !active_bases.contains(b))
                    .then(|| d.path().to_string())
            })
            .collect()
    }

    #[must_use]
    pub fn deltas_read(&self) -> usize {
        self.deltas_read
    }
}

fn covers(delta: &FileInfo, base_path: &str) -> bool {
    let target = ScalarValue::Utf8(base_path.to_string());
    match (delta.stats().min(BASE_PATH_COLUMN), delta.stats().max(BASE_PATH_COLUMN)) {
        (Some(min), Some(max)) => {
            !matches!(target.compare(min), Some(Ordering::Less))
                && !matches!(target.compare(max), Some(Ordering::Greater))
        }
        // Without statistics the delta has to be read
        _ => true,
    }
}

/// True when neither the base file nor any delta that may patch it can
/// hold a matching row.
pub(crate) fn skippable(reader: &MergeReader, filters: &[ResolvedFilter], base: &FileInfo) -> bool {
    !filters.is_empty()
        && can_skip(filters, base.stats(), base.row_count())
        && reader
            .associated(base.path())
            .all(|d| can_skip(filters, d.stats(), d.row_count()))
}

/// Scan `snapshot` plus any `extra` uncommitted files.
pub async fn scan_snapshot(
    store: &DataFileStore,
    snapshot: &Snapshot,
    extra: &[FileInfo],
    filters: &[Filter],
    options: &ScanOptions,
) -> Result<ScanResult> {
    let schema = snapshot
        .schema()
        .cloned()
        .ok_or_else(|| EngineError::table_not_found(snapshot.table_id()))?;
    let resolved = resolve(filters, &schema)?;

    let deltas = snapshot
        .delta_files()
        .chain(extra.iter().filter(|f| f.is_delta()));
    let mut reader = MergeReader::new(store.clone(), snapshot.table_id().clone(), schema, deltas);

    let bases: Vec<&FileInfo> = snapshot
        .base_files()
        .chain(extra.iter().filter(|f| !f.is_delta()))
        .collect();

    let out_schema = if options.include_row_ids {
        row_id_schema(reader.schema())
    } else {
        reader.schema().to_arrow()
    };

    let mut metrics = ScanMetrics {
        files_total: bases.len(),
        ..ScanMetrics::default()
    };
    let mut batches = Vec::new();
    for base in bases {
        if options.data_skipping && skippable(&reader, &resolved, base) {
            metrics.files_skipped += 1;
            continue;
        }
        let merged = reader.materialize(base).await?;
        metrics.files_read += 1;
        metrics.rows_scanned += merged.num_rows();

        let kept = filter_batch(&resolved, &merged)?;
        batches.push(if options.include_row_ids {
            kept
        } else {
            strip_row_ids(reader.schema(), &kept)?
        });
    }
    metrics.deltas_read = reader.deltas_read();

    let batch = concat_batches(&out_schema, &batches)?;
    metrics.rows_returned = batch.num_rows();

    diagnostics::log_debug!(
        "Scanned {table} at version {version}: read {read} of {total} files, {rows} rows",
        table: snapshot.table_id().as_str(),
        version: snapshot.version(),
        read: metrics.files_read,
        total: metrics.files_total,
        rows: metrics.rows_returned
    );

    Ok(ScanResult {
        version: snapshot.version(),
        batch,
        metrics,
    })
}
