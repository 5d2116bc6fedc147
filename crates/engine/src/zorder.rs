// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Z-order clustering.
//!
//! Each clustering column is mapped onto `bits` bits, then the bits are
//! interleaved into one key: bit `i` of dimension `d` lands at position
//! `i * dims + d`. Sorting by that key keeps rows that are close in every
//! dimension close in the file layout, so per-file min/max ranges tighten
//! on all clustered columns at once.

use crate::config::ZOrderConfig;
use crate::engine::{StorageEngine, live_schema};
use crate::error::{EngineError, Result};
use crate::rewrite::{Rewrite, now_micros};
use crate::scan::{MergeReader, strip_row_ids};
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, UInt32Array,
};
use arrow::compute::concat_batches;
use arrow::compute::kernels::take::take_record_batch;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use deltalog::{ConflictScope, FileInfo, Prepared, Snapshot, TableId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Interleave the low `bits` bits of each coordinate.
///
/// Higher bits of a coordinate are ignored so no dimension spills into
/// another. Callers keep `coords.len() * bits <= 128`; positions beyond 127
/// are dropped.
#[must_use]
pub fn z_value(coords: &[u64], bits: u32) -> u128 {
    let dims = coords.len() as u32;
    let mut z: u128 = 0;
    for i in 0..bits.min(64) {
        for (d, coord) in coords.iter().enumerate() {
            let pos = i * dims + d as u32;
            if pos >= 128 {
                return z;
            }
            if (coord >> i) & 1 == 1 {
                z |= 1u128 << pos;
            }
        }
    }
    z
}

fn max_code(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Scale `offset` within `0..=span` onto `0..=max`.
fn scale(offset: u128, span: u128, max: u64) -> u64 {
    if span == 0 {
        return 0;
    }
    (offset * u128::from(max) / span) as u64
}

/// Map a column onto `0..2^bits`, preserving order.
///
/// Numbers scale linearly between the column's min and max; strings and
/// booleans use their dense rank. NULLs map to 0.
pub fn normalize(column: &ArrayRef, bits: u32) -> Result<Vec<u64>> {
    let max = max_code(bits);
    match column.data_type() {
        DataType::Int64 => {
            let array = downcast::<Int64Array>(column)?;
            let values: Vec<Option<i64>> = array.iter().collect();
            let (Some(lo), Some(hi)) = (
                values.iter().flatten().min().copied(),
                values.iter().flatten().max().copied(),
            ) else {
                return Ok(vec![0; values.len()]);
            };
            let span = (i128::from(hi) - i128::from(lo)) as u128;
            Ok(values
                .iter()
                .map(|v| v.map_or(0, |v| scale((i128::from(v) - i128::from(lo)) as u128, span, max)))
                .collect())
        }
        DataType::Float64 => {
            let array = downcast::<Float64Array>(column)?;
            let finite = array.iter().flatten().filter(|v| !v.is_nan());
            let (lo, hi) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });
            Ok(array
                .iter()
                .map(|v| match v {
                    None => 0,
                    Some(v) if v.is_nan() => max,
                    Some(_) if hi <= lo => 0,
                    Some(v) => (((v - lo) / (hi - lo)) * max as f64) as u64,
                })
                .collect())
        }
        DataType::Utf8 => {
            let array = downcast::<StringArray>(column)?;
            let ranks = dense_ranks(array.iter().flatten());
            let span = ranks.len().saturating_sub(1) as u128;
            Ok(array
                .iter()
                .map(|v| v.map_or(0, |v| scale(ranks[v] as u128, span, max)))
                .collect())
        }
        DataType::Boolean => {
            let array = downcast::<BooleanArray>(column)?;
            let ranks = dense_ranks(array.iter().flatten());
            let span = ranks.len().saturating_sub(1) as u128;
            Ok(array
                .iter()
                .map(|v| v.map_or(0, |v| scale(ranks[&v] as u128, span, max)))
                .collect())
        }
        other => Err(EngineError::InvalidSchema(format!(
            "cannot cluster by a column of type {other:?}"
        ))),
    }
}

fn dense_ranks<T: Ord>(values: impl Iterator<Item = T>) -> BTreeMap<T, usize> {
    let distinct: BTreeSet<T> = values.collect();
    distinct.into_iter().enumerate().map(|(rank, v)| (v, rank)).collect()
}

fn downcast<A: Array + 'static>(column: &ArrayRef) -> Result<&A> {
    column.as_any().downcast_ref::<A>().ok_or_else(|| {
        EngineError::InvalidSchema(format!("unexpected array type {:?}", column.data_type()))
    })
}

/// Rows of `batch` in ascending Z-order of `columns`. Ties keep input order.
pub fn sort_by_z(batch: &RecordBatch, columns: &[String], bits: u32) -> Result<RecordBatch> {
    let coords = columns
        .iter()
        .map(|name| {
            let column = batch.column_by_name(name).ok_or_else(|| {
                EngineError::InvalidSchema(format!("unknown clustering column '{name}'"))
            })?;
            normalize(column, bits)
        })
        .collect::<Result<Vec<_>>>()?;

    let keys: Vec<u128> = (0..batch.num_rows())
        .map(|row| {
            let point: Vec<u64> = coords.iter().map(|c| c[row]).collect();
            z_value(&point, bits)
        })
        .collect();

    let mut order: Vec<u32> = (0..batch.num_rows() as u32).collect();
    order.sort_by_key(|&row| keys[row as usize]);
    Ok(take_record_batch(batch, &UInt32Array::from(order))?)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZOrderMetrics {
    pub files_removed: usize,
    pub files_added: usize,
    pub deltas_removed: usize,
    pub rows: usize,
    /// `None` when there was nothing to rewrite
    pub version: Option<i64>,
}

#[derive(Debug)]
struct Clustering {
    rewrite: Rewrite,
    metrics: ZOrderMetrics,
}

#[derive(Debug, Clone)]
pub struct ZOrderOptimizer {
    config: ZOrderConfig,
}

impl ZOrderOptimizer {
    #[must_use]
    pub fn new(config: ZOrderConfig) -> Self {
        Self { config }
    }

    /// Rewrite `files` (all base files when empty) sorted by the Z-order of
    /// `columns`, in files of `target_rows_per_file` rows.
    pub async fn optimize_table(
        &self,
        engine: &StorageEngine,
        table: &TableId,
        files: &[String],
        columns: &[String],
    ) -> Result<ZOrderMetrics> {
        if columns.is_empty() {
            return Err(EngineError::InvalidSchema(
                "Z-order needs at least one column".to_string(),
            ));
        }
        let dims = columns.len() as u32;
        if dims.saturating_mul(self.config.bits_per_dimension) > 128 {
            return Err(EngineError::Config(format!(
                "{dims} columns at {} bits each exceed a 128-bit Z-value",
                self.config.bits_per_dimension
            )));
        }

        let provenance = engine.provenance();
        let committed = engine
            .controller()
            .run(table, &provenance, move |snapshot| async move {
                self.attempt(engine, snapshot, files, columns).await
            })
            .await?;

        let Clustering {
            rewrite,
            mut metrics,
        } = committed.payload;
        rewrite.staged.commit();
        metrics.version = committed.outcome.map(|o| o.version);

        if let Some(version) = metrics.version {
            diagnostics::log_info!(
                "Z-ordered {table} by {columns}: {removed} files into {added} at version {version}",
                table: table.as_str(),
                columns: columns.join(","),
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
        files: &[String],
        columns: &[String],
    ) -> Result<Prepared<Clustering>> {
        let schema = live_schema(&snapshot)?;
        let table = snapshot.table_id();
        for name in columns {
            if schema.column(name).is_none() {
                return Err(EngineError::schema_mismatch(
                    table,
                    format!("unknown clustering column '{name}'"),
                ));
            }
        }

        let selected: Vec<&FileInfo> = if files.is_empty() {
            snapshot.base_files().collect()
        } else {
            files
                .iter()
                .filter_map(|p| snapshot.file(p).filter(|f| !f.is_delta()))
                .collect()
        };
        if selected.is_empty() {
            return Ok(Prepared::nothing(Clustering {
                rewrite: Rewrite::new(),
                metrics: ZOrderMetrics::default(),
            }));
        }

        let store = engine.files();
        let mut reader = MergeReader::for_snapshot(store.clone(), &snapshot, schema.clone());
        let mut rewrite = Rewrite::new();
        let mut consumed = BTreeSet::new();
        let mut batches = Vec::with_capacity(selected.len());
        for file in &selected {
            let merged = reader.materialize(file).await?;
            batches.push(strip_row_ids(&schema, &merged)?);
            rewrite.remove(file.path());
            let _ = consumed.insert(file.path().to_string());
        }

        let rows = concat_batches(&schema.to_arrow(), &batches)?;
        let sorted = sort_by_z(&rows, columns, self.config.bits_per_dimension)?;
        rewrite
            .write_chunks(store, table, &sorted, self.config.target_rows_per_file, false)
            .await?;

        let active: BTreeSet<String> = snapshot.base_files().map(|f| f.path().to_string()).collect();
        let deltas = reader.removable_deltas(&consumed, &active);
        let metrics = ZOrderMetrics {
            files_removed: consumed.len(),
            files_added: rewrite.adds.len(),
            deltas_removed: deltas.len(),
            rows: rewrite.rows_written,
            version: None,
        };
        for path in deltas {
            rewrite.remove(path);
        }

        let scope = ConflictScope::files(rewrite.removes.iter().cloned(), true);
        let actions = rewrite.actions(now_micros(), false);
        Ok(Prepared::new(actions, scope, Clustering { rewrite, metrics }))
    }
}
