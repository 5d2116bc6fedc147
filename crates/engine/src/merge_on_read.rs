// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! UPDATE and DELETE.
//!
//! Under merge-on-read a mutation writes one delta file holding only the
//! affected rows, keyed by row identity. Under copy-on-write every affected
//! base file is rewritten. Both read the same merged view, so a caller
//! cannot tell which strategy ran.

use crate::config::MutationStrategy;
use crate::engine::{StorageEngine, live_schema};
use crate::error::{EngineError, Result};
use crate::predicate::{Filter, evaluate, resolve};
use crate::rewrite::{Rewrite, now_micros};
use crate::scan::{DeltaOp, MergeReader, delta_batch, delta_schema, skippable, strip_row_ids};
use arrow::array::{Array, ArrayRef, BooleanArray, Scalar};
use arrow::compute::kernels::zip::zip;
use arrow::compute::{concat_batches, filter_record_batch, not};
use arrow::record_batch::RecordBatch;
use deltalog::{ConflictScope, Prepared, ScalarValue, Snapshot, TableId, TableSchema};
use std::collections::BTreeSet;
use std::sync::Arc;

/// `SET column = value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: ScalarValue,
}

impl Assignment {
    pub fn new(column: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    pub rows_affected: usize,
    /// Version that made the change visible; the read version when nothing matched
    pub version: i64,
}

#[derive(Debug, Clone, Copy)]
enum Change<'a> {
    Update(&'a [Assignment]),
    Delete,
}

pub(crate) async fn update(
    engine: &StorageEngine,
    table: &TableId,
    filters: &[Filter],
    assignments: &[Assignment],
) -> Result<MutationResult> {
    if assignments.is_empty() {
        return Err(EngineError::InvalidFilter(
            "UPDATE needs at least one assignment".to_string(),
        ));
    }
    mutate(engine, table, filters, Change::Update(assignments)).await
}

pub(crate) async fn delete(
    engine: &StorageEngine,
    table: &TableId,
    filters: &[Filter],
) -> Result<MutationResult> {
    mutate(engine, table, filters, Change::Delete).await
}

/// Check assignments against the schema and coerce their values.
fn resolve_assignments(
    table: &TableId,
    assignments: &[Assignment],
    schema: &TableSchema,
) -> Result<Vec<Assignment>> {
    assignments
        .iter()
        .map(|a| {
            let column = schema.column(&a.column).ok_or_else(|| {
                EngineError::schema_mismatch(table, format!("unknown column '{}'", a.column))
            })?;
            if a.value.is_null() && !column.nullable {
                return Err(EngineError::schema_mismatch(
                    table,
                    format!("column '{}' is not nullable", a.column),
                ));
            }
            let value = a
                .value
                .cast_to(column.data_type)
                .map_err(|e| EngineError::schema_mismatch(table, e.to_string()))?;
            Ok(Assignment {
                column: a.column.clone(),
                value,
            })
        })
        .collect()
}

/// Replace assigned columns with their new value, in every row (`mask` is
/// `None`) or only where `mask` is set.
fn apply_assignments(
    rows: &RecordBatch,
    assignments: &[Assignment],
    mask: Option<&BooleanArray>,
) -> Result<RecordBatch> {
    let schema = rows.schema();
    let mut columns: Vec<ArrayRef> = rows.columns().to_vec();
    for assignment in assignments {
        let Some((idx, field)) = schema.column_with_name(&assignment.column) else {
            continue;
        };
        let column = &columns[idx];
        columns[idx] = match mask {
            None => assignment.value.to_array(field.data_type(), rows.num_rows())?,
            Some(mask) => {
                let value = Scalar::new(assignment.value.to_array(field.data_type(), 1)?);
                zip(mask, &value, column)?
            }
        };
    }
    Ok(RecordBatch::try_new(schema, columns)?)
}

/// What one attempt produced; dropping it deletes the files it staged.
#[derive(Debug)]
struct Mutation {
    rewrite: Rewrite,
    rows_affected: usize,
}

async fn mutate(
    engine: &StorageEngine,
    table: &TableId,
    filters: &[Filter],
    change: Change<'_>,
) -> Result<MutationResult> {
    let strategy = engine.config().mutation_strategy;
    let provenance = engine.provenance();

    let committed = engine
        .controller()
        .run(table, &provenance, move |snapshot| async move {
            attempt(engine, snapshot, filters, change, strategy).await
        })
        .await?;

    let version = committed
        .outcome
        .map_or(committed.read_snapshot.version(), |o| o.version);
    let Mutation {
        rewrite,
        rows_affected,
    } = committed.payload;
    rewrite.staged.commit();

    let kind = match change {
        Change::Update(_) => "UPDATE",
        Change::Delete => "DELETE",
    };
    diagnostics::log_info!(
        "{kind} on {table} affected {rows} rows at version {version}",
        kind: kind,
        table: table.as_str(),
        rows: rows_affected,
        version: version
    );

    Ok(MutationResult {
        rows_affected,
        version,
    })
}

async fn attempt(
    engine: &StorageEngine,
    snapshot: Arc<Snapshot>,
    filters: &[Filter],
    change: Change<'_>,
    strategy: MutationStrategy,
) -> Result<Prepared<Mutation>> {
    let mutation = prepare(engine, &snapshot, filters, change, strategy).await?;
    if mutation.rewrite.is_empty() {
        return Ok(Prepared::nothing(mutation));
    }
    // Whole-table scope: any concurrent commit re-runs the mutation
    let actions = mutation.rewrite.actions(now_micros(), true);
    Ok(Prepared::new(actions, ConflictScope::Table, mutation))
}

async fn prepare(
    engine: &StorageEngine,
    snapshot: &Snapshot,
    filters: &[Filter],
    change: Change<'_>,
    strategy: MutationStrategy,
) -> Result<Mutation> {
    let table = snapshot.table_id();
    let schema = live_schema(snapshot)?;
    let resolved = resolve(filters, &schema)?;
    let assignments = match change {
        Change::Update(assignments) => resolve_assignments(table, assignments, &schema)?,
        Change::Delete => Vec::new(),
    };

    let store = engine.files();
    let mut reader = MergeReader::for_snapshot(store.clone(), snapshot, schema.clone());
    let mut rewrite = Rewrite::new();
    let mut deltas = Vec::new();
    let mut consumed = BTreeSet::new();
    let mut rows_affected = 0;

    for base in snapshot.base_files() {
        if skippable(&reader, &resolved, base) {
            continue;
        }
        let merged = reader.materialize(base).await?;
        let mask = evaluate(&resolved, &merged)?;
        let matched = mask.true_count();
        if matched == 0 {
            continue;
        }
        rows_affected += matched;

        match strategy {
            MutationStrategy::MergeOnRead => {
                let rows = filter_record_batch(&merged, &mask)?;
                deltas.push(match change {
                    Change::Update(_) => delta_batch(
                        &schema,
                        &apply_assignments(&rows, &assignments, None)?,
                        DeltaOp::Update,
                    )?,
                    Change::Delete => delta_batch(&schema, &rows, DeltaOp::Delete)?,
                });
            }
            MutationStrategy::CopyOnWrite => {
                let rows = match change {
                    Change::Update(_) => apply_assignments(&merged, &assignments, Some(&mask))?,
                    Change::Delete => filter_record_batch(&merged, &not(&mask)?)?,
                };
                let rows = strip_row_ids(&schema, &rows)?;
                rewrite
                    .write_chunks(store, table, &rows, usize::MAX, true)
                    .await?;
                rewrite.remove(base.path());
                let _ = consumed.insert(base.path().to_string());
            }
        }
    }

    if !deltas.is_empty() {
        let delta = concat_batches(&delta_schema(&schema), &deltas)?;
        let add = store
            .write(table, &delta, true, true, &mut rewrite.staged)
            .await?;
        rewrite.adds.push(add);
    }
    if !consumed.is_empty() {
        let active: BTreeSet<String> = snapshot.base_files().map(|f| f.path().to_string()).collect();
        for path in reader.removable_deltas(&consumed, &active) {
            rewrite.remove(path);
        }
    }

    Ok(Mutation {
        rewrite,
        rows_affected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use deltalog::{ColumnDef, ColumnType};

    #[test]
    fn test_assignments_are_checked_and_coerced() {
        let table = TableId::new("t").expect("valid");
        let schema = TableSchema::new(vec![
            ColumnDef::new("id", ColumnType::Int64, false),
            ColumnDef::new("score", ColumnType::Float64, true),
        ]);

        let resolved =
            resolve_assignments(&table, &[Assignment::new("score", 3)], &schema).expect("ok");
        assert_eq!(resolved[0].value, ScalarValue::Float64(3.0));

        assert!(resolve_assignments(&table, &[Assignment::new("nope", 1)], &schema).is_err());
        assert!(
            resolve_assignments(&table, &[Assignment::new("id", ScalarValue::Null)], &schema)
                .is_err()
        );
    }

    #[test]
    fn test_masked_assignment_only_touches_matches() {
        let rows = RecordBatch::try_from_iter(vec![
            ("id", Arc::new(Int64Array::from(vec![1, 2, 3])) as ArrayRef),
            ("name", Arc::new(StringArray::from(vec!["a", "b", "c"])) as ArrayRef),
        ])
        .expect("batch");
        let mask = BooleanArray::from(vec![false, true, false]);
        let out = apply_assignments(&rows, &[Assignment::new("name", "z")], Some(&mask))
            .expect("apply");
        let names = out
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("strings");
        assert_eq!(names.iter().flatten().collect::<Vec<_>>(), vec!["a", "z", "c"]);
    }
}
