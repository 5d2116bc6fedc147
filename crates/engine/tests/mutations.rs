// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! UPDATE and DELETE under both mutation strategies, and data skipping
//! in the presence of delta files.

use arrow::array::{ArrayRef, AsArray, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::Int64Type;
use deltalog::{ColumnDef, ColumnType, NoBackoff, ScalarValue, TableSchema};
use engine::{
    Assignment, CompactionConfig, EngineConfig, EngineError, Filter, MutationStrategy,
    StorageEngine,
};
use std::sync::Arc;
use tempfile::TempDir;

fn schema() -> TableSchema {
    TableSchema::new(vec![
        ColumnDef::new("id", ColumnType::Int64, false),
        ColumnDef::new("name", ColumnType::Utf8, true),
    ])
}

fn rows(ids: std::ops::Range<i64>) -> RecordBatch {
    let ids: Vec<i64> = ids.collect();
    let names: Vec<String> = ids.iter().map(|id| format!("name-{id}")).collect();
    RecordBatch::try_new(
        schema().to_arrow(),
        vec![
            Arc::new(Int64Array::from(ids)) as ArrayRef,
            Arc::new(StringArray::from(names)) as ArrayRef,
        ],
    )
    .expect("batch")
}

/// Sorted `(id, name)` pairs.
fn pairs(batch: &RecordBatch) -> Vec<(i64, Option<String>)> {
    let ids = batch.column(0).as_primitive::<Int64Type>();
    let names = batch.column(1).as_string::<i32>();
    let mut pairs: Vec<(i64, Option<String>)> = ids
        .values()
        .iter()
        .zip(names.iter())
        .map(|(id, name)| (*id, name.map(str::to_string)))
        .collect();
    pairs.sort();
    pairs
}

fn expected(ids: std::ops::Range<i64>) -> Vec<(i64, Option<String>)> {
    ids.map(|id| (id, Some(format!("name-{id}")))).collect()
}

async fn setup(strategy: MutationStrategy) -> (TempDir, StorageEngine) {
    let dir = TempDir::new().expect("tempdir");
    let config = EngineConfig::default()
        .with_backoff(Arc::new(NoBackoff))
        .with_mutation_strategy(strategy)
        .with_compaction(CompactionConfig {
            min_file_size: 1024 * 1024,
            ..CompactionConfig::default()
        });
    let engine = StorageEngine::open(dir.path(), config)
        .await
        .expect("open engine");
    let _ = engine.create_table("items", schema()).await.expect("create");
    let _ = engine.write("items", &rows(0..10)).await.expect("write");
    let _ = engine.write("items", &rows(10..20)).await.expect("write");
    (dir, engine)
}

async fn check_mutations(strategy: MutationStrategy) {
    let (_dir, engine) = setup(strategy).await;

    let updated = engine
        .update(
            "items",
            &[Filter::in_list("id", [1_i64, 12])],
            &[Assignment::new("name", "x")],
        )
        .await
        .expect("update");
    assert_eq!(updated.rows_affected, 2);
    assert!(updated.version > 3);

    let deleted = engine
        .delete("items", &[Filter::eq("id", 3)])
        .await
        .expect("delete");
    assert_eq!(deleted.rows_affected, 1);

    // A later update of the same row wins
    let _ = engine
        .update(
            "items",
            &[Filter::eq("id", 1)],
            &[Assignment::new("name", "y")],
        )
        .await
        .expect("second update");

    let mut want = expected(0..20);
    want.retain(|(id, _)| *id != 3);
    for (id, name) in &mut want {
        match id {
            1 => *name = Some("y".into()),
            12 => *name = Some("x".into()),
            _ => {}
        }
    }
    let result = engine.scan("items", &[]).await.expect("scan");
    assert_eq!(pairs(&result.batch), want);

    let filtered = engine
        .scan("items", &[Filter::eq("name", "x")])
        .await
        .expect("filtered scan");
    assert_eq!(pairs(&filtered.batch), vec![(12, Some("x".into()))]);

    // Nothing matches: no commit
    let before = engine.latest_version("items").await.expect("latest");
    let none = engine
        .delete("items", &[Filter::gt("id", 1000)])
        .await
        .expect("no-op delete");
    assert_eq!(none.rows_affected, 0);
    assert_eq!(none.version, before);
    assert_eq!(engine.latest_version("items").await.expect("latest"), before);

    // Compaction folds the deltas in without changing what a scan returns
    let compacted = engine.compact("items").await.expect("compact");
    assert!(compacted.version.is_some());
    let after = engine.scan("items", &[]).await.expect("scan");
    assert_eq!(pairs(&after.batch), want);
    let snapshot = engine.snapshot("items", -1).await.expect("snapshot");
    assert_eq!(snapshot.delta_files().count(), 0);
    assert_eq!(snapshot.base_row_count(), 19);
}

#[tokio::test]
async fn test_merge_on_read_mutations() {
    check_mutations(MutationStrategy::MergeOnRead).await;
}

#[tokio::test]
async fn test_copy_on_write_mutations() {
    check_mutations(MutationStrategy::CopyOnWrite).await;
}

#[tokio::test]
async fn test_merge_on_read_writes_one_delta() {
    let (_dir, engine) = setup(MutationStrategy::MergeOnRead).await;
    let before = engine.snapshot("items", -1).await.expect("snapshot");

    let _ = engine
        .delete("items", &[Filter::in_list("id", [2_i64, 15])])
        .await
        .expect("delete");

    let after = engine.snapshot("items", -1).await.expect("snapshot");
    // Base files untouched, one delta added
    assert_eq!(after.base_files().count(), before.base_files().count());
    assert_eq!(after.delta_files().count(), 1);
    assert_eq!(after.base_row_count(), 20);
    assert_eq!(engine.scan("items", &[]).await.expect("scan").num_rows(), 18);
}

#[tokio::test]
async fn test_copy_on_write_replaces_base_files() {
    let (_dir, engine) = setup(MutationStrategy::CopyOnWrite).await;
    let before = engine.snapshot("items", -1).await.expect("snapshot");

    let _ = engine
        .delete("items", &[Filter::eq("id", 2)])
        .await
        .expect("delete");

    let after = engine.snapshot("items", -1).await.expect("snapshot");
    assert_eq!(after.delta_files().count(), 0);
    assert_eq!(after.base_row_count(), 19);
    // Only the file holding id 2 was rewritten
    let kept = before
        .base_files()
        .filter(|f| after.contains(f.path()))
        .count();
    assert_eq!(kept, 1);
}

#[tokio::test]
async fn test_update_rejects_bad_assignments() {
    let (_dir, engine) = setup(MutationStrategy::MergeOnRead).await;

    let err = engine
        .update("items", &[], &[Assignment::new("missing", 1)])
        .await
        .expect_err("unknown column");
    assert!(matches!(err, EngineError::SchemaMismatch { .. }));

    let err = engine
        .update("items", &[], &[Assignment::new("id", ScalarValue::Null)])
        .await
        .expect_err("null into non-nullable");
    assert!(matches!(err, EngineError::SchemaMismatch { .. }));

    let err = engine
        .update("items", &[], &[])
        .await
        .expect_err("no assignments");
    assert!(matches!(err, EngineError::InvalidFilter(_)));

    let err = engine
        .delete("items", &[Filter::eq("missing", 1)])
        .await
        .expect_err("unknown filter column");
    assert!(matches!(err, EngineError::InvalidFilter(_)));
    assert_eq!(engine.latest_version("items").await.expect("latest"), 3);
}

#[tokio::test]
async fn test_skipping_considers_deltas() {
    let (_dir, engine) = setup(MutationStrategy::MergeOnRead).await;

    // Move a row from the 10..20 file into the range of the other file
    let _ = engine
        .update("items", &[Filter::eq("id", 15)], &[Assignment::new("id", 5)])
        .await
        .expect("update");

    let with_skipping = engine
        .scan("items", &[Filter::eq("id", 5)])
        .await
        .expect("scan");
    let without = engine
        .scan_at(
            "items",
            -1,
            &[Filter::eq("id", 5)],
            &engine::ScanOptions {
                data_skipping: false,
                ..engine::ScanOptions::default()
            },
        )
        .await
        .expect("scan without skipping");
    assert_eq!(pairs(&with_skipping.batch), pairs(&without.batch));
    assert_eq!(with_skipping.num_rows(), 2);

    // A range no file or delta covers is skipped entirely
    let skipped = engine
        .scan("items", &[Filter::gt("id", 100)])
        .await
        .expect("scan");
    assert_eq!(skipped.num_rows(), 0);
    assert_eq!(skipped.metrics.files_skipped, 2);
    assert_eq!(skipped.metrics.files_read, 0);
}

#[tokio::test]
async fn test_concurrent_mutations_serialize() {
    let (_dir, engine) = setup(MutationStrategy::MergeOnRead).await;

    let handles: Vec<_> = (0..5_i64)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .update(
                        "items",
                        &[Filter::eq("id", i)],
                        &[Assignment::new("name", format!("u{i}"))],
                    )
                    .await
            })
        })
        .collect();
    for handle in handles {
        let result = handle.await.expect("join").expect("update");
        assert_eq!(result.rows_affected, 1);
    }

    let result = engine
        .scan("items", &[Filter::lt("id", 5)])
        .await
        .expect("scan");
    let want: Vec<_> = (0..5).map(|i| (i, Some(format!("u{i}")))).collect();
    assert_eq!(pairs(&result.batch), want);
}

async fn check_unfiltered_mutations(strategy: MutationStrategy) {
    let (_dir, engine) = setup(strategy).await;

    // No filters: every visible row
    let updated = engine
        .update("items", &[], &[Assignment::new("name", "all")])
        .await
        .expect("update everything");
    assert_eq!(updated.rows_affected, 20);
    let result = engine.scan("items", &[]).await.expect("scan");
    let want: Vec<_> = (0..20).map(|id| (id, Some("all".to_string()))).collect();
    assert_eq!(pairs(&result.batch), want);

    let _ = engine
        .delete("items", &[Filter::lt("id", 15)])
        .await
        .expect("delete");

    // A filter without a column matches everything that is still visible
    let deleted = engine
        .delete("items", &[Filter::eq("", 0)])
        .await
        .expect("delete everything");
    assert_eq!(deleted.rows_affected, 5);
    assert_eq!(engine.scan("items", &[]).await.expect("scan").num_rows(), 0);
}

#[tokio::test]
async fn test_merge_on_read_mutations_without_filters() {
    check_unfiltered_mutations(MutationStrategy::MergeOnRead).await;
}

#[tokio::test]
async fn test_copy_on_write_mutations_without_filters() {
    check_unfiltered_mutations(MutationStrategy::CopyOnWrite).await;
}
