// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Compaction, auto-compaction, z-order clustering and vacuum.

use arrow::array::{ArrayRef, AsArray, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::Int64Type;
use deltalog::{ColumnDef, ColumnType, NoBackoff, TableSchema};
use engine::{
    CompactionConfig, EngineConfig, Filter, ScanOptions, StorageEngine, ZOrderConfig,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn schema() -> TableSchema {
    TableSchema::new(vec![
        ColumnDef::new("id", ColumnType::Int64, false),
        ColumnDef::new("name", ColumnType::Utf8, true),
    ])
}

fn row(id: i64) -> RecordBatch {
    RecordBatch::try_new(
        schema().to_arrow(),
        vec![
            Arc::new(Int64Array::from(vec![id])) as ArrayRef,
            Arc::new(StringArray::from(vec![format!("name-{id}")])) as ArrayRef,
        ],
    )
    .expect("batch")
}

fn small_files_config() -> EngineConfig {
    EngineConfig::default()
        .with_backoff(Arc::new(NoBackoff))
        .with_compaction(CompactionConfig {
            min_file_size: 16 * 1024,
            max_files_to_compact: 10,
            ..CompactionConfig::default()
        })
}

async fn table_with_rows(dir: &TempDir, config: EngineConfig, count: i64) -> StorageEngine {
    let engine = StorageEngine::open(dir.path(), config)
        .await
        .expect("open engine");
    let _ = engine.create_table("events", schema()).await.expect("create");
    for id in 0..count {
        let _ = engine.write("events", &row(id)).await.expect("write");
    }
    engine
}

#[tokio::test]
async fn test_compaction_reduces_files_and_keeps_rows() {
    let dir = TempDir::new().expect("tempdir");
    let engine = table_with_rows(&dir, small_files_config(), 20).await;
    let before = engine.snapshot("events", -1).await.expect("snapshot");
    assert_eq!(before.num_files(), 20);

    let metrics = engine.compact("events").await.expect("compact");
    assert_eq!(metrics.groups, 2);
    assert_eq!(metrics.files_removed, 20);
    assert_eq!(metrics.rows_rewritten, 20);

    let after = engine.snapshot("events", -1).await.expect("snapshot");
    assert!(after.num_files() < 20);
    assert_eq!(after.num_files(), metrics.files_added);
    assert_eq!(after.base_row_count(), 20);

    for id in 0..20 {
        let found = engine
            .scan("events", &[Filter::eq("id", id)])
            .await
            .expect("point scan");
        assert_eq!(found.num_rows(), 1, "row {id}");
        let name = found.batch.column(1).as_string::<i32>().value(0).to_string();
        assert_eq!(name, format!("name-{id}"));
    }

    // Compaction commits without data_change, and the pre-compaction
    // version still reads the original files
    let old = engine
        .scan_at("events", before.version(), &[], &ScanOptions::default())
        .await
        .expect("time travel");
    assert_eq!(old.num_rows(), 20);

    // Nothing left to do
    let again = engine.compact("events").await.expect("compact again");
    assert_eq!(again.version, None);
}

#[tokio::test]
async fn test_compaction_ignores_large_files() {
    let dir = TempDir::new().expect("tempdir");
    let config = EngineConfig::default().with_compaction(CompactionConfig {
        min_file_size: 1,
        ..CompactionConfig::default()
    });
    let engine = table_with_rows(&dir, config, 5).await;
    let metrics = engine.compact("events").await.expect("compact");
    assert_eq!(metrics.groups, 0);
    assert_eq!(metrics.version, None);
    assert_eq!(engine.latest_version("events").await.expect("latest"), 6);
}

#[tokio::test]
async fn test_auto_compactor_runs_and_stops() {
    let dir = TempDir::new().expect("tempdir");
    let engine = table_with_rows(&dir, small_files_config(), 6).await;

    let compactor = engine.start_auto_compactor();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while compactor.runs() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "no compaction pass");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    compactor.stop().await.expect("stop");

    let snapshot = engine.snapshot("events", -1).await.expect("snapshot");
    assert_eq!(snapshot.num_files(), 1);
    assert_eq!(engine.scan("events", &[]).await.expect("scan").num_rows(), 6);
}

#[tokio::test]
async fn test_auto_compactor_cancel_leaves_table_consistent() {
    let dir = TempDir::new().expect("tempdir");
    let engine = table_with_rows(&dir, small_files_config(), 6).await;

    let compactor = engine.start_auto_compactor();
    let token = compactor.cancellation_token();
    token.cancel();
    compactor.stop().await.expect("stop");

    // Either compacted or not, but never half done
    let snapshot = engine.snapshot("events", -1).await.expect("snapshot");
    assert!(snapshot.num_files() == 1 || snapshot.num_files() == 6);
    assert_eq!(engine.scan("events", &[]).await.expect("scan").num_rows(), 6);
}

fn points_schema() -> TableSchema {
    TableSchema::new(vec![
        ColumnDef::new("x", ColumnType::Int64, false),
        ColumnDef::new("y", ColumnType::Int64, false),
    ])
}

fn points(rng: &mut StdRng, count: usize) -> RecordBatch {
    let xs: Vec<i64> = (0..count).map(|_| rng.gen_range(0..1000)).collect();
    let ys: Vec<i64> = (0..count).map(|_| rng.gen_range(0..1000)).collect();
    RecordBatch::try_new(
        points_schema().to_arrow(),
        vec![
            Arc::new(Int64Array::from(xs)) as ArrayRef,
            Arc::new(Int64Array::from(ys)) as ArrayRef,
        ],
    )
    .expect("batch")
}

fn sorted_points(batch: &RecordBatch) -> Vec<(i64, i64)> {
    let xs = batch.column(0).as_primitive::<Int64Type>();
    let ys = batch.column(1).as_primitive::<Int64Type>();
    let mut out: Vec<(i64, i64)> = xs
        .values()
        .iter()
        .copied()
        .zip(ys.values().iter().copied())
        .collect();
    out.sort_unstable();
    out
}

#[tokio::test]
async fn test_zorder_improves_skipping() {
    let dir = TempDir::new().expect("tempdir");
    let config = EngineConfig::default().with_zorder(ZOrderConfig {
        bits_per_dimension: 16,
        target_rows_per_file: 100,
    });
    let engine = StorageEngine::open(dir.path(), config)
        .await
        .expect("open engine");
    let _ = engine
        .create_table("points", points_schema())
        .await
        .expect("create");
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..4 {
        let _ = engine
            .write("points", &points(&mut rng, 250))
            .await
            .expect("write");
    }

    let query = [Filter::lt("x", 100), Filter::lt("y", 100)];
    let before = engine.scan("points", &query).await.expect("scan");
    assert_eq!(before.metrics.files_skipped, 0);

    let metrics = engine
        .optimize_zorder("points", &["x", "y"])
        .await
        .expect("optimize");
    assert_eq!(metrics.files_removed, 4);
    assert_eq!(metrics.files_added, 10);
    assert_eq!(metrics.rows, 1000);

    let after = engine.scan("points", &query).await.expect("scan");
    assert_eq!(sorted_points(&after.batch), sorted_points(&before.batch));
    assert!(after.metrics.files_skipped >= 2);
    assert!(after.metrics.files_read < before.metrics.files_read);

    let all = engine.scan("points", &[]).await.expect("scan");
    assert_eq!(all.num_rows(), 1000);
}

#[tokio::test]
async fn test_zorder_rejects_bad_columns() {
    let dir = TempDir::new().expect("tempdir");
    let engine = table_with_rows(&dir, EngineConfig::default(), 2).await;
    assert!(engine.optimize_zorder("events", &[]).await.is_err());
    assert!(engine.optimize_zorder("events", &["missing"]).await.is_err());
    assert_eq!(engine.latest_version("events").await.expect("latest"), 3);
}

#[tokio::test]
async fn test_vacuum_respects_retention() {
    let dir = TempDir::new().expect("tempdir");
    let engine = table_with_rows(&dir, small_files_config(), 3).await;
    let before = engine.latest_version("events").await.expect("latest");
    let _ = engine.compact("events").await.expect("compact");

    let kept = engine
        .vacuum("events", Duration::from_secs(3600))
        .await
        .expect("vacuum");
    assert_eq!(kept.files_deleted, 0);
    assert_eq!(kept.retained, 3);
    assert!(
        engine
            .scan_at("events", before, &[], &ScanOptions::default())
            .await
            .is_ok()
    );

    // A file no commit ever referenced, as left by a crashed writer
    let orphan = dir.path().join("events").join("data").join("orphan.parquet");
    std::fs::write(&orphan, b"partial").expect("orphan");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let swept = engine.vacuum("events", Duration::ZERO).await.expect("vacuum");
    assert_eq!(swept.files_deleted, 3);
    assert_eq!(swept.tombstones_expired, 3);
    assert_eq!(swept.orphans_deleted, 1);
    assert!(!orphan.exists());

    // The latest version is intact; older versions lost their files
    assert_eq!(engine.scan("events", &[]).await.expect("scan").num_rows(), 3);
    assert!(
        engine
            .scan_at("events", before, &[], &ScanOptions::default())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_vacuum_keeps_files_of_open_transaction() {
    let dir = TempDir::new().expect("tempdir");
    let engine = table_with_rows(&dir, small_files_config(), 1).await;

    let mut txn = engine.begin_transaction("events").await.expect("begin");
    txn.write(&row(10)).await.expect("stage");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let metrics = engine.vacuum("events", Duration::ZERO).await.expect("vacuum");
    assert_eq!(metrics.orphans_deleted, 0);

    let version = txn.commit().await.expect("commit");
    assert_eq!(version, 3);
    let result = engine.scan("events", &[]).await.expect("scan after commit");
    assert_eq!(result.num_rows(), 2);
}

#[tokio::test]
async fn test_compaction_packs_rows_across_groups() {
    let dir = TempDir::new().expect("tempdir");
    let config = EngineConfig::default()
        .with_backoff(Arc::new(NoBackoff))
        .with_compaction(CompactionConfig {
            min_file_size: 16 * 1024,
            max_files_to_compact: 3,
            ..CompactionConfig::default()
        });
    let engine = table_with_rows(&dir, config, 8).await;

    let metrics = engine.compact("events").await.expect("compact");
    assert_eq!(metrics.groups, 3);
    assert_eq!(metrics.files_removed, 8);
    assert_eq!(metrics.files_added, 1);

    let snapshot = engine.snapshot("events", -1).await.expect("snapshot");
    assert_eq!(snapshot.num_files(), 1);
    assert_eq!(snapshot.base_row_count(), 8);

    // A single small file is left alone, so compaction settles
    let again = engine.compact("events").await.expect("compact again");
    assert_eq!(again.version, None);
    assert_eq!(
        engine.latest_version("events").await.expect("latest"),
        metrics.version.expect("committed")
    );
}
