// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Scans with and without data skipping must return the same rows.

use arrow::array::{ArrayRef, AsArray, Float64Array, RecordBatch};
use arrow::datatypes::Float64Type;
use deltalog::{ColumnDef, ColumnType, NoBackoff, TableSchema};
use engine::{EngineConfig, Filter, FilterOp, ScanOptions, StorageEngine};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tempfile::TempDir;

fn schema() -> TableSchema {
    TableSchema::new(vec![ColumnDef::new("score", ColumnType::Float64, true)])
}

fn scores(values: Vec<Option<f64>>) -> RecordBatch {
    RecordBatch::try_new(
        schema().to_arrow(),
        vec![Arc::new(Float64Array::from(values)) as ArrayRef],
    )
    .expect("batch")
}

/// Bit patterns, so -0.0 and 0.0 stay distinct and NaN compares equal.
fn bits(batch: &RecordBatch) -> Vec<Option<u64>> {
    let mut bits: Vec<Option<u64>> = batch
        .column(0)
        .as_primitive::<Float64Type>()
        .iter()
        .map(|v| v.map(f64::to_bits))
        .collect();
    bits.sort_unstable();
    bits
}

async fn open(dir: &TempDir) -> StorageEngine {
    let config = EngineConfig::default().with_backoff(Arc::new(NoBackoff));
    let engine = StorageEngine::open(dir.path(), config)
        .await
        .expect("open engine");
    let _ = engine.create_table("scores", schema()).await.expect("create");
    engine
}

async fn check_same_rows(engine: &StorageEngine, filters: &[Filter]) -> usize {
    let skipping = engine
        .scan_at("scores", -1, filters, &ScanOptions::default())
        .await
        .expect("scan with skipping");
    let full = engine
        .scan_at(
            "scores",
            -1,
            filters,
            &ScanOptions {
                data_skipping: false,
                ..ScanOptions::default()
            },
        )
        .await
        .expect("scan without skipping");
    assert_eq!(full.metrics.files_skipped, 0);
    assert_eq!(
        bits(&skipping.batch),
        bits(&full.batch),
        "filters {filters:?} lost rows to skipping"
    );
    skipping.metrics.files_skipped
}

#[tokio::test]
async fn test_negative_zero_is_not_skipped() {
    let dir = TempDir::new().expect("tempdir");
    let engine = open(&dir).await;
    let _ = engine
        .write("scores", &scores(vec![Some(-0.0)]))
        .await
        .expect("write");

    let result = engine
        .scan("scores", &[Filter::lt("score", 0.0)])
        .await
        .expect("scan");
    assert_eq!(result.num_rows(), 1);
    assert_eq!(result.metrics.files_skipped, 0);

    let _ = check_same_rows(&engine, &[Filter::lt("score", 0.0)]).await;
    let _ = check_same_rows(&engine, &[Filter::eq("score", 0.0)]).await;
    let _ = check_same_rows(&engine, &[Filter::gt_eq("score", -0.0)]).await;
}

#[tokio::test]
async fn test_skipping_agrees_with_full_scan() {
    let dir = TempDir::new().expect("tempdir");
    let engine = open(&dir).await;
    let mut rng = StdRng::seed_from_u64(7);

    let special = [
        Some(-0.0),
        Some(0.0),
        Some(f64::NAN),
        Some(f64::INFINITY),
        Some(f64::NEG_INFINITY),
        Some(1.0),
        Some(-1.0),
        None,
    ];
    for _ in 0..12 {
        let len = rng.gen_range(1..6);
        let values: Vec<Option<f64>> = (0..len)
            .map(|_| {
                if rng.gen_bool(0.5) {
                    *special.choose(&mut rng).expect("non-empty")
                } else {
                    Some(rng.gen_range(-3.0..3.0))
                }
            })
            .collect();
        let _ = engine.write("scores", &scores(values)).await.expect("write");
    }

    let mut literals = vec![-0.0, 0.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1.0, -1.0];
    literals.extend((0..5).map(|_| rng.gen_range(-3.0..3.0)));

    let mut skipped = 0;
    for &literal in &literals {
        for op in [FilterOp::Eq, FilterOp::Lt, FilterOp::LtEq, FilterOp::Gt, FilterOp::GtEq] {
            skipped += check_same_rows(&engine, &[Filter::new("score", op, literal)]).await;
        }
    }
    for pair in literals.chunks(2) {
        skipped += check_same_rows(&engine, &[Filter::in_list("score", pair.to_vec())]).await;
    }
    // Skipping actually happened somewhere
    assert!(skipped > 0);
}
