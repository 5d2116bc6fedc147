// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use arrow::util::pretty::pretty_format_batches;
use engine::{Filter, ScanOptions, StorageEngine};
use std::fmt::Write;

/// Print the rows of `table` at `version` matching every filter.
///
/// Filters use the `column op literal` form, e.g. `id >= 10` or
/// `name IN ('a', 'b')`.
pub async fn scan_command(
    engine: &StorageEngine,
    table: &str,
    version: i64,
    filters: &[String],
    limit: Option<usize>,
    no_skipping: bool,
) -> Result<String> {
    let filters = filters
        .iter()
        .map(|f| Filter::parse(f).with_context(|| format!("parsing filter '{f}'")))
        .collect::<Result<Vec<_>>>()?;
    let options = ScanOptions {
        data_skipping: !no_skipping && engine.config().data_skipping,
        ..ScanOptions::default()
    };
    let result = engine.scan_at(table, version, &filters, &options).await?;

    let shown = limit.map_or(result.num_rows(), |n| n.min(result.num_rows()));
    let batch = result.batch.slice(0, shown);

    let mut out = String::new();
    writeln!(out, "{}", pretty_format_batches(&[batch])?)?;
    let m = &result.metrics;
    writeln!(
        out,
        "{} rows at version {} (files: {} total, {} skipped, {} read; {} deltas)",
        result.num_rows(),
        result.version,
        m.files_total,
        m.files_skipped,
        m.files_read,
        m.deltas_read
    )?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::sample_engine;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_scan_with_filters() {
        let dir = TempDir::new().expect("tempdir");
        let engine = sample_engine(&dir).await;

        let out = scan_command(&engine, "events", -1, &["id >= 4".to_string()], None, false)
            .await
            .expect("scan");
        assert!(out.contains("name-4"));
        assert!(out.contains("name-5"));
        assert!(!out.contains("name-3"));
        assert!(out.contains("2 rows at version 3"));
        assert!(out.contains("1 skipped"));

        let all = scan_command(&engine, "events", -1, &[], Some(2), true)
            .await
            .expect("scan");
        assert!(all.contains("6 rows at version 3"));
        assert!(all.contains("0 skipped"));
    }

    #[tokio::test]
    async fn test_scan_rejects_bad_filter() {
        let dir = TempDir::new().expect("tempdir");
        let engine = sample_engine(&dir).await;
        let err = scan_command(&engine, "events", -1, &["id ~ 3".to_string()], None, false)
            .await
            .expect_err("bad filter");
        assert!(err.to_string().contains("id ~ 3"));
    }
}
