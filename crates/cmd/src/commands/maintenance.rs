// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::common::{format_size, format_timestamp};
use anyhow::{Result, anyhow};
use engine::StorageEngine;
use std::fmt::Write;
use std::time::Duration;

pub async fn checkpoint_command(engine: &StorageEngine, table: &str) -> Result<String> {
    let marker = engine.checkpoint(table).await?;
    let mut out = String::new();
    writeln!(
        out,
        "Checkpoint of {} at version {}: {} files, {} ({})",
        marker.table_id,
        marker.version,
        marker.num_files,
        format_size(marker.size_in_bytes),
        format_timestamp(marker.created_at)
    )?;
    writeln!(out, "sha256 {}", marker.sha256)?;
    Ok(out)
}

pub async fn compact_command(engine: &StorageEngine, table: &str) -> Result<String> {
    let metrics = engine.compact(table).await?;
    let mut out = String::new();
    match metrics.version {
        None => writeln!(out, "{table}: nothing to compact")?,
        Some(version) => writeln!(
            out,
            "{table}: compacted {} files ({} groups, {} deltas) into {} at version {version}",
            metrics.files_removed, metrics.groups, metrics.deltas_removed, metrics.files_added
        )?,
    }
    Ok(out)
}

pub async fn optimize_command(
    engine: &StorageEngine,
    table: &str,
    columns: &[String],
) -> Result<String> {
    if columns.is_empty() {
        return Err(anyhow!("optimize needs at least one --zorder column"));
    }
    let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
    let metrics = engine.optimize_zorder(table, &columns).await?;
    let mut out = String::new();
    match metrics.version {
        None => writeln!(out, "{table}: no files to cluster")?,
        Some(version) => writeln!(
            out,
            "{table}: clustered {} rows by {} from {} files into {} at version {version}",
            metrics.rows,
            columns.join(", "),
            metrics.files_removed,
            metrics.files_added
        )?,
    }
    Ok(out)
}

pub async fn vacuum_command(
    engine: &StorageEngine,
    table: &str,
    retention: Duration,
) -> Result<String> {
    let metrics = engine.vacuum(table, retention).await?;
    let mut out = String::new();
    writeln!(
        out,
        "{table}: deleted {} files and {} orphans, {} tombstones retained",
        metrics.files_deleted, metrics.orphans_deleted, metrics.retained
    )?;
    Ok(out)
}
