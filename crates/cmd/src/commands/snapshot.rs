// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::common::{format_size, format_timestamp};
use anyhow::Result;
use engine::StorageEngine;
use std::fmt::Write;

/// Describe the snapshot of `table` at `version` (`-1` for latest).
/// With `files`, list every active file with its statistics.
pub async fn snapshot_command(
    engine: &StorageEngine,
    table: &str,
    version: i64,
    files: bool,
) -> Result<String> {
    let snapshot = engine.snapshot(table, version).await?;
    let mut out = String::new();

    writeln!(out, "Table:     {}", snapshot.table_id())?;
    writeln!(out, "Version:   {}", snapshot.version())?;
    writeln!(out, "Committed: {}", format_timestamp(snapshot.timestamp()))?;
    if !snapshot.is_live() {
        writeln!(out, "State:     dropped")?;
    }
    if let Some(schema) = snapshot.schema() {
        writeln!(out, "Schema:")?;
        for column in &schema.columns {
            writeln!(
                out,
                "  {:<20} {:?}{}",
                column.name,
                column.data_type,
                if column.nullable { "" } else { " not null" }
            )?;
        }
    }
    writeln!(
        out,
        "Files:     {} base, {} delta, {}",
        snapshot.base_files().count(),
        snapshot.delta_files().count(),
        format_size(snapshot.total_size())
    )?;
    writeln!(out, "Rows:      {} (before deltas)", snapshot.base_row_count())?;

    if files {
        for file in snapshot.files() {
            let stats = file.stats();
            let ranges: Vec<String> = stats
                .min_values
                .iter()
                .filter(|(column, _)| !column.starts_with('_'))
                .map(|(column, min)| {
                    let max = stats
                        .max(column)
                        .map_or_else(|| "?".to_string(), ToString::to_string);
                    format!("{column}=[{min}, {max}]")
                })
                .collect();
            writeln!(
                out,
                "  {}{} v{} {} rows {} {}",
                file.path(),
                if file.is_delta() { " (delta)" } else { "" },
                file.added_version,
                file.row_count(),
                format_size(file.size()),
                ranges.join(" ")
            )?;
        }
    }
    Ok(out)
}
