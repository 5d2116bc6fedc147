// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use engine::StorageEngine;
use std::fmt::Write;

/// One line per live table: name, version, files and rows.
pub async fn tables_command(engine: &StorageEngine) -> Result<String> {
    let mut out = String::new();
    let tables = engine.list_tables().await?;
    if tables.is_empty() {
        writeln!(out, "No tables")?;
        return Ok(out);
    }
    for table in tables {
        let snapshot = engine.snapshot(table.as_str(), -1).await?;
        writeln!(
            out,
            "{:<30} v{:<6} {:>5} files {:>10} rows",
            table,
            snapshot.version(),
            snapshot.num_files(),
            snapshot.base_row_count()
        )?;
    }
    Ok(out)
}
