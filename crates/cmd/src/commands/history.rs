// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::common::{format_size, format_timestamp};
use anyhow::Result;
use deltalog::{Action, LogEntry};
use engine::StorageEngine;
use std::fmt::Write;

/// The log of `table`, newest last. `limit` keeps only the newest entries.
pub async fn history_command(
    engine: &StorageEngine,
    table: &str,
    limit: Option<usize>,
) -> Result<String> {
    let entries = engine.history(table).await?;
    let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));

    let mut out = String::new();
    for entry in &entries[skip..] {
        writeln!(out, "{}", format_entry(entry))?;
    }
    writeln!(out, "{} entries", entries.len())?;
    Ok(out)
}

fn format_entry(entry: &LogEntry) -> String {
    let detail = match &entry.action {
        Action::Add(add) => format!(
            "{} {} ({} rows, {}{})",
            if add.is_delta { "delta" } else { "file" },
            add.path,
            add.row_count,
            format_size(add.size),
            if add.data_change { "" } else { ", rewrite" }
        ),
        Action::Remove(remove) => remove.path.clone(),
        Action::Metadata(metadata) if metadata.is_database() => "database".to_string(),
        Action::Metadata(metadata) if metadata.is_dropped() => "dropped".to_string(),
        Action::Metadata(metadata) => metadata
            .schema
            .columns
            .iter()
            .map(|c| format!("{}:{:?}", c.name, c.data_type))
            .collect::<Vec<_>>()
            .join(", "),
    };
    let user = entry.provenance.user_id.as_deref().unwrap_or("-");
    format!(
        "{:>6}  {}  {:<8} {:<10} {}",
        entry.version,
        format_timestamp(entry.timestamp),
        entry.action.operation(),
        user,
        detail
    )
}
