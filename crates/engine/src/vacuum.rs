// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Physical deletion of files the log no longer references.
//!
//! A REMOVE only tombstones a file; time travel to versions before the
//! REMOVE still reads it. Vacuum deletes the bytes once the tombstone is
//! older than the retention period, which ends time travel to those
//! versions.

use crate::data_file::DATA_DIR;
use crate::engine::StorageEngine;
use crate::error::Result;
use deltalog::{Action, TableId};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VacuumMetrics {
    /// Tombstoned files deleted from disk
    pub files_deleted: usize,
    /// Tombstones past retention, including files already gone
    pub tombstones_expired: usize,
    /// Tombstones still inside the retention period
    pub retained: usize,
    /// Unreferenced files (failed writers) deleted from disk
    pub orphans_deleted: usize,
}

pub(crate) async fn vacuum(
    engine: &StorageEngine,
    table: &TableId,
    retention: Duration,
) -> Result<VacuumMetrics> {
    let snapshot = engine.log().current_snapshot_or_empty(table).await?;
    let entries = engine.log().entries(table).await?;
    let now = SystemTime::now();
    let cutoff = now.checked_sub(retention).unwrap_or(SystemTime::UNIX_EPOCH);
    let cutoff_micros = cutoff
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX));

    // Newest tombstone per path wins; a file can be re-added and removed again
    let mut tombstones: BTreeMap<&str, i64> = BTreeMap::new();
    let mut referenced: BTreeSet<&str> = BTreeSet::new();
    for entry in &entries {
        match &entry.action {
            Action::Add(add) => {
                let _ = referenced.insert(add.path.as_str());
            }
            Action::Remove(remove) => {
                let _ = tombstones.insert(remove.path.as_str(), remove.deletion_timestamp);
            }
            Action::Metadata(_) => {}
        }
    }

    let store = engine.files();
    let mut metrics = VacuumMetrics::default();
    for (path, deleted_at) in tombstones {
        if snapshot.contains(path) {
            continue;
        }
        if deleted_at >= cutoff_micros {
            metrics.retained += 1;
            continue;
        }
        metrics.tombstones_expired += 1;
        if store.delete(table, path).await? {
            metrics.files_deleted += 1;
        }
    }

    // Without the full history an unreferenced file may still be live in a
    // version before the oldest kept entry
    if entries.first().is_some_and(|e| e.version == 1) {
        metrics.orphans_deleted =
            delete_orphans(engine, table, &referenced, cutoff).await?;
    }

    diagnostics::log_info!(
        "Vacuumed {table}: {deleted} files deleted, {orphans} orphans, {retained} tombstones retained",
        table: table.as_str(),
        deleted: metrics.files_deleted,
        orphans: metrics.orphans_deleted,
        retained: metrics.retained
    );
    Ok(metrics)
}

/// Delete data files that no ADD ever named and that are older than
/// `cutoff`. Files a writer still holds staged are kept whatever their age.
async fn delete_orphans(
    engine: &StorageEngine,
    table: &TableId,
    referenced: &BTreeSet<&str>,
    cutoff: SystemTime,
) -> Result<usize> {
    let store = engine.files();
    let mut dir = match tokio::fs::read_dir(store.data_dir(table)).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut candidates = Vec::new();
    while let Some(item) = dir.next_entry().await? {
        let name = item.file_name().to_string_lossy().into_owned();
        let path = format!("{DATA_DIR}/{name}");
        if referenced.contains(path.as_str()) || store.is_staged(table, &path) {
            continue;
        }
        let modified = item.metadata().await?.modified()?;
        if modified >= cutoff {
            continue;
        }
        candidates.push(path);
    }
    if candidates.is_empty() {
        return Ok(0);
    }

    // A writer unstages its files only after the ADD is in the log, so a
    // file that left staging during the listing shows up in a fresh read
    let snapshot = engine.log().current_snapshot_or_empty(table).await?;
    let entries = engine.log().entries(table).await?;
    let added: BTreeSet<&str> = entries
        .iter()
        .filter_map(|e| match &e.action {
            Action::Add(add) => Some(add.path.as_str()),
            _ => None,
        })
        .collect();

    let mut deleted = 0;
    for path in candidates {
        if added.contains(path.as_str())
            || snapshot.contains(&path)
            || store.is_staged(table, &path)
        {
            continue;
        }
        if store.delete(table, &path).await? {
            diagnostics::log_debug!("Deleted orphan {path}", path: path.as_str());
            deleted += 1;
        }
    }
    Ok(deleted)
}
