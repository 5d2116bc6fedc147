// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use engine::{EngineConfig, StorageEngine};
use std::path::Path;

/// Open the engine at `root`, with the YAML config at `config` if given.
pub async fn open_engine(root: &Path, config: Option<&Path>) -> Result<StorageEngine> {
    let config = match config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    diagnostics::log_debug!("Opening tables at {root}", root: root.display().to_string());
    StorageEngine::open(root, config)
        .await
        .with_context(|| format!("opening {}", root.display()))
}

/// Format microseconds since the epoch as UTC.
#[must_use]
pub fn format_timestamp(micros: i64) -> String {
    chrono::DateTime::from_timestamp_micros(micros)
        .map_or_else(|| "unknown".to_string(), |dt| {
            dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
        })
}

/// Human-readable byte count.
#[must_use]
pub fn format_size(bytes: i64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
