// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Process-wide logging for the deltacore crates.
//!
//! Output goes to stderr through `emit_term`. The level is chosen by the
//! `DELTACORE_LOG` environment variable:
//! - `DELTACORE_LOG=off` (default) - silent
//! - `DELTACORE_LOG=error|warn` - failures and recoverable problems
//!   (checkpoint write failures, commit retries)
//! - `DELTACORE_LOG=info` - commits, checkpoints, compaction summaries
//! - `DELTACORE_LOG=debug` - per-file and per-attempt detail

use std::sync::Once;

// Re-export emit so the macros resolve from downstream crates
pub use emit;

/// Environment variable that selects the minimum log level.
pub const LOG_ENV_VAR: &str = "DELTACORE_LOG";

static INIT: Once = Once::new();

/// Map a `DELTACORE_LOG` value to a minimum level.
///
/// `Ok(None)` means logging is disabled; `Err` carries the unrecognised value.
pub fn parse_level(value: &str) -> Result<Option<emit::Level>, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "off" => Ok(None),
        "error" => Ok(Some(emit::Level::Error)),
        "warn" => Ok(Some(emit::Level::Warn)),
        "info" => Ok(Some(emit::Level::Info)),
        "debug" => Ok(Some(emit::Level::Debug)),
        other => Err(other.to_string()),
    }
}

/// Initialize diagnostics from `DELTACORE_LOG`.
///
/// Safe to call any number of times; only the first call installs the emitter.
pub fn init_diagnostics() {
    INIT.call_once(|| {
        let value = std::env::var(LOG_ENV_VAR).unwrap_or_else(|_| "off".to_string());

        let level = match parse_level(&value) {
            Ok(None) => return,
            Ok(Some(level)) => level,
            Err(unknown) => {
                // The emitter is not installed yet, so this is the only way to say it
                eprintln!("Warning: unknown {LOG_ENV_VAR} value '{unknown}', using 'info'");
                emit::Level::Info
            }
        };

        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(level))
            .init();

        // The runtime must outlive every emitting thread, including background
        // checkpoint and compaction tasks.
        std::mem::forget(rt);
    });
}

/// Log basic operations: commits, checkpoints, compaction summaries.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

/// Log detailed diagnostics: conflict checks, files skipped, staged paths.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

/// Log recoverable problems: commit retries, checkpoint fallbacks.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

/// Log failures that abort an operation.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

/// Re-export the init function for convenience
pub use init_diagnostics as init;
