// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{Parser, Subcommand};
use cmd::commands::{
    checkpoint_command, compact_command, history_command, optimize_command, scan_command,
    snapshot_command, tables_command, vacuum_command,
};
use cmd::common::open_engine;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "deltacore")]
struct Cli {
    /// Directory holding the tables
    #[arg(long, env = "DELTACORE_ROOT", global = true, default_value = ".")]
    root: PathBuf,

    /// YAML engine configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List live tables
    Tables,
    /// Show the transaction log of a table
    History {
        table: String,
        /// Only the newest N entries
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Describe a table version
    Snapshot {
        table: String,
        /// Version to show, latest by default
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        version: i64,
        /// List active files with their statistics
        #[arg(long)]
        files: bool,
    },
    /// Print rows, optionally filtered and at an older version
    Scan {
        table: String,
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        version: i64,
        /// Filter such as "id >= 10"; repeat for AND
        #[arg(short, long = "filter")]
        filters: Vec<String>,
        #[arg(short, long)]
        limit: Option<usize>,
        /// Read every file, ignoring statistics
        #[arg(long)]
        no_skipping: bool,
    },
    /// Write a checkpoint at the latest version
    Checkpoint { table: String },
    /// Merge small files
    Compact { table: String },
    /// Cluster a table by the Z-order of some columns
    Optimize {
        table: String,
        #[arg(long = "zorder", required = true)]
        columns: Vec<String>,
    },
    /// Delete files tombstoned longer ago than the retention period
    Vacuum {
        table: String,
        #[arg(long, default_value_t = 168)]
        retention_hours: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    diagnostics::init_diagnostics();

    let cli = Cli::parse();
    let engine = open_engine(&cli.root, cli.config.as_deref()).await?;

    let output = match &cli.command {
        Commands::Tables => tables_command(&engine).await?,
        Commands::History { table, limit } => history_command(&engine, table, *limit).await?,
        Commands::Snapshot {
            table,
            version,
            files,
        } => snapshot_command(&engine, table, *version, *files).await?,
        Commands::Scan {
            table,
            version,
            filters,
            limit,
            no_skipping,
        } => scan_command(&engine, table, *version, filters, *limit, *no_skipping).await?,
        Commands::Checkpoint { table } => checkpoint_command(&engine, table).await?,
        Commands::Compact { table } => compact_command(&engine, table).await?,
        Commands::Optimize { table, columns } => {
            optimize_command(&engine, table, columns).await?
        }
        Commands::Vacuum {
            table,
            retention_hours,
        } => {
            let retention = Duration::from_secs(retention_hours.saturating_mul(3600));
            vacuum_command(&engine, table, retention).await?
        }
    };

    // Background checkpoints started by this process finish before exit
    engine.wait_for_background().await?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(output.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_scan_args() {
        let cli = Cli::try_parse_from([
            "deltacore",
            "--root",
            "/tmp/tables",
            "scan",
            "events",
            "--version",
            "3",
            "-f",
            "id >= 2",
            "-f",
            "name = 'x'",
        ])
        .expect("parse");
        assert_eq!(cli.root, PathBuf::from("/tmp/tables"));
        match cli.command {
            Commands::Scan {
                table,
                version,
                filters,
                ..
            } => {
                assert_eq!(table, "events");
                assert_eq!(version, 3);
                assert_eq!(filters.len(), 2);
            }
            _ => panic!("expected scan"),
        }
    }
}
