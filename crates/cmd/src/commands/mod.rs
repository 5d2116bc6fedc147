// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

pub mod history;
pub mod maintenance;
pub mod scan;
pub mod snapshot;
pub mod tables;

pub use history::history_command;
pub use maintenance::{checkpoint_command, compact_command, optimize_command, vacuum_command};
pub use scan::scan_command;
pub use snapshot::snapshot_command;
pub use tables::tables_command;
