// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Shared plumbing for operations that replace files: compaction,
//! clustering and copy-on-write mutations.

use crate::data_file::{DataFileStore, StagedFiles};
use crate::error::Result;
use arrow::record_batch::RecordBatch;
use deltalog::{Action, AddFile, TableId};
use std::collections::BTreeSet;

/// New files plus the files they supersede, committed as one unit.
#[derive(Debug, Default)]
pub struct Rewrite {
    pub adds: Vec<AddFile>,
    pub removes: BTreeSet<String>,
    pub staged: StagedFiles,
    pub rows_written: usize,
}

impl Rewrite {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty()
    }

    /// Write `batch` as files of at most `rows_per_file` rows.
    pub async fn write_chunks(
        &mut self,
        store: &DataFileStore,
        table: &TableId,
        batch: &RecordBatch,
        rows_per_file: usize,
        data_change: bool,
    ) -> Result<()> {
        let rows_per_file = rows_per_file.max(1);
        let mut offset = 0;
        while offset < batch.num_rows() {
            let len = rows_per_file.min(batch.num_rows() - offset);
            let chunk = batch.slice(offset, len);
            let add = store
                .write(table, &chunk, false, data_change, &mut self.staged)
                .await?;
            self.adds.push(add);
            self.rows_written += len;
            offset += len;
        }
        Ok(())
    }

    pub fn remove(&mut self, path: impl Into<String>) {
        let _ = self.removes.insert(path.into());
    }

    /// ADDs first, then REMOVEs, all sharing one deletion timestamp.
    #[must_use]
    pub fn actions(&self, deletion_timestamp: i64, data_change: bool) -> Vec<Action> {
        self.adds
            .iter()
            .cloned()
            .map(Action::Add)
            .chain(
                self.removes
                    .iter()
                    .map(|p| Action::remove(p.clone(), deletion_timestamp, data_change)),
            )
            .collect()
    }
}

/// Rows per output file so files land near `target_bytes`, estimated from
/// the average row size of the input files.
#[must_use]
pub fn rows_per_file(target_bytes: u64, input_bytes: i64, input_rows: i64) -> usize {
    if input_rows <= 0 || input_bytes <= 0 {
        return usize::MAX;
    }
    let bytes_per_row = (input_bytes as f64 / input_rows as f64).max(1.0);
    ((target_bytes as f64 / bytes_per_row) as usize).max(1)
}

/// Microseconds since the Unix epoch, used for REMOVE deletion timestamps.
#[must_use]
pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::record_batch;

    #[test]
    fn test_rows_per_file_estimate() {
        assert_eq!(rows_per_file(1000, 100, 10), 100);
        assert_eq!(rows_per_file(5, 1000, 10), 1);
        assert_eq!(rows_per_file(1000, 0, 0), usize::MAX);
    }

    #[tokio::test]
    async fn test_write_chunks_splits_and_orders_actions() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = DataFileStore::new(dir.path());
        let table = TableId::new("rewrite_t").expect("valid");
        let batch = record_batch!(("id", Int64, [1, 2, 3, 4, 5])).expect("batch");

        let mut rewrite = Rewrite::new();
        rewrite
            .write_chunks(&store, &table, &batch, 2, false)
            .await
            .expect("write");
        rewrite.remove("data/old.parquet");

        assert_eq!(rewrite.adds.len(), 3);
        assert_eq!(rewrite.rows_written, 5);
        assert_eq!(rewrite.staged.len(), 3);
        let rows: Vec<i64> = rewrite.adds.iter().map(|a| a.row_count).collect();
        assert_eq!(rows, vec![2, 2, 1]);

        let actions = rewrite.actions(7, false);
        assert_eq!(actions.len(), 4);
        assert!(matches!(&actions[0], Action::Add(a) if !a.data_change));
        assert!(matches!(&actions[3], Action::Remove(r) if r.path == "data/old.parquet"));
    }
}
