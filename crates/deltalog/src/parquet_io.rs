// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Buffer-based Parquet encoding shared by commit, checkpoint and data files.

use crate::error::Result;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::{ArrowWriter, arrow_reader::ParquetRecordBatchReaderBuilder};
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Encode batches sharing `schema` into one in-memory Parquet file.
pub fn encode_batches(schema: SchemaRef, batches: &[RecordBatch]) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    {
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(props))?;
        for batch in batches {
            writer.write(batch)?;
        }
        let _ = writer.close()?;
    }
    Ok(buffer)
}

/// Decode an in-memory Parquet file into its Arrow schema and batches.
pub fn decode_batches(data: Bytes) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data)?;
    let schema = builder.schema().clone();
    let reader = builder.build()?;

    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    Ok((schema, batches))
}

/// Decode and concatenate into a single batch (empty files give an empty batch).
pub fn decode_single_batch(data: Bytes) -> Result<RecordBatch> {
    let (schema, batches) = decode_batches(data)?;
    Ok(arrow::compute::concat_batches(&schema, &batches)?)
}

/// Write `data` to a fresh file and sync it before returning.
///
/// Fails with `AlreadyExists` rather than replacing an existing file.
pub async fn write_new_file_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

/// Sync a directory so entries created or renamed in it survive a crash.
pub async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}
