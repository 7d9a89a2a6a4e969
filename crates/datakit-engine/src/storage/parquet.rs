//! Parquet and file helpers shared by the writer, reader and finaliser.

use std::fs::File;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::Array;
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use sha2::{Digest, Sha256};

const PARQUET_OVERHEAD_BYTES: usize = 4096;

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_created_by(format!("datakit {}", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Encode one batch as a complete Parquet file in memory.
pub fn batch_to_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let capacity = batch
        .get_array_memory_size()
        .saturating_add(PARQUET_OVERHEAD_BYTES);
    let mut cursor = Cursor::new(Vec::with_capacity(capacity));
    let mut writer = ArrowWriter::try_new(&mut cursor, batch.schema(), Some(writer_properties()))
        .context("Failed to create Parquet writer")?;
    writer.write(batch).context("Failed to write RecordBatch to Parquet")?;
    writer.close().context("Failed to finish Parquet file")?;
    Ok(cursor.into_inner())
}

/// Read every batch of a Parquet file.
pub fn read_parquet(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("Failed to read Parquet metadata of {}", path.display()))?
        .build()
        .with_context(|| format!("Failed to build Parquet reader for {}", path.display()))?;
    reader
        .map(|batch| batch.with_context(|| format!("Failed to decode batch from {}", path.display())))
        .collect()
}

/// Read a Parquet file as one batch. A file without row groups yields an
/// empty batch with the file's schema.
pub fn read_parquet_table(path: &Path) -> Result<RecordBatch> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("Failed to read Parquet metadata of {}", path.display()))?;
    let schema = Arc::clone(builder.schema());
    let batches = builder
        .build()
        .with_context(|| format!("Failed to build Parquet reader for {}", path.display()))?
        .map(|batch| batch.with_context(|| format!("Failed to decode batch from {}", path.display())))
        .collect::<Result<Vec<_>>>()?;
    concat_batches(&schema, &batches).with_context(|| format!("Failed to combine batches of {}", path.display()))
}

/// Write `bytes` to `path` and fsync before returning.
pub fn write_durable(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let mut file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync {}", path.display()))?;
    Ok(())
}

/// Atomically move a staged file into place.
pub fn promote(staged: &Path, target: &Path) -> Result<()> {
    std::fs::rename(staged, target).with_context(|| {
        format!("Failed to rename {} to {}", staged.display(), target.display())
    })
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(sha256_hex(&bytes))
}

/// Typed column lookup by name.
pub fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .with_context(|| format!("Missing column '{name}'"))?
        .as_any()
        .downcast_ref::<T>()
        .with_context(|| format!("Column '{name}' has an unexpected type"))
}
