//! Git-portable projection of the UID DB.
//!
//! The only columns that must travel with the repo are
//! `(account, folder, uidvalidity, uid, content_hash)` — they map IMAP UIDs
//! to on-disk content. Everything else in the UID DB is regenerable from
//! the `.eml` files, so the parquet stays small and diff-stable.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::{ArrayRef, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use tracing::info;

use super::uids::UidDb;

pub const UIDS_PARQUET: &str = "uids.parquet";

fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("account", DataType::Utf8, false),
        Field::new("folder", DataType::Utf8, false),
        Field::new("uidvalidity", DataType::Int64, false),
        Field::new("uid", DataType::Int64, false),
        Field::new("content_hash", DataType::Utf8, false),
    ]))
}

/// Export the UID DB's key columns, sorted by all four keys, compressed
/// with ZSTD at a Git-friendly level.
pub async fn export_uids(db: &UidDb, output: &Path) -> Result<u64> {
    let rows = db.export_rows().await?;

    let accounts: StringArray = rows.iter().map(|r| Some(r.0.as_str())).collect();
    let folders: StringArray = rows.iter().map(|r| Some(r.1.as_str())).collect();
    let uidvalidities: Int64Array = rows.iter().map(|r| Some(r.2)).collect();
    let uids: Int64Array = rows.iter().map(|r| Some(r.3)).collect();
    let hashes: StringArray = rows.iter().map(|r| Some(r.4.as_str())).collect();

    let batch = RecordBatch::try_new(
        schema(),
        vec![
            Arc::new(accounts) as ArrayRef,
            Arc::new(folders),
            Arc::new(uidvalidities),
            Arc::new(uids),
            Arc::new(hashes),
        ],
    )
    .context("assembling record batch")?;

    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(
            ZstdLevel::try_new(19).context("zstd level")?,
        ))
        .build();

    let file = File::create(output)
        .with_context(|| format!("creating {}", output.display()))?;
    let mut writer =
        ArrowWriter::try_new(file, schema(), Some(props)).context("opening parquet writer")?;
    writer.write(&batch).context("writing parquet batch")?;
    writer.close().context("closing parquet writer")?;

    info!(rows = rows.len(), path = %output.display(), "uids exported to parquet");
    Ok(rows.len() as u64)
}

/// Read the projection back into key tuples.
pub fn read_uids(path: &Path) -> Result<Vec<(String, String, i64, i64, String)>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("opening parquet reader")?
        .build()
        .context("building parquet reader")?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.context("reading parquet batch")?;
        let accounts = string_column(&batch, 0, "account")?;
        let folders = string_column(&batch, 1, "folder")?;
        let uidvalidities = int_column(&batch, 2, "uidvalidity")?;
        let uids = int_column(&batch, 3, "uid")?;
        let hashes = string_column(&batch, 4, "content_hash")?;

        for i in 0..batch.num_rows() {
            rows.push((
                accounts.value(i).to_string(),
                folders.value(i).to_string(),
                uidvalidities.value(i),
                uids.value(i),
                hashes.value(i).to_string(),
            ));
        }
    }
    Ok(rows)
}

/// Rebuild the pulled-message key rows from the parquet projection.
/// `message_id` and `local_path` stay NULL for the index pass.
pub async fn import_uids(db: &UidDb, path: &Path) -> Result<u64> {
    let rows = read_uids(path)?;
    let imported = db.import_rows(&rows).await?;
    info!(rows = imported, path = %path.display(), "uids imported from parquet");
    Ok(imported)
}

/// True when the parquet projection is newer than the DB file, meaning the
/// DB (per-machine, not Git-tracked) is behind the repo and should be
/// rebuilt from the projection.
pub fn parquet_is_newer(db_path: &Path, parquet_path: &Path) -> bool {
    let Ok(parquet_meta) = std::fs::metadata(parquet_path) else {
        return false;
    };
    let Ok(db_meta) = std::fs::metadata(db_path) else {
        return true;
    };
    match (parquet_meta.modified(), db_meta.modified()) {
        (Ok(p), Ok(d)) => p > d,
        _ => false,
    }
}

fn string_column<'a>(
    batch: &'a RecordBatch,
    idx: usize,
    name: &str,
) -> Result<&'a StringArray> {
    match batch.column(idx).as_any().downcast_ref::<StringArray>() {
        Some(col) => Ok(col),
        None => bail!("parquet column '{name}' is not a string column"),
    }
}

fn int_column<'a>(batch: &'a RecordBatch, idx: usize, name: &str) -> Result<&'a Int64Array> {
    match batch.column(idx).as_any().downcast_ref::<Int64Array>() {
        Some(col) => Ok(col),
        None => bail!("parquet column '{name}' is not an int64 column"),
    }
}
