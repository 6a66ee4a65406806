//! Layout conversion and rebuild paths: everything in the DBs can be
//! re-derived from the `.eml` files and the parquet projection.

use std::path::Path;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::layout::StorageLayout;
use crate::parsing::{extract_body_text, HeaderInfo};
use crate::storage::{parquet, FileIndex, UidDb};
use crate::types::PulledRecord;

#[derive(Debug, Default)]
pub struct ConvertSummary {
    pub moved: usize,
    pub errors: usize,
    pub dry_run: bool,
}

/// Re-home every message from the current layout into `target`. Old files
/// are deleted only after everything has been written to the new layout.
pub async fn convert_layout(
    root: &Path,
    current: &mut StorageLayout,
    target: &mut StorageLayout,
    dry_run: bool,
) -> Result<ConvertSummary> {
    let messages = current.iter_messages(None, None, None, None).await?;
    let mut summary = ConvertSummary {
        dry_run,
        ..Default::default()
    };

    if dry_run {
        summary.moved = messages.len();
        return Ok(summary);
    }

    let mut old_paths = Vec::new();
    let mut new_paths = std::collections::HashSet::new();
    for msg in &messages {
        let result = target
            .add_message(
                &msg.message_id,
                &msg.raw,
                &msg.folder,
                msg.date,
                &msg.from_addr,
                &msg.to_addr,
                &msg.cc_addr,
                &msg.subject,
                None,
                None,
            )
            .await;
        match result {
            Ok(written) => {
                summary.moved += 1;
                new_paths.insert(written);
                if let Some(path) = &msg.path {
                    old_paths.push(path.clone());
                }
            }
            Err(e) => {
                summary.errors += 1;
                warn!(message_id = %msg.message_id, error = %e, "conversion write failed");
            }
        }
    }

    // All new copies exist; now drop the originals. A message whose path
    // is identical under both templates must not be deleted.
    if current.is_tree() {
        for rel in old_paths {
            let path = root.join(&rel);
            if new_paths.contains(&path) {
                continue;
            }
            if path.extension().is_some_and(|ext| ext == "eml") {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "removing converted file failed");
                }
            }
        }
    } else {
        let msgs_db = root.join(".eml").join(crate::layout::sqlite::MSGS_DB);
        if msgs_db.exists() {
            std::fs::remove_file(&msgs_db)
                .with_context(|| format!("removing {}", msgs_db.display()))?;
        }
    }

    info!(moved = summary.moved, errors = summary.errors, "layout conversion finished");
    Ok(summary)
}

/// Rebuild the UID DB's key rows from `uids.parquet`, then cross-reference
/// the file index to restore `message_id` / `local_path`.
pub async fn rebuild_uid_db(db: &UidDb, index: &FileIndex, parquet_path: &Path) -> Result<u64> {
    let imported = parquet::import_uids(db, parquet_path).await?;
    let entries = index.all_entries().await?;
    let filled = db.fill_from_index(&entries).await?;
    info!(imported, filled, "UID DB rebuilt from parquet");
    Ok(imported)
}

#[derive(Debug, Default)]
pub struct BackfillStats {
    pub indexed: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Backfill FTS body text by re-reading `.eml` files.
///
/// File reads fan out to a bounded pool (`jobs`); results drain in
/// completion order into this single task, which is the only DB writer,
/// flushing every 100 rows.
pub async fn backfill_fts(
    root: &Path,
    db: &UidDb,
    jobs: usize,
    limit: Option<i64>,
) -> Result<BackfillStats> {
    let records = db.records_needing_fts(limit).await?;
    if records.is_empty() {
        info!("no messages need FTS indexing");
        return Ok(BackfillStats::default());
    }
    info!(count = records.len(), jobs, "backfilling FTS from .eml files");

    let mut stats = BackfillStats::default();

    let reads = stream::iter(records.into_iter().map(|record| {
        let root = root.to_path_buf();
        async move {
            let handle = tokio::task::spawn_blocking(move || read_record_body(&root, record));
            handle.await.context("FTS read task panicked")
        }
    }))
    .buffer_unordered(jobs.max(1));

    let mut batch: Vec<(PulledRecord, String, String, String)> = Vec::new();
    futures::pin_mut!(reads);
    while let Some(result) = reads.next().await {
        match result? {
            ReadOutcome::Ok(record, body, from_addr, to_addr) => {
                batch.push((record, body, from_addr, to_addr));
                if batch.len() >= 100 {
                    flush_batch(db, &mut batch, &mut stats).await?;
                }
            }
            ReadOutcome::Missing => stats.skipped += 1,
            ReadOutcome::Unreadable => stats.errors += 1,
        }
    }
    flush_batch(db, &mut batch, &mut stats).await?;

    info!(
        indexed = stats.indexed,
        skipped = stats.skipped,
        errors = stats.errors,
        "FTS backfill finished"
    );
    Ok(stats)
}

enum ReadOutcome {
    Ok(PulledRecord, String, String, String),
    Missing,
    Unreadable,
}

fn read_record_body(root: &Path, record: PulledRecord) -> ReadOutcome {
    let Some(local_path) = record.local_path.as_deref() else {
        return ReadOutcome::Missing;
    };
    let path = root.join(local_path);
    if !path.exists() {
        return ReadOutcome::Missing;
    }
    let Ok(raw) = std::fs::read(&path) else {
        return ReadOutcome::Unreadable;
    };

    let body = extract_body_text(&raw);

    // Addresses may predate the columns that hold them; recover them from
    // the file while it is in hand.
    let (mut from_addr, mut to_addr) = (
        record.from_addr.clone().unwrap_or_default(),
        record.to_addr.clone().unwrap_or_default(),
    );
    if from_addr.is_empty() || to_addr.is_empty() {
        if let Ok(info) = HeaderInfo::parse(&raw) {
            if from_addr.is_empty() {
                from_addr = info.from_addr;
            }
            if to_addr.is_empty() {
                to_addr = info.to_addr;
            }
        }
    }

    ReadOutcome::Ok(record, body, from_addr, to_addr)
}

async fn flush_batch(
    db: &UidDb,
    batch: &mut Vec<(PulledRecord, String, String, String)>,
    stats: &mut BackfillStats,
) -> Result<()> {
    for (record, body, from_addr, to_addr) in batch.drain(..) {
        let Some(message_id) = record.message_id.as_deref() else {
            stats.skipped += 1;
            continue;
        };
        db.update_addresses(&record, &from_addr, &to_addr).await?;
        db.insert_fts(
            message_id,
            record.subject.as_deref(),
            Some(&body),
            Some(&from_addr),
            Some(&to_addr),
        )
        .await?;
        stats.indexed += 1;
    }
    Ok(())
}
