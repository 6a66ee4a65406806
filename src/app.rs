//! Command dispatch: wire the stores and engines together, print
//! user-facing summaries, map failures to exit codes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use crate::cli::{Cli, Command};
use crate::config::{self, EmlConfig};
use crate::convert;
use crate::errors::{AppError, AppResult};
use crate::imap::{FilterConfig, ImapClient};
use crate::layout::{is_valid_layout, StorageLayout};
use crate::storage::{parquet, uids, FileIndex, UidDb};
use crate::sync::{self, PullEngine, PullOptions, PushEngine, PushOptions};
use crate::threading;
use crate::types::Account;

pub async fn run(cli: Cli) -> i32 {
    match dispatch(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    }
}

async fn dispatch(cli: Cli) -> AppResult<()> {
    match cli.command {
        Command::Pull {
            account,
            folder,
            full,
            retry,
            limit,
            dry_run,
            cache_ttl,
            max_errors,
            checkpoint,
            tag,
            addresses,
            domains,
            from_addresses,
            from_domains,
            user,
            password,
        } => {
            let root = require_root()?;
            let cfg = load_valid_config(&root)?;
            let acct = resolve_account(&cfg, &account, user, password)?;

            let db = open_uid_db(&root).await?;
            let index = FileIndex::open(&root)
                .await
                .map_err(AppError::Other)?;
            let layout = StorageLayout::open(&root, &cfg.layout)
                .await
                .map_err(AppError::Other)?;

            println!("Source: {} ({})", acct.kind.as_str(), acct.user);
            println!("Layout: {}", cfg.layout);
            if dry_run {
                println!("DRY RUN - no changes will be made");
            }

            let opts = PullOptions {
                folder,
                dry_run,
                full,
                retry,
                limit,
                cache_ttl,
                max_errors,
                checkpoint,
                tag,
                filters: FilterConfig {
                    addresses,
                    domains,
                    from_addresses,
                    from_domains,
                },
            };
            let mut engine = PullEngine::new(&root, acct, db, index, layout);
            let summary = engine.run(&opts).await?;
            print_pull_summary(&account, &summary);
            Ok(())
        }

        Command::Push {
            account,
            folder,
            limit,
            dry_run,
            max_size,
            delay,
            max_errors,
            tag,
            user,
            password,
        } => {
            let root = require_root()?;
            let cfg = load_valid_config(&root)?;
            let acct = resolve_account(&cfg, &account, user, password)?;

            let db = open_uid_db(&root).await?;
            let layout = StorageLayout::open(&root, &cfg.layout)
                .await
                .map_err(AppError::Other)?;

            println!("Destination: {} ({})", acct.kind.as_str(), acct.user);
            println!("Folder: {folder}");
            if dry_run {
                println!("DRY RUN - no changes will be made");
            }

            let opts = PushOptions {
                folder,
                dry_run,
                limit,
                max_size_mb: max_size,
                delay: Duration::from_secs_f64(delay.max(0.0)),
                max_errors,
                tag,
            };
            let mut engine = PushEngine::new(&root, acct, db, layout);
            let summary = engine.run(&opts).await?;
            print_push_summary(&summary, max_size);
            Ok(())
        }

        Command::Folders { account, counts } => {
            let root = require_root()?;
            let cfg = load_valid_config(&root)?;
            let acct = resolve_account(&cfg, &account, None, None)?;

            let mut client = ImapClient::for_account(&acct)?;
            client.connect(&acct.user, &acct.password).await?;
            let folders = client.list_folders(counts).await;
            client.disconnect().await;

            for folder in folders? {
                match folder.count {
                    Some(count) => println!("{:>8}  {}", count, folder.name),
                    None => println!("{:>8}  {}", "-", folder.name),
                }
            }
            Ok(())
        }

        Command::Uids {
            account,
            folder,
            refresh,
            fetch_missing_ids,
        } => {
            let root = require_root()?;
            let cfg = load_valid_config(&root)?;
            let acct = resolve_account(&cfg, &account, None, None)?;
            let folder = folder.unwrap_or_else(|| acct.kind.default_folder().to_string());
            let db = open_uid_db(&root).await?;

            let mut client = ImapClient::for_account(&acct)?;
            client.connect(&acct.user, &acct.password).await?;
            let result = uids_report(
                &db,
                &mut client,
                &account,
                &folder,
                refresh,
                fetch_missing_ids,
            )
            .await;
            client.disconnect().await;
            result
        }

        Command::Index { update, stats } => {
            let root = require_root()?;
            let index = FileIndex::open(&root).await.map_err(AppError::Other)?;

            if stats {
                let s = index.stats().await.map_err(AppError::Other)?;
                println!("Files indexed:    {}", s.total_files);
                println!("With Message-ID:  {}", s.with_message_id);
                println!("Total size:       {} bytes", s.total_size);
                if let (Some(oldest), Some(newest)) = (&s.oldest_date, &s.newest_date) {
                    println!("Date range:       {oldest} .. {newest}");
                }
                if let Some(sha) = &s.git_sha {
                    println!("Indexed at HEAD:  {sha}");
                }
                return Ok(());
            }

            if update {
                let s = index.update().await.map_err(AppError::Other)?;
                println!(
                    "Index updated: {} added, {} modified, {} deleted",
                    s.added, s.modified, s.deleted
                );
            } else {
                let s = index.rebuild().await.map_err(AppError::Other)?;
                println!("Index rebuilt: {} files ({} errors)", s.indexed, s.errors);
            }
            Ok(())
        }

        Command::IndexFts { jobs, limit, rebuild } => {
            let root = require_root()?;
            let db = open_uid_db(&root).await?;

            if rebuild {
                let count = db.rebuild_fts().await.map_err(AppError::Other)?;
                println!("FTS index rebuilt: {count} messages (metadata only)");
                println!("Run index-fts without -R to restore body text from files.");
                return Ok(());
            }

            let stats = convert::backfill_fts(&root, &db, jobs, limit)
                .await
                .map_err(AppError::Other)?;
            println!(
                "FTS backfill: {} indexed, {} skipped, {} errors",
                stats.indexed, stats.skipped, stats.errors
            );
            Ok(())
        }

        Command::Search {
            query,
            limit,
            offset,
            account,
            folder,
        } => {
            let root = require_root()?;
            let db = open_uid_db(&root).await?;

            let total = db
                .search_count(&query, account.as_deref(), folder.as_deref())
                .await
                .map_err(AppError::Other)?;
            let results = db
                .search(&query, limit, offset, account.as_deref(), folder.as_deref())
                .await
                .map_err(AppError::Other)?;

            for record in &results {
                println!(
                    "{:<20} {:<30} {}",
                    record.msg_date.as_deref().unwrap_or("-"),
                    record.from_addr.as_deref().unwrap_or("-"),
                    record.subject.as_deref().unwrap_or("(no subject)")
                );
                if let Some(path) = &record.local_path {
                    println!("    {path}");
                }
            }
            println!();
            println!("{} of {} matches", results.len(), total);
            Ok(())
        }

        Command::Thread { message_id, replies } => {
            let root = require_root()?;
            let db = open_uid_db(&root).await?;

            let messages = if replies {
                threading::get_replies(&db, &message_id, 100).await
            } else {
                threading::get_thread(&db, &message_id, 100).await
            }
            .map_err(AppError::Other)?;

            if messages.is_empty() {
                println!("No messages found for {message_id}");
                return Ok(());
            }

            if !replies {
                let root_id = messages
                    .first()
                    .and_then(|m| m.message_id.as_deref())
                    .unwrap_or(&message_id);
                let slug = threading::assign_thread_slug(&db, root_id)
                    .await
                    .map_err(AppError::Other)?;
                println!("Thread {slug} ({} messages)", messages.len());
            }

            for msg in &messages {
                println!(
                    "{:<20} {:<30} {}",
                    msg.msg_date.as_deref().unwrap_or("-"),
                    msg.from_addr.as_deref().unwrap_or("-"),
                    msg.subject.as_deref().unwrap_or("(no subject)")
                );
            }
            Ok(())
        }

        Command::Export => {
            let root = require_root()?;
            let db = open_uid_db(&root).await?;
            let output = root.join(config::EML_DIR).join(parquet::UIDS_PARQUET);
            let rows = parquet::export_uids(&db, &output)
                .await
                .map_err(AppError::Other)?;
            println!("Exported {rows} rows to {}", output.display());
            Ok(())
        }

        Command::Import => {
            let root = require_root()?;
            let parquet_path = root.join(config::EML_DIR).join(parquet::UIDS_PARQUET);
            if !parquet_path.exists() {
                return Err(AppError::Config(format!(
                    "no parquet projection at {}",
                    parquet_path.display()
                )));
            }
            let db = UidDb::open(&root.join(config::EML_DIR))
                .await
                .map_err(AppError::Other)?;
            let index = FileIndex::open(&root).await.map_err(AppError::Other)?;
            let rows = convert::rebuild_uid_db(&db, &index, &parquet_path)
                .await
                .map_err(AppError::Other)?;
            println!("Imported {rows} rows from {}", parquet_path.display());
            Ok(())
        }

        Command::Convert { layout, dry_run } => {
            let root = require_root()?;
            let mut cfg = load_valid_config(&root)?;
            if !is_valid_layout(&layout) {
                return Err(AppError::Config(format!("invalid layout '{layout}'")));
            }
            if cfg.layout == layout {
                println!("Store already uses layout '{layout}'");
                return Ok(());
            }

            let mut current = StorageLayout::open(&root, &cfg.layout)
                .await
                .map_err(AppError::Other)?;
            let mut target = StorageLayout::open(&root, &layout)
                .await
                .map_err(AppError::Other)?;

            let summary = convert::convert_layout(&root, &mut current, &mut target, dry_run)
                .await
                .map_err(AppError::Other)?;

            if dry_run {
                println!("Would move {} messages to layout '{layout}'", summary.moved);
                return Ok(());
            }

            cfg.layout = layout.clone();
            config::save_config(&root, &cfg).map_err(AppError::Other)?;

            if target.is_tree() {
                let index = FileIndex::open(&root).await.map_err(AppError::Other)?;
                index.rebuild().await.map_err(AppError::Other)?;
            }

            println!(
                "Converted {} messages to layout '{layout}' ({} errors)",
                summary.moved, summary.errors
            );
            Ok(())
        }

        Command::Status => {
            let root = require_root()?;

            match sync::read_status(&root) {
                Some(status) => {
                    println!(
                        "{} in progress: {}/{} [PID {}]",
                        status.operation, status.account, status.folder, status.pid
                    );
                    println!(
                        "  {}/{} done, {} skipped, {} failed",
                        status.completed, status.total, status.skipped, status.failed
                    );
                    if let Some(subject) = &status.current_subject {
                        println!("  current: {subject}");
                    }
                }
                None => println!("No sync running."),
            }

            let db = open_uid_db(&root).await?;
            let runs = db.recent_runs(5).await.map_err(AppError::Other)?;
            if !runs.is_empty() {
                println!("\nRecent runs:");
                for run in runs {
                    println!(
                        "  #{} {} {}/{} {} (total={} fetched={} skipped={} failed={})",
                        run.id,
                        run.operation,
                        run.account,
                        run.folder,
                        run.status,
                        run.total,
                        run.fetched,
                        run.skipped,
                        run.failed
                    );
                }
            }

            let pulls = db
                .get_recent_pulls(10, None, None, true)
                .await
                .map_err(AppError::Other)?;
            if !pulls.is_empty() {
                println!("\nRecent pulls:");
                for pull in pulls {
                    println!(
                        "  UID {:>8} {} {}",
                        pull.uid,
                        pull.folder,
                        pull.subject.as_deref().unwrap_or("(no subject)")
                    );
                }
            }
            Ok(())
        }
    }
}

/// Server-vs-local set report, optionally refreshing the UID cache and
/// filling in Message-IDs the cache is missing.
async fn uids_report(
    db: &UidDb,
    client: &mut ImapClient,
    account: &str,
    folder: &str,
    refresh: bool,
    fetch_missing_ids: bool,
) -> AppResult<()> {
    let (count, uidvalidity) = client.select(folder, true).await?;
    println!("Folder: {folder} ({count} messages, UIDVALIDITY {uidvalidity})");

    if refresh {
        let server_uids = client.uid_search("ALL").await?;
        let batch: Vec<(u32, Option<String>)> =
            server_uids.iter().map(|&uid| (uid, None)).collect();
        db.record_server_uids(account, folder, uidvalidity, &batch)
            .await
            .map_err(AppError::Other)?;
        db.record_server_folder(account, folder, uidvalidity, server_uids.len() as u32)
            .await
            .map_err(AppError::Other)?;
        println!("Cached {} server UIDs", server_uids.len());
    }

    if fetch_missing_ids {
        let missing = db
            .get_uids_without_message_id(account, folder, uidvalidity)
            .await
            .map_err(AppError::Other)?;
        if missing.is_empty() {
            println!("All cached UIDs have Message-IDs");
        } else {
            let mut uids: Vec<u32> = missing.into_iter().collect();
            uids.sort_unstable();
            println!("Fetching Message-IDs for {} UIDs", uids.len());
            let fetched = client.fetch_message_ids(&uids).await?;
            let with_id = fetched.iter().filter(|(_, mid)| mid.is_some()).count();
            db.record_server_uids(account, folder, uidvalidity, &fetched)
                .await
                .map_err(AppError::Other)?;
            println!("Recorded {with_id} Message-IDs ({} had none)", uids.len() - with_id);
        }
    }

    let server = db
        .get_server_uids(account, folder, uidvalidity)
        .await
        .map_err(AppError::Other)?;
    let pulled = db
        .get_pulled_uids(account, folder, uidvalidity)
        .await
        .map_err(AppError::Other)?;
    let unpulled = db
        .get_unpulled_uids(account, folder, uidvalidity)
        .await
        .map_err(AppError::Other)?;

    println!();
    println!("Server UIDs cached: {}", server.len());
    println!("Pulled:             {}", pulled.len());
    println!("Unpulled:           {}", unpulled.len());
    Ok(())
}

fn require_root() -> AppResult<PathBuf> {
    config::find_root(None).ok_or_else(|| {
        AppError::Config(
            "Not inside a mailstash working tree (no .eml directory found; \
             set MAILSTASH_ROOT or create one)"
                .to_string(),
        )
    })
}

fn load_valid_config(root: &Path) -> AppResult<EmlConfig> {
    let cfg = config::load_config(root).map_err(AppError::Other)?;
    if !is_valid_layout(&cfg.layout) {
        return Err(AppError::Config(format!(
            "unknown layout '{}' in config.yaml",
            cfg.layout
        )));
    }
    Ok(cfg)
}

fn resolve_account(
    cfg: &EmlConfig,
    name: &str,
    user: Option<String>,
    password: Option<String>,
) -> AppResult<Account> {
    let mut account = cfg
        .accounts
        .get(name)
        .cloned()
        .ok_or_else(|| {
            AppError::Config(format!(
                "Account '{name}' not found. Add it to .eml/config.yaml"
            ))
        })?;
    account.name = name.to_string();
    if let Some(user) = user {
        account.user = user;
    }
    if let Some(password) = password {
        account.password = password;
    }
    if account.user.is_empty() || account.password.is_empty() {
        return Err(AppError::Config(format!(
            "Account '{name}' is missing credentials"
        )));
    }
    Ok(account)
}

/// Open the UID DB, rebuilding it from the parquet projection first when
/// the projection is newer (the DB file is per-machine; the parquet
/// travels with the repo).
async fn open_uid_db(root: &Path) -> AppResult<UidDb> {
    let eml_dir = root.join(config::EML_DIR);
    let parquet_path = eml_dir.join(parquet::UIDS_PARQUET);

    let mut db_path = eml_dir.join(uids::UIDS_DB);
    if !db_path.exists() && eml_dir.join(uids::LEGACY_PULLS_DB).exists() {
        db_path = eml_dir.join(uids::LEGACY_PULLS_DB);
    }
    let needs_rebuild = parquet::parquet_is_newer(&db_path, &parquet_path);

    let db = UidDb::open(&eml_dir).await.map_err(AppError::Other)?;

    if needs_rebuild {
        info!(parquet = %parquet_path.display(), "parquet newer than DB; rebuilding");
        let index = FileIndex::open(root).await.map_err(AppError::Other)?;
        convert::rebuild_uid_db(&db, &index, &parquet_path)
            .await
            .context("rebuilding UID DB from parquet")
            .map_err(AppError::Other)?;
    }

    Ok(db)
}

fn print_pull_summary(account: &str, summary: &sync::PullSummary) {
    println!();
    println!("Found: {}", summary.found);
    if summary.dry_run {
        println!("Would fetch: {}", summary.fetched);
        return;
    }
    println!("Fetched: {}", summary.fetched);
    if summary.skipped > 0 {
        println!("Skipped (duplicate): {}", summary.skipped);
    }
    println!("Total in storage: {}", summary.total_in_store);
    println!("Pulled UIDs tracked: {}", summary.tracked);
    if summary.failed > 0 {
        println!("Failed: {}", summary.failed);
        for error in &summary.errors {
            println!("  {error}");
        }
        if let Some(path) = &summary.failures_path {
            println!("  Failures logged: {}", path.display());
            println!(
                "  Retry with: mailstash pull {account} -f '{}' --retry",
                summary.folder
            );
        }
    }
    if summary.aborted {
        println!("Note: aborted early due to rate limiting. Retry later.");
    }
}

fn print_push_summary(summary: &sync::PushSummary, max_size: u64) {
    println!();
    println!("Messages in storage: {}", summary.total_in_store);
    println!("Already pushed: {}", summary.already_pushed);
    println!("To push: {}", summary.to_push);
    if summary.dry_run {
        println!("Would push: {}", summary.pushed);
        if summary.skipped > 0 {
            println!("Would skip: {} (over {max_size}MB or untracked)", summary.skipped);
        }
        return;
    }
    println!("Pushed: {}", summary.pushed);
    if summary.skipped > 0 {
        println!("Skipped: {} (over {max_size}MB or untracked)", summary.skipped);
    }
    if summary.failed > 0 {
        println!("Failed: {}", summary.failed);
        for error in &summary.errors {
            println!("  {error}");
        }
    }
    if summary.aborted {
        println!("Note: aborted early due to rate limiting. Retry later.");
    }
}
