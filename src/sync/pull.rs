//! The pull engine: fetch messages from IMAP into the local store with
//! per-UID tracking, content-hash dedup, failure accounting, and a
//! consecutive-error abort for rate-limit storms.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config;
use crate::errors::{AppError, AppResult};
use crate::imap::{FilterConfig, ImapClient, ImapError};
use crate::layout::path_template::content_hash;
use crate::layout::StorageLayout;
use crate::parsing::{extract_body_text, HeaderInfo};
use crate::storage::{FileIndex, UidDb};
use crate::types::{
    now_iso, Account, PullFailure, PullStatus, PulledRecord, RunStatus, SyncOp,
};

use super::status::StatusWriter;

pub const STALE_RUN_MINUTES: i64 = 60;

#[derive(Clone, Debug)]
pub struct PullOptions {
    pub folder: Option<String>,
    pub dry_run: bool,
    pub full: bool,
    pub retry: bool,
    pub limit: Option<usize>,
    /// UID cache TTL in minutes; 0 always refreshes from the server.
    pub cache_ttl: i64,
    /// Abort after this many consecutive errors.
    pub max_errors: usize,
    /// Persist run counters every N messages.
    pub checkpoint: usize,
    pub tag: Option<String>,
    /// Sender/recipient filters; empty means every message in the folder.
    pub filters: FilterConfig,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            folder: None,
            dry_run: false,
            full: false,
            retry: false,
            limit: None,
            cache_ttl: 60,
            max_errors: 10,
            checkpoint: 100,
            tag: None,
            filters: FilterConfig::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PullSummary {
    pub folder: String,
    pub found: usize,
    pub fetched: u64,
    pub skipped: u64,
    pub failed: u64,
    pub aborted: bool,
    pub dry_run: bool,
    pub total_in_store: i64,
    pub tracked: i64,
    pub failures_path: Option<PathBuf>,
    /// First errors encountered, for the summary printout.
    pub errors: Vec<String>,
}

pub struct PullEngine {
    root: PathBuf,
    account: Account,
    db: UidDb,
    index: FileIndex,
    layout: StorageLayout,
}

impl PullEngine {
    pub fn new(
        root: &Path,
        account: Account,
        db: UidDb,
        index: FileIndex,
        layout: StorageLayout,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            account,
            db,
            index,
            layout,
        }
    }

    pub async fn run(&mut self, opts: &PullOptions) -> AppResult<PullSummary> {
        let account_name = self.account.name.clone();
        let folder = opts
            .folder
            .clone()
            .unwrap_or_else(|| self.account.kind.default_folder().to_string());

        // The status file is the cross-process lock; dry runs stay lock-free.
        let mut status = if opts.dry_run {
            None
        } else {
            Some(StatusWriter::acquire(
                &self.root,
                SyncOp::Pull,
                &account_name,
                &folder,
                0,
            )?)
        };

        self.db.sweep_stale_runs(STALE_RUN_MINUTES).await?;

        // Seed the tree layout's dedup maps from the persistent index so
        // the first HasContent check is O(1) instead of a full scan.
        if self.layout.is_tree() {
            let entries = self.index.all_entries().await?;
            if let StorageLayout::Tree(tree) = &mut self.layout {
                tree.seed_indices(entries);
            }
        }

        let mut client = ImapClient::for_account(&self.account)?;
        client
            .connect(&self.account.user, &self.account.password)
            .await?;

        let result = self
            .run_connected(&mut client, opts, &account_name, &folder, &mut status)
            .await;

        client.disconnect().await;
        result
    }

    async fn run_connected(
        &mut self,
        client: &mut ImapClient,
        opts: &PullOptions,
        account: &str,
        folder: &str,
        status: &mut Option<StatusWriter>,
    ) -> AppResult<PullSummary> {
        let (server_count, uidvalidity) = client.select(folder, true).await?;
        info!(
            account,
            folder,
            messages = server_count,
            uidvalidity,
            "folder selected"
        );

        // A UIDVALIDITY change voids all prior UID knowledge. Old records
        // stay for audit; the new epoch simply starts empty.
        if let Some(stored) = self.db.get_uidvalidity(account, folder).await? {
            if stored != uidvalidity {
                warn!(
                    account,
                    folder,
                    stored,
                    current = uidvalidity,
                    "UIDVALIDITY changed; prior pull records belong to a dead epoch"
                );
            }
        }

        let pulled = self.db.get_pulled_uids(account, folder, uidvalidity).await?;
        if !pulled.is_empty() {
            info!(account, folder, pulled = pulled.len(), "already-pulled UIDs loaded");
        }

        let mut failures = config::load_failures(&self.root, account, folder)?;

        let uids = self
            .plan_candidates(client, opts, account, folder, uidvalidity, &pulled, &failures)
            .await?;
        let Some(mut uids) = uids else {
            // Retry requested with an empty failure log.
            return Ok(PullSummary {
                folder: folder.to_string(),
                dry_run: opts.dry_run,
                ..Default::default()
            });
        };

        if let Some(limit) = opts.limit {
            uids.truncate(limit);
        }

        let total = uids.len();
        info!(account, folder, candidates = total, "pull plan ready");

        if let Some(status) = status.as_mut() {
            status.set_total(total as u64)?;
        }

        let run_id = if opts.dry_run {
            None
        } else {
            Some(
                self.db
                    .start_run(SyncOp::Pull, account, folder, total as i64)
                    .await?,
            )
        };

        let mut summary = PullSummary {
            folder: folder.to_string(),
            found: total,
            dry_run: opts.dry_run,
            ..Default::default()
        };
        let mut consecutive_errors = 0usize;

        for uid in uids {
            let info = match client.fetch_headers(uid).await {
                Ok(info) => info,
                Err(e) => {
                    self.note_failure(
                        opts, account, folder, uidvalidity, uid, None, &e, run_id,
                        &mut failures, &mut summary, &mut consecutive_errors,
                    )
                    .await?;
                    if !e.is_transient() {
                        self.abort_run(run_id, RunStatus::Failed, &e.to_string()).await?;
                        config::save_failures(&self.root, account, folder, &failures)?;
                        return Err(AppError::Imap(e));
                    }
                    if consecutive_errors >= opts.max_errors {
                        summary.aborted = true;
                        break;
                    }
                    continue;
                }
            };

            let subject = truncate(&info.subject, 60);

            if opts.dry_run {
                debug!(uid, subject = %subject, "would migrate");
                summary.fetched += 1;
                continue;
            }

            match client.fetch_raw(uid).await {
                Ok(raw) => {
                    if let Err(e) = self
                        .store_message(
                            opts, account, folder, uidvalidity, uid, &info, &raw, run_id,
                            &mut summary,
                        )
                        .await
                    {
                        // Disk-side failure: counted like a fetch failure.
                        let err = ImapError::transient(format!("{e:#}"));
                        self.note_failure(
                            opts, account, folder, uidvalidity, uid, Some(&info), &err, run_id,
                            &mut failures, &mut summary, &mut consecutive_errors,
                        )
                        .await?;
                    } else {
                        failures.remove(&uid);
                        consecutive_errors = 0;
                    }
                }
                Err(e) => {
                    self.note_failure(
                        opts, account, folder, uidvalidity, uid, Some(&info), &e, run_id,
                        &mut failures, &mut summary, &mut consecutive_errors,
                    )
                    .await?;
                    if !e.is_transient() {
                        self.abort_run(run_id, RunStatus::Failed, &e.to_string()).await?;
                        config::save_failures(&self.root, account, folder, &failures)?;
                        return Err(AppError::Imap(e));
                    }
                }
            }

            if let Some(status) = status.as_mut() {
                status.update(
                    summary.fetched + summary.skipped + summary.failed,
                    summary.skipped,
                    summary.failed,
                    Some(&subject),
                )?;
            }
            if let Some(run_id) = run_id {
                let done = (summary.fetched + summary.skipped + summary.failed) as usize;
                if opts.checkpoint > 0 && done % opts.checkpoint == 0 {
                    self.db
                        .update_run(
                            run_id,
                            summary.fetched as i64,
                            summary.skipped as i64,
                            summary.failed as i64,
                        )
                        .await?;
                }
            }

            if consecutive_errors >= opts.max_errors {
                warn!(
                    consecutive_errors,
                    "aborting: consecutive error threshold reached (likely rate limited)"
                );
                summary.aborted = true;
                break;
            }
        }

        if let Some(run_id) = run_id {
            self.db
                .update_run(
                    run_id,
                    summary.fetched as i64,
                    summary.skipped as i64,
                    summary.failed as i64,
                )
                .await?;
            let (status_final, error) = if summary.aborted {
                (
                    RunStatus::Aborted,
                    Some(format!("{consecutive_errors} consecutive errors (rate limited)")),
                )
            } else {
                (RunStatus::Completed, None)
            };
            self.db.end_run(run_id, status_final, error.as_deref()).await?;
        }

        if !opts.dry_run {
            config::save_failures(&self.root, account, folder, &failures)?;
            if !failures.is_empty() {
                summary.failures_path = Some(config::failures_path(&self.root, account, folder));
            }
            config::set_folder_sync_state(&self.root, account, folder, uidvalidity, server_count)?;

            summary.total_in_store = self.layout.count(None).await?;
            summary.tracked = self
                .db
                .get_pulled_count(account, folder, Some(uidvalidity))
                .await?;
        }

        Ok(summary)
    }

    /// Decide which UIDs this run will attempt. `None` means a retry run
    /// found nothing to retry.
    #[allow(clippy::too_many_arguments)]
    async fn plan_candidates(
        &mut self,
        client: &mut ImapClient,
        opts: &PullOptions,
        account: &str,
        folder: &str,
        uidvalidity: u32,
        pulled: &std::collections::HashSet<u32>,
        failures: &BTreeMap<u32, PullFailure>,
    ) -> AppResult<Option<Vec<u32>>> {
        if opts.retry {
            if failures.is_empty() {
                info!(account, folder, "no failures to retry");
                return Ok(None);
            }
            let uids: Vec<u32> = failures.keys().copied().collect();
            info!(account, folder, retrying = uids.len(), "retry plan");
            return Ok(Some(uids));
        }

        // A filtered pull searches with the expanded query instead of ALL.
        // The result is a subset of the folder, so it never feeds the
        // server-UID cache.
        if !opts.filters.is_empty() {
            let query = opts.filters.build_imap_query();
            info!(account, folder, query = %query, "filtered UID search");
            let server_uids = client.uid_search(&query).await?;
            if !opts.dry_run {
                // These are genuine server UIDs, just not the full folder
                // listing, so the folder snapshot (and its TTL) stays put.
                let batch: Vec<(u32, Option<String>)> =
                    server_uids.iter().map(|&uid| (uid, None)).collect();
                self.db
                    .record_server_uids(account, folder, uidvalidity, &batch)
                    .await?;
            }
            let uids = if opts.full {
                server_uids
            } else {
                server_uids
                    .into_iter()
                    .filter(|uid| !pulled.contains(uid))
                    .collect()
            };
            return Ok(Some(uids));
        }

        // Fresh cached server UIDs let us skip the (slow) UID SEARCH ALL.
        if !opts.full && opts.cache_ttl > 0 {
            let cached = self.db.get_server_uids(account, folder, uidvalidity).await?;
            if !cached.is_empty() {
                if let Some((_, _, last_checked)) =
                    self.db.get_server_folder(account, folder).await?
                {
                    if cache_is_fresh(&last_checked, opts.cache_ttl) {
                        let mut unpulled: Vec<u32> =
                            cached.difference(pulled).copied().collect();
                        unpulled.sort_unstable();
                        info!(
                            account,
                            folder,
                            cached = cached.len(),
                            unpulled = unpulled.len(),
                            "using cached server UIDs"
                        );
                        return Ok(Some(unpulled));
                    }
                    debug!(account, folder, "UID cache expired");
                }
            }
        }

        info!(account, folder, "fetching UID list from server");
        let server_uids = client.uid_search("ALL").await?;
        info!(account, folder, server = server_uids.len(), "server UID list loaded");

        if !opts.dry_run {
            let batch: Vec<(u32, Option<String>)> =
                server_uids.iter().map(|&uid| (uid, None)).collect();
            self.db
                .record_server_uids(account, folder, uidvalidity, &batch)
                .await?;
            self.db
                .record_server_folder(account, folder, uidvalidity, server_uids.len() as u32)
                .await?;
        }

        let uids = if opts.full {
            server_uids
        } else {
            server_uids
                .into_iter()
                .filter(|uid| !pulled.contains(uid))
                .collect()
        };
        Ok(Some(uids))
    }

    /// Dedup-or-store one fetched message and record the pull.
    #[allow(clippy::too_many_arguments)]
    async fn store_message(
        &mut self,
        opts: &PullOptions,
        account: &str,
        folder: &str,
        uidvalidity: u32,
        uid: u32,
        info: &HeaderInfo,
        raw: &[u8],
        run_id: Option<i64>,
        summary: &mut PullSummary,
    ) -> Result<()> {
        let hash = content_hash(raw);

        let existing = self.layout.path_by_content(raw).await?;
        let (status, local_path) = match existing {
            Some(existing_path) => {
                debug!(uid, path = %existing_path, "duplicate content, skipping write");
                summary.skipped += 1;
                (PullStatus::Skipped, Some(existing_path))
            }
            None => {
                let path = self
                    .layout
                    .add_message(
                        info.message_id.as_deref().unwrap_or(""),
                        raw,
                        folder,
                        info.date,
                        &info.from_addr,
                        &info.to_addr,
                        &info.cc_addr,
                        &info.subject,
                        Some(uid),
                        opts.tag.as_deref(),
                    )
                    .await?;
                if self.layout.is_tree() {
                    self.index.index_file(&path).await?;
                }
                summary.fetched += 1;
                let rel = path
                    .strip_prefix(&self.root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .to_string();
                (PullStatus::New, Some(rel))
            }
        };

        let body_text = extract_body_text(raw);
        let record = PulledRecord {
            account: account.to_string(),
            folder: folder.to_string(),
            uidvalidity,
            uid,
            content_hash: hash,
            message_id: info.message_id.clone(),
            local_path,
            pulled_at: String::new(),
            subject: Some(info.subject.clone()),
            msg_date: info.date.map(|d| d.to_rfc3339()),
            status: Some(status),
            sync_run_id: run_id,
            error: None,
            in_reply_to: info.in_reply_to.clone(),
            references: info.references.clone(),
            from_addr: Some(info.from_addr.clone()),
            to_addr: Some(info.to_addr.clone()),
        };
        self.db
            .record_pull(&record, Some(&body_text))
            .await
            .context("recording pull")?;

        Ok(())
    }

    /// Count a per-message failure: failed pull record plus failure-log
    /// entry, both skipped for dry runs.
    #[allow(clippy::too_many_arguments)]
    async fn note_failure(
        &mut self,
        opts: &PullOptions,
        account: &str,
        folder: &str,
        uidvalidity: u32,
        uid: u32,
        info: Option<&HeaderInfo>,
        error: &ImapError,
        run_id: Option<i64>,
        failures: &mut BTreeMap<u32, PullFailure>,
        summary: &mut PullSummary,
        consecutive_errors: &mut usize,
    ) -> Result<()> {
        summary.failed += 1;
        *consecutive_errors += 1;
        let subject = info.map(|i| truncate(&i.subject, 60)).unwrap_or_default();
        if summary.errors.len() < 10 {
            summary.errors.push(if subject.is_empty() {
                format!("UID {uid}: {error}")
            } else {
                format!("UID {uid} ({subject}): {error}")
            });
        }
        warn!(uid, error = %error, "message pull failed");

        if opts.dry_run {
            return Ok(());
        }

        failures.insert(
            uid,
            PullFailure {
                error: error.to_string(),
                timestamp: Some(now_iso()),
            },
        );

        let record = PulledRecord {
            account: account.to_string(),
            folder: folder.to_string(),
            uidvalidity,
            uid,
            content_hash: String::new(),
            message_id: info.and_then(|i| i.message_id.clone()),
            local_path: None,
            pulled_at: String::new(),
            subject: info.map(|i| i.subject.clone()),
            msg_date: info.and_then(|i| i.date).map(|d| d.to_rfc3339()),
            status: Some(PullStatus::Failed),
            sync_run_id: run_id,
            error: Some(error.to_string()),
            in_reply_to: None,
            references: None,
            from_addr: None,
            to_addr: None,
        };
        self.db
            .record_pull(&record, None)
            .await
            .context("recording failed pull")?;
        Ok(())
    }

    async fn abort_run(
        &self,
        run_id: Option<i64>,
        status: RunStatus,
        error: &str,
    ) -> Result<()> {
        if let Some(run_id) = run_id {
            self.db.end_run(run_id, status, Some(error)).await?;
        }
        Ok(())
    }
}

fn cache_is_fresh(last_checked: &str, ttl_minutes: i64) -> bool {
    let Ok(checked) =
        chrono::NaiveDateTime::parse_from_str(last_checked, "%Y-%m-%dT%H:%M:%S")
    else {
        return false;
    };
    let age = chrono::Utc::now().naive_utc() - checked;
    age.num_minutes() < ttl_minutes
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_freshness_uses_ttl() {
        let recent = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        assert!(cache_is_fresh(&recent, 60));

        let old = (chrono::Utc::now() - chrono::Duration::minutes(120))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();
        assert!(!cache_is_fresh(&old, 60));
        assert!(cache_is_fresh(&old, 600));
        assert!(!cache_is_fresh("garbage", 60));
    }
}
