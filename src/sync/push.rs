//! The push engine: replay the local store into a destination IMAP account,
//! gated by the per-destination manifest so repeated runs are idempotent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tracing::{debug, info, warn};

use crate::config;
use crate::errors::{AppError, AppResult};
use crate::imap::ImapClient;
use crate::layout::StorageLayout;
use crate::storage::UidDb;
use crate::types::{Account, RunStatus, StoredMessage, SyncOp};

use super::pull::STALE_RUN_MINUTES;
use super::status::StatusWriter;

#[derive(Clone, Debug)]
pub struct PushOptions {
    pub folder: String,
    pub dry_run: bool,
    pub limit: Option<usize>,
    /// Skip messages larger than this many MiB.
    pub max_size_mb: u64,
    /// Inter-message delay for rate-limit spreading.
    pub delay: Duration,
    pub max_errors: usize,
    pub tag: Option<String>,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            folder: "INBOX".to_string(),
            dry_run: false,
            limit: None,
            max_size_mb: 25,
            delay: Duration::ZERO,
            max_errors: 10,
            tag: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct PushSummary {
    pub total_in_store: usize,
    pub already_pushed: usize,
    pub to_push: usize,
    pub pushed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub aborted: bool,
    pub dry_run: bool,
    pub errors: Vec<String>,
}

pub struct PushEngine {
    root: PathBuf,
    account: Account,
    db: UidDb,
    layout: StorageLayout,
}

impl PushEngine {
    pub fn new(root: &Path, account: Account, db: UidDb, layout: StorageLayout) -> Self {
        Self {
            root: root.to_path_buf(),
            account,
            db,
            layout,
        }
    }

    pub async fn run(&mut self, opts: &PushOptions) -> AppResult<PushSummary> {
        let account_name = self.account.name.clone();

        let mut status = if opts.dry_run {
            None
        } else {
            Some(StatusWriter::acquire(
                &self.root,
                SyncOp::Push,
                &account_name,
                &opts.folder,
                0,
            )?)
        };

        self.db.sweep_stale_runs(STALE_RUN_MINUTES).await?;

        let pushed_set = config::load_pushed(&self.root, &account_name)?;
        let all_msgs = self
            .layout
            .iter_messages(None, None, None, opts.tag.as_deref())
            .await?;
        let total_in_store = all_msgs.len();

        // Messages without a real Message-ID (synthetic content-hash ids)
        // have no stable identity the manifest can gate on; they are
        // counted, never uploaded.
        let mut synthetic = 0usize;
        let mut unpushed: Vec<StoredMessage> = all_msgs
            .into_iter()
            .filter(|m| {
                if m.message_id.ends_with("@content-hash>") {
                    synthetic += 1;
                    return false;
                }
                !pushed_set.contains(&m.message_id)
            })
            .collect();
        if synthetic > 0 {
            warn!(count = synthetic, "messages without Message-ID excluded from push");
        }

        // Best-effort chronology on the destination: local date ascending,
        // path as the tie-break.
        unpushed.sort_by(|a, b| {
            let epoch = Utc.timestamp_opt(0, 0).unwrap();
            let ka = (a.date.unwrap_or(epoch), a.path.clone().unwrap_or_default());
            let kb = (b.date.unwrap_or(epoch), b.path.clone().unwrap_or_default());
            ka.cmp(&kb)
        });

        if let Some(limit) = opts.limit {
            unpushed.truncate(limit);
        }

        let mut summary = PushSummary {
            total_in_store,
            already_pushed: pushed_set.len(),
            to_push: unpushed.len(),
            dry_run: opts.dry_run,
            skipped: synthetic as u64,
            ..Default::default()
        };

        info!(
            account = %account_name,
            folder = %opts.folder,
            in_store = total_in_store,
            already_pushed = pushed_set.len(),
            to_push = unpushed.len(),
            "push plan ready"
        );

        if unpushed.is_empty() {
            return Ok(summary);
        }

        if let Some(status) = status.as_mut() {
            status.set_total(unpushed.len() as u64)?;
        }

        let mut client = ImapClient::for_account(&self.account)?;
        if !opts.dry_run {
            client
                .connect(&self.account.user, &self.account.password)
                .await?;
        }

        let run_id = if opts.dry_run {
            None
        } else {
            Some(
                self.db
                    .start_run(SyncOp::Push, &account_name, &opts.folder, unpushed.len() as i64)
                    .await?,
            )
        };

        let result = self
            .upload_loop(&mut client, opts, &account_name, unpushed, run_id, status, &mut summary)
            .await;

        if !opts.dry_run {
            client.disconnect().await;
        }

        if let Some(run_id) = run_id {
            self.db
                .update_run(
                    run_id,
                    summary.pushed as i64,
                    summary.skipped as i64,
                    summary.failed as i64,
                )
                .await?;
            let (run_status, error) = if summary.aborted {
                (RunStatus::Aborted, Some("consecutive errors (rate limited)"))
            } else if result.is_err() {
                (RunStatus::Failed, Some("fatal IMAP error"))
            } else {
                (RunStatus::Completed, None)
            };
            self.db.end_run(run_id, run_status, error).await?;
        }

        result?;
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_loop(
        &mut self,
        client: &mut ImapClient,
        opts: &PushOptions,
        account: &str,
        unpushed: Vec<StoredMessage>,
        _run_id: Option<i64>,
        mut status: Option<StatusWriter>,
        summary: &mut PushSummary,
    ) -> AppResult<()> {
        let max_size_bytes = opts.max_size_mb * 1024 * 1024;
        let mut consecutive_errors = 0usize;

        for msg in unpushed {
            let subject = truncate(&msg.subject, 60);

            if msg.raw.len() as u64 > max_size_bytes {
                debug!(
                    message_id = %msg.message_id,
                    size = msg.raw.len(),
                    "oversized message skipped"
                );
                summary.skipped += 1;
                continue;
            }

            if opts.dry_run {
                debug!(message_id = %msg.message_id, subject = %subject, "would push");
                summary.pushed += 1;
                continue;
            }

            match client.append(&opts.folder, &msg.raw, msg.date).await {
                Ok(()) => {
                    config::mark_pushed(&self.root, account, &msg.message_id)?;
                    config::log_pushed(
                        &self.root,
                        account,
                        &msg.message_id,
                        &msg.subject,
                        msg.path.as_deref(),
                    )?;
                    summary.pushed += 1;
                    consecutive_errors = 0;
                    debug!(message_id = %msg.message_id, "pushed");
                }
                Err(e) => {
                    summary.failed += 1;
                    consecutive_errors += 1;
                    if summary.errors.len() < 10 {
                        summary.errors.push(format!("{subject}: {e}"));
                    }
                    warn!(message_id = %msg.message_id, error = %e, "push failed");
                    if !e.is_transient() {
                        return Err(AppError::Imap(e));
                    }
                }
            }

            if let Some(status) = status.as_mut() {
                status.update(
                    summary.pushed + summary.failed + summary.skipped,
                    summary.skipped,
                    summary.failed,
                    Some(&subject),
                )?;
            }

            if !opts.delay.is_zero() {
                tokio::time::sleep(opts.delay).await;
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

        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
