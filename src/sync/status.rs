//! Live progress file doubling as the per-working-tree operation lock.
//!
//! A single writer owns `.eml/sync-status.json` for the life of an engine
//! run. Acquisition fails when an existing file names a PID that is still
//! alive; readers (the status command, the external dashboard) tolerate
//! partial writes by treating unparseable content as "no sync running".

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::types::{now_iso, SyncOp};

pub const STATUS_FILE: &str = "sync-status.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncStatus {
    pub pid: u32,
    pub operation: String,
    pub account: String,
    pub folder: String,
    pub total: u64,
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_subject: Option<String>,
    pub started: String,
}

pub fn status_path(root: &Path) -> PathBuf {
    root.join(crate::config::EML_DIR).join(STATUS_FILE)
}

/// Read the current status, tolerating partial writes.
pub fn read_status(root: &Path) -> Option<SyncStatus> {
    let raw = fs::read_to_string(status_path(root)).ok()?;
    serde_json::from_str(&raw).ok()
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes existence without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

/// The lock holder. Dropping it removes the status file, so abnormal exits
/// through `?` still release the working tree.
#[derive(Debug)]
pub struct StatusWriter {
    path: PathBuf,
    status: SyncStatus,
}

impl StatusWriter {
    /// Take the working-tree lock, refusing if another live process holds
    /// it. A leftover file from a dead process is replaced.
    pub fn acquire(
        root: &Path,
        operation: SyncOp,
        account: &str,
        folder: &str,
        total: u64,
    ) -> AppResult<Self> {
        let path = status_path(root);

        if let Some(existing) = read_status(root) {
            if existing.pid != std::process::id() && pid_alive(existing.pid) {
                return Err(AppError::Concurrency(format!(
                    "Another {} is already running: {}/{} [PID {}]",
                    existing.operation, existing.account, existing.folder, existing.pid
                )));
            }
            warn!(pid = existing.pid, "replacing stale status file from dead process");
        }

        let status = SyncStatus {
            pid: std::process::id(),
            operation: operation.as_str().to_string(),
            account: account.to_string(),
            folder: folder.to_string(),
            total,
            completed: 0,
            skipped: 0,
            failed: 0,
            current_subject: None,
            started: now_iso(),
        };

        let writer = Self { path, status };
        writer.write()?;
        Ok(writer)
    }

    fn write(&self) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(&self.status).context("serializing status")?;
        fs::write(&self.path, raw)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }

    pub fn set_total(&mut self, total: u64) -> AppResult<()> {
        self.status.total = total;
        self.write()
    }

    pub fn update(
        &mut self,
        completed: u64,
        skipped: u64,
        failed: u64,
        current_subject: Option<&str>,
    ) -> AppResult<()> {
        self.status.completed = completed;
        self.status.skipped = skipped;
        self.status.failed = failed;
        self.status.current_subject = current_subject.map(str::to_string);
        self.write()
    }
}

impl Drop for StatusWriter {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(error = %e, path = %self.path.display(), "status file cleanup failed");
        }
    }
}
