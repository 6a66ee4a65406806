//! Working-tree discovery and the YAML-backed state files.
//!
//! Everything lives under `<root>/.eml/`: the project config, per-account
//! failure logs (sorted by UID for stable diffs), push manifests (sorted
//! Message-ID text files), and the human-readable sync-state mirror.

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::{now_iso, Account, PullFailure};

pub const EML_DIR: &str = ".eml";
pub const CONFIG_FILE: &str = "config.yaml";
pub const FAILURES_DIR: &str = "failures";
pub const PUSHED_DIR: &str = "pushed";
pub const SYNC_STATE_DIR: &str = "sync-state";

const ROOT_ENV: &str = "MAILSTASH_ROOT";

/// Top-level project configuration, read from `.eml/config.yaml`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmlConfig {
    #[serde(default = "default_layout")]
    pub layout: String,
    #[serde(default)]
    pub accounts: BTreeMap<String, Account>,
}

fn default_layout() -> String {
    "default".to_string()
}

impl Default for EmlConfig {
    fn default() -> Self {
        Self {
            layout: default_layout(),
            accounts: BTreeMap::new(),
        }
    }
}

/// Find the working tree root: `MAILSTASH_ROOT` if it points at a tree
/// containing `.eml/`, else the nearest ancestor of `start` that does.
pub fn find_root(start: Option<&Path>) -> Option<PathBuf> {
    if let Ok(env_root) = env::var(ROOT_ENV) {
        let env_path = PathBuf::from(env_root);
        if env_path.join(EML_DIR).is_dir() {
            return Some(env_path);
        }
    }

    let start = match start {
        Some(path) => path.to_path_buf(),
        None => env::current_dir().ok()?,
    };
    let mut path = start.as_path();
    loop {
        if path.join(EML_DIR).is_dir() {
            return Some(path.to_path_buf());
        }
        path = path.parent()?;
    }
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(EML_DIR).join(CONFIG_FILE)
}

pub fn has_config(root: &Path) -> bool {
    config_path(root).exists()
}

pub fn load_config(root: &Path) -> Result<EmlConfig> {
    let path = config_path(root);
    if !path.exists() {
        return Ok(EmlConfig::default());
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut config: EmlConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    for (name, account) in config.accounts.iter_mut() {
        account.name = name.clone();
    }
    Ok(config)
}

pub fn save_config(root: &Path, config: &EmlConfig) -> Result<()> {
    let path = config_path(root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let raw = serde_yaml::to_string(config).context("serializing config")?;
    fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub fn get_account(root: &Path, name: &str) -> Result<Option<Account>> {
    Ok(load_config(root)?.accounts.get(name).cloned())
}

fn safe_name(name: &str) -> String {
    name.replace('/', "_")
}

// -------------------------------------------------------------------------
// Failure log: uid -> {error, timestamp}, retriable, removed on success
// -------------------------------------------------------------------------

pub fn failures_path(root: &Path, account: &str, folder: &str) -> PathBuf {
    root.join(EML_DIR)
        .join(FAILURES_DIR)
        .join(format!("{}_{}.yaml", safe_name(account), safe_name(folder)))
}

pub fn load_failures(root: &Path, account: &str, folder: &str) -> Result<BTreeMap<u32, PullFailure>> {
    let path = failures_path(root, account, folder);
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Persist the failure map sorted by UID; an empty map removes the file.
pub fn save_failures(
    root: &Path,
    account: &str,
    folder: &str,
    failures: &BTreeMap<u32, PullFailure>,
) -> Result<()> {
    let path = failures_path(root, account, folder);
    if failures.is_empty() {
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        }
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let raw = serde_yaml::to_string(failures).context("serializing failures")?;
    fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

// -------------------------------------------------------------------------
// Push manifest: sorted Message-ID set + append-only upload log
// -------------------------------------------------------------------------

pub fn pushed_path(root: &Path, account: &str) -> PathBuf {
    root.join(EML_DIR)
        .join(PUSHED_DIR)
        .join(format!("{}.txt", safe_name(account)))
}

fn pushed_log_path(root: &Path, account: &str) -> PathBuf {
    root.join(EML_DIR)
        .join(PUSHED_DIR)
        .join(format!("{}.log", safe_name(account)))
}

pub fn load_pushed(root: &Path, account: &str) -> Result<HashSet<String>> {
    let path = pushed_path(root, account);
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Rewrite the whole manifest sorted. Safe because only one engine runs at
/// a time per working tree.
pub fn save_pushed(root: &Path, account: &str, message_ids: &HashSet<String>) -> Result<()> {
    let path = pushed_path(root, account);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut sorted: Vec<&String> = message_ids.iter().collect();
    sorted.sort();
    let mut out = String::new();
    for id in sorted {
        out.push_str(id);
        out.push('\n');
    }
    fs::write(&path, out).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub fn mark_pushed(root: &Path, account: &str, message_id: &str) -> Result<()> {
    let mut pushed = load_pushed(root, account)?;
    pushed.insert(message_id.to_string());
    save_pushed(root, account, &pushed)
}

/// Append to the upload log consumed by the "recently uploaded" view.
pub fn log_pushed(
    root: &Path,
    account: &str,
    message_id: &str,
    subject: &str,
    path: Option<&str>,
) -> Result<()> {
    use std::io::Write;

    let log_path = pushed_log_path(root, account);
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening {}", log_path.display()))?;
    writeln!(
        file,
        "{}\t{}\t{}\t{}\t{}",
        now_iso(),
        account,
        message_id,
        subject.replace(['\t', '\n'], " "),
        path.unwrap_or("")
    )
    .with_context(|| format!("appending to {}", log_path.display()))?;
    Ok(())
}

// -------------------------------------------------------------------------
// Sync-state mirror: folder -> {uidvalidity, message_count}
// -------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FolderSyncState {
    pub uidvalidity: u32,
    #[serde(default)]
    pub message_count: u32,
}

pub fn sync_state_path(root: &Path, account: &str) -> PathBuf {
    root.join(EML_DIR)
        .join(SYNC_STATE_DIR)
        .join(format!("{}.yaml", safe_name(account)))
}

pub fn load_sync_state(root: &Path, account: &str) -> Result<BTreeMap<String, FolderSyncState>> {
    let path = sync_state_path(root, account);
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub fn save_sync_state(
    root: &Path,
    account: &str,
    state: &BTreeMap<String, FolderSyncState>,
) -> Result<()> {
    let path = sync_state_path(root, account);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let raw = serde_yaml::to_string(state).context("serializing sync state")?;
    fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub fn set_folder_sync_state(
    root: &Path,
    account: &str,
    folder: &str,
    uidvalidity: u32,
    message_count: u32,
) -> Result<()> {
    let mut state = load_sync_state(root, account)?;
    state.insert(
        folder.to_string(),
        FolderSyncState {
            uidvalidity,
            message_count,
        },
    );
    save_sync_state(root, account, &state)
}
