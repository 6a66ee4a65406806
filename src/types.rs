use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Gmail,
    Zoho,
    Generic,
}

impl AccountKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "gmail" => Some(Self::Gmail),
            "zoho" => Some(Self::Zoho),
            "generic" | "imap" => Some(Self::Generic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Zoho => "zoho",
            Self::Generic => "generic",
        }
    }

    /// Default source folder when none is given on the command line.
    pub fn default_folder(&self) -> &'static str {
        match self {
            Self::Gmail => "[Gmail]/All Mail",
            _ => "INBOX",
        }
    }
}

/// An IMAP account as configured in `.eml/config.yaml`. Immutable during a
/// sync run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AccountKind,
    pub user: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default = "default_imap_port", skip_serializing_if = "is_default_port")]
    pub port: u16,
}

pub fn default_imap_port() -> u16 {
    993
}

fn is_default_port(port: &u16) -> bool {
    *port == 993
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PullStatus {
    New,
    Skipped,
    Failed,
}

impl PullStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "new" => Some(Self::New),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One row of `pulled_messages`: the authoritative record that a UID was
/// fetched (or failed) within its `(account, folder, uidvalidity)` epoch.
#[derive(Clone, Debug)]
pub struct PulledRecord {
    pub account: String,
    pub folder: String,
    pub uidvalidity: u32,
    pub uid: u32,
    pub content_hash: String,
    pub message_id: Option<String>,
    pub local_path: Option<String>,
    pub pulled_at: String,
    pub subject: Option<String>,
    pub msg_date: Option<String>,
    pub status: Option<PullStatus>,
    pub sync_run_id: Option<i64>,
    pub error: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub from_addr: Option<String>,
    pub to_addr: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOp {
    Pull,
    Push,
}

impl SyncOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        }
    }
}

/// One invocation of the pull or push engine.
#[derive(Clone, Debug)]
pub struct SyncRun {
    pub id: i64,
    pub operation: String,
    pub account: String,
    pub folder: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub status: String,
    pub total: i64,
    pub fetched: i64,
    pub skipped: i64,
    pub failed: i64,
    pub error: Option<String>,
}

/// A recently pulled message, as shown by the external status reader.
#[derive(Clone, Debug)]
pub struct RecentPull {
    pub uid: u32,
    pub folder: String,
    pub local_path: Option<String>,
    pub pulled_at: String,
    pub subject: Option<String>,
    pub msg_date: Option<String>,
    pub status: Option<String>,
}

/// One `.eml` file as seen by the File Index.
#[derive(Clone, Debug)]
pub struct IndexedFile {
    pub path: String,
    pub content_hash: String,
    pub message_id: Option<String>,
    pub date: Option<String>,
    pub from_addr: String,
    pub to_addr: String,
    pub subject: String,
    pub size: i64,
    pub mtime: f64,
}

/// A message read back out of a storage layout.
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub message_id: String,
    pub raw: Vec<u8>,
    pub folder: String,
    pub date: Option<DateTime<Utc>>,
    pub from_addr: String,
    pub to_addr: String,
    pub cc_addr: String,
    pub subject: String,
    pub path: Option<String>,
}

/// A failed pull attempt for a UID, persisted in the failure log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PullFailure {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}
