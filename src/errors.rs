use thiserror::Error;

use crate::imap::ImapError;

pub type AppResult<T> = Result<T, AppError>;

/// Top-level failure classes. Everything inside the fetch/push loops is
/// counted per-message and never surfaces here; these are the errors that
/// abort a command.
#[derive(Error, Debug)]
pub enum AppError {
    /// Bad account, missing credential, unknown layout. Exit code 1.
    #[error("{0}")]
    Config(String),

    /// Another pull/push holds the working-tree lock. Exit code 2.
    #[error("{0}")]
    Concurrency(String),

    #[error(transparent)]
    Imap(#[from] ImapError),

    /// Disk full, permission denied, unwritable store.
    #[error("write failed: {0}")]
    Write(#[from] std::io::Error),

    /// Corrupt database that could not be rebuilt.
    #[error("schema error: {0}")]
    Schema(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 1,
            AppError::Concurrency(_) => 2,
            _ => 3,
        }
    }
}
