//! Storage layouts: a closed set of two ways to hold message bytes.

pub mod path_template;
pub mod sqlite;
pub mod tree;

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::types::StoredMessage;

pub use path_template::{is_valid_layout, PathTemplate};
pub use sqlite::SqliteLayout;
pub use tree::TreeLayout;

/// The configured store: `.eml` files in a directory tree, or blobs in a
/// single SQLite file.
pub enum StorageLayout {
    Tree(TreeLayout),
    Sqlite(SqliteLayout),
}

impl StorageLayout {
    /// Open the layout named by the config (`"sqlite"` selects the blob
    /// store, anything else is a tree template or preset).
    pub async fn open(root: &Path, layout: &str) -> Result<Self> {
        if layout == "sqlite" {
            Ok(Self::Sqlite(SqliteLayout::open(root).await?))
        } else {
            Ok(Self::Tree(TreeLayout::new(root, layout)))
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, Self::Tree(_))
    }

    /// Relative path of an already-stored copy of these bytes, if any.
    pub async fn path_by_content(&mut self, raw: &[u8]) -> Result<Option<String>> {
        match self {
            Self::Tree(tree) => tree.path_by_content(raw),
            Self::Sqlite(db) => db.path_by_content(raw).await,
        }
    }

    pub async fn has_message(&mut self, message_id: &str) -> Result<bool> {
        match self {
            Self::Tree(tree) => tree.has_message(message_id),
            Self::Sqlite(db) => db.has_message(message_id).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_message(
        &mut self,
        message_id: &str,
        raw: &[u8],
        folder: &str,
        date: Option<DateTime<Utc>>,
        from_addr: &str,
        to_addr: &str,
        cc_addr: &str,
        subject: &str,
        source_uid: Option<u32>,
        tag: Option<&str>,
    ) -> Result<PathBuf> {
        match self {
            Self::Tree(tree) => {
                tree.add_message(message_id, raw, folder, date, from_addr, subject, source_uid)
            }
            Self::Sqlite(db) => {
                db.add_message(
                    message_id, raw, folder, date, from_addr, to_addr, cc_addr, subject,
                    source_uid, tag,
                )
                .await
            }
        }
    }

    pub async fn get_message(&mut self, message_id: &str) -> Result<Option<StoredMessage>> {
        match self {
            Self::Tree(tree) => tree.get_message(message_id),
            Self::Sqlite(db) => db.get_message(message_id).await,
        }
    }

    pub async fn iter_messages(
        &self,
        folder: Option<&str>,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
        tag: Option<&str>,
    ) -> Result<Vec<StoredMessage>> {
        match self {
            Self::Tree(tree) => tree.iter_messages(folder, start_date, end_date),
            Self::Sqlite(db) => db.iter_messages(folder, start_date, end_date, tag).await,
        }
    }

    pub async fn count(&self, folder: Option<&str>) -> Result<i64> {
        match self {
            Self::Tree(tree) => Ok(tree.count(folder)? as i64),
            Self::Sqlite(db) => db.count(folder).await,
        }
    }
}
