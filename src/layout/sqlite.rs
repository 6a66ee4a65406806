//! SQLite layout: messages stored as blobs in `.eml/msgs.db`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::types::StoredMessage;

use super::path_template::content_hash;

pub const MSGS_DB: &str = "msgs.db";

pub struct SqliteLayout {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl SqliteLayout {
    pub async fn open(root: &Path) -> Result<Self> {
        let db_path = root.join(".eml").join(MSGS_DB);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("connecting to sqlite at {}", db_path.display()))?;

        let layout = Self { pool, db_path };
        layout.migrate().await?;
        Ok(layout)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode = WAL;")
            .execute(&self.pool)
            .await
            .context("enabling WAL")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY,
                message_id TEXT UNIQUE NOT NULL,
                folder TEXT NOT NULL,
                date TEXT,
                from_addr TEXT,
                to_addr TEXT,
                cc_addr TEXT,
                subject TEXT,
                raw BLOB NOT NULL,
                content_hash TEXT NOT NULL,
                source_uid TEXT,
                tags TEXT,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_messages_folder ON messages(folder);
            CREATE INDEX IF NOT EXISTS idx_messages_date ON messages(date);
            CREATE INDEX IF NOT EXISTS idx_messages_hash ON messages(content_hash);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("running msgs.db migrations")?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_message(
        &self,
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
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO messages
                (message_id, folder, date, from_addr, to_addr, cc_addr, subject, raw, content_hash, source_uid, tags)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11);
            "#,
        )
        .bind(message_id)
        .bind(folder)
        .bind(date.map(|d| d.to_rfc3339()))
        .bind(from_addr)
        .bind(to_addr)
        .bind(cc_addr)
        .bind(subject)
        .bind(raw)
        .bind(content_hash(raw))
        .bind(source_uid.map(|u| u.to_string()))
        .bind(tag)
        .execute(&self.pool)
        .await
        .context("inserting message blob")?;

        Ok(self.db_path.clone())
    }

    pub async fn has_message(&self, message_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM messages WHERE message_id = ?1 LIMIT 1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .context("checking message_id")?;
        Ok(row.is_some())
    }

    /// The dedup hook: any row with the same content hash means the bytes
    /// are already stored. The "path" of a sqlite-stored message is the db
    /// file itself, relative to the working tree.
    pub async fn path_by_content(&self, raw: &[u8]) -> Result<Option<String>> {
        let row = sqlx::query("SELECT 1 FROM messages WHERE content_hash = ?1 LIMIT 1")
            .bind(content_hash(raw))
            .fetch_optional(&self.pool)
            .await
            .context("checking content hash")?;
        Ok(row.is_some().then(|| format!(".eml/{MSGS_DB}")))
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            r#"
            SELECT message_id, folder, date, from_addr, to_addr, cc_addr, subject, raw
            FROM messages
            WHERE message_id = ?1;
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading message")?;

        Ok(row.map(|row| row_to_message(&row)))
    }

    pub async fn iter_messages(
        &self,
        folder: Option<&str>,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
        tag: Option<&str>,
    ) -> Result<Vec<StoredMessage>> {
        let mut query = String::from(
            "SELECT message_id, folder, date, from_addr, to_addr, cc_addr, subject, raw, tags \
             FROM messages WHERE 1=1",
        );
        if folder.is_some() {
            query.push_str(" AND folder = ?1");
        }
        query.push_str(" ORDER BY date ASC");

        let mut q = sqlx::query(&query);
        if let Some(folder) = folder {
            q = q.bind(folder);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .context("listing messages")?;

        let mut out = Vec::new();
        for row in rows {
            if let Some(tag) = tag {
                let tags = row.get::<Option<String>, _>(8).unwrap_or_default();
                if !tags.split(',').any(|t| t.trim() == tag) {
                    continue;
                }
            }
            let msg = row_to_message(&row);
            if let Some(date) = msg.date {
                if start_date.is_some_and(|s| date < s) || end_date.is_some_and(|e| date > e) {
                    continue;
                }
            }
            out.push(msg);
        }
        Ok(out)
    }

    pub async fn count(&self, folder: Option<&str>) -> Result<i64> {
        let row = if let Some(folder) = folder {
            sqlx::query("SELECT COUNT(*) FROM messages WHERE folder = ?1")
                .bind(folder)
                .fetch_one(&self.pool)
                .await
        } else {
            sqlx::query("SELECT COUNT(*) FROM messages")
                .fetch_one(&self.pool)
                .await
        }
        .context("counting messages")?;
        Ok(row.get::<i64, _>(0))
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> StoredMessage {
    let date = row
        .get::<Option<String>, _>(2)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|d| d.with_timezone(&Utc));
    StoredMessage {
        message_id: row.get(0),
        folder: row.get(1),
        date,
        from_addr: row.get::<Option<String>, _>(3).unwrap_or_default(),
        to_addr: row.get::<Option<String>, _>(4).unwrap_or_default(),
        cc_addr: row.get::<Option<String>, _>(5).unwrap_or_default(),
        subject: row.get::<Option<String>, _>(6).unwrap_or_default(),
        raw: row.get::<Vec<u8>, _>(7),
        path: Some(format!(".eml/{MSGS_DB}")),
    }
}
