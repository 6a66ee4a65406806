//! Content-addressed index of `.eml` files under the store root.
//!
//! Backs O(1) lookups by Message-ID or content hash, and records the
//! version-control HEAD it was built at so `update()` can re-index only
//! the files git says changed.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use rayon::prelude::*;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::layout::path_template::content_hash;
use crate::layout::tree::walk_eml_files;
use crate::parsing::HeaderInfo;
use crate::types::IndexedFile;

pub const INDEX_DB: &str = "index.db";

#[derive(Clone)]
pub struct FileIndex {
    pool: SqlitePool,
    root: PathBuf,
}

#[derive(Debug, Default)]
pub struct RebuildStats {
    pub indexed: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Default)]
pub struct UpdateStats {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl FileIndex {
    /// Open (creating if needed) `.eml/index.db` for the working tree.
    pub async fn open(root: &Path) -> Result<Self> {
        let eml_dir = root.join(".eml");
        std::fs::create_dir_all(&eml_dir)
            .with_context(|| format!("creating {}", eml_dir.display()))?;
        let db_path = eml_dir.join(INDEX_DB);
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("connecting to sqlite at {}", db_path.display()))?;

        let index = Self {
            pool,
            root: root.to_path_buf(),
        };
        index.migrate().await?;
        Ok(index)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode = WAL;")
            .execute(&self.pool)
            .await
            .context("enabling WAL")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                path TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL,
                message_id TEXT,
                date TEXT,
                from_addr TEXT,
                to_addr TEXT,
                subject TEXT,
                size INTEGER,
                mtime REAL,
                indexed_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_files_message_id ON files(message_id);
            CREATE INDEX IF NOT EXISTS idx_files_content_hash ON files(content_hash);
            CREATE INDEX IF NOT EXISTS idx_files_date ON files(date);

            CREATE TABLE IF NOT EXISTS index_meta (
                key TEXT PRIMARY KEY,
                value TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("running index.db migrations")?;

        Ok(())
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM index_meta WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("loading index meta")?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO index_meta (key, value) VALUES (?1, ?2)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .context("saving index meta")?;
        Ok(())
    }

    fn git_head(&self) -> Option<String> {
        let output = Command::new("git")
            .args(["-C"])
            .arg(&self.root)
            .args(["rev-parse", "HEAD"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn file_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await
            .context("counting indexed files")?;
        Ok(row.get::<i64, _>(0))
    }

    pub async fn get_by_message_id(&self, message_id: &str) -> Result<Option<IndexedFile>> {
        self.get_by("message_id", message_id).await
    }

    pub async fn get_by_content_hash(&self, sha: &str) -> Result<Option<IndexedFile>> {
        self.get_by("content_hash", sha).await
    }

    pub async fn get_by_path(&self, path: &str) -> Result<Option<IndexedFile>> {
        self.get_by("path", path).await
    }

    async fn get_by(&self, column: &str, value: &str) -> Result<Option<IndexedFile>> {
        let sql = format!(
            "SELECT path, content_hash, message_id, date, from_addr, to_addr, subject, size, mtime \
             FROM files WHERE {column} = ?1"
        );
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading file by {column}"))?;
        Ok(row.map(|r| row_to_file(&r)))
    }

    pub async fn all_message_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT message_id FROM files WHERE message_id IS NOT NULL")
            .fetch_all(&self.pool)
            .await
            .context("loading message ids")?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    pub async fn all_content_hashes(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT content_hash FROM files")
            .fetch_all(&self.pool)
            .await
            .context("loading content hashes")?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    /// `(path, message_id, content_hash)` for every indexed file; used to
    /// seed the tree layout's lookup maps.
    pub async fn all_entries(&self) -> Result<Vec<(String, Option<String>, String)>> {
        let rows = sqlx::query("SELECT path, message_id, content_hash FROM files")
            .fetch_all(&self.pool)
            .await
            .context("loading index entries")?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get(0), r.get(1), r.get(2)))
            .collect())
    }

    /// Index one file incrementally (called by the pull engine after each
    /// successful write).
    pub async fn index_file(&self, path: &Path) -> Result<bool> {
        let Some(entry) = read_file_entry(&self.root, path) else {
            return Ok(false);
        };
        self.upsert(&entry).await?;
        Ok(true)
    }

    pub async fn remove_file(&self, rel_path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM files WHERE path = ?1")
            .bind(rel_path)
            .execute(&self.pool)
            .await
            .context("removing indexed file")?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert(&self, entry: &IndexedFile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (path, content_hash, message_id, date, from_addr, to_addr, subject, size, mtime)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(path) DO UPDATE SET
                content_hash = excluded.content_hash,
                message_id = excluded.message_id,
                date = excluded.date,
                from_addr = excluded.from_addr,
                to_addr = excluded.to_addr,
                subject = excluded.subject,
                size = excluded.size,
                mtime = excluded.mtime,
                indexed_at = CURRENT_TIMESTAMP;
            "#,
        )
        .bind(&entry.path)
        .bind(&entry.content_hash)
        .bind(&entry.message_id)
        .bind(&entry.date)
        .bind(&entry.from_addr)
        .bind(&entry.to_addr)
        .bind(&entry.subject)
        .bind(entry.size)
        .bind(entry.mtime)
        .execute(&self.pool)
        .await
        .context("upserting indexed file")?;
        Ok(())
    }

    /// Full rebuild: walk the store root, parse every `.eml` in parallel,
    /// replace the table contents.
    pub async fn rebuild(&self) -> Result<RebuildStats> {
        sqlx::query("DELETE FROM files")
            .execute(&self.pool)
            .await
            .context("clearing files table")?;

        let root = self.root.clone();
        let paths = walk_eml_files(&root)?;
        let total = paths.len();

        // Parsing thousands of messages is CPU-bound; fan out on rayon
        // inside a blocking task, write from this single task.
        let entries: Vec<Option<IndexedFile>> = tokio::task::spawn_blocking(move || {
            paths
                .par_iter()
                .map(|path| read_file_entry(&root, path))
                .collect()
        })
        .await
        .context("index rebuild task panicked")?;

        let mut stats = RebuildStats::default();
        let mut tx = self.pool.begin().await.context("beginning rebuild tx")?;
        for entry in entries.into_iter() {
            let Some(entry) = entry else {
                stats.errors += 1;
                continue;
            };
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO files
                    (path, content_hash, message_id, date, from_addr, to_addr, subject, size, mtime)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9);
                "#,
            )
            .bind(&entry.path)
            .bind(&entry.content_hash)
            .bind(&entry.message_id)
            .bind(&entry.date)
            .bind(&entry.from_addr)
            .bind(&entry.to_addr)
            .bind(&entry.subject)
            .bind(entry.size)
            .bind(entry.mtime)
            .execute(&mut *tx)
            .await
            .context("inserting indexed file")?;
            stats.indexed += 1;
        }
        tx.commit().await.context("committing rebuild tx")?;

        if let Some(head) = self.git_head() {
            self.set_meta("git_sha", &head).await?;
        }
        self.set_meta("file_count", &stats.indexed.to_string())
            .await?;

        info!(total, indexed = stats.indexed, errors = stats.errors, "file index rebuilt");
        Ok(stats)
    }

    /// Incremental update: ask git which `.eml` files changed between the
    /// recorded HEAD and now (plus untracked), re-index only those. Falls
    /// back to a full rebuild when there is no baseline.
    pub async fn update(&self) -> Result<UpdateStats> {
        let Some(indexed_sha) = self.get_meta("git_sha").await? else {
            let stats = self.rebuild().await?;
            return Ok(UpdateStats {
                added: stats.indexed,
                ..Default::default()
            });
        };

        let diff = Command::new("git")
            .args(["-C"])
            .arg(&self.root)
            .args(["diff", "--name-status"])
            .arg(format!("{indexed_sha}..HEAD"))
            .args(["--", "*.eml"])
            .output();

        let diff = match diff {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).to_string()
            }
            _ => {
                debug!("git diff unavailable; rebuilding index");
                let stats = self.rebuild().await?;
                return Ok(UpdateStats {
                    added: stats.indexed,
                    ..Default::default()
                });
            }
        };

        let mut stats = UpdateStats::default();
        for line in diff.lines() {
            let mut parts = line.splitn(2, '\t');
            let (Some(status), Some(rel)) = (parts.next(), parts.next()) else {
                continue;
            };
            let full = self.root.join(rel);
            match status {
                "D" => {
                    if self.remove_file(rel).await? {
                        stats.deleted += 1;
                    }
                }
                "A" => {
                    if full.exists() && self.index_file(&full).await? {
                        stats.added += 1;
                    }
                }
                _ => {
                    if full.exists() && self.index_file(&full).await? {
                        stats.modified += 1;
                    }
                }
            }
        }

        // Untracked files are new too.
        if let Ok(output) = Command::new("git")
            .args(["-C"])
            .arg(&self.root)
            .args(["ls-files", "--others", "--exclude-standard", "*.eml"])
            .output()
        {
            if output.status.success() {
                for rel in String::from_utf8_lossy(&output.stdout).lines() {
                    if rel.is_empty() {
                        continue;
                    }
                    let full = self.root.join(rel);
                    if full.exists()
                        && self.get_by_path(rel).await?.is_none()
                        && self.index_file(&full).await?
                    {
                        stats.added += 1;
                    }
                }
            }
        }

        if let Some(head) = self.git_head() {
            self.set_meta("git_sha", &head).await?;
        }
        self.set_meta("file_count", &self.file_count().await?.to_string())
            .await?;

        info!(
            added = stats.added,
            modified = stats.modified,
            deleted = stats.deleted,
            "file index updated"
        );
        Ok(stats)
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*), COUNT(message_id), COALESCE(SUM(size), 0),
                   MIN(date), MAX(date)
            FROM files;
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("loading index stats")?;

        Ok(IndexStats {
            total_files: row.get(0),
            with_message_id: row.get(1),
            total_size: row.get(2),
            oldest_date: row.get(3),
            newest_date: row.get(4),
            git_sha: self.get_meta("git_sha").await?,
        })
    }
}

#[derive(Debug)]
pub struct IndexStats {
    pub total_files: i64,
    pub with_message_id: i64,
    pub total_size: i64,
    pub oldest_date: Option<String>,
    pub newest_date: Option<String>,
    pub git_sha: Option<String>,
}

fn row_to_file(row: &sqlx::sqlite::SqliteRow) -> IndexedFile {
    IndexedFile {
        path: row.get(0),
        content_hash: row.get(1),
        message_id: row.get(2),
        date: row.get(3),
        from_addr: row.get::<Option<String>, _>(4).unwrap_or_default(),
        to_addr: row.get::<Option<String>, _>(5).unwrap_or_default(),
        subject: row.get::<Option<String>, _>(6).unwrap_or_default(),
        size: row.get::<Option<i64>, _>(7).unwrap_or(0),
        mtime: row.get::<Option<f64>, _>(8).unwrap_or(0.0),
    }
}

fn read_file_entry(root: &Path, path: &Path) -> Option<IndexedFile> {
    let meta = std::fs::metadata(path).ok()?;
    let raw = std::fs::read(path).ok()?;
    let info = HeaderInfo::parse(&raw).ok()?;

    let rel = path.strip_prefix(root).unwrap_or(path);
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    Some(IndexedFile {
        path: rel.to_string_lossy().to_string(),
        content_hash: content_hash(&raw),
        message_id: info.message_id,
        date: info.date.map(|d| d.to_rfc3339()),
        from_addr: info.from_addr,
        to_addr: info.to_addr,
        subject: info.subject,
        size: meta.len() as i64,
        mtime,
    })
}
