//! The UID DB: authoritative tracker of which UIDs have been pulled.
//!
//! One SQLite file (`.eml/uids.db`, legacy name `pulls.db`) holding the
//! per-epoch pull records, the cached server UID snapshot, sync-run
//! bookkeeping, the FTS index, and thread-slug assignments. The critical
//! key columns are mirrored to `uids.parquet` for Git portability; all
//! other columns are regenerable from the `.eml` files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{info, warn};

use crate::types::{PullStatus, PulledRecord, RecentPull, RunStatus, SyncOp, SyncRun};

pub const UIDS_DB: &str = "uids.db";
pub const LEGACY_PULLS_DB: &str = "pulls.db";

fn now_sqlite() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

#[derive(Clone)]
pub struct UidDb {
    pool: SqlitePool,
    path: PathBuf,
}

impl UidDb {
    /// Open the UID DB under `.eml/`. Prefers `uids.db`; falls back to the
    /// legacy `pulls.db` filename when only that exists.
    pub async fn open(eml_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(eml_dir)
            .with_context(|| format!("creating {}", eml_dir.display()))?;

        let mut db_path = eml_dir.join(UIDS_DB);
        let legacy = eml_dir.join(LEGACY_PULLS_DB);
        if !db_path.exists() && legacy.exists() {
            info!(path = %legacy.display(), "using legacy pulls.db");
            db_path = legacy;
        }

        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("connecting to sqlite at {}", db_path.display()))?;

        let db = Self { pool, path: db_path };
        db.migrate().await?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode = WAL;")
            .execute(&self.pool)
            .await
            .context("enabling WAL")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation TEXT NOT NULL,
                account TEXT NOT NULL,
                folder TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                status TEXT NOT NULL DEFAULT 'running',
                total INTEGER DEFAULT 0,
                fetched INTEGER DEFAULT 0,
                skipped INTEGER DEFAULT 0,
                failed INTEGER DEFAULT 0,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sync_runs_started
                ON sync_runs(started_at DESC);
            CREATE INDEX IF NOT EXISTS idx_sync_runs_account_folder
                ON sync_runs(account, folder);

            CREATE TABLE IF NOT EXISTS pulled_messages (
                account TEXT NOT NULL,
                folder TEXT NOT NULL,
                uidvalidity INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                message_id TEXT,
                local_path TEXT,
                pulled_at TEXT NOT NULL,
                subject TEXT,
                msg_date TEXT,
                status TEXT,
                sync_run_id INTEGER,
                error_message TEXT,
                in_reply_to TEXT,
                references_ TEXT,
                from_addr TEXT,
                to_addr TEXT,
                PRIMARY KEY (account, folder, uidvalidity, uid)
            );
            CREATE INDEX IF NOT EXISTS idx_pulled_hash
                ON pulled_messages(content_hash);
            CREATE INDEX IF NOT EXISTS idx_pulled_message_id
                ON pulled_messages(message_id);
            CREATE INDEX IF NOT EXISTS idx_pulled_folder
                ON pulled_messages(account, folder);
            CREATE INDEX IF NOT EXISTS idx_pulled_at
                ON pulled_messages(pulled_at DESC);
            CREATE INDEX IF NOT EXISTS idx_pulled_in_reply_to
                ON pulled_messages(in_reply_to);

            CREATE TABLE IF NOT EXISTS server_uids (
                account TEXT NOT NULL,
                folder TEXT NOT NULL,
                uidvalidity INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                message_id TEXT,
                last_seen TEXT NOT NULL,
                PRIMARY KEY (account, folder, uidvalidity, uid)
            );
            CREATE INDEX IF NOT EXISTS idx_server_folder
                ON server_uids(account, folder, uidvalidity);

            CREATE TABLE IF NOT EXISTS server_folders (
                account TEXT NOT NULL,
                folder TEXT NOT NULL,
                uidvalidity INTEGER NOT NULL,
                message_count INTEGER,
                last_checked TEXT NOT NULL,
                PRIMARY KEY (account, folder)
            );

            CREATE TABLE IF NOT EXISTS thread_slugs (
                slug TEXT PRIMARY KEY,
                root_message_id TEXT NOT NULL UNIQUE
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("running uids.db migrations")?;

        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
                message_id,
                subject,
                body_text,
                from_addr,
                to_addr
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating FTS table")?;

        Ok(())
    }

    // ---------------------------------------------------------------------
    // Pull records
    // ---------------------------------------------------------------------

    /// Idempotent upsert of one pull outcome; also feeds the FTS index for
    /// non-failed pulls that carry a Message-ID.
    pub async fn record_pull(
        &self,
        record: &PulledRecord,
        body_text: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO pulled_messages
                (account, folder, uidvalidity, uid, content_hash, message_id, local_path,
                 pulled_at, subject, msg_date, status, sync_run_id, error_message,
                 in_reply_to, references_, from_addr, to_addr)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17);
            "#,
        )
        .bind(&record.account)
        .bind(&record.folder)
        .bind(record.uidvalidity as i64)
        .bind(record.uid as i64)
        .bind(&record.content_hash)
        .bind(&record.message_id)
        .bind(&record.local_path)
        .bind(if record.pulled_at.is_empty() {
            now_sqlite()
        } else {
            record.pulled_at.clone()
        })
        .bind(&record.subject)
        .bind(&record.msg_date)
        .bind(record.status.map(|s| s.as_str()))
        .bind(record.sync_run_id)
        .bind(&record.error)
        .bind(&record.in_reply_to)
        .bind(&record.references)
        .bind(&record.from_addr)
        .bind(&record.to_addr)
        .execute(&self.pool)
        .await
        .context("recording pull")?;

        if record.status != Some(PullStatus::Failed) {
            if let Some(message_id) = &record.message_id {
                self.insert_fts(
                    message_id,
                    record.subject.as_deref(),
                    body_text,
                    record.from_addr.as_deref(),
                    record.to_addr.as_deref(),
                )
                .await?;
            }
        }

        Ok(())
    }

    pub async fn get_pulled_uids(
        &self,
        account: &str,
        folder: &str,
        uidvalidity: u32,
    ) -> Result<HashSet<u32>> {
        let rows = sqlx::query(
            r#"
            SELECT uid FROM pulled_messages
            WHERE account = ?1 AND folder = ?2 AND uidvalidity = ?3;
            "#,
        )
        .bind(account)
        .bind(folder)
        .bind(uidvalidity as i64)
        .fetch_all(&self.pool)
        .await
        .context("loading pulled uids")?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<i64, _>(0) as u32)
            .collect())
    }

    pub async fn get_pulled_count(
        &self,
        account: &str,
        folder: &str,
        uidvalidity: Option<u32>,
    ) -> Result<i64> {
        let row = if let Some(v) = uidvalidity {
            sqlx::query(
                "SELECT COUNT(*) FROM pulled_messages WHERE account = ?1 AND folder = ?2 AND uidvalidity = ?3",
            )
            .bind(account)
            .bind(folder)
            .bind(v as i64)
            .fetch_one(&self.pool)
            .await
        } else {
            sqlx::query("SELECT COUNT(*) FROM pulled_messages WHERE account = ?1 AND folder = ?2")
                .bind(account)
                .bind(folder)
                .fetch_one(&self.pool)
                .await
        }
        .context("counting pulled messages")?;
        Ok(row.get::<i64, _>(0))
    }

    pub async fn has_content_hash(&self, content_hash: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM pulled_messages WHERE content_hash = ?1 LIMIT 1")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await
            .context("checking content hash")?;
        Ok(row.is_some())
    }

    /// The UIDVALIDITY on record for a folder. When epochs disagree (the
    /// folder was reset at some point), the most frequent value wins.
    pub async fn get_uidvalidity(&self, account: &str, folder: &str) -> Result<Option<u32>> {
        let row = sqlx::query(
            r#"
            SELECT uidvalidity, COUNT(*) as cnt FROM pulled_messages
            WHERE account = ?1 AND folder = ?2
            GROUP BY uidvalidity
            ORDER BY cnt DESC
            LIMIT 1;
            "#,
        )
        .bind(account)
        .bind(folder)
        .fetch_optional(&self.pool)
        .await
        .context("loading stored uidvalidity")?;

        Ok(row.map(|r| r.get::<i64, _>(0) as u32))
    }

    // ---------------------------------------------------------------------
    // Server UID cache
    // ---------------------------------------------------------------------

    pub async fn record_server_uids(
        &self,
        account: &str,
        folder: &str,
        uidvalidity: u32,
        uids: &[(u32, Option<String>)],
    ) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        let now = now_sqlite();
        let mut tx = self.pool.begin().await.context("beginning transaction")?;
        for (uid, message_id) in uids {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO server_uids
                    (account, folder, uidvalidity, uid, message_id, last_seen)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6);
                "#,
            )
            .bind(account)
            .bind(folder)
            .bind(uidvalidity as i64)
            .bind(*uid as i64)
            .bind(message_id)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .context("recording server uid")?;
        }
        tx.commit().await.context("committing server uid batch")?;
        Ok(())
    }

    pub async fn record_server_folder(
        &self,
        account: &str,
        folder: &str,
        uidvalidity: u32,
        message_count: u32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO server_folders
                (account, folder, uidvalidity, message_count, last_checked)
            VALUES (?1, ?2, ?3, ?4, ?5);
            "#,
        )
        .bind(account)
        .bind(folder)
        .bind(uidvalidity as i64)
        .bind(message_count as i64)
        .bind(now_sqlite())
        .execute(&self.pool)
        .await
        .context("recording server folder")?;
        Ok(())
    }

    /// `(uidvalidity, message_count, last_checked)` for a folder snapshot.
    pub async fn get_server_folder(
        &self,
        account: &str,
        folder: &str,
    ) -> Result<Option<(u32, i64, String)>> {
        let row = sqlx::query(
            "SELECT uidvalidity, message_count, last_checked FROM server_folders WHERE account = ?1 AND folder = ?2",
        )
        .bind(account)
        .bind(folder)
        .fetch_optional(&self.pool)
        .await
        .context("loading server folder")?;

        Ok(row.map(|r| {
            (
                r.get::<i64, _>(0) as u32,
                r.get::<Option<i64>, _>(1).unwrap_or(0),
                r.get::<String, _>(2),
            )
        }))
    }

    pub async fn get_server_uids(
        &self,
        account: &str,
        folder: &str,
        uidvalidity: u32,
    ) -> Result<HashSet<u32>> {
        let rows = sqlx::query(
            r#"
            SELECT uid FROM server_uids
            WHERE account = ?1 AND folder = ?2 AND uidvalidity = ?3;
            "#,
        )
        .bind(account)
        .bind(folder)
        .bind(uidvalidity as i64)
        .fetch_all(&self.pool)
        .await
        .context("loading server uids")?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<i64, _>(0) as u32)
            .collect())
    }

    /// Server UIDs with no pull record in the same epoch.
    pub async fn get_unpulled_uids(
        &self,
        account: &str,
        folder: &str,
        uidvalidity: u32,
    ) -> Result<HashSet<u32>> {
        let rows = sqlx::query(
            r#"
            SELECT s.uid FROM server_uids s
            LEFT JOIN pulled_messages p
                ON s.account = p.account
                AND s.folder = p.folder
                AND s.uidvalidity = p.uidvalidity
                AND s.uid = p.uid
            WHERE s.account = ?1 AND s.folder = ?2 AND s.uidvalidity = ?3
                AND p.uid IS NULL;
            "#,
        )
        .bind(account)
        .bind(folder)
        .bind(uidvalidity as i64)
        .fetch_all(&self.pool)
        .await
        .context("loading unpulled uids")?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<i64, _>(0) as u32)
            .collect())
    }

    pub async fn get_uids_without_message_id(
        &self,
        account: &str,
        folder: &str,
        uidvalidity: u32,
    ) -> Result<HashSet<u32>> {
        let rows = sqlx::query(
            r#"
            SELECT uid FROM server_uids
            WHERE account = ?1 AND folder = ?2 AND uidvalidity = ?3
                AND (message_id IS NULL OR message_id = '');
            "#,
        )
        .bind(account)
        .bind(folder)
        .bind(uidvalidity as i64)
        .fetch_all(&self.pool)
        .await
        .context("loading uids without message id")?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<i64, _>(0) as u32)
            .collect())
    }

    // ---------------------------------------------------------------------
    // Sync runs
    // ---------------------------------------------------------------------

    pub async fn start_run(
        &self,
        operation: SyncOp,
        account: &str,
        folder: &str,
        total: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_runs (operation, account, folder, started_at, status, total)
            VALUES (?1, ?2, ?3, ?4, 'running', ?5);
            "#,
        )
        .bind(operation.as_str())
        .bind(account)
        .bind(folder)
        .bind(now_sqlite())
        .bind(total)
        .execute(&self.pool)
        .await
        .context("starting sync run")?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update_run(
        &self,
        run_id: i64,
        fetched: i64,
        skipped: i64,
        failed: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sync_runs SET fetched = ?1, skipped = ?2, failed = ?3 WHERE id = ?4",
        )
        .bind(fetched)
        .bind(skipped)
        .bind(failed)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .context("updating sync run")?;
        Ok(())
    }

    pub async fn end_run(
        &self,
        run_id: i64,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sync_runs SET ended_at = ?1, status = ?2, error_message = ?3 WHERE id = ?4",
        )
        .bind(now_sqlite())
        .bind(status.as_str())
        .bind(error)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .context("ending sync run")?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<SyncRun>> {
        let row = sqlx::query(
            r#"
            SELECT id, operation, account, folder, started_at, ended_at,
                   status, total, fetched, skipped, failed, error_message
            FROM sync_runs WHERE id = ?1;
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading sync run")?;

        Ok(row.map(|r| row_to_run(&r)))
    }

    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query(
            r#"
            SELECT id, operation, account, folder, started_at, ended_at,
                   status, total, fetched, skipped, failed, error_message
            FROM sync_runs
            ORDER BY started_at DESC
            LIMIT ?1;
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("loading recent sync runs")?;

        Ok(rows.iter().map(row_to_run).collect())
    }

    /// Runs still marked `running` after `max_age_minutes` were orphaned by
    /// a dead process; sweep them to `aborted`.
    pub async fn sweep_stale_runs(&self, max_age_minutes: i64) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::minutes(max_age_minutes))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();
        let result = sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = 'aborted', ended_at = ?1, error_message = 'Marked as stale (no completion)'
            WHERE status = 'running' AND started_at < ?2;
            "#,
        )
        .bind(now_sqlite())
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("sweeping stale runs")?;

        let swept = result.rows_affected();
        if swept > 0 {
            warn!(swept, "stale running sync runs marked aborted");
        }
        Ok(swept)
    }

    // ---------------------------------------------------------------------
    // Analytics for the external status reader
    // ---------------------------------------------------------------------

    pub async fn get_recent_pulls(
        &self,
        limit: i64,
        account: Option<&str>,
        folder: Option<&str>,
        with_path_only: bool,
    ) -> Result<Vec<RecentPull>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT uid, folder, local_path, pulled_at, subject, msg_date, status \
             FROM pulled_messages WHERE 1=1",
        );
        if let Some(account) = account {
            qb.push(" AND account = ");
            qb.push_bind(account);
        }
        if let Some(folder) = folder {
            qb.push(" AND folder = ");
            qb.push_bind(folder);
        }
        if with_path_only {
            qb.push(" AND local_path IS NOT NULL");
        }
        qb.push(" ORDER BY pulled_at DESC LIMIT ");
        qb.push_bind(limit);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("loading recent pulls")?;

        Ok(rows
            .into_iter()
            .map(|row| RecentPull {
                uid: row.get::<i64, _>(0) as u32,
                folder: row.get(1),
                local_path: row.get(2),
                pulled_at: row.get(3),
                subject: row.get(4),
                msg_date: row.get(5),
                status: row.get(6),
            })
            .collect())
    }

    pub async fn get_pulls_by_hour(
        &self,
        limit_hours: i64,
        account: Option<&str>,
        folder: Option<&str>,
    ) -> Result<Vec<(String, i64)>> {
        let cutoff = (Utc::now() - Duration::hours(limit_hours))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT strftime('%Y-%m-%d %H:00', pulled_at) as hour, COUNT(*) as count \
             FROM pulled_messages WHERE pulled_at >= ",
        );
        qb.push_bind(cutoff);
        if let Some(account) = account {
            qb.push(" AND account = ");
            qb.push_bind(account);
        }
        if let Some(folder) = folder {
            qb.push(" AND folder = ");
            qb.push_bind(folder);
        }
        qb.push(" GROUP BY hour ORDER BY hour DESC");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("loading pulls by hour")?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>(0), row.get::<i64, _>(1)))
            .collect())
    }

    /// Per-hour activity split into new writes vs dedup skips.
    pub async fn get_activity_by_hour(
        &self,
        limit_hours: i64,
        account: Option<&str>,
        folder: Option<&str>,
    ) -> Result<Vec<(String, i64, i64)>> {
        let cutoff = (Utc::now() - Duration::hours(limit_hours))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT strftime('%Y-%m-%d %H:00', pulled_at) as hour, \
                    SUM(CASE WHEN status IS NULL OR status != 'skipped' THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN status = 'skipped' THEN 1 ELSE 0 END) \
             FROM pulled_messages WHERE pulled_at >= ",
        );
        qb.push_bind(cutoff);
        if let Some(account) = account {
            qb.push(" AND account = ");
            qb.push_bind(account);
        }
        if let Some(folder) = folder {
            qb.push(" AND folder = ");
            qb.push_bind(folder);
        }
        qb.push(" GROUP BY hour ORDER BY hour DESC");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("loading activity by hour")?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<String, _>(0),
                    row.get::<i64, _>(1),
                    row.get::<i64, _>(2),
                )
            })
            .collect())
    }

    // ---------------------------------------------------------------------
    // Threading
    // ---------------------------------------------------------------------

    /// A thread is the union of the message itself, direct replies, and
    /// anything whose References chain mentions it. Ordered by msg_date.
    pub async fn get_thread(&self, message_id: &str, limit: i64) -> Result<Vec<PulledRecord>> {
        let rows = sqlx::query(&format!(
            "{PULLED_COLUMNS} FROM pulled_messages \
             WHERE message_id = ?1 OR in_reply_to = ?1 OR references_ LIKE ?2 \
             ORDER BY msg_date LIMIT ?3",
        ))
        .bind(message_id)
        .bind(format!("%{message_id}%"))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("loading thread")?;

        Ok(rows.iter().map(row_to_pulled).collect())
    }

    pub async fn get_replies(&self, message_id: &str, limit: i64) -> Result<Vec<PulledRecord>> {
        let rows = sqlx::query(&format!(
            "{PULLED_COLUMNS} FROM pulled_messages \
             WHERE in_reply_to = ?1 ORDER BY msg_date LIMIT ?2",
        ))
        .bind(message_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("loading replies")?;

        Ok(rows.iter().map(row_to_pulled).collect())
    }

    pub async fn slug_owner(&self, slug: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT root_message_id FROM thread_slugs WHERE slug = ?1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .context("loading slug owner")?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn slug_for_root(&self, root_message_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT slug FROM thread_slugs WHERE root_message_id = ?1")
            .bind(root_message_id)
            .fetch_optional(&self.pool)
            .await
            .context("loading slug for root")?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn insert_slug(&self, slug: &str, root_message_id: &str) -> Result<()> {
        sqlx::query("INSERT INTO thread_slugs (slug, root_message_id) VALUES (?1, ?2)")
            .bind(slug)
            .bind(root_message_id)
            .execute(&self.pool)
            .await
            .context("inserting thread slug")?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Full-text search
    // ---------------------------------------------------------------------

    /// Replace-then-insert keeps re-pulled messages from accumulating
    /// duplicate FTS rows.
    pub async fn insert_fts(
        &self,
        message_id: &str,
        subject: Option<&str>,
        body_text: Option<&str>,
        from_addr: Option<&str>,
        to_addr: Option<&str>,
    ) -> Result<()> {
        sqlx::query("DELETE FROM messages_fts WHERE message_id = ?1")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .context("clearing prior FTS row")?;
        sqlx::query(
            r#"
            INSERT INTO messages_fts (message_id, subject, body_text, from_addr, to_addr)
            VALUES (?1, ?2, ?3, ?4, ?5);
            "#,
        )
        .bind(message_id)
        .bind(subject)
        .bind(body_text)
        .bind(from_addr)
        .bind(to_addr)
        .execute(&self.pool)
        .await
        .context("inserting FTS row")?;
        Ok(())
    }

    /// FTS5 query over subject/body/from/to, bm25-ranked.
    pub async fn search(
        &self,
        query: &str,
        limit: i64,
        offset: i64,
        account: Option<&str>,
        folder: Option<&str>,
    ) -> Result<Vec<PulledRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT p.account, p.folder, p.uidvalidity, p.uid, p.content_hash, p.message_id, \
                    p.local_path, p.pulled_at, p.subject, p.msg_date, p.status, p.sync_run_id, \
                    p.error_message, p.in_reply_to, p.references_, p.from_addr, p.to_addr \
             FROM messages_fts \
             JOIN pulled_messages p ON messages_fts.message_id = p.message_id \
             WHERE messages_fts MATCH "
        ));
        qb.push_bind(query);
        if let Some(account) = account {
            qb.push(" AND p.account = ");
            qb.push_bind(account);
        }
        if let Some(folder) = folder {
            qb.push(" AND p.folder = ");
            qb.push_bind(folder);
        }
        qb.push(" ORDER BY bm25(messages_fts) LIMIT ");
        qb.push_bind(limit);
        qb.push(" OFFSET ");
        qb.push_bind(offset);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("running FTS search")?;

        Ok(rows.iter().map(row_to_pulled).collect())
    }

    pub async fn search_count(
        &self,
        query: &str,
        account: Option<&str>,
        folder: Option<&str>,
    ) -> Result<i64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT COUNT(*) FROM messages_fts \
             JOIN pulled_messages p ON messages_fts.message_id = p.message_id \
             WHERE messages_fts MATCH ",
        );
        qb.push_bind(query);
        if let Some(account) = account {
            qb.push(" AND p.account = ");
            qb.push_bind(account);
        }
        if let Some(folder) = folder {
            qb.push(" AND p.folder = ");
            qb.push_bind(folder);
        }

        let row = qb
            .build()
            .fetch_one(&self.pool)
            .await
            .context("counting FTS results")?;
        Ok(row.get::<i64, _>(0))
    }

    /// Rebuild the FTS index from `pulled_messages` metadata. Body text is
    /// not stored there, so rows come back without it; the FTS backfill
    /// re-reads `.eml` files to restore bodies.
    pub async fn rebuild_fts(&self) -> Result<i64> {
        sqlx::query("DELETE FROM messages_fts")
            .execute(&self.pool)
            .await
            .context("clearing FTS table")?;

        let result = sqlx::query(
            r#"
            INSERT INTO messages_fts (message_id, subject, body_text, from_addr, to_addr)
            SELECT message_id, subject, NULL, from_addr, to_addr
            FROM pulled_messages
            WHERE message_id IS NOT NULL AND subject IS NOT NULL;
            "#,
        )
        .execute(&self.pool)
        .await
        .context("rebuilding FTS table")?;

        Ok(result.rows_affected() as i64)
    }

    /// Rows that have a file on disk but no body text in the FTS index yet.
    pub async fn records_needing_fts(&self, limit: Option<i64>) -> Result<Vec<PulledRecord>> {
        let mut sql = format!(
            "{PULLED_COLUMNS} FROM pulled_messages \
             WHERE local_path IS NOT NULL AND message_id IS NOT NULL \
               AND message_id NOT IN (
                   SELECT message_id FROM messages_fts
                   WHERE body_text IS NOT NULL AND body_text != ''
               ) \
             ORDER BY pulled_at DESC"
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("loading records needing FTS")?;
        Ok(rows.iter().map(row_to_pulled).collect())
    }

    /// Backfilled addresses discovered while re-reading `.eml` files.
    pub async fn update_addresses(
        &self,
        record: &PulledRecord,
        from_addr: &str,
        to_addr: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pulled_messages SET from_addr = ?1, to_addr = ?2
            WHERE account = ?3 AND folder = ?4 AND uidvalidity = ?5 AND uid = ?6;
            "#,
        )
        .bind(from_addr)
        .bind(to_addr)
        .bind(&record.account)
        .bind(&record.folder)
        .bind(record.uidvalidity as i64)
        .bind(record.uid as i64)
        .execute(&self.pool)
        .await
        .context("updating addresses")?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Parquet projection support
    // ---------------------------------------------------------------------

    /// The key columns, sorted for a byte-stable export.
    pub async fn export_rows(&self) -> Result<Vec<(String, String, i64, i64, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT account, folder, uidvalidity, uid, content_hash
            FROM pulled_messages
            ORDER BY account, folder, uidvalidity, uid;
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("loading rows for export")?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get(0),
                    row.get(1),
                    row.get::<i64, _>(2),
                    row.get::<i64, _>(3),
                    row.get(4),
                )
            })
            .collect())
    }

    /// Cross-reference pass after a parquet import: fill in `message_id`
    /// and `local_path` for rows whose content hash matches an indexed
    /// file. Entries are `(path, message_id, content_hash)`.
    pub async fn fill_from_index(
        &self,
        entries: &[(String, Option<String>, String)],
    ) -> Result<u64> {
        let mut filled = 0u64;
        let mut tx = self.pool.begin().await.context("beginning fill tx")?;
        for (path, message_id, hash) in entries {
            let result = sqlx::query(
                r#"
                UPDATE pulled_messages
                SET message_id = COALESCE(message_id, ?1),
                    local_path = COALESCE(local_path, ?2)
                WHERE content_hash = ?3
                  AND (message_id IS NULL OR local_path IS NULL);
                "#,
            )
            .bind(message_id)
            .bind(path)
            .bind(hash)
            .execute(&mut *tx)
            .await
            .context("filling pulled row from index")?;
            filled += result.rows_affected();
        }
        tx.commit().await.context("committing fill tx")?;
        Ok(filled)
    }

    /// Import key columns from the parquet projection. `message_id` and
    /// `local_path` stay NULL until the index cross-reference pass.
    pub async fn import_rows(
        &self,
        rows: &[(String, String, i64, i64, String)],
    ) -> Result<u64> {
        let now = now_sqlite();
        let mut tx = self.pool.begin().await.context("beginning import tx")?;
        for (account, folder, uidvalidity, uid, content_hash) in rows {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO pulled_messages
                    (account, folder, uidvalidity, uid, content_hash, message_id, local_path, pulled_at)
                VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, ?6);
                "#,
            )
            .bind(account)
            .bind(folder)
            .bind(uidvalidity)
            .bind(uid)
            .bind(content_hash)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .context("importing pulled row")?;
        }
        tx.commit().await.context("committing import tx")?;
        Ok(rows.len() as u64)
    }
}

const PULLED_COLUMNS: &str = "SELECT account, folder, uidvalidity, uid, content_hash, message_id, \
     local_path, pulled_at, subject, msg_date, status, sync_run_id, error_message, \
     in_reply_to, references_, from_addr, to_addr";

fn row_to_pulled(row: &sqlx::sqlite::SqliteRow) -> PulledRecord {
    PulledRecord {
        account: row.get(0),
        folder: row.get(1),
        uidvalidity: row.get::<i64, _>(2) as u32,
        uid: row.get::<i64, _>(3) as u32,
        content_hash: row.get(4),
        message_id: row.get(5),
        local_path: row.get(6),
        pulled_at: row.get(7),
        subject: row.get(8),
        msg_date: row.get(9),
        status: row
            .get::<Option<String>, _>(10)
            .as_deref()
            .and_then(PullStatus::parse),
        sync_run_id: row.get(11),
        error: row.get(12),
        in_reply_to: row.get(13),
        references: row.get(14),
        from_addr: row.get(15),
        to_addr: row.get(16),
    }
}

fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> SyncRun {
    SyncRun {
        id: row.get(0),
        operation: row.get(1),
        account: row.get(2),
        folder: row.get(3),
        started_at: row.get(4),
        ended_at: row.get(5),
        status: row.get(6),
        total: row.get::<Option<i64>, _>(7).unwrap_or(0),
        fetched: row.get::<Option<i64>, _>(8).unwrap_or(0),
        skipped: row.get::<Option<i64>, _>(9).unwrap_or(0),
        failed: row.get::<Option<i64>, _>(10).unwrap_or(0),
        error: row.get(11),
    }
}
