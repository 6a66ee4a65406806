use tempfile::TempDir;

use mailstash::storage::UidDb;
use mailstash::threading;
use mailstash::types::{PullStatus, PulledRecord, RunStatus, SyncOp};

fn record(account: &str, folder: &str, uidvalidity: u32, uid: u32, hash: &str) -> PulledRecord {
    PulledRecord {
        account: account.to_string(),
        folder: folder.to_string(),
        uidvalidity,
        uid,
        content_hash: hash.to_string(),
        message_id: Some(format!("<{uid}@example.com>")),
        local_path: Some(format!("{folder}/{uid}.eml")),
        pulled_at: String::new(),
        subject: Some(format!("message {uid}")),
        msg_date: Some(format!("2024-01-{:02}T00:00:00+00:00", (uid % 27) + 1)),
        status: Some(PullStatus::New),
        sync_run_id: None,
        error: None,
        in_reply_to: None,
        references: None,
        from_addr: Some("alice@example.com".to_string()),
        to_addr: Some("bob@example.com".to_string()),
    }
}

#[tokio::test]
async fn record_pull_is_idempotent_per_epoch() {
    let dir = TempDir::new().unwrap();
    let db = UidDb::open(dir.path()).await.unwrap();

    let rec = record("g", "INBOX", 7, 11, "aaa");
    db.record_pull(&rec, None).await.unwrap();
    db.record_pull(&rec, None).await.unwrap();

    let pulled = db.get_pulled_uids("g", "INBOX", 7).await.unwrap();
    assert_eq!(pulled.len(), 1);
    assert!(pulled.contains(&11));
    assert_eq!(db.get_pulled_count("g", "INBOX", Some(7)).await.unwrap(), 1);
}

#[tokio::test]
async fn unpulled_is_server_minus_pulled() {
    let dir = TempDir::new().unwrap();
    let db = UidDb::open(dir.path()).await.unwrap();

    let server: Vec<(u32, Option<String>)> =
        vec![(11, None), (12, None), (13, None)];
    db.record_server_uids("g", "INBOX", 7, &server).await.unwrap();
    db.record_server_folder("g", "INBOX", 7, 3).await.unwrap();

    db.record_pull(&record("g", "INBOX", 7, 12, "h12"), None)
        .await
        .unwrap();

    let unpulled = db.get_unpulled_uids("g", "INBOX", 7).await.unwrap();
    assert_eq!(unpulled.len(), 2);
    assert!(unpulled.contains(&11));
    assert!(unpulled.contains(&13));

    // Pulled UIDs are a subset of server UIDs within the epoch.
    let pulled = db.get_pulled_uids("g", "INBOX", 7).await.unwrap();
    let server_set = db.get_server_uids("g", "INBOX", 7).await.unwrap();
    assert!(pulled.is_subset(&server_set));
}

#[tokio::test]
async fn server_uids_track_missing_message_ids() {
    let dir = TempDir::new().unwrap();
    let db = UidDb::open(dir.path()).await.unwrap();

    db.record_server_uids(
        "g",
        "INBOX",
        7,
        &[
            (1, Some("<one@example.com>".to_string())),
            (2, None),
            (3, Some(String::new())),
        ],
    )
    .await
    .unwrap();

    let missing = db.get_uids_without_message_id("g", "INBOX", 7).await.unwrap();
    assert_eq!(missing.len(), 2);
    assert!(missing.contains(&2));
    assert!(missing.contains(&3));
}

#[tokio::test]
async fn uidvalidity_change_starts_an_empty_epoch() {
    let dir = TempDir::new().unwrap();
    let db = UidDb::open(dir.path()).await.unwrap();

    for uid in 1..=5 {
        db.record_pull(&record("g", "INBOX", 7, uid, &format!("h{uid}")), None)
            .await
            .unwrap();
    }

    // New epoch: nothing pulled yet, old records remain for audit.
    assert!(db.get_pulled_uids("g", "INBOX", 8).await.unwrap().is_empty());
    assert_eq!(db.get_pulled_uids("g", "INBOX", 7).await.unwrap().len(), 5);
    assert_eq!(db.get_uidvalidity("g", "INBOX").await.unwrap(), Some(7));

    // Once the new epoch dominates, it wins the disagreement.
    for uid in 1..=8 {
        db.record_pull(&record("g", "INBOX", 8, uid, &format!("n{uid}")), None)
            .await
            .unwrap();
    }
    assert_eq!(db.get_uidvalidity("g", "INBOX").await.unwrap(), Some(8));
}

#[tokio::test]
async fn content_hash_lookup_spans_folders() {
    let dir = TempDir::new().unwrap();
    let db = UidDb::open(dir.path()).await.unwrap();

    db.record_pull(&record("g", "A", 1, 5, "shared"), None)
        .await
        .unwrap();
    assert!(db.has_content_hash("shared").await.unwrap());
    assert!(!db.has_content_hash("missing").await.unwrap());
}

#[tokio::test]
async fn sync_run_lifecycle_and_stale_sweep() {
    let dir = TempDir::new().unwrap();
    let db = UidDb::open(dir.path()).await.unwrap();

    let run_id = db.start_run(SyncOp::Pull, "g", "INBOX", 3).await.unwrap();
    db.update_run(run_id, 2, 1, 0).await.unwrap();
    db.end_run(run_id, RunStatus::Completed, None).await.unwrap();

    let run = db.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "completed");
    assert_eq!(run.total, 3);
    assert_eq!(run.fetched, 2);
    assert_eq!(run.skipped, 1);
    assert!(run.ended_at.is_some());

    // A fresh running row is not swept...
    let running = db.start_run(SyncOp::Pull, "g", "INBOX", 1).await.unwrap();
    assert_eq!(db.sweep_stale_runs(60).await.unwrap(), 0);
    // ...but anything older than the cutoff is.
    assert_eq!(db.sweep_stale_runs(-1).await.unwrap(), 1);
    let swept = db.get_run(running).await.unwrap().unwrap();
    assert_eq!(swept.status, "aborted");
}

#[tokio::test]
async fn thread_union_and_replies() {
    let dir = TempDir::new().unwrap();
    let db = UidDb::open(dir.path()).await.unwrap();

    let mut root = record("g", "INBOX", 1, 1, "h1");
    root.message_id = Some("<root@example.com>".to_string());
    root.msg_date = Some("2024-01-01T00:00:00+00:00".to_string());
    db.record_pull(&root, None).await.unwrap();

    let mut reply = record("g", "INBOX", 1, 2, "h2");
    reply.message_id = Some("<reply@example.com>".to_string());
    reply.in_reply_to = Some("<root@example.com>".to_string());
    reply.references = Some("<root@example.com>".to_string());
    reply.msg_date = Some("2024-01-02T00:00:00+00:00".to_string());
    db.record_pull(&reply, None).await.unwrap();

    let mut nested = record("g", "INBOX", 1, 3, "h3");
    nested.message_id = Some("<nested@example.com>".to_string());
    nested.in_reply_to = Some("<reply@example.com>".to_string());
    nested.references = Some("<root@example.com> <reply@example.com>".to_string());
    nested.msg_date = Some("2024-01-03T00:00:00+00:00".to_string());
    db.record_pull(&nested, None).await.unwrap();

    let mut unrelated = record("g", "INBOX", 1, 4, "h4");
    unrelated.message_id = Some("<other@example.com>".to_string());
    db.record_pull(&unrelated, None).await.unwrap();

    let thread = db.get_thread("<root@example.com>", 100).await.unwrap();
    let ids: Vec<_> = thread
        .iter()
        .map(|m| m.message_id.clone().unwrap())
        .collect();
    assert_eq!(
        ids,
        vec![
            "<root@example.com>".to_string(),
            "<reply@example.com>".to_string(),
            "<nested@example.com>".to_string(),
        ]
    );

    let replies = db.get_replies("<root@example.com>", 100).await.unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].message_id.as_deref(), Some("<reply@example.com>"));
}

#[tokio::test]
async fn slug_collision_increments_until_free() {
    let dir = TempDir::new().unwrap();
    let db = UidDb::open(dir.path()).await.unwrap();

    let root = "<root@example.com>";
    let natural = threading::slug_from_seed(threading::slug_seed(root));

    // Occupy the natural slug with a different root to force a collision.
    db.insert_slug(&natural, "<squatter@example.com>").await.unwrap();

    let assigned = threading::assign_thread_slug(&db, root).await.unwrap();
    assert_ne!(assigned, natural);
    assert_eq!(
        assigned,
        threading::slug_from_seed(threading::slug_seed(root) + 1)
    );

    // Assignment is sticky.
    let again = threading::assign_thread_slug(&db, root).await.unwrap();
    assert_eq!(again, assigned);
}

#[tokio::test]
async fn fts_search_finds_body_text() {
    let dir = TempDir::new().unwrap();
    let db = UidDb::open(dir.path()).await.unwrap();

    let mut rec = record("g", "INBOX", 1, 1, "h1");
    rec.subject = Some("quarterly budget review".to_string());
    db.record_pull(&rec, Some("the zanzibar project is over budget"))
        .await
        .unwrap();

    let mut other = record("g", "INBOX", 1, 2, "h2");
    other.subject = Some("lunch plans".to_string());
    db.record_pull(&other, Some("tacos on friday")).await.unwrap();

    let hits = db.search("zanzibar", 10, 0, None, None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].uid, 1);
    assert_eq!(db.search_count("zanzibar", None, None).await.unwrap(), 1);

    // Account filter excludes everything for an unknown account.
    let none = db.search("zanzibar", 10, 0, Some("nope"), None).await.unwrap();
    assert!(none.is_empty());

    // Re-pulling the same message does not duplicate FTS rows.
    db.record_pull(&rec, Some("the zanzibar project is over budget"))
        .await
        .unwrap();
    assert_eq!(db.search_count("zanzibar", None, None).await.unwrap(), 1);

    // Metadata-only rebuild drops body text but keeps subjects searchable.
    let rebuilt = db.rebuild_fts().await.unwrap();
    assert_eq!(rebuilt, 2);
    assert!(db.search("zanzibar", 10, 0, None, None).await.unwrap().is_empty());
    assert_eq!(db.search_count("quarterly", None, None).await.unwrap(), 1);
}

#[tokio::test]
async fn activity_split_counts_new_vs_deduped() {
    let dir = TempDir::new().unwrap();
    let db = UidDb::open(dir.path()).await.unwrap();

    db.record_pull(&record("g", "INBOX", 1, 1, "h1"), None).await.unwrap();
    db.record_pull(&record("g", "INBOX", 1, 2, "h2"), None).await.unwrap();

    let mut dup = record("g", "INBOX", 1, 3, "h1");
    dup.status = Some(PullStatus::Skipped);
    db.record_pull(&dup, None).await.unwrap();

    let hourly = db.get_pulls_by_hour(24, Some("g"), None).await.unwrap();
    assert_eq!(hourly.len(), 1);
    assert_eq!(hourly[0].1, 3);

    let split = db.get_activity_by_hour(24, Some("g"), None).await.unwrap();
    assert_eq!(split.len(), 1);
    let (_, new_count, deduped) = &split[0];
    assert_eq!(*new_count, 2);
    assert_eq!(*deduped, 1);
}

#[tokio::test]
async fn failed_pulls_keep_error_and_no_path() {
    let dir = TempDir::new().unwrap();
    let db = UidDb::open(dir.path()).await.unwrap();

    let mut rec = record("g", "INBOX", 7, 42, "");
    rec.status = Some(PullStatus::Failed);
    rec.local_path = None;
    rec.error = Some("socket timeout".to_string());
    db.record_pull(&rec, None).await.unwrap();

    // Failed rows count as attempted (retry goes through the failure log),
    // and never reach the FTS index.
    assert!(db.get_pulled_uids("g", "INBOX", 7).await.unwrap().contains(&42));
    assert_eq!(db.search_count("message", None, None).await.unwrap(), 0);

    let recent = db.get_recent_pulls(10, Some("g"), None, false).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].status.as_deref(), Some("failed"));

    // with_path_only hides failures that saved nothing.
    let with_path = db.get_recent_pulls(10, Some("g"), None, true).await.unwrap();
    assert!(with_path.is_empty());
}
