use tempfile::TempDir;

use mailstash::storage::{parquet, UidDb};
use mailstash::types::{PullStatus, PulledRecord};

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
        subject: None,
        msg_date: None,
        status: Some(PullStatus::New),
        sync_run_id: None,
        error: None,
        in_reply_to: None,
        references: None,
        from_addr: None,
        to_addr: None,
    }
}

#[tokio::test]
async fn export_import_reexport_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let db = UidDb::open(dir.path()).await.unwrap();

    // Insert out of key order; export must sort.
    db.record_pull(&record("zoho", "Sent", 3, 9, "h9"), None).await.unwrap();
    db.record_pull(&record("g", "INBOX", 7, 13, "h13"), None).await.unwrap();
    db.record_pull(&record("g", "INBOX", 7, 11, "h11"), None).await.unwrap();
    db.record_pull(&record("g", "Archive", 2, 4, "h4"), None).await.unwrap();

    let first = dir.path().join("uids.parquet");
    let exported = parquet::export_uids(&db, &first).await.unwrap();
    assert_eq!(exported, 4);

    // The exported rows are the DB's key tuples, in key order.
    let rows = parquet::read_uids(&first).unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0].0, "g");
    assert_eq!(rows[0].1, "Archive");
    assert_eq!(rows[1], ("g".into(), "INBOX".into(), 7, 11, "h11".into()));
    assert_eq!(rows[2], ("g".into(), "INBOX".into(), 7, 13, "h13".into()));
    assert_eq!(rows[3].0, "zoho");

    // Rebuild a fresh DB from the projection and re-export.
    let dir2 = TempDir::new().unwrap();
    let db2 = UidDb::open(dir2.path()).await.unwrap();
    let imported = parquet::import_uids(&db2, &first).await.unwrap();
    assert_eq!(imported, 4);

    // Imported rows leave message_id/local_path for the index pass.
    let restored = db2.get_pulled_uids("g", "INBOX", 7).await.unwrap();
    assert_eq!(restored.len(), 2);
    assert!(db2.has_content_hash("h13").await.unwrap());

    let second = dir2.path().join("uids.parquet");
    parquet::export_uids(&db2, &second).await.unwrap();

    let a = std::fs::read(&first).unwrap();
    let b = std::fs::read(&second).unwrap();
    assert_eq!(a, b, "round-tripped parquet must be byte-identical");
}

#[tokio::test]
async fn index_pass_fills_message_id_and_path() {
    let dir = TempDir::new().unwrap();
    let db = UidDb::open(dir.path()).await.unwrap();

    db.import_rows(&[(
        "g".to_string(),
        "INBOX".to_string(),
        7,
        11,
        "hash11".to_string(),
    )])
    .await
    .unwrap();

    let filled = db
        .fill_from_index(&[(
            "INBOX/2024/01/x.eml".to_string(),
            Some("<m11@example.com>".to_string()),
            "hash11".to_string(),
        )])
        .await
        .unwrap();
    assert_eq!(filled, 1);

    let thread = db.get_thread("<m11@example.com>", 10).await.unwrap();
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].local_path.as_deref(), Some("INBOX/2024/01/x.eml"));
}

#[test]
fn parquet_freshness_compares_mtimes() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("uids.db");
    let pq_path = dir.path().join("uids.parquet");

    // No parquet at all: nothing to rebuild from.
    assert!(!parquet::parquet_is_newer(&db_path, &pq_path));

    // Parquet exists, DB does not: the projection is authoritative.
    std::fs::write(&pq_path, b"x").unwrap();
    assert!(parquet::parquet_is_newer(&db_path, &pq_path));

    // DB written after the parquet: no rebuild.
    std::thread::sleep(std::time::Duration::from_millis(20));
    std::fs::write(&db_path, b"y").unwrap();
    assert!(!parquet::parquet_is_newer(&db_path, &pq_path));
}
