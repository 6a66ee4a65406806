use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use mailstash::convert;
use mailstash::layout::path_template::content_hash;
use mailstash::layout::{StorageLayout, TreeLayout};
use mailstash::storage::FileIndex;

fn sample_eml(message_id: &str, subject: &str, body: &str) -> Vec<u8> {
    format!(
        "Message-ID: {message_id}\r\n\
         Date: Mon, 15 Jan 2024 10:30:00 +0000\r\n\
         From: alice@example.com\r\n\
         To: bob@example.com\r\n\
         Subject: {subject}\r\n\
         \r\n\
         {body}\r\n"
    )
    .into_bytes()
}

#[test]
fn tree_layout_writes_and_dedupes() {
    let dir = TempDir::new().unwrap();
    let mut tree = TreeLayout::new(dir.path(), "daily");

    let raw = sample_eml("<a@example.com>", "Hello World", "first body");
    let date = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();

    let path = tree
        .add_message("<a@example.com>", &raw, "INBOX", Some(date), "alice", "Hello World", Some(11))
        .unwrap();
    assert!(path.exists());
    let rel = path.strip_prefix(dir.path()).unwrap().to_string_lossy().to_string();
    assert!(rel.starts_with("INBOX/2024/01/15/"));
    assert!(rel.ends_with("_hello_world.eml"));

    // Same bytes resolve to the existing file; different bytes do not.
    assert_eq!(tree.path_by_content(&raw).unwrap(), Some(rel));
    let other = sample_eml("<b@example.com>", "Other", "second body");
    assert_eq!(tree.path_by_content(&other).unwrap(), None);

    assert!(tree.has_message("<a@example.com>").unwrap());
    assert_eq!(tree.count(None).unwrap(), 1);
}

#[test]
fn tree_scan_ignores_state_dir() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join(".eml")).unwrap();
    // A stray .eml-suffixed file inside the state dir must not be indexed.
    std::fs::write(dir.path().join(".eml/trap.eml"), b"not a message").unwrap();

    let mut tree = TreeLayout::new(dir.path(), "flat");
    let raw = sample_eml("<a@example.com>", "real", "body");
    tree.add_message("<a@example.com>", &raw, "INBOX", None, "", "real", None)
        .unwrap();

    assert_eq!(tree.count(None).unwrap(), 1);
    let msgs = tree.iter_messages(None, None, None).unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].message_id, "<a@example.com>");
    assert_eq!(msgs[0].folder, "INBOX");
}

#[test]
fn messages_without_message_id_get_synthetic_ids() {
    let dir = TempDir::new().unwrap();
    let raw = b"From: x@example.com\r\nSubject: anon\r\n\r\nbody\r\n".to_vec();
    let mut tree = TreeLayout::new(dir.path(), "flat");
    tree.add_message("", &raw, "INBOX", None, "", "anon", None).unwrap();

    let msgs = tree.iter_messages(None, None, None).unwrap();
    assert_eq!(msgs.len(), 1);
    let expected = format!("<{}@content-hash>", content_hash(&raw));
    assert_eq!(msgs[0].message_id, expected);
}

#[tokio::test]
async fn file_index_rebuild_matches_rescan() {
    let dir = TempDir::new().unwrap();
    let mut tree = TreeLayout::new(dir.path(), "monthly");
    let date = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();

    for i in 0..5 {
        let raw = sample_eml(&format!("<m{i}@example.com>"), &format!("msg {i}"), "body");
        tree.add_message(
            &format!("<m{i}@example.com>"),
            &raw,
            "INBOX",
            Some(date),
            "alice",
            &format!("msg {i}"),
            Some(i),
        )
        .unwrap();
    }

    let index = FileIndex::open(dir.path()).await.unwrap();
    let stats = index.rebuild().await.unwrap();
    assert_eq!(stats.indexed, 5);
    assert_eq!(index.file_count().await.unwrap(), 5);

    let first = {
        let mut entries = index.all_entries().await.unwrap();
        entries.sort();
        entries
    };

    // Rebuilding from the same files yields the same row set.
    index.rebuild().await.unwrap();
    let second = {
        let mut entries = index.all_entries().await.unwrap();
        entries.sort();
        entries
    };
    assert_eq!(first, second);

    // O(1) lookups by id and hash.
    let by_id = index.get_by_message_id("<m3@example.com>").await.unwrap().unwrap();
    let by_hash = index
        .get_by_content_hash(&by_id.content_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_id.path, by_hash.path);
    assert_eq!(by_id.subject, "msg 3");
}

#[tokio::test]
async fn incremental_index_file_matches_rebuild_row() {
    let dir = TempDir::new().unwrap();
    let mut tree = TreeLayout::new(dir.path(), "flat");
    let raw = sample_eml("<a@example.com>", "incremental", "body");
    let path = tree
        .add_message("<a@example.com>", &raw, "INBOX", None, "alice", "incremental", Some(1))
        .unwrap();

    let index = FileIndex::open(dir.path()).await.unwrap();
    assert!(index.index_file(&path).await.unwrap());

    let entry = index.get_by_message_id("<a@example.com>").await.unwrap().unwrap();
    assert_eq!(entry.content_hash, content_hash(&raw));
    assert_eq!(entry.size as usize, raw.len());
}

#[tokio::test]
async fn convert_tree_to_tree_preserves_content_set() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join(".eml")).unwrap();

    let mut current = StorageLayout::open(root, "daily").await.unwrap();
    let date = Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();
    let mut hashes = Vec::new();
    for i in 0..3 {
        let raw = sample_eml(&format!("<c{i}@example.com>"), &format!("conv {i}"), "body");
        hashes.push(content_hash(&raw));
        current
            .add_message(
                &format!("<c{i}@example.com>"),
                &raw,
                "INBOX",
                Some(date),
                "alice",
                "bob",
                "",
                &format!("conv {i}"),
                Some(i),
                None,
            )
            .await
            .unwrap();
    }
    hashes.sort();

    // Dry run only enumerates.
    let mut target = StorageLayout::open(root, "flat").await.unwrap();
    let dry = convert::convert_layout(root, &mut current, &mut target, true)
        .await
        .unwrap();
    assert_eq!(dry.moved, 3);
    assert_eq!(current.count(None).await.unwrap(), 3);

    // Real conversion: same content set, different paths.
    let summary = convert::convert_layout(root, &mut current, &mut target, false)
        .await
        .unwrap();
    assert_eq!(summary.moved, 3);
    assert_eq!(summary.errors, 0);

    let converted = StorageLayout::open(root, "flat").await.unwrap();
    let msgs = converted.iter_messages(None, None, None, None).await.unwrap();
    let mut got: Vec<String> = msgs.iter().map(|m| content_hash(&m.raw)).collect();
    got.sort();
    assert_eq!(got, hashes);

    // Old daily shards are gone.
    assert!(!root.join("INBOX/2024/05/02").exists() || {
        std::fs::read_dir(root.join("INBOX/2024/05/02")).unwrap().count() == 0
    });

    // Converting back restores the same content set again.
    let mut flat = StorageLayout::open(root, "flat").await.unwrap();
    let mut daily = StorageLayout::open(root, "daily").await.unwrap();
    let back = convert::convert_layout(root, &mut flat, &mut daily, false)
        .await
        .unwrap();
    assert_eq!(back.moved, 3);

    let restored = StorageLayout::open(root, "daily").await.unwrap();
    let msgs = restored.iter_messages(None, None, None, None).await.unwrap();
    let mut got: Vec<String> = msgs.iter().map(|m| content_hash(&m.raw)).collect();
    got.sort();
    assert_eq!(got, hashes);
}
