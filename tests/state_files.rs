use std::collections::BTreeMap;

use tempfile::TempDir;

use mailstash::config;
use mailstash::types::PullFailure;

#[test]
fn pushed_manifest_is_sorted_and_idempotent() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    config::mark_pushed(root, "zoho", "<b@example.com>").unwrap();
    config::mark_pushed(root, "zoho", "<a@example.com>").unwrap();
    config::mark_pushed(root, "zoho", "<b@example.com>").unwrap();

    let raw = std::fs::read_to_string(config::pushed_path(root, "zoho")).unwrap();
    assert_eq!(raw, "<a@example.com>\n<b@example.com>\n");

    let loaded = config::load_pushed(root, "zoho").unwrap();
    assert_eq!(loaded.len(), 2);
    assert!(loaded.contains("<a@example.com>"));
}

#[test]
fn account_names_with_slashes_get_safe_filenames() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    config::mark_pushed(root, "g/user", "<a@example.com>").unwrap();
    let path = config::pushed_path(root, "g/user");
    assert!(path.ends_with(".eml/pushed/g_user.txt"));
    assert!(path.exists());
}

#[test]
fn push_log_appends_one_line_per_upload() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    config::log_pushed(root, "zoho", "<a@example.com>", "hello\tworld", Some("INBOX/a.eml"))
        .unwrap();
    config::log_pushed(root, "zoho", "<b@example.com>", "second", None).unwrap();

    let log = root.join(".eml/pushed/zoho.log");
    let raw = std::fs::read_to_string(log).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 2);
    // Tabs in subjects must not break the record format.
    assert!(lines[0].contains("hello world"));
    assert!(lines[0].ends_with("INBOX/a.eml"));
}

#[test]
fn failures_sorted_by_uid_and_removed_when_empty() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    let mut failures = BTreeMap::new();
    failures.insert(
        43,
        PullFailure {
            error: "socket timeout".to_string(),
            timestamp: Some("2024-01-01T00:00:00+00:00".to_string()),
        },
    );
    failures.insert(
        42,
        PullFailure {
            error: "server busy".to_string(),
            timestamp: None,
        },
    );

    config::save_failures(root, "g", "[Gmail]/All Mail", &failures).unwrap();
    let path = config::failures_path(root, "g", "[Gmail]/All Mail");
    assert!(path.ends_with(".eml/failures/g_[Gmail]_All Mail.yaml"));

    let raw = std::fs::read_to_string(&path).unwrap();
    let pos42 = raw.find("42").unwrap();
    let pos43 = raw.find("43").unwrap();
    assert!(pos42 < pos43, "failure file must be sorted by uid");

    let loaded = config::load_failures(root, "g", "[Gmail]/All Mail").unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[&42].error, "server busy");

    // Success path: entries vanish, an empty map deletes the file.
    config::save_failures(root, "g", "[Gmail]/All Mail", &BTreeMap::new()).unwrap();
    assert!(!path.exists());
}

#[test]
fn config_roundtrip_preserves_accounts() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join(".eml")).unwrap();
    std::fs::write(
        root.join(".eml/config.yaml"),
        concat!(
            "layout: monthly\n",
            "accounts:\n",
            "  g:\n",
            "    type: gmail\n",
            "    user: me@gmail.com\n",
            "    password: secret\n",
            "  z:\n",
            "    type: zoho\n",
            "    user: me@zoho.com\n",
            "    password: hunter2\n",
            "    port: 1993\n",
        ),
    )
    .unwrap();

    let cfg = config::load_config(root).unwrap();
    assert_eq!(cfg.layout, "monthly");
    assert_eq!(cfg.accounts.len(), 2);
    let g = &cfg.accounts["g"];
    assert_eq!(g.name, "g");
    assert_eq!(g.port, 993);
    assert_eq!(cfg.accounts["z"].port, 1993);

    config::save_config(root, &cfg).unwrap();
    let again = config::load_config(root).unwrap();
    assert_eq!(again.accounts["z"].password, "hunter2");
    assert_eq!(again.layout, "monthly");
}

#[test]
fn find_root_walks_upward() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join(".eml")).unwrap();
    let nested = root.join("INBOX/2024/01");
    std::fs::create_dir_all(&nested).unwrap();

    let found = config::find_root(Some(&nested)).unwrap();
    assert_eq!(found, root);

    let outside = TempDir::new().unwrap();
    assert!(config::find_root(Some(outside.path())).is_none());
}

#[test]
fn sync_state_mirror_tracks_folders() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    config::set_folder_sync_state(root, "g", "INBOX", 7, 1234).unwrap();
    config::set_folder_sync_state(root, "g", "[Gmail]/All Mail", 9, 50_000).unwrap();

    let state = config::load_sync_state(root, "g").unwrap();
    assert_eq!(state.len(), 2);
    assert_eq!(state["INBOX"].uidvalidity, 7);
    assert_eq!(state["[Gmail]/All Mail"].message_count, 50_000);
}
