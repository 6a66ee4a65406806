use tempfile::TempDir;

use mailstash::errors::AppError;
use mailstash::sync::{read_status, StatusWriter};
use mailstash::types::SyncOp;

#[test]
fn acquire_writes_and_drop_removes() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    {
        let mut writer =
            StatusWriter::acquire(root, SyncOp::Pull, "g", "INBOX", 10).unwrap();
        let status = read_status(root).unwrap();
        assert_eq!(status.operation, "pull");
        assert_eq!(status.account, "g");
        assert_eq!(status.folder, "INBOX");
        assert_eq!(status.total, 10);
        assert_eq!(status.pid, std::process::id());

        writer.update(3, 1, 0, Some("a subject")).unwrap();
        let status = read_status(root).unwrap();
        assert_eq!(status.completed, 3);
        assert_eq!(status.skipped, 1);
        assert_eq!(status.current_subject.as_deref(), Some("a subject"));
    }

    // Dropping the writer releases the lock.
    assert!(read_status(root).is_none());
}

#[cfg(unix)]
#[test]
fn live_foreign_pid_refuses_second_writer() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join(".eml")).unwrap();

    // PID 1 is always alive.
    std::fs::write(
        root.join(".eml/sync-status.json"),
        serde_json::json!({
            "pid": 1,
            "operation": "pull",
            "account": "g",
            "folder": "INBOX",
            "total": 100,
            "completed": 5,
            "skipped": 0,
            "failed": 0,
            "started": "2024-01-01T00:00:00+00:00"
        })
        .to_string(),
    )
    .unwrap();

    let err = StatusWriter::acquire(root, SyncOp::Pull, "g", "INBOX", 0).unwrap_err();
    match &err {
        AppError::Concurrency(msg) => {
            assert!(msg.contains("Another pull is already running"));
        }
        other => panic!("expected Concurrency error, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn stale_dead_pid_is_replaced() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join(".eml")).unwrap();

    // A PID far above pid_max never exists.
    std::fs::write(
        root.join(".eml/sync-status.json"),
        serde_json::json!({
            "pid": 999_999_999u32,
            "operation": "push",
            "account": "z",
            "folder": "INBOX",
            "total": 1,
            "completed": 0,
            "skipped": 0,
            "failed": 0,
            "started": "2024-01-01T00:00:00+00:00"
        })
        .to_string(),
    )
    .unwrap();

    let writer = StatusWriter::acquire(root, SyncOp::Pull, "g", "INBOX", 0).unwrap();
    let status = read_status(root).unwrap();
    assert_eq!(status.pid, std::process::id());
    drop(writer);
}

#[test]
fn partial_writes_read_as_absent() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join(".eml")).unwrap();
    std::fs::write(root.join(".eml/sync-status.json"), "{\"pid\": 42, \"oper").unwrap();

    assert!(read_status(root).is_none());

    // And a truncated file does not block acquisition.
    let writer = StatusWriter::acquire(root, SyncOp::Push, "z", "INBOX", 0).unwrap();
    drop(writer);
}
