//! Emergency action log: capping, ordering, and recovery from bad files.

use std::sync::Arc;

use agent_loop::audit::{ActionLogEntry, ActionLogger, ActionResult, CappedActionLog, EmergencyAction};

fn entry(n: usize) -> ActionLogEntry {
    ActionLogEntry::new(
        EmergencyAction::RecoverStuckClaims,
        "tester",
        ActionResult::Success,
        format!("entry {n}"),
    )
}

#[test]
fn new_creates_state_directory() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("nested").join(".agent-loop");

    let log = CappedActionLog::new(&dir, 10).expect("log opens");
    log.log_entry(entry(0)).expect("write");

    assert!(dir.exists());
    assert!(log.path().exists());
}

#[test]
fn keeps_only_the_most_recent_entries() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = CappedActionLog::new(temp.path(), 100).expect("log opens");

    for n in 0..105 {
        log.log_entry(entry(n)).expect("write");
    }

    let entries = log.recent(usize::MAX).expect("read");
    assert_eq!(entries.len(), 100);
    assert_eq!(entries[0].details, "entry 5");
    assert_eq!(entries[99].details, "entry 104");
}

#[test]
fn recent_returns_newest_last() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = CappedActionLog::new(temp.path(), 10).expect("log opens");
    for n in 0..5 {
        log.log_entry(entry(n)).expect("write");
    }

    let details: Vec<String> = log
        .recent(2)
        .expect("read")
        .into_iter()
        .map(|e| e.details)
        .collect();
    assert_eq!(details, vec!["entry 3", "entry 4"]);
}

#[test]
fn file_is_a_json_array_with_snake_case_fields() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = CappedActionLog::new(temp.path(), 10).expect("log opens");
    log.log_entry(ActionLogEntry::new(
        EmergencyAction::StopAll,
        "operator",
        ActionResult::Partial,
        "stopped 2 agent(s)",
    ))
    .expect("write");

    let raw = std::fs::read_to_string(log.path()).expect("read file");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
    let first = &value.as_array().expect("array")[0];
    assert_eq!(first["action"], "stop_all");
    assert_eq!(first["result"], "partial");
    assert_eq!(first["actor"], "operator");
    assert!(first["timestamp"].is_string());
}

#[test]
fn unreadable_file_is_replaced() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = CappedActionLog::new(temp.path(), 10).expect("log opens");
    std::fs::write(log.path(), b"not json").expect("write garbage");

    log.log_entry(entry(1)).expect("write succeeds");
    let entries = log.recent(10).expect("read");
    assert_eq!(entries.len(), 1);
}

#[test]
fn concurrent_writers_do_not_lose_entries() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = Arc::new(CappedActionLog::new(temp.path(), 1_000).expect("log opens"));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                for n in 0..10 {
                    log.log_entry(entry(t * 10 + n)).expect("write");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread joins");
    }

    assert_eq!(log.recent(usize::MAX).expect("read").len(), 80);
}
