use agent_loop::models::session::AgentStatus;
use agent_loop::models::transition::StateTransition;
use agent_loop::persistence::TransitionLog;

#[test]
fn appends_and_filters_by_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = TransitionLog::new(temp.path()).expect("log opens");

    log.append(&StateTransition::new(1, AgentStatus::Idle, AgentStatus::Working, Some("123".into())))
        .expect("append");
    log.append(&StateTransition::new(2, AgentStatus::Idle, AgentStatus::Working, None))
        .expect("append");
    log.append(&StateTransition::new(1, AgentStatus::Working, AgentStatus::Reviewing, Some("123".into())))
        .expect("append");

    let agent_one = log.for_agent(1).expect("read");
    assert_eq!(agent_one.len(), 2);
    assert_eq!(agent_one[1].to_state, AgentStatus::Reviewing);
    assert_eq!(log.read_all().expect("read").len(), 3);
}

#[test]
fn missing_log_reads_empty() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = TransitionLog::new(temp.path()).expect("log opens");
    assert!(log.read_all().expect("read").is_empty());
}

#[test]
fn malformed_lines_are_skipped() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = TransitionLog::new(temp.path()).expect("log opens");
    log.append(&StateTransition::new(1, AgentStatus::Idle, AgentStatus::Working, None))
        .expect("append");

    let path = temp.path().join("transitions.jsonl");
    let mut raw = std::fs::read_to_string(&path).expect("read");
    raw.push_str("{ truncated\n\n");
    std::fs::write(&path, raw).expect("write");

    log.append(&StateTransition::new(1, AgentStatus::Working, AgentStatus::Idle, None))
        .expect("append after corruption");

    let entries = log.for_agent(1).expect("read");
    assert_eq!(entries.len(), 2);
}

#[test]
fn each_entry_is_one_json_line() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = TransitionLog::new(temp.path()).expect("log opens");
    log.append(&StateTransition::new(3, AgentStatus::Idle, AgentStatus::Paused, None))
        .expect("append");

    let raw = std::fs::read_to_string(temp.path().join("transitions.jsonl")).expect("read");
    let line = raw.lines().next().expect("one line");
    let value: serde_json::Value = serde_json::from_str(line).expect("json");
    assert_eq!(value["agent_id"], 3);
    assert_eq!(value["from_state"], "idle");
    assert_eq!(value["to_state"], "paused");
}
