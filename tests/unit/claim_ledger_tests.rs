//! Claim ledger: exclusivity, release, staleness, and corruption handling.

use std::collections::HashSet;
use std::sync::Arc;

use agent_loop::models::agent_identity;
use agent_loop::persistence::{RetryPolicy, WorkQueue};
use chrono::{Duration, Utc};

async fn open_queue(dir: &std::path::Path) -> WorkQueue {
    WorkQueue::open(dir, RetryPolicy::immediate(0))
        .await
        .expect("queue opens")
}

#[tokio::test]
async fn first_claim_wins_and_second_is_refused() {
    let temp = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(temp.path()).await;

    assert!(queue.claim("79", "123", "agent-1").await.expect("claim"));
    assert!(!queue.claim("79", "123", "agent-2").await.expect("claim"));

    let active = queue.list_active().await.expect("list");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].claimed_by, "agent-1");
    assert_eq!(active[0].container_id, "79");
    assert_eq!(active[0].work_item_id, "123");
}

#[tokio::test]
async fn same_item_in_another_container_is_independent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(temp.path()).await;

    assert!(queue.claim("79", "123", "agent-1").await.expect("claim"));
    assert!(queue.claim("80", "123", "agent-2").await.expect("claim"));
    assert_eq!(queue.list_active().await.expect("list").len(), 2);
}

#[tokio::test]
async fn release_frees_the_item_for_another_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(temp.path()).await;
    queue.claim("79", "123", "agent-1").await.expect("claim");

    let released = queue.release("79", "123").await.expect("release");
    assert_eq!(released.map(|c| c.claimed_by), Some("agent-1".to_owned()));
    assert!(queue.release("79", "123").await.expect("release").is_none());

    assert!(queue.claim("79", "123", "agent-2").await.expect("claim"));
}

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    let temp = tempfile::tempdir().expect("tempdir");
    let queue = Arc::new(open_queue(temp.path()).await);

    let mut handles = Vec::new();
    for agent in 1..=8 {
        let queue = Arc::clone(&queue);
        handles.push(tokio::spawn(async move {
            queue
                .claim("79", "123", &agent_identity(agent))
                .await
                .expect("claim")
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.expect("join") {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(queue.list_active().await.expect("list").len(), 1);
}

#[tokio::test]
async fn two_ledger_handles_on_one_directory_agree() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = Arc::new(open_queue(temp.path()).await);
    let second = Arc::new(open_queue(temp.path()).await);

    let a = {
        let q = Arc::clone(&first);
        tokio::spawn(async move { q.claim("79", "123", "agent-1").await.expect("claim") })
    };
    let b = {
        let q = Arc::clone(&second);
        tokio::spawn(async move { q.claim("79", "123", "agent-2").await.expect("claim") })
    };

    let results = [a.await.expect("join"), b.await.expect("join")];
    assert_eq!(results.iter().filter(|won| **won).count(), 1);
}

#[tokio::test]
async fn release_owned_by_only_touches_that_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(temp.path()).await;
    queue.claim("79", "1", "agent-1").await.expect("claim");
    queue.claim("79", "2", "agent-1").await.expect("claim");
    queue.claim("79", "3", "agent-2").await.expect("claim");

    let released = queue.release_owned_by("agent-1").await.expect("release");
    let ids: HashSet<String> = released.into_iter().map(|c| c.work_item_id).collect();
    assert_eq!(ids, HashSet::from(["1".to_owned(), "2".to_owned()]));

    let remaining = queue.list_by_owner("agent-2").await.expect("list");
    assert_eq!(remaining.len(), 1);
    assert!(queue.list_by_owner("agent-1").await.expect("list").is_empty());
}

#[tokio::test]
async fn claims_older_than_threshold_are_stale() {
    let temp = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(temp.path()).await;
    queue.claim("79", "123", "agent-1").await.expect("claim");
    queue.claim("79", "124", "agent-2").await.expect("claim");

    // Nine hours from now the claims are past the eight-hour threshold.
    let later = Utc::now() + Duration::hours(9);
    let released = queue
        .release_stale(later, Duration::hours(8))
        .await
        .expect("release stale");

    assert_eq!(released.len(), 2);
    assert!(queue.list_active().await.expect("list").is_empty());
}

#[tokio::test]
async fn fresh_claims_survive_stale_sweep() {
    let temp = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(temp.path()).await;
    queue.claim("79", "123", "agent-1").await.expect("claim");

    let released = queue
        .release_stale(Utc::now(), Duration::hours(8))
        .await
        .expect("release stale");

    assert!(released.is_empty());
    assert_eq!(queue.list_active().await.expect("list").len(), 1);
}

#[tokio::test]
async fn clear_all_reports_count() {
    let temp = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(temp.path()).await;
    for item in ["1", "2", "3"] {
        queue.claim("79", item, "agent-1").await.expect("claim");
    }

    assert_eq!(queue.clear_all().await.expect("clear"), 3);
    assert_eq!(queue.clear_all().await.expect("clear"), 0);
}

#[tokio::test]
async fn corrupt_ledger_reads_as_empty_and_accepts_claims() {
    let temp = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(temp.path()).await;
    std::fs::write(temp.path().join("claims.json"), b"[{ broken").expect("write garbage");

    assert!(queue.list_active().await.expect("list").is_empty());
    assert!(queue.claim("79", "123", "agent-1").await.expect("claim"));
    assert_eq!(queue.list_active().await.expect("list").len(), 1);
}
