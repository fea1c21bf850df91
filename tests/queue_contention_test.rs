// Queue correctness under contention: atomic claiming, stale reclaim,
// retry exhaustion, and dead-letter recovery against the in-memory store,
// which honors the same claim contract as the Postgres backend.

use anyhow::Result;
use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use docflow::{
    DeadLetterQueue, DocumentStore, ErrorInfo, Metadata, MemoryStore, QueuePolicy, QueueState,
    WorkQueue,
};

fn queue_over(store: Arc<MemoryStore>, policy: QueuePolicy) -> Arc<WorkQueue> {
    WorkQueue::new(store, policy).into()
}

/// Enqueue 100 documents, run 10 concurrent claimers.
/// Every document is claimed exactly once and no claimer ever observes a
/// queue_id another claimer already holds.
#[tokio::test]
async fn test_atomic_claiming_under_contention() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.ensure_run("run-1", "h").await?;
    let queue = queue_over(store.clone(), QueuePolicy::default());

    for index in 0..100 {
        queue
            .add_document("run-1", &format!("doc-{index:03}"), "src", Metadata::new())
            .await?;
    }

    let mut handles = Vec::new();
    for worker in 0..10 {
        let queue = queue.clone();
        let worker_id = format!("worker-{worker}");
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                match queue.claim_next("run-1", &worker_id).await.unwrap() {
                    Some(item) => {
                        claimed.push(item.queue_id);
                        // Jitter the interleaving so claims genuinely race.
                        let pause = rand::random::<u64>() % 3;
                        tokio::time::sleep(std::time::Duration::from_millis(pause)).await;
                        queue.mark_completed(item.queue_id).await.unwrap();
                    }
                    None => break,
                }
            }
            claimed
        }));
    }

    let mut all_claims = Vec::new();
    for handle in handles {
        let claims = handle.await?;
        // No worker observes the same queue_id twice.
        let unique: HashSet<_> = claims.iter().collect();
        assert_eq!(unique.len(), claims.len());
        all_claims.extend(claims);
    }

    // Each document claimed by exactly one worker, total processed = 100.
    let unique: HashSet<_> = all_claims.iter().collect();
    assert_eq!(all_claims.len(), 100, "every document claimed once");
    assert_eq!(unique.len(), 100, "no double claims across workers");

    let status = queue.get_status("run-1").await?;
    assert_eq!(status.completed, 100);
    assert!(status.is_drained());
    Ok(())
}

/// A worker claims an item and goes silent past the
/// heartbeat timeout. Any other process reclaims it: state returns to
/// retry, retry_count increments, the claim is cleared.
#[tokio::test]
async fn test_stale_claim_reclaimed_after_timeout() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.ensure_run("run-1", "h").await?;
    let queue = queue_over(store.clone(), QueuePolicy::default());

    let outcome = queue
        .add_document("run-1", "doc-a", "src", Metadata::new())
        .await?;

    // W1 claims with a heartbeat already older than the timeout (the
    // equivalent of claiming and then sleeping past it).
    let stale_time = Utc::now() - Duration::seconds(600);
    let claimed = store.claim_next("run-1", "w1", stale_time).await?.unwrap();
    assert_eq!(claimed.queue_id, outcome.queue_id);

    let reclaimed = queue.reclaim_stale(300).await?;
    assert_eq!(reclaimed, 1);

    let item = queue.get_item(outcome.queue_id).await?.unwrap();
    assert_eq!(item.state, QueueState::Retry);
    assert_eq!(item.retry_count, 1);
    assert_eq!(item.claimed_by_worker, None);

    // Invariant: after reclaim(T), no processing item has a heartbeat
    // older than now - T.
    let status = queue.get_status("run-1").await?;
    assert_eq!(status.processing, 0);

    // The item is immediately claimable by another worker.
    let item = queue.claim_next("run-1", "w2").await?.unwrap();
    assert_eq!(item.claimed_by_worker.as_deref(), Some("w2"));
    Ok(())
}

/// A fresh heartbeat protects an in-flight claim from reclaim.
#[tokio::test]
async fn test_heartbeat_prevents_reclaim() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.ensure_run("run-1", "h").await?;
    store.register_worker("run-1", "w1", "host").await?;
    let queue = queue_over(store.clone(), QueuePolicy::default());

    queue
        .add_document("run-1", "doc-a", "src", Metadata::new())
        .await?;
    queue.claim_next("run-1", "w1").await?.unwrap();
    queue.heartbeat("run-1", "w1").await?;

    assert_eq!(queue.reclaim_stale(300).await?, 0);
    let status = queue.get_status("run-1").await?;
    assert_eq!(status.processing, 1);
    Ok(())
}

/// Retry counts accumulate across reclaim and explicit failures; once
/// max_retries is exceeded the item lands in the dead letter, and a
/// dead-letter requeue resets it for a clean second life.
#[tokio::test]
async fn test_retry_exhaustion_and_dead_letter_requeue() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.ensure_run("run-1", "h").await?;
    let queue = queue_over(
        store.clone(),
        QueuePolicy {
            max_retries: 2,
            retry_backoff_seconds: 0,
            ..Default::default()
        },
    );

    let outcome = queue
        .add_document("run-1", "doc-a", "src", Metadata::new())
        .await?;

    // Fail repeatedly until the dead letter takes it.
    loop {
        let Some(item) = queue.claim_next("run-1", "w1").await? else {
            break;
        };
        let error = ErrorInfo::from_error(&anyhow::anyhow!("parse failure in row 7"), Utc::now());
        queue.mark_failed(item.queue_id, error, true).await?;
        let current = queue.get_item(outcome.queue_id).await?.unwrap();
        if current.state == QueueState::Failed {
            break;
        }
    }

    let item = queue.get_item(outcome.queue_id).await?.unwrap();
    assert_eq!(item.state, QueueState::Failed);
    assert_eq!(item.retry_count, 2, "failed on the attempt after max_retries");

    // Operator requeues; the item re-enters pending with
    // a zeroed retry_count and processes cleanly once the cause is fixed.
    let dlq = DeadLetterQueue::new(store.clone());
    let listed = dlq.list(Some("run-1"), 10).await?;
    assert_eq!(listed.len(), 1);
    assert!(dlq.retry(outcome.queue_id).await?);

    let item = queue.get_item(outcome.queue_id).await?.unwrap();
    assert_eq!(item.state, QueueState::Pending);
    assert_eq!(item.retry_count, 0);

    let reclaimed = queue.claim_next("run-1", "w2").await?.unwrap();
    queue.mark_completed(reclaimed.queue_id).await?;
    let status = queue.get_status("run-1").await?;
    assert_eq!(status.completed, 1);
    assert_eq!(status.failed, 0);
    Ok(())
}

/// At most one non-terminal item per (run, doc) even under concurrent
/// enqueues of the same document.
#[tokio::test]
async fn test_concurrent_enqueue_is_idempotent() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.ensure_run("run-1", "h").await?;
    let queue = queue_over(store.clone(), QueuePolicy::default());

    let mut handles = Vec::new();
    for _ in 0..20 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue
                .add_document("run-1", "doc-shared", "src", Metadata::new())
                .await
                .unwrap()
        }));
    }

    let mut ids = HashSet::new();
    let mut created = 0;
    for handle in handles {
        let outcome = handle.await?;
        ids.insert(outcome.queue_id);
        if outcome.created {
            created += 1;
        }
    }
    assert_eq!(ids.len(), 1, "all callers observe the same queue item");
    assert_eq!(created, 1, "exactly one enqueue wins");

    let status = queue.get_status("run-1").await?;
    assert_eq!(status.pending, 1);
    Ok(())
}
