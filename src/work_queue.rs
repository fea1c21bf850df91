// Work Queue
// Policy layer over the store's queue primitives: idempotent enqueue,
// atomic claim, heartbeats, exponential retry backoff, and dead-letter
// transitions. The store supplies atomicity; this module supplies the
// state-machine decisions.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ProcessingConfig;
use crate::contracts::{
    DocumentStore, EnqueueOutcome, ErrorInfo, Metadata, QueueItem, QueueStatus,
};
use crate::types::QueueState;

/// Default priority for enqueued documents; lower sorts sooner.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Retry and backoff policy, taken from the processing config.
#[derive(Debug, Clone, Copy)]
pub struct QueuePolicy {
    pub max_retries: u32,
    pub retry_backoff_seconds: u64,
    pub max_backoff_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
}

impl QueuePolicy {
    pub fn from_config(processing: &ProcessingConfig) -> Self {
        Self {
            max_retries: processing.max_retries,
            retry_backoff_seconds: processing.retry_backoff_seconds,
            max_backoff_seconds: processing.max_backoff_seconds,
            heartbeat_interval_seconds: processing.heartbeat_interval_seconds,
            heartbeat_timeout_seconds: processing.heartbeat_timeout_seconds,
        }
    }

    /// backoff(n) = base * 2^n, capped at max_backoff.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 1u64 << retry_count.min(20);
        let seconds = self
            .retry_backoff_seconds
            .saturating_mul(factor)
            .min(self.max_backoff_seconds);
        Duration::seconds(seconds as i64)
    }
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_seconds: 60,
            max_backoff_seconds: 3600,
            heartbeat_interval_seconds: 30,
            heartbeat_timeout_seconds: 300,
        }
    }
}

/// What happened to a failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Returned to retry; selectable again at the given backoff.
    Retried { retry_count: i32 },
    /// Exhausted retries (or non-retryable); now in the dead letter.
    DeadLettered,
}

pub struct WorkQueue {
    store: Arc<dyn DocumentStore>,
    policy: QueuePolicy,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn DocumentStore>, policy: QueuePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Idempotent enqueue on (run_id, doc_id); see the store contract.
    pub async fn add_document(
        &self,
        run_id: &str,
        doc_id: &str,
        source_name: &str,
        metadata: Metadata,
    ) -> Result<EnqueueOutcome> {
        self.add_document_with_priority(run_id, doc_id, source_name, DEFAULT_PRIORITY, metadata)
            .await
    }

    pub async fn add_document_with_priority(
        &self,
        run_id: &str,
        doc_id: &str,
        source_name: &str,
        priority: i32,
        metadata: Metadata,
    ) -> Result<EnqueueOutcome> {
        let outcome = self
            .store
            .enqueue_document(run_id, doc_id, source_name, priority, metadata)
            .await
            .with_context(|| format!("Failed to enqueue {doc_id} for run {run_id}"))?;
        if outcome.created {
            debug!(run_id, doc_id, queue_id = outcome.queue_id, "enqueued document");
            self.store.add_run_counts(run_id, 1, 0, 0).await?;
        } else {
            debug!(run_id, doc_id, queue_id = outcome.queue_id, "document already queued");
        }
        Ok(outcome)
    }

    /// Atomically claim the next available item for this worker.
    pub async fn claim_next(&self, run_id: &str, worker_id: &str) -> Result<Option<QueueItem>> {
        let claimed = self.store.claim_next(run_id, worker_id, Utc::now()).await?;
        if let Some(item) = &claimed {
            debug!(
                run_id,
                worker_id,
                queue_id = item.queue_id,
                doc_id = %item.doc_id,
                retry_count = item.retry_count,
                "claimed queue item"
            );
        }
        Ok(claimed)
    }

    /// Refresh heartbeats for the worker registration row and for every
    /// item the worker currently holds.
    pub async fn heartbeat(&self, run_id: &str, worker_id: &str) -> Result<()> {
        let now = Utc::now();
        self.store.heartbeat_worker(run_id, worker_id, now).await?;
        let touched = self.store.heartbeat_claims(run_id, worker_id, now).await?;
        debug!(run_id, worker_id, claims = touched, "heartbeat");
        Ok(())
    }

    /// processing → completed, incrementing the run's processed counter.
    pub async fn mark_completed(&self, queue_id: i64) -> Result<()> {
        let item = self
            .store
            .get_queue_item(queue_id)
            .await?
            .with_context(|| format!("Unknown queue item: {queue_id}"))?;
        self.store.mark_item_completed(queue_id).await?;
        self.store.add_run_counts(&item.run_id, 0, 1, 0).await?;
        info!(queue_id, doc_id = %item.doc_id, run_id = %item.run_id, "completed");
        Ok(())
    }

    /// Route a failure: retryable errors below the retry limit go back to
    /// the queue with exponential backoff; everything else dead-letters.
    pub async fn mark_failed(
        &self,
        queue_id: i64,
        error: ErrorInfo,
        retryable: bool,
    ) -> Result<FailureOutcome> {
        let item = self
            .store
            .get_queue_item(queue_id)
            .await?
            .with_context(|| format!("Unknown queue item: {queue_id}"))?;

        if retryable && (item.retry_count as u32) < self.policy.max_retries {
            let backoff = self.policy.backoff(item.retry_count as u32);
            let next_attempt_at = Utc::now() + backoff;
            self.store
                .mark_item_retry(queue_id, next_attempt_at, error)
                .await?;
            warn!(
                queue_id,
                doc_id = %item.doc_id,
                retry_count = item.retry_count + 1,
                backoff_seconds = backoff.num_seconds(),
                "item scheduled for retry"
            );
            Ok(FailureOutcome::Retried {
                retry_count: item.retry_count + 1,
            })
        } else {
            self.store.mark_item_failed(queue_id, error).await?;
            self.store.add_run_counts(&item.run_id, 0, 0, 1).await?;
            warn!(
                queue_id,
                doc_id = %item.doc_id,
                run_id = %item.run_id,
                retry_count = item.retry_count,
                "item dead-lettered"
            );
            Ok(FailureOutcome::DeadLettered)
        }
    }

    /// Return stale processing items (heartbeat older than the timeout)
    /// to retry. Any process may call this.
    pub async fn reclaim_stale(&self, timeout_seconds: u64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::seconds(timeout_seconds as i64);
        let reclaimed = self.store.reclaim_stale_items(cutoff).await?;
        if reclaimed > 0 {
            warn!(reclaimed, timeout_seconds, "reclaimed stale queue items");
        }
        Ok(reclaimed)
    }

    pub async fn get_status(&self, run_id: &str) -> Result<QueueStatus> {
        self.store.queue_status(run_id).await
    }

    pub async fn get_item(&self, queue_id: i64) -> Result<Option<QueueItem>> {
        self.store.get_queue_item(queue_id).await
    }

    /// True once every enqueued item for the run is terminal.
    pub async fn is_drained(&self, run_id: &str) -> Result<bool> {
        let status = self.get_status(run_id).await?;
        Ok(status.is_drained())
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }
}

/// Sanity check used by tests and assertions after claiming.
pub fn is_claimable(item: &QueueItem, now: chrono::DateTime<Utc>) -> bool {
    match item.state {
        QueueState::Pending => true,
        QueueState::Retry => item.next_attempt_at.map(|t| now >= t).unwrap_or(true),
        _ => false,
    }
}
