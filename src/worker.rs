// Document Worker
// Drains the queue for a run: claim → process → mark complete or failed,
// with a background heartbeat task and cooperative shutdown checked
// between documents. Processor errors are routed by the error taxonomy;
// queue/store errors propagate out and end the worker, because they mean
// the shared store is unreachable.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::contracts::ErrorInfo;
use crate::document_processor::{DocumentProcessor, ProcessOutcome};
use crate::observability::WorkerStats;
use crate::run_coordinator::RunCoordinator;
use crate::types::{ValidatedWorkerId, WorkerStatus};
use crate::work_queue::WorkQueue;

/// Empty-poll backoff bounds: 1s doubling up to 30s.
const POLL_BACKOFF_MIN: Duration = Duration::from_secs(1);
const POLL_BACKOFF_MAX: Duration = Duration::from_secs(30);

pub struct Worker {
    worker_id: ValidatedWorkerId,
    queue: Arc<WorkQueue>,
    processor: Arc<DocumentProcessor>,
    coordinator: RunCoordinator,
    shutdown: Arc<AtomicBool>,
    heartbeat_interval: Duration,
    max_documents: Option<u64>,
}

impl Worker {
    pub fn new(
        worker_id: ValidatedWorkerId,
        queue: Arc<WorkQueue>,
        processor: Arc<DocumentProcessor>,
        shutdown: Arc<AtomicBool>,
        max_documents: Option<u64>,
    ) -> Self {
        let heartbeat_interval =
            Duration::from_secs(queue.policy().heartbeat_interval_seconds.max(1));
        let coordinator = RunCoordinator::new(queue.store());
        Self {
            worker_id,
            queue,
            processor,
            coordinator,
            shutdown,
            heartbeat_interval,
            max_documents,
        }
    }

    pub fn worker_id(&self) -> &ValidatedWorkerId {
        &self.worker_id
    }

    /// Install a ctrl-c handler that flips the shared shutdown flag.
    /// Workers refuse new claims after the flag is set and finish the
    /// document in flight.
    pub fn install_signal_handler(shutdown: Arc<AtomicBool>) {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, requesting graceful shutdown");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }

    fn spawn_heartbeat(&self, run_id: String) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let worker_id = self.worker_id.as_str().to_string();
        let shutdown = self.shutdown.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(error) = queue.heartbeat(&run_id, &worker_id).await {
                    error!(worker_id, %error, "heartbeat failed");
                }
            }
        })
    }

    /// Register against the run and drain the queue until it is empty,
    /// the document cap is reached, or shutdown is requested.
    pub async fn run(&self, run_id: &str) -> Result<WorkerStats> {
        let worker_id = self.worker_id.as_str();
        let hostname = hostname();
        self.coordinator
            .register_worker(run_id, worker_id, &hostname)
            .await
            .context("Worker registration failed")?;

        let heartbeat = self.spawn_heartbeat(run_id.to_string());
        let result = self.claim_loop(run_id).await;

        // Flush a final heartbeat and mark the registration stopped so the
        // coordinator sees a clean exit rather than a stale worker.
        let store = self.queue.store();
        let _ = store.heartbeat_worker(run_id, worker_id, Utc::now()).await;
        let _ = store
            .update_worker_status(run_id, worker_id, WorkerStatus::Stopped)
            .await;
        heartbeat.abort();

        match &result {
            Ok(stats) => info!(
                worker_id,
                processed = stats.documents_processed,
                failed = stats.documents_failed,
                unchanged = stats.documents_unchanged,
                "worker finished"
            ),
            Err(error) => error!(worker_id, %error, "worker exiting on store failure"),
        }
        result
    }

    async fn claim_loop(&self, run_id: &str) -> Result<WorkerStats> {
        let worker_id = self.worker_id.as_str();
        let mut stats = WorkerStats::default();
        let mut backoff = POLL_BACKOFF_MIN;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!(worker_id, "shutdown requested, refusing new claims");
                break;
            }
            let attempted = stats.documents_processed + stats.documents_failed;
            if let Some(cap) = self.max_documents {
                if attempted >= cap {
                    info!(worker_id, cap, "document cap reached");
                    break;
                }
            }

            // Queue/store errors propagate: the worker cannot continue
            // without the shared store.
            let Some(item) = self.queue.claim_next(run_id, worker_id).await? else {
                if self.queue.is_drained(run_id).await? {
                    debug!(worker_id, "queue drained");
                    break;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(POLL_BACKOFF_MAX);
                continue;
            };
            backoff = POLL_BACKOFF_MIN;

            match self.processor.process(&self.queue, &item).await {
                Ok(ProcessOutcome::Processed(processed)) => {
                    self.queue.mark_completed(item.queue_id).await?;
                    stats.documents_processed += 1;
                    stats.elements_created += processed.elements;
                    stats.relationships_created += processed.relationships;
                    stats.entities_created += processed.entities.created;
                    stats.links_discovered += processed.links_discovered;
                    self.queue
                        .store()
                        .add_worker_counts(run_id, worker_id, 1, 0)
                        .await?;
                }
                Ok(ProcessOutcome::Unchanged) => {
                    self.queue.mark_completed(item.queue_id).await?;
                    stats.documents_processed += 1;
                    stats.documents_unchanged += 1;
                    self.queue
                        .store()
                        .add_worker_counts(run_id, worker_id, 1, 0)
                        .await?;
                }
                Err(processing_error) => {
                    let fatal = processing_error.is_fatal_config();
                    let retryable = processing_error.is_retryable();
                    let class = processing_error.class();
                    let error = processing_error.into_inner();
                    warn!(
                        worker_id,
                        queue_id = item.queue_id,
                        doc_id = %item.doc_id,
                        class,
                        %error,
                        "document processing failed"
                    );
                    let mut info = ErrorInfo::from_error(&error, Utc::now());
                    info.fingerprint = format!("{class}: {}", info.fingerprint);
                    info.message = format!("{class}: {}", info.message);
                    self.queue
                        .mark_failed(item.queue_id, info, retryable)
                        .await?;
                    stats.documents_failed += 1;
                    self.queue
                        .store()
                        .add_worker_counts(run_id, worker_id, 0, 1)
                        .await?;

                    if fatal {
                        // Broken worker setup poisons every document it
                        // touches; bubble up and exit after the flush in
                        // run().
                        return Err(error.context("Fatal configuration error"));
                    }
                }
            }
        }

        Ok(stats)
    }
}

/// Run N workers as tasks in one process and merge their statistics.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Build `count` workers sharing the queue, processor, and shutdown
    /// flag. With an explicit base id the workers are `{base}-{n}`;
    /// otherwise each gets a generated id.
    pub fn new(
        count: usize,
        base_id: Option<&ValidatedWorkerId>,
        queue: Arc<WorkQueue>,
        processor: Arc<DocumentProcessor>,
        shutdown: Arc<AtomicBool>,
        max_documents: Option<u64>,
    ) -> Result<Self> {
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let worker_id = match base_id {
                Some(base) if count == 1 => base.clone(),
                Some(base) => ValidatedWorkerId::new(format!("{}-{}", base.as_str(), index + 1))?,
                None => ValidatedWorkerId::generate(),
            };
            workers.push(Worker::new(
                worker_id,
                queue.clone(),
                processor.clone(),
                shutdown.clone(),
                max_documents,
            ));
        }
        Ok(Self { workers })
    }

    pub fn worker_ids(&self) -> Vec<&str> {
        self.workers.iter().map(|w| w.worker_id().as_str()).collect()
    }

    /// Run every worker to completion and merge stats. Individual worker
    /// failures are surfaced after the others finish.
    pub async fn run(self, run_id: &str) -> Result<WorkerStats> {
        let handles: Vec<_> = self
            .workers
            .into_iter()
            .map(|worker| {
                let run_id = run_id.to_string();
                tokio::spawn(async move { worker.run(&run_id).await })
            })
            .collect();

        let mut combined = WorkerStats::default();
        let mut first_error = None;
        for joined in futures::future::join_all(handles).await {
            match joined.context("Worker task panicked")? {
                Ok(stats) => combined.merge(&stats),
                Err(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(combined),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::factory;
    use crate::memory_store::MemoryStore;
    use crate::types::QueueState;

    fn test_config(base_path: &std::path::Path) -> Config {
        Config::from_yaml(&format!(
            r#"
storage:
  backend: memory
content_sources:
  - name: docs
    type: filesystem
    base_path: {}
processing:
  mode: single
  max_retries: 1
  retry_backoff_seconds: 0
"#,
            base_path.display()
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_worker_drains_queue() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        tokio::fs::write(dir.path().join("a.md"), "# A\n\nAlpha body.").await?;
        tokio::fs::write(dir.path().join("b.md"), "# B\n\nBeta body.").await?;

        let config = test_config(dir.path());
        let store: Arc<dyn crate::contracts::DocumentStore> = Arc::new(MemoryStore::new());
        store.ensure_run("run-1", "h").await?;
        let (processor, queue) = factory::create_processor(&config, store.clone()).await?;
        queue
            .add_document("run-1", "a.md", "docs", Default::default())
            .await?;
        queue
            .add_document("run-1", "b.md", "docs", Default::default())
            .await?;

        let worker = Worker::new(
            ValidatedWorkerId::new("w-test")?,
            queue.clone(),
            processor,
            Arc::new(AtomicBool::new(false)),
            None,
        );
        let stats = worker.run("run-1").await?;

        assert_eq!(stats.documents_processed, 2);
        assert_eq!(stats.documents_failed, 0);
        assert!(stats.elements_created > 0);
        assert!(queue.is_drained("run-1").await?);

        let workers = store.list_workers("run-1").await?;
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].status, WorkerStatus::Stopped);
        assert_eq!(workers[0].documents_processed, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_worker_routes_missing_document_to_retry_then_dead_letter() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let config = test_config(dir.path());
        let store: Arc<dyn crate::contracts::DocumentStore> = Arc::new(MemoryStore::new());
        store.ensure_run("run-1", "h").await?;
        let (processor, queue) = factory::create_processor(&config, store.clone()).await?;
        // Enqueued but never written to disk → fetch fails as transient.
        let outcome = queue
            .add_document("run-1", "ghost.md", "docs", Default::default())
            .await?;

        let worker = Worker::new(
            ValidatedWorkerId::new("w-test")?,
            queue.clone(),
            processor,
            Arc::new(AtomicBool::new(false)),
            None,
        );
        let stats = worker.run("run-1").await?;

        // max_retries = 1 with zero backoff: one retry then dead letter.
        assert_eq!(stats.documents_processed, 0);
        assert_eq!(stats.documents_failed, 2);
        let item = queue.get_item(outcome.queue_id).await?.unwrap();
        assert_eq!(item.state, QueueState::Failed);
        assert_eq!(item.retry_count, 1);
        assert!(item.error_info.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_flag_refuses_new_claims() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        tokio::fs::write(dir.path().join("a.md"), "# A\n\nBody.").await?;
        let config = test_config(dir.path());
        let store: Arc<dyn crate::contracts::DocumentStore> = Arc::new(MemoryStore::new());
        store.ensure_run("run-1", "h").await?;
        let (processor, queue) = factory::create_processor(&config, store.clone()).await?;
        queue
            .add_document("run-1", "a.md", "docs", Default::default())
            .await?;

        let shutdown = Arc::new(AtomicBool::new(true));
        let worker = Worker::new(
            ValidatedWorkerId::new("w-test")?,
            queue.clone(),
            processor,
            shutdown,
            None,
        );
        let stats = worker.run("run-1").await?;
        assert_eq!(stats.documents_processed, 0);

        let status = queue.get_status("run-1").await?;
        assert_eq!(status.pending, 1, "item left for other workers");
        Ok(())
    }

    #[tokio::test]
    async fn test_max_documents_cap() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        for name in ["a.md", "b.md", "c.md"] {
            tokio::fs::write(dir.path().join(name), "# T\n\nBody.").await?;
        }
        let config = test_config(dir.path());
        let store: Arc<dyn crate::contracts::DocumentStore> = Arc::new(MemoryStore::new());
        store.ensure_run("run-1", "h").await?;
        let (processor, queue) = factory::create_processor(&config, store.clone()).await?;
        for name in ["a.md", "b.md", "c.md"] {
            queue
                .add_document("run-1", name, "docs", Default::default())
                .await?;
        }

        let worker = Worker::new(
            ValidatedWorkerId::new("w-test")?,
            queue.clone(),
            processor,
            Arc::new(AtomicBool::new(false)),
            Some(2),
        );
        let stats = worker.run("run-1").await?;
        assert_eq!(stats.documents_processed, 2);

        let status = queue.get_status("run-1").await?;
        assert_eq!(status.pending, 1);
        Ok(())
    }

    #[test]
    fn test_pool_worker_ids() -> Result<()> {
        let store: Arc<dyn crate::contracts::DocumentStore> = Arc::new(MemoryStore::new());
        let queue = Arc::new(WorkQueue::new(store.clone(), Default::default()));
        let config = test_config(std::path::Path::new("/tmp"));
        let processor = futures::executor::block_on(factory::create_processor(&config, store))
            .unwrap()
            .0;

        let base = ValidatedWorkerId::new("pool")?;
        let pool = WorkerPool::new(
            3,
            Some(&base),
            queue,
            processor,
            Arc::new(AtomicBool::new(false)),
            None,
        )?;
        assert_eq!(pool.worker_ids(), vec!["pool-1", "pool-2", "pool-3"]);
        Ok(())
    }
}
