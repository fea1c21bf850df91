// Processing Coordinator
// Run lifecycle: derive the run id from config, enumerate documents from
// every configured source, enqueue them, and monitor until the queue
// drains. In single mode the coordinator drains its own queue with one
// in-process worker; in distributed mode separate worker processes do.

use anyhow::{anyhow, Result};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::{Config, ProcessingMode};
use crate::content_source::SourceRegistry;
use crate::contracts::{DocumentStore, Metadata, LINK_DEPTH_KEY};
use crate::document_processor::DocumentProcessor;
use crate::factory;
use crate::observability::RunSummary;
use crate::run_coordinator::{derive_run_id, RunCoordinator};
use crate::types::ValidatedWorkerId;
use crate::work_queue::WorkQueue;
use crate::worker::Worker;

/// Monitor poll cadence while waiting for workers to drain the queue.
const MONITOR_POLL: Duration = Duration::from_secs(2);

pub struct Coordinator {
    config: Config,
    store: Arc<dyn DocumentStore>,
    queue: Arc<WorkQueue>,
    sources: Arc<SourceRegistry>,
    processor: Arc<DocumentProcessor>,
    runs: RunCoordinator,
    shutdown: Arc<AtomicBool>,
}

impl Coordinator {
    pub async fn new(
        config: Config,
        store: Arc<dyn DocumentStore>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let (processor, queue) = factory::create_processor(&config, store.clone()).await?;
        let sources = factory::create_sources(&config)?;
        let runs = RunCoordinator::new(store.clone());
        Ok(Self {
            config,
            store,
            queue,
            sources,
            processor,
            runs,
            shutdown,
        })
    }

    /// Execute one full run: ensure, enqueue, drain or monitor, complete.
    pub async fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let run_id = derive_run_id(&self.config)?;
        let run_id = run_id.as_str();
        self.runs.ensure_run_exists(run_id, &self.config).await?;

        let queued = self.enqueue_from_sources(run_id).await?;
        info!(run_id, queued, "document enumeration complete");

        match self.config.processing.mode {
            ProcessingMode::Single => self.drain_inline(run_id).await?,
            ProcessingMode::Distributed | ProcessingMode::Worker => {
                self.monitor(run_id).await?;
            }
        }

        self.runs.mark_run_completed(run_id).await?;
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| anyhow!("Run row vanished: {run_id}"))?;
        Ok(RunSummary {
            run_id: run_id.to_string(),
            documents_queued: run.documents_queued.max(0) as u64,
            documents_processed: run.documents_processed.max(0) as u64,
            documents_failed: run.documents_failed.max(0) as u64,
            runtime_seconds: started.elapsed().as_secs_f64(),
        })
    }

    /// Enumerate every configured source and enqueue its documents.
    /// Source failures are isolated: a broken source is logged and
    /// skipped, the run proceeds with the rest.
    async fn enqueue_from_sources(&self, run_id: &str) -> Result<u64> {
        let mut queued = 0;
        for source in self.sources.iter() {
            let documents = match source.list_documents().await {
                Ok(documents) => documents,
                Err(error) => {
                    warn!(source = source.name(), %error, "source enumeration failed, skipping");
                    continue;
                }
            };
            info!(
                source = source.name(),
                documents = documents.len(),
                "source enumerated"
            );
            for document in documents {
                let mut metadata: Metadata = document.metadata;
                metadata.insert(LINK_DEPTH_KEY.to_string(), json!(0));
                let outcome = self
                    .queue
                    .add_document(run_id, &document.doc_id, source.name(), metadata)
                    .await?;
                if outcome.created {
                    queued += 1;
                }
            }
        }
        Ok(queued)
    }

    /// Single mode: drain the queue in-process with one worker.
    async fn drain_inline(&self, run_id: &str) -> Result<()> {
        let worker = Worker::new(
            ValidatedWorkerId::generate(),
            self.queue.clone(),
            self.processor.clone(),
            self.shutdown.clone(),
            None,
        );
        let stats = worker.run(run_id).await?;
        info!(
            run_id,
            processed = stats.documents_processed,
            failed = stats.documents_failed,
            "inline drain complete"
        );
        Ok(())
    }

    /// Distributed mode: watch the queue, reclaim stale work, and return
    /// once everything is terminal. Failed documents do not abort the run.
    async fn monitor(&self, run_id: &str) -> Result<()> {
        let timeout = self.config.processing.heartbeat_timeout_seconds;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                // Leave the run active so a restarted coordinator resumes it.
                return Err(anyhow!("Coordinator interrupted while monitoring run {run_id}"));
            }

            self.queue.reclaim_stale(timeout).await?;
            self.runs.detect_stale_workers(run_id, timeout).await?;

            let status = self.queue.get_status(run_id).await?;
            if status.is_drained() {
                info!(
                    run_id,
                    completed = status.completed,
                    failed = status.failed,
                    "queue drained"
                );
                return Ok(());
            }
            info!(
                run_id,
                pending = status.pending,
                processing = status.processing,
                retry = status.retry,
                completed = status.completed,
                failed = status.failed,
                "run in progress"
            );
            tokio::time::sleep(MONITOR_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::types::RunStatus;

    fn config_for(dir: &std::path::Path, mode: &str) -> Config {
        Config::from_yaml(&format!(
            r#"
storage:
  backend: memory
content_sources:
  - name: docs
    type: filesystem
    base_path: {}
processing:
  mode: {mode}
"#,
            dir.display()
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_empty_source_completes_with_zero_documents() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let config = config_for(dir.path(), "single");
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let coordinator =
            Coordinator::new(config.clone(), store.clone(), Arc::new(AtomicBool::new(false)))
                .await?;

        let summary = coordinator.run().await?;
        assert_eq!(summary.documents_queued, 0);
        assert_eq!(summary.documents_processed, 0);

        let run_id = derive_run_id(&config)?;
        let run = store.get_run(run_id.as_str()).await?.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn test_single_mode_ingests_directory() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        tokio::fs::write(dir.path().join("one.md"), "# One\n\nFirst body.").await?;
        tokio::fs::write(dir.path().join("two.md"), "# Two\n\nSecond body.").await?;

        let config = config_for(dir.path(), "single");
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let coordinator =
            Coordinator::new(config.clone(), store.clone(), Arc::new(AtomicBool::new(false)))
                .await?;

        let summary = coordinator.run().await?;
        assert_eq!(summary.documents_queued, 2);
        assert_eq!(summary.documents_processed, 2);
        assert_eq!(summary.documents_failed, 0);

        assert!(store.get_document("one.md").await?.is_some());
        let elements = store.get_elements("one.md").await?;
        assert!(!elements.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_coordinator_restart_resumes_run() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        tokio::fs::write(dir.path().join("one.md"), "# One\n\nBody.").await?;

        let config = config_for(dir.path(), "single");
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());

        let first =
            Coordinator::new(config.clone(), store.clone(), Arc::new(AtomicBool::new(false)))
                .await?;
        let first_summary = first.run().await?;

        // Second coordinator with the same config joins the same run and
        // re-enqueues the document (its prior item is terminal).
        let second =
            Coordinator::new(config.clone(), store.clone(), Arc::new(AtomicBool::new(false)))
                .await?;
        let second_summary = second.run().await?;
        assert_eq!(first_summary.run_id, second_summary.run_id);
        assert_eq!(store.list_runs().await?.len(), 1);
        Ok(())
    }
}
