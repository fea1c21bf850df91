// Run Coordinator
// Deterministic run identity plus the run/worker registry operations. The
// run_id is a short hash over the canonical serialization of the config's
// content-sources and storage sections, so every process started with the
// same input set converges on the same run, across hosts and restarts.

use anyhow::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::contracts::{DocumentStore, ProcessingRun, WorkerRegistration};
use crate::types::{RunStatus, ValidatedRunId, WorkerStatus};

/// Derive the run id: first 12 hex chars of SHA-256 over the config's
/// canonical identity serialization.
pub fn derive_run_id(config: &Config) -> Result<ValidatedRunId> {
    let identity = config.identity_json()?;
    let digest = Sha256::digest(identity.as_bytes());
    ValidatedRunId::new(&hex::encode(digest)[..ValidatedRunId::LENGTH])
}

/// Full config hash stored on the run row for auditability.
pub fn config_hash(config: &Config) -> Result<String> {
    let identity = config.identity_json()?;
    Ok(hex::encode(Sha256::digest(identity.as_bytes())))
}

pub struct RunCoordinator {
    store: Arc<dyn DocumentStore>,
}

impl RunCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Insert the run row if missing. A coordinator restarting with the
    /// same config resumes the existing run rather than duplicating it.
    pub async fn ensure_run_exists(&self, run_id: &str, config: &Config) -> Result<ProcessingRun> {
        let hash = config_hash(config)?;
        let run = self.store.ensure_run(run_id, &hash).await?;
        info!(run_id, status = %run.status, "run ensured");
        Ok(run)
    }

    /// Insert or revive a worker registration.
    pub async fn register_worker(
        &self,
        run_id: &str,
        worker_id: &str,
        hostname: &str,
    ) -> Result<()> {
        self.store.register_worker(run_id, worker_id, hostname).await?;
        info!(run_id, worker_id, hostname, "worker registered");
        Ok(())
    }

    pub async fn mark_run_completed(&self, run_id: &str) -> Result<()> {
        self.store
            .update_run_status(run_id, RunStatus::Completed)
            .await?;
        info!(run_id, "run completed");
        Ok(())
    }

    pub async fn mark_run_failed(&self, run_id: &str) -> Result<()> {
        self.store.update_run_status(run_id, RunStatus::Failed).await?;
        warn!(run_id, "run failed");
        Ok(())
    }

    /// Workers whose heartbeat is older than the timeout. Each is marked
    /// stale in the registry; their in-flight claims are recovered
    /// separately by `WorkQueue::reclaim_stale`.
    pub async fn detect_stale_workers(
        &self,
        run_id: &str,
        timeout_seconds: u64,
    ) -> Result<Vec<WorkerRegistration>> {
        let now = Utc::now();
        let mut stale = Vec::new();
        for worker in self.store.list_workers(run_id).await? {
            if worker.status == WorkerStatus::Stopped || worker.status == WorkerStatus::Stale {
                continue;
            }
            if worker.is_stale(now, timeout_seconds as i64) {
                warn!(
                    run_id,
                    worker_id = %worker.worker_id,
                    last_heartbeat = %worker.last_heartbeat,
                    "stale worker detected"
                );
                self.store
                    .update_worker_status(run_id, &worker.worker_id, WorkerStatus::Stale)
                    .await?;
                stale.push(worker);
            }
        }
        Ok(stale)
    }

    /// Live workers: registered, not stopped, heartbeat within the timeout.
    pub async fn live_worker_count(&self, run_id: &str, timeout_seconds: u64) -> Result<usize> {
        let now = Utc::now();
        Ok(self
            .store
            .list_workers(run_id)
            .await?
            .into_iter()
            .filter(|w| {
                w.status != WorkerStatus::Stopped
                    && w.status != WorkerStatus::Stale
                    && !w.is_stale(now, timeout_seconds as i64)
            })
            .count())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<ProcessingRun>> {
        self.store.get_run(run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use chrono::Duration;

    const CONFIG_A: &str = r#"
storage:
  backend: memory
content_sources:
  - name: docs
    type: filesystem
    base_path: /data/docs
processing:
  mode: distributed
"#;

    #[test]
    fn test_run_id_is_deterministic() {
        let a = Config::from_yaml(CONFIG_A).unwrap();
        let b = Config::from_yaml(CONFIG_A).unwrap();
        assert_eq!(derive_run_id(&a).unwrap(), derive_run_id(&b).unwrap());
    }

    #[test]
    fn test_run_id_ignores_non_identity_sections() {
        let with_embedding = format!("{CONFIG_A}embedding:\n  enabled: true\n");
        let a = Config::from_yaml(CONFIG_A).unwrap();
        let b = Config::from_yaml(&with_embedding).unwrap();
        assert_eq!(derive_run_id(&a).unwrap(), derive_run_id(&b).unwrap());
    }

    #[test]
    fn test_run_id_tracks_content_sources() {
        let other = CONFIG_A.replace("/data/docs", "/data/elsewhere");
        let a = Config::from_yaml(CONFIG_A).unwrap();
        let b = Config::from_yaml(&other).unwrap();
        assert_ne!(derive_run_id(&a).unwrap(), derive_run_id(&b).unwrap());
    }

    #[tokio::test]
    async fn test_second_coordinator_joins_existing_run() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let coordinator = RunCoordinator::new(store.clone());
        let config = Config::from_yaml(CONFIG_A).unwrap();
        let run_id = derive_run_id(&config)?;

        let first = coordinator.ensure_run_exists(run_id.as_str(), &config).await?;
        let second = coordinator.ensure_run_exists(run_id.as_str(), &config).await?;
        assert_eq!(first.run_id, second.run_id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(store.list_runs().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_worker_detection() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let coordinator = RunCoordinator::new(store.clone());
        store.ensure_run("run-1", "h").await?;
        coordinator.register_worker("run-1", "w1", "host-a").await?;
        coordinator.register_worker("run-1", "w2", "host-b").await?;

        // Age w1's heartbeat past the timeout.
        store
            .heartbeat_worker("run-1", "w1", Utc::now() - Duration::seconds(900))
            .await?;

        let stale = coordinator.detect_stale_workers("run-1", 300).await?;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].worker_id, "w1");
        assert_eq!(coordinator.live_worker_count("run-1", 300).await?, 1);

        // A second sweep does not report the same worker again.
        let again = coordinator.detect_stale_workers("run-1", 300).await?;
        assert!(again.is_empty());
        Ok(())
    }
}
