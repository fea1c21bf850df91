// Dead Letter Queue
// Operator tooling over terminally failed queue items: listing, requeueing,
// purging, failure-pattern analysis, and export. Failed items keep their
// full error context, so recovery is inspect → fix the cause → requeue.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::contracts::{DocumentStore, QueueItem};

/// Cap on sample messages retained per failure pattern.
const PATTERN_SAMPLES: usize = 3;

pub struct DeadLetterQueue {
    store: Arc<dyn DocumentStore>,
}

/// A group of failures sharing an error fingerprint.
#[derive(Debug, Clone, Serialize)]
pub struct FailurePattern {
    pub error_type: String,
    pub frequency: usize,
    pub affected_documents: usize,
    pub first_occurrence: Option<DateTime<Utc>>,
    pub last_occurrence: Option<DateTime<Utc>>,
    pub sample_messages: Vec<String>,
    pub affected_sources: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ExportDocument<'a> {
    export_timestamp: DateTime<Utc>,
    run_id_filter: Option<&'a str>,
    total_items: usize,
    items: &'a [QueueItem],
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Failed items, most recent first, optionally filtered by run.
    pub async fn list(&self, run_id: Option<&str>, limit: usize) -> Result<Vec<QueueItem>> {
        self.store.list_failed_items(run_id, limit).await
    }

    /// Requeue one item: failed → pending with retry_count reset to zero.
    /// Returns false when the item does not exist or is not failed.
    pub async fn retry(&self, queue_id: i64) -> Result<bool> {
        let requeued = self.store.reset_item_pending(queue_id).await?;
        if requeued {
            info!(queue_id, "dead-letter item requeued");
        }
        Ok(requeued)
    }

    /// Requeue every failed item of a run. Returns (requeued, total).
    pub async fn retry_run(&self, run_id: &str) -> Result<(usize, usize)> {
        let items = self.list(Some(run_id), usize::MAX).await?;
        let total = items.len();
        let mut requeued = 0;
        for item in items {
            if self.retry(item.queue_id).await? {
                requeued += 1;
            }
        }
        info!(run_id, requeued, total, "dead-letter run requeue");
        Ok((requeued, total))
    }

    /// Delete failed items older than `days` days.
    pub async fn purge(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(days as i64);
        let purged = self.store.purge_failed_items(cutoff).await?;
        info!(days, purged, "dead-letter purge");
        Ok(purged)
    }

    /// Group failures by error fingerprint, most frequent first.
    pub async fn analyze(&self, run_id: Option<&str>) -> Result<Vec<FailurePattern>> {
        let items = self.list(run_id, usize::MAX).await?;

        let mut groups: BTreeMap<String, Vec<&QueueItem>> = BTreeMap::new();
        for item in &items {
            let fingerprint = item
                .error_info
                .as_ref()
                .map(|e| e.fingerprint.clone())
                .unwrap_or_else(|| "unknown".to_string());
            groups.entry(fingerprint).or_default().push(item);
        }

        let mut patterns: Vec<FailurePattern> = groups
            .into_iter()
            .map(|(error_type, members)| {
                let mut documents: Vec<&str> =
                    members.iter().map(|i| i.doc_id.as_str()).collect();
                documents.sort_unstable();
                documents.dedup();

                let mut sources: Vec<String> = members
                    .iter()
                    .map(|i| i.source_name.clone())
                    .collect();
                sources.sort_unstable();
                sources.dedup();

                let occurrences: Vec<DateTime<Utc>> = members
                    .iter()
                    .filter_map(|i| i.error_info.as_ref().map(|e| e.failed_at))
                    .collect();

                FailurePattern {
                    error_type,
                    frequency: members.len(),
                    affected_documents: documents.len(),
                    first_occurrence: occurrences.iter().min().copied(),
                    last_occurrence: occurrences.iter().max().copied(),
                    sample_messages: members
                        .iter()
                        .filter_map(|i| i.error_info.as_ref().map(|e| e.message.clone()))
                        .take(PATTERN_SAMPLES)
                        .collect(),
                    affected_sources: sources,
                }
            })
            .collect();

        patterns.sort_by(|a, b| b.frequency.cmp(&a.frequency));
        Ok(patterns)
    }

    /// Export failed items to a JSON file. Returns the item count.
    pub async fn export(&self, run_id: Option<&str>, path: impl AsRef<Path>) -> Result<usize> {
        let items = self.list(run_id, 1000).await?;
        let document = ExportDocument {
            export_timestamp: Utc::now(),
            run_id_filter: run_id,
            total_items: items.len(),
            items: &items,
        };
        let path = path.as_ref();
        let payload =
            serde_json::to_string_pretty(&document).context("Failed to serialize export")?;
        std::fs::write(path, payload)
            .with_context(|| format!("Failed to write export file: {}", path.display()))?;
        info!(path = %path.display(), items = items.len(), "dead-letter export written");
        Ok(items.len())
    }
}
