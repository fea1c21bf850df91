// In-Memory Store
// A complete DocumentStore backend guarded by a single mutex. One lock over
// the whole state gives claim_next the same atomicity the Postgres backend
// gets from row locking, which is exactly the contract in a single process.
// Used by the test suites and by `storage.backend = memory` configs.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use crate::contracts::{
    Document, DocumentPersistPlan, DocumentStore, Element, EnqueueOutcome, Entity, EntityMapping,
    EntityRelationship, ErrorInfo, Metadata, PersistReceipt, ProcessingRun, QueueItem, QueueStatus,
    Relationship, WorkerRegistration,
};
use crate::types::{QueueState, RunStatus, WorkerStatus, DERIVED_FROM};

#[derive(Default)]
struct State {
    runs: HashMap<String, ProcessingRun>,
    // keyed by (run_id, worker_id)
    workers: HashMap<(String, String), WorkerRegistration>,
    queue: BTreeMap<i64, QueueItem>,
    next_queue_id: i64,
    documents: HashMap<String, Document>,
    elements: HashMap<String, Element>,
    element_id_by_pk: HashMap<i64, String>,
    next_element_pk: i64,
    relationships: HashMap<String, Relationship>,
    entities: HashMap<String, Entity>,
    entity_id_by_pk: HashMap<i64, String>,
    next_entity_pk: i64,
    mappings: Vec<EntityMapping>,
    entity_relationships: Vec<EntityRelationship>,
}

pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_queue_id: 1,
                next_element_pk: 1,
                next_entity_pk: 1,
                ..Default::default()
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn delete_entity(&mut self, entity_pk: i64) {
        if let Some(entity_id) = self.entity_id_by_pk.remove(&entity_pk) {
            self.entities.remove(&entity_id);
        }
        self.mappings
            .retain(|m| m.entity_pk != entity_pk);
        self.entity_relationships
            .retain(|r| r.source_pk != entity_pk && r.target_pk != entity_pk);
    }

    /// Drop a document's elements with cascade to mappings and to
    /// intra-document relationships. Cross-document edges survive.
    fn drop_document_content(&mut self, doc_id: &str) {
        let doomed: Vec<(String, i64)> = self
            .elements
            .values()
            .filter(|e| e.doc_id == doc_id)
            .map(|e| (e.element_id.clone(), e.element_pk))
            .collect();
        let doomed_ids: std::collections::HashSet<&str> =
            doomed.iter().map(|(id, _)| id.as_str()).collect();
        let doomed_pks: std::collections::HashSet<i64> =
            doomed.iter().map(|(_, pk)| *pk).collect();

        self.relationships.retain(|_, r| {
            r.is_cross_document()
                || (!doomed_ids.contains(r.source_id.as_str())
                    && !doomed_ids.contains(r.target_id.as_str()))
        });
        self.mappings.retain(|m| !doomed_pks.contains(&m.element_pk));
        for (element_id, pk) in doomed {
            self.elements.remove(&element_id);
            self.element_id_by_pk.remove(&pk);
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn init_schema(&self, force: bool) -> Result<()> {
        if force {
            let mut state = self.state.lock();
            *state = State {
                next_queue_id: 1,
                next_element_pk: 1,
                next_entity_pk: 1,
                ..Default::default()
            };
        }
        Ok(())
    }

    async fn schema_exists(&self) -> Result<bool> {
        Ok(true)
    }

    async fn ensure_run(&self, run_id: &str, config_hash: &str) -> Result<ProcessingRun> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let run = state
            .runs
            .entry(run_id.to_string())
            .or_insert_with(|| ProcessingRun {
                run_id: run_id.to_string(),
                status: RunStatus::Active,
                config_hash: config_hash.to_string(),
                created_at: now,
                updated_at: now,
                worker_count: 0,
                documents_queued: 0,
                documents_processed: 0,
                documents_failed: 0,
            });
        Ok(run.clone())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<ProcessingRun>> {
        Ok(self.state.lock().runs.get(run_id).cloned())
    }

    async fn list_runs(&self) -> Result<Vec<ProcessingRun>> {
        let state = self.state.lock();
        let mut runs: Vec<_> = state.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let mut state = self.state.lock();
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| anyhow!("Unknown run: {run_id}"))?;
        run.status = status;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn add_run_counts(
        &self,
        run_id: &str,
        queued: i64,
        processed: i64,
        failed: i64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| anyhow!("Unknown run: {run_id}"))?;
        run.documents_queued += queued;
        run.documents_processed += processed;
        run.documents_failed += failed;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn register_worker(&self, run_id: &str, worker_id: &str, hostname: &str) -> Result<()> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let key = (run_id.to_string(), worker_id.to_string());
        if let Some(existing) = state.workers.get_mut(&key) {
            existing.status = WorkerStatus::Active;
            existing.last_heartbeat = now;
            return Ok(());
        }
        state.workers.insert(
            key,
            WorkerRegistration {
                worker_id: worker_id.to_string(),
                run_id: run_id.to_string(),
                status: WorkerStatus::Active,
                hostname: hostname.to_string(),
                last_heartbeat: now,
                documents_processed: 0,
                documents_failed: 0,
                registered_at: now,
            },
        );
        if let Some(run) = state.runs.get_mut(run_id) {
            run.worker_count += 1;
        }
        Ok(())
    }

    async fn heartbeat_worker(
        &self,
        run_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let key = (run_id.to_string(), worker_id.to_string());
        if let Some(worker) = state.workers.get_mut(&key) {
            worker.last_heartbeat = now;
        }
        Ok(())
    }

    async fn update_worker_status(
        &self,
        run_id: &str,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let key = (run_id.to_string(), worker_id.to_string());
        if let Some(worker) = state.workers.get_mut(&key) {
            worker.status = status;
        }
        Ok(())
    }

    async fn add_worker_counts(
        &self,
        run_id: &str,
        worker_id: &str,
        processed: i64,
        failed: i64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let key = (run_id.to_string(), worker_id.to_string());
        if let Some(worker) = state.workers.get_mut(&key) {
            worker.documents_processed += processed;
            worker.documents_failed += failed;
        }
        Ok(())
    }

    async fn list_workers(&self, run_id: &str) -> Result<Vec<WorkerRegistration>> {
        let state = self.state.lock();
        let mut workers: Vec<_> = state
            .workers
            .values()
            .filter(|w| w.run_id == run_id)
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    async fn enqueue_document(
        &self,
        run_id: &str,
        doc_id: &str,
        source_name: &str,
        priority: i32,
        metadata: Metadata,
    ) -> Result<EnqueueOutcome> {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .queue
            .values()
            .find(|i| i.run_id == run_id && i.doc_id == doc_id && !i.state.is_terminal())
        {
            return Ok(EnqueueOutcome {
                queue_id: existing.queue_id,
                created: false,
            });
        }

        let now = Utc::now();
        let queue_id = state.next_queue_id;
        state.next_queue_id += 1;
        state.queue.insert(
            queue_id,
            QueueItem {
                queue_id,
                run_id: run_id.to_string(),
                doc_id: doc_id.to_string(),
                source_name: source_name.to_string(),
                state: QueueState::Pending,
                priority,
                retry_count: 0,
                claimed_by_worker: None,
                claimed_at: None,
                last_heartbeat: None,
                next_attempt_at: None,
                metadata,
                error_info: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(EnqueueOutcome {
            queue_id,
            created: true,
        })
    }

    async fn claim_next(
        &self,
        run_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>> {
        // The entire select-and-update happens under one lock: two
        // concurrent callers can never observe the same claimable item.
        let mut state = self.state.lock();
        let candidate = state
            .queue
            .values()
            .filter(|i| i.run_id == run_id)
            .filter(|i| match i.state {
                QueueState::Pending => true,
                QueueState::Retry => i.next_attempt_at.map(|t| now >= t).unwrap_or(true),
                _ => false,
            })
            .min_by_key(|i| (i.priority, i.created_at, i.queue_id))
            .map(|i| i.queue_id);

        let Some(queue_id) = candidate else {
            return Ok(None);
        };
        let item = state.queue.get_mut(&queue_id).expect("candidate exists");
        item.state = QueueState::Processing;
        item.claimed_by_worker = Some(worker_id.to_string());
        item.claimed_at = Some(now);
        item.last_heartbeat = Some(now);
        item.updated_at = now;
        Ok(Some(item.clone()))
    }

    async fn get_queue_item(&self, queue_id: i64) -> Result<Option<QueueItem>> {
        Ok(self.state.lock().queue.get(&queue_id).cloned())
    }

    async fn heartbeat_claims(
        &self,
        run_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        let mut touched = 0;
        for item in state.queue.values_mut() {
            if item.run_id == run_id
                && item.state == QueueState::Processing
                && item.claimed_by_worker.as_deref() == Some(worker_id)
            {
                item.last_heartbeat = Some(now);
                item.updated_at = now;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn mark_item_completed(&self, queue_id: i64) -> Result<()> {
        let mut state = self.state.lock();
        let item = state
            .queue
            .get_mut(&queue_id)
            .ok_or_else(|| anyhow!("Unknown queue item: {queue_id}"))?;
        item.state = QueueState::Completed;
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_item_retry(
        &self,
        queue_id: i64,
        next_attempt_at: DateTime<Utc>,
        error: ErrorInfo,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let item = state
            .queue
            .get_mut(&queue_id)
            .ok_or_else(|| anyhow!("Unknown queue item: {queue_id}"))?;
        item.state = QueueState::Retry;
        item.retry_count += 1;
        item.claimed_by_worker = None;
        item.claimed_at = None;
        item.next_attempt_at = Some(next_attempt_at);
        item.error_info = Some(error);
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_item_failed(&self, queue_id: i64, error: ErrorInfo) -> Result<()> {
        let mut state = self.state.lock();
        let item = state
            .queue
            .get_mut(&queue_id)
            .ok_or_else(|| anyhow!("Unknown queue item: {queue_id}"))?;
        item.state = QueueState::Failed;
        item.claimed_by_worker = None;
        item.claimed_at = None;
        item.error_info = Some(error);
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_item_pending(&self, queue_id: i64) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(item) = state.queue.get_mut(&queue_id) else {
            return Ok(false);
        };
        if item.state != QueueState::Failed {
            return Ok(false);
        }
        item.state = QueueState::Pending;
        item.retry_count = 0;
        item.claimed_by_worker = None;
        item.claimed_at = None;
        item.last_heartbeat = None;
        item.next_attempt_at = None;
        item.error_info = None;
        item.updated_at = Utc::now();
        Ok(true)
    }

    async fn reclaim_stale_items(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let mut reclaimed = 0;
        for item in state.queue.values_mut() {
            let stale = item.state == QueueState::Processing
                && item.last_heartbeat.map(|t| t < cutoff).unwrap_or(true);
            if stale {
                item.state = QueueState::Retry;
                item.retry_count += 1;
                item.claimed_by_worker = None;
                item.claimed_at = None;
                item.next_attempt_at = Some(now);
                item.updated_at = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn queue_status(&self, run_id: &str) -> Result<QueueStatus> {
        let state = self.state.lock();
        let mut status = QueueStatus::default();
        for item in state.queue.values().filter(|i| i.run_id == run_id) {
            match item.state {
                QueueState::Pending => status.pending += 1,
                QueueState::Processing => status.processing += 1,
                QueueState::Completed => status.completed += 1,
                QueueState::Failed => status.failed += 1,
                QueueState::Retry => status.retry += 1,
            }
        }
        Ok(status)
    }

    async fn list_failed_items(
        &self,
        run_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<QueueItem>> {
        let state = self.state.lock();
        let mut items: Vec<_> = state
            .queue
            .values()
            .filter(|i| i.state == QueueState::Failed)
            .filter(|i| run_id.map(|r| i.run_id == r).unwrap_or(true))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        items.truncate(limit);
        Ok(items)
    }

    async fn purge_failed_items(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.queue.len();
        state.queue.retain(|_, item| {
            !(item.state == QueueState::Failed
                && item
                    .error_info
                    .as_ref()
                    .map(|e| e.failed_at < cutoff)
                    .unwrap_or(item.updated_at < cutoff))
        });
        Ok((before - state.queue.len()) as u64)
    }

    async fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        Ok(self.state.lock().documents.get(doc_id).cloned())
    }

    async fn apply_document_plan(&self, plan: DocumentPersistPlan) -> Result<PersistReceipt> {
        plan.validate()?;
        let mut state = self.state.lock();
        let doc_id = plan.document.doc_id.clone();

        if plan.replace_existing {
            state.drop_document_content(&doc_id);
        }
        let mut document = plan.document;
        if let Some(existing) = state.documents.get(&doc_id) {
            document.created_at = existing.created_at;
        }
        state.documents.insert(doc_id.clone(), document);

        // Elements arrive parents-first; assign pks in that order.
        let mut pk_by_element_id: HashMap<String, i64> = HashMap::new();
        for mut element in plan.elements.clone() {
            let pk = state.next_element_pk;
            state.next_element_pk += 1;
            element.element_pk = pk;
            pk_by_element_id.insert(element.element_id.clone(), pk);
            state.element_id_by_pk.insert(pk, element.element_id.clone());
            state.elements.insert(element.element_id.clone(), element);
        }

        for relationship in &plan.relationships {
            state
                .relationships
                .insert(relationship.relationship_id.clone(), relationship.clone());
        }

        for pk in &plan.entities_deleted {
            state.delete_entity(*pk);
        }
        // Unlinked entities already lost this document's mappings with the
        // element cascade above; their rows stay for the other documents.

        for entity in &plan.entities_updated {
            if let Some(existing) = state.entities.get_mut(&entity.entity_id) {
                existing.attributes = entity.attributes.clone();
                existing.name = entity.name.clone();
            }
        }

        for entity in &plan.entities_created {
            if state.entities.contains_key(&entity.entity_id) {
                continue; // another document already produced it
            }
            let pk = state.next_entity_pk;
            state.next_entity_pk += 1;
            let mut row = entity.clone();
            row.entity_pk = pk;
            state.entity_id_by_pk.insert(pk, row.entity_id.clone());
            state.entities.insert(row.entity_id.clone(), row);
        }

        for mapping in &plan.mappings {
            let element_pk = *pk_by_element_id
                .get(&mapping.element_id)
                .ok_or_else(|| anyhow!("Mapping references unknown element {}", mapping.element_id))?;
            let entity_pk = state
                .entities
                .get(&mapping.entity_id)
                .map(|e| e.entity_pk)
                .ok_or_else(|| anyhow!("Mapping references unknown entity {}", mapping.entity_id))?;
            state.mappings.push(EntityMapping {
                element_pk,
                entity_pk,
                relationship_type: DERIVED_FROM.to_string(),
                domain: mapping.domain.clone(),
            });
        }

        for planned in &plan.entity_relationships {
            let source_pk = state
                .entities
                .get(&planned.source_entity_id)
                .map(|e| e.entity_pk)
                .ok_or_else(|| anyhow!("Unknown source entity {}", planned.source_entity_id))?;
            let target_pk = state
                .entities
                .get(&planned.target_entity_id)
                .map(|e| e.entity_pk)
                .ok_or_else(|| anyhow!("Unknown target entity {}", planned.target_entity_id))?;
            let duplicate = state.entity_relationships.iter().any(|r| {
                r.source_pk == source_pk
                    && r.target_pk == target_pk
                    && r.relationship_type == planned.relationship_type
            });
            if !duplicate {
                state.entity_relationships.push(EntityRelationship {
                    source_pk,
                    target_pk,
                    relationship_type: planned.relationship_type.clone(),
                    confidence: planned.confidence,
                    domain: planned.domain.clone(),
                });
            }
        }

        Ok(PersistReceipt {
            elements_written: plan.elements.len() as u64,
            relationships_written: plan.relationships.len() as u64,
            entity_counts: plan.counts,
        })
    }

    async fn get_elements(&self, doc_id: &str) -> Result<Vec<Element>> {
        let state = self.state.lock();
        let mut elements: Vec<_> = state
            .elements
            .values()
            .filter(|e| e.doc_id == doc_id)
            .cloned()
            .collect();
        elements.sort_by_key(|e| e.document_position);
        Ok(elements)
    }

    async fn get_element_by_id(&self, element_id: &str) -> Result<Option<Element>> {
        Ok(self.state.lock().elements.get(element_id).cloned())
    }

    async fn elements_with_embeddings(
        &self,
        excluding_doc: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Element>> {
        let state = self.state.lock();
        let mut elements: Vec<_> = state
            .elements
            .values()
            .filter(|e| e.embedding.is_some())
            .filter(|e| excluding_doc.map(|d| e.doc_id != d).unwrap_or(true))
            .cloned()
            .collect();
        elements.sort_by_key(|e| e.element_pk);
        elements.truncate(limit);
        Ok(elements)
    }

    async fn outgoing_relationships(&self, element_id: &str) -> Result<Vec<Relationship>> {
        let state = self.state.lock();
        let mut relationships: Vec<_> = state
            .relationships
            .values()
            .filter(|r| r.source_id == element_id)
            .cloned()
            .collect();
        relationships.sort_by(|a, b| a.relationship_id.cmp(&b.relationship_id));
        Ok(relationships)
    }

    async fn insert_relationships(&self, relationships: &[Relationship]) -> Result<u64> {
        let mut state = self.state.lock();
        let mut written = 0;
        for relationship in relationships {
            state
                .relationships
                .insert(relationship.relationship_id.clone(), relationship.clone());
            written += 1;
        }
        Ok(written)
    }

    async fn entities_derived_from(&self, doc_id: &str) -> Result<Vec<Entity>> {
        let state = self.state.lock();
        let doc_pks: std::collections::HashSet<i64> = state
            .elements
            .values()
            .filter(|e| e.doc_id == doc_id)
            .map(|e| e.element_pk)
            .collect();
        let mut entity_pks: Vec<i64> = state
            .mappings
            .iter()
            .filter(|m| doc_pks.contains(&m.element_pk) && m.relationship_type == DERIVED_FROM)
            .map(|m| m.entity_pk)
            .collect();
        entity_pks.sort_unstable();
        entity_pks.dedup();
        Ok(entity_pks
            .into_iter()
            .filter_map(|pk| {
                state
                    .entity_id_by_pk
                    .get(&pk)
                    .and_then(|id| state.entities.get(id))
                    .cloned()
            })
            .collect())
    }

    async fn get_entity(&self, entity_id: &str) -> Result<Option<Entity>> {
        Ok(self.state.lock().entities.get(entity_id).cloned())
    }

    async fn entity_mapping_count(
        &self,
        entity_pk: i64,
        excluding_doc: Option<&str>,
    ) -> Result<u64> {
        let state = self.state.lock();
        let excluded_pks: std::collections::HashSet<i64> = match excluding_doc {
            Some(doc_id) => state
                .elements
                .values()
                .filter(|e| e.doc_id == doc_id)
                .map(|e| e.element_pk)
                .collect(),
            None => Default::default(),
        };
        Ok(state
            .mappings
            .iter()
            .filter(|m| {
                m.entity_pk == entity_pk
                    && m.relationship_type == DERIVED_FROM
                    && !excluded_pks.contains(&m.element_pk)
            })
            .count() as u64)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
