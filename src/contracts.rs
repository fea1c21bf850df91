// Contract-First Design
// This module defines the shared data model and the storage contract that the
// queue, coordinator, and document-processor layers are written against.
// Backends implement `DocumentStore`; everything else stays backend-agnostic.

use anyhow::{ensure, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ElementType, QueueState, RelationshipType, RunStatus, WorkerStatus};

/// Opaque string→value mapping carried on documents, elements, queue items,
/// and relationships.
pub type Metadata = serde_json::Map<String, Value>;

/// Metadata key marking a relationship as crossing document boundaries.
pub const CROSS_DOCUMENT_KEY: &str = "cross_document";

/// Metadata key tracking link-discovery depth on queue items.
pub const LINK_DEPTH_KEY: &str = "link_depth";

/// Upper bound on `content_preview` length, in bytes at a char boundary.
pub const CONTENT_PREVIEW_MAX: usize = 240;

/// An ingested document: identity, provenance, and content fingerprint.
/// One document owns many elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub doc_type: String,
    pub source: String,
    pub content_hash: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A canonical parsed unit of a document.
///
/// # Invariants
/// - Exactly one element per document has `element_type == Root` and
///   `parent_id == None`
/// - `parent_id` references an element in the same document or is None
/// - `document_position` is a strict total order within the document
/// - `element_order` is a strict order among siblings sharing a parent
/// - `content_hash` is stable for identical source bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub element_id: String,
    /// Monotonic integer assigned by the store at persist time; 0 before.
    pub element_pk: i64,
    pub doc_id: String,
    pub parent_id: Option<String>,
    pub element_type: ElementType,
    pub content_preview: String,
    /// Opaque structured reference allowing the original bytes to be
    /// resolved later (source name, doc id, byte offsets).
    pub content_location: Value,
    pub content_hash: String,
    pub element_order: i32,
    pub document_position: i32,
    pub metadata: Metadata,
    pub embedding: Option<Vec<f32>>,
}

/// A directed edge between two elements.
///
/// Structural edges (contains, contained_by, next_sibling) are created
/// during parsing and deleted atomically with their owning document. Link
/// and semantic edges may reference elements in other documents; the
/// `cross_document` metadata flag distinguishes the two.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub relationship_id: String,
    pub source_id: String,
    pub target_id: String,
    pub relationship_type: RelationshipType,
    pub metadata: Metadata,
}

impl Relationship {
    pub fn is_cross_document(&self) -> bool {
        self.metadata
            .get(CROSS_DOCUMENT_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A domain object derived from one or more elements via ontology rules.
///
/// # Invariants
/// - `entity_id` is the stable normalization of (entity_type, name)
/// - Every stored entity has at least one live DERIVED_FROM mapping;
///   entities losing their last mapping are garbage-collected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Monotonic integer assigned by the store; 0 before persist.
    pub entity_pk: i64,
    pub entity_id: String,
    pub entity_type: String,
    pub name: String,
    pub domain: String,
    pub attributes: Metadata,
}

/// Many-to-many link between an element and an entity derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMapping {
    pub element_pk: i64,
    pub entity_pk: i64,
    pub relationship_type: String,
    pub domain: String,
}

/// A directed edge between two entities with its own type and confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub source_pk: i64,
    pub target_pk: i64,
    pub relationship_type: String,
    pub confidence: f64,
    pub domain: String,
}

/// Error context captured when a queue item fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable fingerprint for grouping failures (error type, not message).
    pub fingerprint: String,
    pub message: String,
    /// Chain of source errors, outermost first.
    pub details: Vec<String>,
    pub failed_at: DateTime<Utc>,
}

impl ErrorInfo {
    /// Snapshot an error chain for the queue. The fingerprint is the
    /// outermost error with digits stripped, so "timeout after 30s" and
    /// "timeout after 12s" group together.
    pub fn from_error(err: &anyhow::Error, now: DateTime<Utc>) -> Self {
        let message = err.to_string();
        let details: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
        let fingerprint: String = message
            .chars()
            .filter(|c| !c.is_ascii_digit())
            .take(120)
            .collect();
        Self {
            fingerprint,
            message,
            details,
            failed_at: now,
        }
    }
}

/// One unit of work: a (run, document) pair moving through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub queue_id: i64,
    pub run_id: String,
    pub doc_id: String,
    pub source_name: String,
    pub state: QueueState,
    /// Lower sorts sooner.
    pub priority: i32,
    pub retry_count: i32,
    pub claimed_by_worker: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub error_info: Option<ErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn link_depth(&self) -> u32 {
        self.metadata
            .get(LINK_DEPTH_KEY)
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    }
}

/// One logical ingestion over a config; spans processes and restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRun {
    pub run_id: String,
    pub status: RunStatus,
    pub config_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub worker_count: i64,
    pub documents_queued: i64,
    pub documents_processed: i64,
    pub documents_failed: i64,
}

/// A worker's registration row against a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub run_id: String,
    pub status: WorkerStatus,
    pub hostname: String,
    pub last_heartbeat: DateTime<Utc>,
    pub documents_processed: i64,
    pub documents_failed: i64,
    pub registered_at: DateTime<Utc>,
}

impl WorkerRegistration {
    pub fn is_stale(&self, now: DateTime<Utc>, timeout_seconds: i64) -> bool {
        (now - self.last_heartbeat).num_seconds() > timeout_seconds
    }
}

/// Counts by state for monitoring a run's queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub retry: u64,
}

impl QueueStatus {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.retry
    }

    /// No claimable or in-flight work remains.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.processing == 0 && self.retry == 0
    }
}

/// Result of an idempotent enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub queue_id: i64,
    /// False when an existing non-terminal item was returned instead.
    pub created: bool,
}

/// Smart-update classification counts returned to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartUpdateCounts {
    pub preserved: u64,
    pub updated: u64,
    pub created: u64,
    pub deleted: u64,
}

/// A DERIVED_FROM mapping planned before primary keys exist. The store
/// resolves both ids to pks inside the persist transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedMapping {
    pub element_id: String,
    pub entity_id: String,
    pub domain: String,
}

/// An entity relationship planned by entity_id, resolved to pks at persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedEntityRelationship {
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub relationship_type: String,
    pub confidence: f64,
    pub domain: String,
}

/// Everything one document commit writes, computed by the processor and
/// applied atomically by the store. A visible partial document is a bug.
#[derive(Debug, Clone)]
pub struct DocumentPersistPlan {
    pub document: Document,
    /// In insertion order: parents precede children, per the parent_id FK.
    pub elements: Vec<Element>,
    /// Intra-document relationships; endpoints are in `elements`.
    pub relationships: Vec<Relationship>,
    /// True when this doc_id already exists: existing elements and
    /// intra-document relationships are replaced wholesale first.
    pub replace_existing: bool,
    /// Entities new to this document (entity_pk == 0); upserted by
    /// entity_id since another document may already have produced them.
    pub entities_created: Vec<Entity>,
    /// Entities whose attributes changed; entity_pk preserved.
    pub entities_updated: Vec<Entity>,
    /// Entity pks to unlink from this document only (still referenced by
    /// other documents).
    pub entities_unlinked: Vec<i64>,
    /// Entity pks to delete outright, with their relationships.
    pub entities_deleted: Vec<i64>,
    pub mappings: Vec<PlannedMapping>,
    pub entity_relationships: Vec<PlannedEntityRelationship>,
    pub counts: SmartUpdateCounts,
}

impl DocumentPersistPlan {
    /// Validate the structural invariants a parser is contractually
    /// obligated to satisfy before the plan reaches a backend.
    pub fn validate(&self) -> Result<()> {
        let mut roots = 0usize;
        let mut seen_positions = std::collections::HashSet::new();
        let ids: std::collections::HashSet<&str> =
            self.elements.iter().map(|e| e.element_id.as_str()).collect();

        for element in &self.elements {
            if element.element_type == ElementType::Root {
                ensure!(
                    element.parent_id.is_none(),
                    "Root element {} must not have a parent",
                    element.element_id
                );
                roots += 1;
            }
            if let Some(parent) = &element.parent_id {
                ensure!(
                    ids.contains(parent.as_str()),
                    "Element {} references parent {} outside this document",
                    element.element_id,
                    parent
                );
            }
            ensure!(
                seen_positions.insert(element.document_position),
                "Duplicate document_position {} in document {}",
                element.document_position,
                self.document.doc_id
            );
        }
        ensure!(
            roots == 1,
            "Document {} must have exactly one root element, found {}",
            self.document.doc_id,
            roots
        );

        for rel in &self.relationships {
            ensure!(
                ids.contains(rel.source_id.as_str()),
                "Relationship {} source {} not in element set",
                rel.relationship_id,
                rel.source_id
            );
        }
        Ok(())
    }
}

/// Receipt for an applied persist plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReceipt {
    pub elements_written: u64,
    pub relationships_written: u64,
    pub entity_counts: SmartUpdateCounts,
}

/// The storage contract. One shared relational (or relational-equivalent)
/// store is the only mutable resource processes share.
///
/// # Atomicity discipline
/// - `claim_next` is the sole operation requiring an explicit row-locking
///   primitive (select-skip-locked-update-commit). A backend that cannot
///   provide it is not a valid queue backend and must fail at
///   construction rather than fall back to a racy path.
/// - `apply_document_plan` must commit everything or nothing.
/// - All other operations rely on the store's default isolation.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    // ---- schema ----

    /// Create all tables. With `force`, drop existing tables first.
    async fn init_schema(&self, force: bool) -> Result<()>;

    async fn schema_exists(&self) -> Result<bool>;

    // ---- runs and workers ----

    /// Insert the run row if missing; return the current row either way.
    /// Two coordinators racing on the same run_id must both succeed and
    /// observe a single row.
    async fn ensure_run(&self, run_id: &str, config_hash: &str) -> Result<ProcessingRun>;

    async fn get_run(&self, run_id: &str) -> Result<Option<ProcessingRun>>;

    async fn list_runs(&self) -> Result<Vec<ProcessingRun>>;

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<()>;

    /// Add deltas to the run counters (queued / processed / failed).
    async fn add_run_counts(
        &self,
        run_id: &str,
        queued: i64,
        processed: i64,
        failed: i64,
    ) -> Result<()>;

    /// Insert a worker row, or revive an existing one (status back to
    /// active, heartbeat refreshed).
    async fn register_worker(&self, run_id: &str, worker_id: &str, hostname: &str) -> Result<()>;

    async fn heartbeat_worker(
        &self,
        run_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn update_worker_status(
        &self,
        run_id: &str,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<()>;

    async fn add_worker_counts(
        &self,
        run_id: &str,
        worker_id: &str,
        processed: i64,
        failed: i64,
    ) -> Result<()>;

    async fn list_workers(&self, run_id: &str) -> Result<Vec<WorkerRegistration>>;

    // ---- queue ----

    /// Idempotent on (run_id, doc_id): if a non-terminal item exists its id
    /// is returned with `created == false`; if only terminal items exist a
    /// new pending item is created.
    async fn enqueue_document(
        &self,
        run_id: &str,
        doc_id: &str,
        source_name: &str,
        priority: i32,
        metadata: Metadata,
    ) -> Result<EnqueueOutcome>;

    /// Atomically select the highest-priority claimable item (pending, or
    /// retry with next_attempt_at <= now), mark it processing for this
    /// worker, and return it. Concurrent callers never receive the same
    /// item; losers get the next candidate or None.
    async fn claim_next(
        &self,
        run_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>>;

    async fn get_queue_item(&self, queue_id: i64) -> Result<Option<QueueItem>>;

    /// Refresh last_heartbeat on every item this worker currently holds.
    /// Returns the number of items touched.
    async fn heartbeat_claims(
        &self,
        run_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// processing → completed.
    async fn mark_item_completed(&self, queue_id: i64) -> Result<()>;

    /// processing → retry: increment retry_count, clear the claim, record
    /// the error and the next attempt time.
    async fn mark_item_retry(
        &self,
        queue_id: i64,
        next_attempt_at: DateTime<Utc>,
        error: ErrorInfo,
    ) -> Result<()>;

    /// processing → failed (dead letter), retaining full error context.
    async fn mark_item_failed(&self, queue_id: i64, error: ErrorInfo) -> Result<()>;

    /// Dead-letter requeue: failed → pending with retry_count reset to 0.
    /// Returns false if the item does not exist or is not failed.
    async fn reset_item_pending(&self, queue_id: i64) -> Result<bool>;

    /// Return every processing item whose last_heartbeat predates `cutoff`
    /// to retry with incremented retry_count. Any process may call this.
    async fn reclaim_stale_items(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn queue_status(&self, run_id: &str) -> Result<QueueStatus>;

    async fn list_failed_items(
        &self,
        run_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<QueueItem>>;

    /// Delete failed items whose failure predates `cutoff`.
    async fn purge_failed_items(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // ---- documents and graph ----

    async fn get_document(&self, doc_id: &str) -> Result<Option<Document>>;

    /// Apply a full document commit atomically: document upsert, wholesale
    /// element/intra-doc-relationship replacement when `replace_existing`,
    /// entity upserts/updates/unlinks/deletes, mappings, and entity
    /// relationships. Child elements are inserted after their parents;
    /// relationships after both endpoints.
    async fn apply_document_plan(&self, plan: DocumentPersistPlan) -> Result<PersistReceipt>;

    /// Elements of a document ordered by document_position.
    async fn get_elements(&self, doc_id: &str) -> Result<Vec<Element>>;

    async fn get_element_by_id(&self, element_id: &str) -> Result<Option<Element>>;

    /// Up to `limit` embedded elements outside `excluding_doc`, the
    /// candidate pool for cross-document semantic analysis.
    async fn elements_with_embeddings(
        &self,
        excluding_doc: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Element>>;

    async fn outgoing_relationships(&self, element_id: &str) -> Result<Vec<Relationship>>;

    /// Insert analysis-time relationships (e.g. cross-document semantic
    /// edges) outside any per-document transaction.
    async fn insert_relationships(&self, relationships: &[Relationship]) -> Result<u64>;

    /// Entities with a live DERIVED_FROM mapping from this document.
    async fn entities_derived_from(&self, doc_id: &str) -> Result<Vec<Entity>>;

    async fn get_entity(&self, entity_id: &str) -> Result<Option<Entity>>;

    /// Count of live DERIVED_FROM mappings for an entity, optionally
    /// excluding those from one document. Drives entity GC.
    async fn entity_mapping_count(
        &self,
        entity_pk: i64,
        excluding_doc: Option<&str>,
    ) -> Result<u64>;

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ElementType;

    fn element(id: &str, parent: Option<&str>, etype: ElementType, pos: i32) -> Element {
        Element {
            element_id: id.to_string(),
            element_pk: 0,
            doc_id: "doc-1".to_string(),
            parent_id: parent.map(String::from),
            element_type: etype,
            content_preview: String::new(),
            content_location: Value::Null,
            content_hash: String::new(),
            element_order: 0,
            document_position: pos,
            metadata: Metadata::new(),
            embedding: None,
        }
    }

    fn plan_with_elements(elements: Vec<Element>) -> DocumentPersistPlan {
        DocumentPersistPlan {
            document: Document {
                doc_id: "doc-1".to_string(),
                doc_type: "text".to_string(),
                source: "file://doc-1".to_string(),
                content_hash: "abc".to_string(),
                metadata: Metadata::new(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            elements,
            relationships: Vec::new(),
            replace_existing: false,
            entities_created: Vec::new(),
            entities_updated: Vec::new(),
            entities_unlinked: Vec::new(),
            entities_deleted: Vec::new(),
            mappings: Vec::new(),
            entity_relationships: Vec::new(),
            counts: SmartUpdateCounts::default(),
        }
    }

    #[test]
    fn test_plan_requires_exactly_one_root() {
        let plan = plan_with_elements(vec![
            element("root", None, ElementType::Root, 0),
            element("p1", Some("root"), ElementType::Paragraph, 1),
        ]);
        assert!(plan.validate().is_ok());

        let no_root = plan_with_elements(vec![element("p1", None, ElementType::Paragraph, 0)]);
        assert!(no_root.validate().is_err());

        let two_roots = plan_with_elements(vec![
            element("r1", None, ElementType::Root, 0),
            element("r2", None, ElementType::Root, 1),
        ]);
        assert!(two_roots.validate().is_err());
    }

    #[test]
    fn test_plan_rejects_foreign_parent() {
        let plan = plan_with_elements(vec![
            element("root", None, ElementType::Root, 0),
            element("p1", Some("elsewhere"), ElementType::Paragraph, 1),
        ]);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_plan_rejects_duplicate_positions() {
        let plan = plan_with_elements(vec![
            element("root", None, ElementType::Root, 0),
            element("p1", Some("root"), ElementType::Paragraph, 0),
        ]);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_error_info_fingerprint_strips_digits() {
        let now = Utc::now();
        let a = ErrorInfo::from_error(&anyhow::anyhow!("timeout after 30s"), now);
        let b = ErrorInfo::from_error(&anyhow::anyhow!("timeout after 12s"), now);
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_ne!(a.message, b.message);
    }

    #[test]
    fn test_queue_status_drained() {
        let status = QueueStatus {
            pending: 0,
            processing: 0,
            completed: 10,
            failed: 2,
            retry: 0,
        };
        assert!(status.is_drained());
        assert_eq!(status.total(), 12);

        let busy = QueueStatus {
            retry: 1,
            ..status
        };
        assert!(!busy.is_drained());
    }

    #[test]
    fn test_cross_document_flag() {
        let mut metadata = Metadata::new();
        metadata.insert(CROSS_DOCUMENT_KEY.to_string(), Value::Bool(true));
        let rel = Relationship {
            relationship_id: "r1".to_string(),
            source_id: "a".to_string(),
            target_id: "b".to_string(),
            relationship_type: crate::types::RelationshipType::SemanticSimilarity,
            metadata,
        };
        assert!(rel.is_cross_document());
    }
}
