// Document Processor
// The per-document pipeline run after a successful claim: fetch → parse →
// link discovery → entity extraction → embedding → atomic persist. Errors
// are classified into the retry taxonomy here; the worker loop only routes
// them. Re-ingests of known documents go through the smart-update diff so
// unchanged entities keep their primary keys and relationships.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RelationshipDetectionConfig;
use crate::content_source::SourceRegistry;
use crate::contextual_embedding::ContextualEmbeddingGenerator;
use crate::contracts::{
    DocumentPersistPlan, DocumentStore, Element, Entity, Metadata, QueueItem, Relationship,
    SmartUpdateCounts, CROSS_DOCUMENT_KEY, LINK_DEPTH_KEY,
};
use crate::embeddings::cosine_similarity;
use crate::entity_extraction::{EntityExtractor, ExtractedEntities};
use crate::parser::{ParsedDocument, ParserRegistry};
use crate::types::RelationshipType;
use crate::work_queue::WorkQueue;

/// Candidate pool size for cross-document similarity scans.
const SEMANTIC_CANDIDATE_LIMIT: usize = 256;

/// Error taxonomy for one document's processing. The variant decides the
/// queue transition: only `Transient` is retryable; everything else goes
/// to the dead letter. Config errors additionally signal the worker that
/// its own setup is broken.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("transient: {0}")]
    Transient(anyhow::Error),
    #[error("parse: {0}")]
    Parse(anyhow::Error),
    #[error("config: {0}")]
    Config(anyhow::Error),
    #[error("integrity: {0}")]
    Integrity(anyhow::Error),
}

impl ProcessingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessingError::Transient(_))
    }

    pub fn is_fatal_config(&self) -> bool {
        matches!(self, ProcessingError::Config(_))
    }

    /// Taxonomy label used to prefix error fingerprints.
    pub fn class(&self) -> &'static str {
        match self {
            ProcessingError::Transient(_) => "transient",
            ProcessingError::Parse(_) => "parse",
            ProcessingError::Config(_) => "config",
            ProcessingError::Integrity(_) => "integrity",
        }
    }

    /// The underlying error with its full context chain.
    pub fn into_inner(self) -> anyhow::Error {
        match self {
            ProcessingError::Transient(error)
            | ProcessingError::Parse(error)
            | ProcessingError::Config(error)
            | ProcessingError::Integrity(error) => error,
        }
    }
}

/// Outcome of one document's pipeline.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Document parsed and persisted.
    Processed(ProcessedDocument),
    /// Source reported no change and the stored hash matched.
    Unchanged,
}

#[derive(Debug, Default)]
pub struct ProcessedDocument {
    pub elements: u64,
    pub relationships: u64,
    pub entities: SmartUpdateCounts,
    pub links_discovered: u64,
    pub cross_document_relationships: u64,
}

pub struct DocumentProcessor {
    store: Arc<dyn DocumentStore>,
    sources: Arc<SourceRegistry>,
    parsers: Arc<ParserRegistry>,
    extractor: Arc<EntityExtractor>,
    embedder: Option<Arc<ContextualEmbeddingGenerator>>,
    relationship_detection: RelationshipDetectionConfig,
    max_link_depth: u32,
}

impl DocumentProcessor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        sources: Arc<SourceRegistry>,
        parsers: Arc<ParserRegistry>,
        extractor: Arc<EntityExtractor>,
        embedder: Option<Arc<ContextualEmbeddingGenerator>>,
        relationship_detection: RelationshipDetectionConfig,
        max_link_depth: u32,
    ) -> Self {
        Self {
            store,
            sources,
            parsers,
            extractor,
            embedder,
            relationship_detection,
            max_link_depth,
        }
    }

    /// Run the full pipeline for a claimed queue item.
    pub async fn process(
        &self,
        queue: &WorkQueue,
        item: &QueueItem,
    ) -> std::result::Result<ProcessOutcome, ProcessingError> {
        let doc_id = item.doc_id.as_str();
        let source = self
            .sources
            .get(&item.source_name)
            .ok_or_else(|| {
                ProcessingError::Config(anyhow!(
                    "Content source '{}' is not registered",
                    item.source_name
                ))
            })?;

        let existing = self
            .store
            .get_document(doc_id)
            .await
            .map_err(ProcessingError::Transient)?;

        // 1. Fetch. Source errors are trust-bounded: recorded against this
        // document as a retryable failure, never propagated raw.
        let fetched = source
            .fetch_document(doc_id)
            .await
            .with_context(|| format!("Failed to fetch {doc_id} from {}", item.source_name))
            .map_err(ProcessingError::Transient)?;

        if let Some(existing) = &existing {
            let changed = source
                .has_changed(doc_id, existing.updated_at)
                .await
                .unwrap_or(true);
            let hash = crate::parser::content_hash(&fetched.content);
            if !changed && hash == existing.content_hash {
                debug!(doc_id, "document unchanged, short-circuiting");
                return Ok(ProcessOutcome::Unchanged);
            }
        }

        // 2. Parse.
        let parsed = self
            .parsers
            .parse(
                &fetched.doc_type,
                doc_id,
                &format!("{}://{}", item.source_name, doc_id),
                &fetched.content,
                &fetched.metadata,
            )
            .map_err(ProcessingError::Parse)?;

        // 3. Link discovery, bounded by the run's max depth. Cycles are
        // tolerated because add_document is idempotent on (run, doc).
        let links_discovered = self
            .discover_links(queue, item, &parsed)
            .await
            .map_err(ProcessingError::Transient)?;

        // 4. Entity extraction.
        let extracted = self
            .extractor
            .extract(&parsed.elements)
            .await
            .map_err(ProcessingError::Parse)?;

        // 5. Embedding.
        let embeddings: HashMap<String, Vec<f32>> = match &self.embedder {
            Some(embedder) => embedder
                .embed_document(&parsed.elements)
                .await
                .map_err(ProcessingError::Transient)?
                .into_iter()
                .collect(),
            None => HashMap::new(),
        };

        // 6. Persist atomically, diffing entities when the document is
        // already known.
        let replace_existing = existing.is_some();
        let plan = self
            .build_plan(&parsed, extracted, &embeddings, replace_existing)
            .await
            .map_err(ProcessingError::Integrity)?;
        let counts = plan.counts;
        let receipt = self
            .store
            .apply_document_plan(plan)
            .await
            .map_err(ProcessingError::Integrity)?;

        // 7. Cross-document semantic edges, outside the persist
        // transaction by design; failures here never fail the document.
        let cross_document_relationships = match self.detect_semantic_relationships(doc_id).await {
            Ok(count) => count,
            Err(error) => {
                warn!(doc_id, %error, "cross-document relationship detection failed");
                0
            }
        };

        info!(
            doc_id,
            elements = receipt.elements_written,
            relationships = receipt.relationships_written,
            entities_created = counts.created,
            entities_preserved = counts.preserved,
            links_discovered,
            "document processed"
        );
        Ok(ProcessOutcome::Processed(ProcessedDocument {
            elements: receipt.elements_written,
            relationships: receipt.relationships_written,
            entities: counts,
            links_discovered,
            cross_document_relationships,
        }))
    }

    async fn discover_links(
        &self,
        queue: &WorkQueue,
        item: &QueueItem,
        parsed: &ParsedDocument,
    ) -> Result<u64> {
        let current_depth = item.link_depth();
        if current_depth >= self.max_link_depth {
            return Ok(0);
        }

        let mut discovered = 0;
        for target in parsed.external_link_targets() {
            let Some((source_name, doc_id)) =
                self.sources
                    .resolve_link(&target, &item.source_name, &item.doc_id)
            else {
                debug!(%target, "link target did not resolve to a registered source");
                continue;
            };
            let mut metadata = Metadata::new();
            metadata.insert(LINK_DEPTH_KEY.to_string(), json!(current_depth + 1));
            metadata.insert("discovered_from".to_string(), json!(item.doc_id));
            let outcome = queue
                .add_document(&item.run_id, &doc_id, &source_name, metadata)
                .await?;
            if outcome.created {
                discovered += 1;
            }
        }
        Ok(discovered)
    }

    /// Build the atomic persist plan, running the smart-update entity diff
    /// when this doc_id already exists in storage.
    async fn build_plan(
        &self,
        parsed: &ParsedDocument,
        extracted: ExtractedEntities,
        embeddings: &HashMap<String, Vec<f32>>,
        replace_existing: bool,
    ) -> Result<DocumentPersistPlan> {
        let doc_id = &parsed.document.doc_id;
        let mut elements: Vec<Element> = parsed
            .elements
            .iter()
            .map(|e| e.to_element(doc_id))
            .collect();
        for element in &mut elements {
            element.embedding = embeddings.get(&element.element_id).cloned();
        }

        let mut plan = DocumentPersistPlan {
            document: parsed.document.clone(),
            elements,
            relationships: parsed.relationships.clone(),
            replace_existing,
            entities_created: Vec::new(),
            entities_updated: Vec::new(),
            entities_unlinked: Vec::new(),
            entities_deleted: Vec::new(),
            mappings: extracted.mappings,
            entity_relationships: extracted.relationships,
            counts: SmartUpdateCounts::default(),
        };

        if !replace_existing {
            plan.counts.created = extracted.entities.len() as u64;
            plan.entities_created = extracted.entities;
            return Ok(plan);
        }

        // Smart update: classify against the entities this document
        // previously derived.
        let old_entities = self.store.entities_derived_from(doc_id).await?;
        let old_by_id: HashMap<&str, &Entity> = old_entities
            .iter()
            .map(|e| (e.entity_id.as_str(), e))
            .collect();
        let new_ids: HashSet<String> = extracted
            .entities
            .iter()
            .map(|e| e.entity_id.clone())
            .collect();

        for entity in extracted.entities {
            match old_by_id.get(entity.entity_id.as_str()) {
                Some(old) if attributes_equal(&old.attributes, &entity.attributes) => {
                    plan.counts.preserved += 1;
                    // Row stays untouched; only the new mappings re-link it.
                }
                Some(old) => {
                    plan.counts.updated += 1;
                    let mut updated = entity;
                    updated.entity_pk = old.entity_pk;
                    plan.entities_updated.push(updated);
                }
                None => {
                    plan.counts.created += 1;
                    plan.entities_created.push(entity);
                }
            }
        }

        for old in &old_entities {
            if new_ids.contains(old.entity_id.as_str()) {
                continue;
            }
            // Disappeared from this document: delete outright only when no
            // other live document still derives it.
            let elsewhere = self
                .store
                .entity_mapping_count(old.entity_pk, Some(doc_id))
                .await?;
            if elsewhere > 0 {
                plan.entities_unlinked.push(old.entity_pk);
            } else {
                plan.counts.deleted += 1;
                plan.entities_deleted.push(old.entity_pk);
            }
        }

        Ok(plan)
    }

    /// Compare freshly embedded elements against the stored pool and emit
    /// similarity edges across documents.
    async fn detect_semantic_relationships(&self, doc_id: &str) -> Result<u64> {
        if !self.relationship_detection.enabled
            || !self.relationship_detection.cross_document_semantic
            || self.embedder.is_none()
        {
            return Ok(0);
        }
        let threshold = self.relationship_detection.similarity_threshold;

        let own: Vec<Element> = self
            .store
            .get_elements(doc_id)
            .await?
            .into_iter()
            .filter(|e| e.embedding.is_some())
            .collect();
        if own.is_empty() {
            return Ok(0);
        }
        let candidates = self
            .store
            .elements_with_embeddings(Some(doc_id), SEMANTIC_CANDIDATE_LIMIT)
            .await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut relationships = Vec::new();
        for element in &own {
            let Some(embedding) = &element.embedding else { continue };
            for candidate in &candidates {
                let Some(other) = &candidate.embedding else { continue };
                let similarity = cosine_similarity(embedding, other);
                if similarity < threshold {
                    continue;
                }
                let mut metadata = Metadata::new();
                metadata.insert(CROSS_DOCUMENT_KEY.to_string(), Value::Bool(true));
                metadata.insert("similarity".to_string(), json!(similarity));
                relationships.push(Relationship {
                    relationship_id: format!(
                        "sem:{}:{}",
                        element.element_id, candidate.element_id
                    ),
                    source_id: element.element_id.clone(),
                    target_id: candidate.element_id.clone(),
                    relationship_type: RelationshipType::SemanticSimilarity,
                    metadata,
                });
            }
        }
        if relationships.is_empty() {
            return Ok(0);
        }
        self.store.insert_relationships(&relationships).await
    }
}

/// Attribute equality on canonical JSON, so key order never matters.
fn attributes_equal(a: &Metadata, b: &Metadata) -> bool {
    crate::config::canonical_json(&Value::Object(a.clone()))
        == crate::config::canonical_json(&Value::Object(b.clone()))
}
