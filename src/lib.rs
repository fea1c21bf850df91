// docflow - A distributed document-ingestion and knowledge-extraction pipeline
// Root library module

pub mod config;
pub mod content_source;
pub mod contextual_embedding;
pub mod contracts;
pub mod coordinator;
pub mod dead_letter;
pub mod document_processor;
pub mod embeddings;
pub mod entity_extraction;
pub mod factory;
pub mod memory_store;
pub mod observability;
pub mod ontology;
pub mod parser;
pub mod postgres_store;
pub mod run_coordinator;
pub mod schema;
pub mod token_counter;
pub mod types;
pub mod work_queue;
pub mod worker;

// Re-export observability entry points
pub use observability::{
    init_logging, init_logging_with_level, init_logging_with_name, RunSummary, WorkerStats,
};

// Re-export the core data model and storage contract
pub use contracts::{
    Document, DocumentPersistPlan, DocumentStore, Element, EnqueueOutcome, Entity, EntityMapping,
    EntityRelationship, ErrorInfo, Metadata, PersistReceipt, PlannedEntityRelationship,
    PlannedMapping, ProcessingRun, QueueItem, QueueStatus, Relationship, SmartUpdateCounts,
    WorkerRegistration,
};

// Re-export validated types and tag sets
pub use types::{
    ElementType, QueueState, RelationshipKind, RelationshipType, RunStatus, ValidatedDocumentId,
    ValidatedRunId, ValidatedSourceName, ValidatedWorkerId, WorkerStatus, DERIVED_FROM,
};

// Re-export configuration
pub use config::{
    canonical_json, Config, ContextFormat, ProcessingMode, SourceConfig, SourceKind, StorageConfig,
};

// Re-export queue and run coordination
pub use run_coordinator::{config_hash, derive_run_id, RunCoordinator};
pub use work_queue::{FailureOutcome, QueuePolicy, WorkQueue, DEFAULT_PRIORITY};

// Re-export dead-letter tooling
pub use dead_letter::{DeadLetterQueue, FailurePattern};

// Re-export storage backends
pub use memory_store::MemoryStore;
pub use postgres_store::PostgresStore;

// Re-export the pluggable seams
pub use content_source::{ContentSource, FetchedDocument, FileSystemSource, SourceDocument, SourceRegistry};
pub use parser::{
    content_hash, doc_type_for_name, DocumentParser, MarkdownParser, ParsedDocument,
    ParsedElement, ParserRegistry, TextParser,
};

// Re-export embedding providers and the contextual engine
pub use embeddings::{
    cosine_similarity, EmbeddingProvider, EmbeddingResult, EmbeddingService,
    HashEmbeddingProvider, OpenAiEmbeddingProvider,
};
pub use contextual_embedding::{
    AssembledContext, BudgetSplit, ContextCandidate, ContextRole, ContextualEmbeddingGenerator,
    DocumentGraph, DocumentShape,
};
pub use token_counter::{TokenCounter, ELISION_MARKER};

// Re-export ontology and extraction
pub use entity_extraction::{normalize_entity_id, EntityExtractor, ExtractedEntities};
pub use ontology::{CoOccurrence, ElementEntityMapping, EntityRelationshipRule, Ontology, Term};

// Re-export the pipeline processes
pub use coordinator::Coordinator;
pub use document_processor::{
    DocumentProcessor, ProcessOutcome, ProcessedDocument, ProcessingError,
};
pub use worker::{Worker, WorkerPool};
