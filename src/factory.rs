// Factory Functions
// Assembly of production components from configuration. Registries and
// collaborators are constructed once per process and passed down as
// dependencies; nothing here is a global.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::config::{Config, StorageConfig};
use crate::content_source::SourceRegistry;
use crate::contextual_embedding::{generator_from_settings, ContextualEmbeddingGenerator};
use crate::contracts::DocumentStore;
use crate::document_processor::DocumentProcessor;
use crate::embeddings::EmbeddingService;
use crate::entity_extraction::EntityExtractor;
use crate::memory_store::MemoryStore;
use crate::ontology::Ontology;
use crate::parser::ParserRegistry;
use crate::postgres_store::PostgresStore;
use crate::work_queue::{QueuePolicy, WorkQueue};

/// Open the store named in the config.
pub async fn create_store(config: &Config) -> Result<Arc<dyn DocumentStore>> {
    match &config.storage {
        StorageConfig::Postgres {
            dsn,
            max_connections,
        } => {
            let store = PostgresStore::connect(dsn, *max_connections).await?;
            info!("connected to postgres store");
            Ok(Arc::new(store))
        }
        StorageConfig::Memory {} => {
            info!("using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Rebuild the content-source registry from config. Called before each run.
pub fn create_sources(config: &Config) -> Result<Arc<SourceRegistry>> {
    let registry = SourceRegistry::from_config(&config.content_sources)
        .context("Failed to build content-source registry")?;
    info!(sources = registry.len(), "content-source registry built");
    Ok(Arc::new(registry))
}

pub fn create_parsers() -> Arc<ParserRegistry> {
    Arc::new(ParserRegistry::with_defaults())
}

/// Embedding service when enabled in config.
pub fn create_embedding_service(config: &Config) -> Result<Option<Arc<EmbeddingService>>> {
    if !config.embedding.enabled {
        return Ok(None);
    }
    let service = EmbeddingService::from_settings(&config.embedding)?;
    info!(
        model = %service.model_name(),
        dimension = service.dimension(),
        "embedding service initialized"
    );
    Ok(Some(Arc::new(service)))
}

/// Contextual generator wrapping the base embedding service.
pub fn create_embedder(
    config: &Config,
    service: Option<Arc<EmbeddingService>>,
    store: Arc<dyn DocumentStore>,
) -> Option<Arc<ContextualEmbeddingGenerator>> {
    service.map(|service| {
        Arc::new(generator_from_settings(
            &config.embedding,
            service,
            Some(store),
        ))
    })
}

/// Entity extractor over the configured ontology files.
pub fn create_extractor(
    config: &Config,
    embeddings: Option<Arc<EmbeddingService>>,
) -> Result<Arc<EntityExtractor>> {
    let mut ontologies = Vec::new();
    for path in &config.domain.ontologies {
        let ontology = Ontology::load(path)?;
        info!(
            name = %ontology.name,
            domain = %ontology.domain,
            mappings = ontology.element_entity_mappings.len(),
            "ontology loaded"
        );
        ontologies.push(ontology);
    }
    Ok(Arc::new(EntityExtractor::new(&ontologies, embeddings)?))
}

pub fn create_queue(config: &Config, store: Arc<dyn DocumentStore>) -> Arc<WorkQueue> {
    Arc::new(WorkQueue::new(
        store,
        QueuePolicy::from_config(&config.processing),
    ))
}

/// The full per-process pipeline: store → registries → extractor →
/// embedder → processor + queue.
pub async fn create_processor(
    config: &Config,
    store: Arc<dyn DocumentStore>,
) -> Result<(Arc<DocumentProcessor>, Arc<WorkQueue>)> {
    let sources = create_sources(config)?;
    let parsers = create_parsers();
    let service = create_embedding_service(config)?;
    let embedder = create_embedder(config, service.clone(), store.clone());
    let extractor = create_extractor(config, service)?;
    let queue = create_queue(config, store.clone());

    let processor = Arc::new(DocumentProcessor::new(
        store,
        sources,
        parsers,
        extractor,
        embedder,
        config.relationship_detection.clone(),
        config.processing.max_link_depth,
    ));
    Ok((processor, queue))
}
