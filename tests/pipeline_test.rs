// End-to-end pipeline scenarios over a filesystem source and the
// in-memory store: full ingestion with embeddings, link-discovery cycles,
// unchanged short-circuiting, and run-id peering between coordinators.

use anyhow::Result;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;

use docflow::{
    derive_run_id, Config, Coordinator, DocumentStore, ElementType, MemoryStore,
    RelationshipType, RunStatus,
};

fn config_yaml(dir: &TempDir, extra: &str) -> String {
    format!(
        r#"
storage:
  backend: memory
content_sources:
  - name: docs
    type: filesystem
    base_path: {}
processing:
  mode: single
{extra}"#,
        dir.path().display()
    )
}

async fn run_once(config: &Config, store: Arc<dyn DocumentStore>) -> Result<docflow::RunSummary> {
    let coordinator = Coordinator::new(
        config.clone(),
        store,
        Arc::new(AtomicBool::new(false)),
    )
    .await?;
    coordinator.run().await
}

#[tokio::test]
async fn test_full_ingestion_with_embeddings() -> Result<()> {
    let dir = TempDir::new()?;
    tokio::fs::write(
        dir.path().join("report.md"),
        "# Quarterly Report\n\nRevenue grew this quarter.\n\n## Details\n\n- north region\n- south region\n",
    )
    .await?;

    let config = Config::from_yaml(&config_yaml(
        &dir,
        "embedding:\n  enabled: true\n  provider: hash\n  dimension: 32\n  max_tokens: 512\n",
    ))?;
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let summary = run_once(&config, store.clone()).await?;

    assert_eq!(summary.documents_processed, 1);
    assert_eq!(summary.documents_failed, 0);

    let document = store.get_document("report.md").await?.expect("document stored");
    assert_eq!(document.doc_type, "markdown");
    assert!(!document.content_hash.is_empty());

    let elements = store.get_elements("report.md").await?;
    let roots: Vec<_> = elements
        .iter()
        .filter(|e| e.element_type == ElementType::Root)
        .collect();
    assert_eq!(roots.len(), 1, "exactly one root per document");
    assert!(roots[0].parent_id.is_none());

    // Positions are a strict total order; parents precede children.
    let positions: Vec<i32> = elements.iter().map(|e| e.document_position).collect();
    let mut sorted = positions.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), elements.len());

    // Every text-bearing element got an embedding of the configured size.
    for element in elements.iter().filter(|e| !e.content_preview.is_empty()) {
        let embedding = element.embedding.as_ref().expect("embedding present");
        assert_eq!(embedding.len(), 32);
    }

    // Structural relationships resolvable from the root.
    let outgoing = store.outgoing_relationships(&roots[0].element_id).await?;
    assert!(outgoing
        .iter()
        .any(|r| r.relationship_type == RelationshipType::Contains));
    Ok(())
}

/// Link cycle A->B->A: both documents are ingested exactly
/// once in the run; idempotent enqueue absorbs the rediscovery.
#[tokio::test]
async fn test_link_discovery_cycle_ingests_each_once() -> Result<()> {
    let dir = TempDir::new()?;
    tokio::fs::write(
        dir.path().join("a.md"),
        "# A\n\nSee [b](b.md) for details.\n",
    )
    .await?;
    tokio::fs::write(dir.path().join("b.md"), "# B\n\nBack to [a](a.md).\n").await?;

    let config = Config::from_yaml(&config_yaml(&dir, "  max_link_depth: 3\n"))?;
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let summary = run_once(&config, store.clone()).await?;

    assert_eq!(summary.documents_processed, 2, "each document exactly once");
    assert!(store.get_document("a.md").await?.is_some());
    assert!(store.get_document("b.md").await?.is_some());

    let run_id = derive_run_id(&config)?;
    let status = store.queue_status(run_id.as_str()).await?;
    assert_eq!(status.completed, 2);
    assert_eq!(status.total(), 2, "no duplicate queue items from the cycle");
    Ok(())
}

/// With max_link_depth 0, nothing beyond the enumerated set is ingested.
/// The linked file sits in a subdirectory of a non-recursive source, so
/// only link discovery could ever reach it.
#[tokio::test]
async fn test_link_depth_zero_disables_discovery() -> Result<()> {
    let dir = TempDir::new()?;
    tokio::fs::create_dir_all(dir.path().join("linked")).await?;
    tokio::fs::write(
        dir.path().join("a.md"),
        "# A\n\nSee [hidden](linked/hidden.md).\n",
    )
    .await?;
    tokio::fs::write(dir.path().join("linked/hidden.md"), "# Hidden\n\nBody.\n").await?;

    // Non-recursive source: hidden.md is only reachable via the link.
    let config = Config::from_yaml(&format!(
        r#"
storage:
  backend: memory
content_sources:
  - name: docs
    type: filesystem
    base_path: {}
    recursive: false
processing:
  mode: single
  max_link_depth: 0
"#,
        dir.path().display()
    ))?;
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let summary = run_once(&config, store.clone()).await?;

    assert_eq!(summary.documents_processed, 1);
    assert!(store.get_document("linked/hidden.md").await?.is_none());

    // Raising the depth pulls the linked document in.
    let mut deeper = config.clone();
    deeper.processing.max_link_depth = 2;
    let store2: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let summary = run_once(&deeper, store2.clone()).await?;
    assert_eq!(summary.documents_processed, 2);
    assert!(store2.get_document("linked/hidden.md").await?.is_some());
    Ok(())
}

/// Re-running the same config over unchanged files short-circuits every
/// document: elements keep their content hashes and positions, and the
/// run completes cleanly again.
#[tokio::test]
async fn test_reingest_unchanged_documents_short_circuits() -> Result<()> {
    let dir = TempDir::new()?;
    tokio::fs::write(dir.path().join("stable.md"), "# Stable\n\nSame bytes.\n").await?;

    let config = Config::from_yaml(&config_yaml(&dir, ""))?;
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());

    run_once(&config, store.clone()).await?;
    let before = store.get_elements("stable.md").await?;

    let summary = run_once(&config, store.clone()).await?;
    // Run counters are cumulative across both passes of the same run.
    assert_eq!(summary.documents_processed, 2);
    assert_eq!(summary.documents_failed, 0);

    let after = store.get_elements("stable.md").await?;
    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(after.iter()) {
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.document_position, b.document_position);
        // Short-circuit means elements were not rewritten at all.
        assert_eq!(a.element_pk, b.element_pk);
    }
    Ok(())
}

/// Two coordinators with the same config compute the
/// same run id; the second becomes a peer of the first run, not a new one.
#[tokio::test]
async fn test_identical_configs_share_one_run() -> Result<()> {
    let dir = TempDir::new()?;
    tokio::fs::write(dir.path().join("doc.md"), "# Doc\n\nBody.\n").await?;

    let config_a = Config::from_yaml(&config_yaml(&dir, ""))?;
    let config_b = Config::from_yaml(&config_yaml(&dir, "embedding:\n  enabled: false\n"))?;
    assert_eq!(derive_run_id(&config_a)?, derive_run_id(&config_b)?);

    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    run_once(&config_a, store.clone()).await?;
    run_once(&config_b, store.clone()).await?;

    let runs = store.list_runs().await?;
    assert_eq!(runs.len(), 1, "same identity, same run");
    assert_eq!(runs[0].status, RunStatus::Completed);
    Ok(())
}

/// A document that fails to parse dead-letters without aborting the run.
#[tokio::test]
async fn test_failed_document_does_not_abort_run() -> Result<()> {
    let dir = TempDir::new()?;
    tokio::fs::write(dir.path().join("good.md"), "# Good\n\nFine.\n").await?;
    // A file listed by enumeration but deleted before the worker fetches
    // it; simulate by enqueueing a ghost through a second, empty source.
    let config = Config::from_yaml(&format!(
        r#"
storage:
  backend: memory
content_sources:
  - name: docs
    type: filesystem
    base_path: {}
processing:
  mode: single
  max_retries: 0
"#,
        dir.path().display()
    ))?;
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());

    // Pre-enqueue a ghost document into the derived run before starting.
    let run_id = derive_run_id(&config)?;
    store.ensure_run(run_id.as_str(), "seed").await?;
    store
        .enqueue_document(run_id.as_str(), "missing.md", "docs", 100, Default::default())
        .await?;

    let summary = run_once(&config, store.clone()).await?;
    assert_eq!(summary.documents_processed, 1);
    assert_eq!(summary.documents_failed, 1);

    let run = store.get_run(run_id.as_str()).await?.unwrap();
    assert_eq!(run.status, RunStatus::Completed, "run completes with failures");
    let status = store.queue_status(run_id.as_str()).await?;
    assert_eq!(status.failed, 1);
    assert_eq!(status.completed, 1);
    Ok(())
}
