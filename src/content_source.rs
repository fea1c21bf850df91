// Content Sources
// Named producers of (doc_id, content, metadata). The registry is rebuilt
// from config before each run and passed down as a dependency; sources are
// trust-bounded, so their errors are recorded against the enclosing
// document by the processor and never reach the worker loop.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::config::{SourceConfig, SourceKind};
use crate::contracts::Metadata;
use crate::parser::doc_type_for_name;

/// One listed document: its id within the source plus listing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub doc_id: String,
    pub metadata: Metadata,
}

/// A fetched document: raw bytes, format tag, and fetch metadata.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub content: Vec<u8>,
    pub doc_type: String,
    pub metadata: Metadata,
    /// Set when the content lives on local disk and large-binary handling
    /// could stream it instead of holding bytes.
    pub binary_path: Option<PathBuf>,
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    fn name(&self) -> &str;

    async fn list_documents(&self) -> Result<Vec<SourceDocument>>;

    async fn fetch_document(&self, doc_id: &str) -> Result<FetchedDocument>;

    /// Cheap change check against the last ingest timestamp. Sources
    /// without change detection should return true (always re-fetch).
    async fn has_changed(&self, doc_id: &str, last_seen: DateTime<Utc>) -> Result<bool>;

    /// Resolve a link target found in `from_doc` to a doc_id this source
    /// can serve, or None when the target is outside this source.
    fn resolve_link(&self, target: &str, from_doc: &str) -> Option<String> {
        let _ = (target, from_doc);
        None
    }
}

/// Name→source registry for one run.
pub struct SourceRegistry {
    sources: HashMap<String, Arc<dyn ContentSource>>,
    /// Config order, kept for deterministic enumeration and link probing.
    order: Vec<String>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn from_config(configs: &[SourceConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            crate::types::ValidatedSourceName::new(&config.name)
                .with_context(|| format!("Invalid content source name: {:?}", config.name))?;
            let source: Arc<dyn ContentSource> = match &config.kind {
                SourceKind::Filesystem {
                    base_path,
                    include_extensions,
                    recursive,
                } => Arc::new(FileSystemSource::new(
                    &config.name,
                    base_path.clone(),
                    include_extensions.clone(),
                    *recursive,
                )?),
            };
            registry.register(source);
        }
        Ok(registry)
    }

    pub fn register(&mut self, source: Arc<dyn ContentSource>) {
        let name = source.name().to_string();
        if !self.sources.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.sources.insert(name, source);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ContentSource>> {
        self.sources.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = Arc<dyn ContentSource>> + '_ {
        self.order.iter().filter_map(|name| self.get(name))
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Resolve a discovered link to (source_name, doc_id). The source the
    /// link was found in gets first claim; the rest are probed in config
    /// order.
    pub fn resolve_link(
        &self,
        target: &str,
        from_source: &str,
        from_doc: &str,
    ) -> Option<(String, String)> {
        if let Some(source) = self.get(from_source) {
            if let Some(doc_id) = source.resolve_link(target, from_doc) {
                return Some((from_source.to_string(), doc_id));
            }
        }
        for source in self.iter() {
            if source.name() == from_source {
                continue;
            }
            if let Some(doc_id) = source.resolve_link(target, from_doc) {
                return Some((source.name().to_string(), doc_id));
            }
        }
        None
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Filesystem adapter: serves files under a base directory, doc_id is the
/// base-relative path with '/' separators.
pub struct FileSystemSource {
    name: String,
    base_path: PathBuf,
    include_extensions: Vec<String>,
    recursive: bool,
}

impl FileSystemSource {
    pub fn new(
        name: &str,
        base_path: PathBuf,
        include_extensions: Vec<String>,
        recursive: bool,
    ) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            base_path,
            include_extensions: include_extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            recursive,
        })
    }

    fn extension_allowed(&self, path: &Path) -> bool {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => self
                .include_extensions
                .iter()
                .any(|allowed| allowed == &ext.to_ascii_lowercase()),
            None => false,
        }
    }

    fn full_path(&self, doc_id: &str) -> Result<PathBuf> {
        // doc_ids never escape the base directory.
        let relative = Path::new(doc_id);
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(anyhow!("Invalid doc_id path: {doc_id}"));
        }
        Ok(self.base_path.join(relative))
    }

    fn doc_id_for(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.base_path)
            .ok()
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
    }

    async fn modified_at(&self, doc_id: &str) -> Result<DateTime<Utc>> {
        let path = self.full_path(doc_id)?;
        let fs_metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        let modified = fs_metadata
            .modified()
            .context("Filesystem does not report modification times")?;
        Ok(DateTime::<Utc>::from(modified))
    }
}

#[async_trait]
impl ContentSource for FileSystemSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_documents(&self) -> Result<Vec<SourceDocument>> {
        let mut documents = Vec::new();
        let mut pending = vec![self.base_path.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .with_context(|| format!("Failed to read directory {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if self.recursive {
                        pending.push(path);
                    }
                    continue;
                }
                if !self.extension_allowed(&path) {
                    continue;
                }
                let Some(doc_id) = self.doc_id_for(&path) else {
                    continue;
                };
                let mut metadata = Metadata::new();
                if let Ok(fs_metadata) = entry.metadata().await {
                    if let Ok(modified) = fs_metadata.modified() {
                        metadata.insert(
                            "modified_at".to_string(),
                            json!(DateTime::<Utc>::from(modified).to_rfc3339()),
                        );
                    }
                    metadata.insert("size_bytes".to_string(), json!(fs_metadata.len()));
                }
                documents.push(SourceDocument { doc_id, metadata });
            }
        }

        documents.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        Ok(documents)
    }

    async fn fetch_document(&self, doc_id: &str) -> Result<FetchedDocument> {
        let path = self.full_path(doc_id)?;
        let content = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let mut metadata = Metadata::new();
        metadata.insert("source_path".to_string(), json!(path.display().to_string()));
        if let Ok(modified) = self.modified_at(doc_id).await {
            metadata.insert("modified_at".to_string(), json!(modified.to_rfc3339()));
        }

        Ok(FetchedDocument {
            content,
            doc_type: doc_type_for_name(doc_id),
            metadata,
            binary_path: Some(path),
        })
    }

    async fn has_changed(&self, doc_id: &str, last_seen: DateTime<Utc>) -> Result<bool> {
        match self.modified_at(doc_id).await {
            Ok(modified) => Ok(modified > last_seen),
            // Missing or unreadable file counts as changed; the fetch that
            // follows will surface the real error.
            Err(_) => Ok(true),
        }
    }

    fn resolve_link(&self, target: &str, from_doc: &str) -> Option<String> {
        // Only relative file links belong to a filesystem source.
        if target.contains("://") || target.starts_with('/') || target.starts_with('#') {
            return None;
        }
        let target = target.split('#').next().unwrap_or(target);
        if target.is_empty() {
            return None;
        }

        let from_dir = Path::new(from_doc).parent().unwrap_or_else(|| Path::new(""));
        let mut normalized: Vec<String> = Vec::new();
        for component in from_dir.join(target).components() {
            match component {
                Component::Normal(part) => normalized.push(part.to_string_lossy().into_owned()),
                Component::ParentDir => {
                    // Escaping above the base directory is out of bounds.
                    normalized.pop()?;
                }
                Component::CurDir => {}
                Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        let doc_id = normalized.join("/");
        if doc_id.is_empty() || !self.extension_allowed(Path::new(&doc_id)) {
            return None;
        }
        Some(doc_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn fixture() -> Result<(TempDir, FileSystemSource)> {
        let dir = TempDir::new()?;
        tokio::fs::create_dir_all(dir.path().join("guides")).await?;
        tokio::fs::write(dir.path().join("readme.md"), "# Readme\n\nHello.").await?;
        tokio::fs::write(dir.path().join("notes.txt"), "plain notes").await?;
        tokio::fs::write(dir.path().join("image.png"), [0u8, 1, 2]).await?;
        tokio::fs::write(dir.path().join("guides/setup.md"), "# Setup").await?;

        let source = FileSystemSource::new(
            "docs",
            dir.path().to_path_buf(),
            vec!["md".to_string(), "txt".to_string()],
            true,
        )?;
        Ok((dir, source))
    }

    #[tokio::test]
    async fn test_list_respects_extension_filter() -> Result<()> {
        let (_dir, source) = fixture().await?;
        let documents = source.list_documents().await?;
        let ids: Vec<&str> = documents.iter().map(|d| d.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["guides/setup.md", "notes.txt", "readme.md"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_non_recursive_skips_subdirectories() -> Result<()> {
        let (dir, _) = fixture().await?;
        let flat = FileSystemSource::new(
            "docs",
            dir.path().to_path_buf(),
            vec!["md".to_string()],
            false,
        )?;
        let documents = flat.list_documents().await?;
        let ids: Vec<&str> = documents.iter().map(|d| d.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["readme.md"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_returns_bytes_and_doc_type() -> Result<()> {
        let (_dir, source) = fixture().await?;
        let fetched = source.fetch_document("readme.md").await?;
        assert_eq!(fetched.doc_type, "markdown");
        assert!(String::from_utf8_lossy(&fetched.content).contains("# Readme"));
        assert!(fetched.metadata.contains_key("modified_at"));

        let plain = source.fetch_document("notes.txt").await?;
        assert_eq!(plain.doc_type, "text");
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_rejects_escaping_doc_ids() -> Result<()> {
        let (_dir, source) = fixture().await?;
        assert!(source.fetch_document("../etc/passwd").await.is_err());
        assert!(source.fetch_document("/etc/passwd").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_has_changed_tracks_mtime() -> Result<()> {
        let (_dir, source) = fixture().await?;
        let past = Utc::now() - chrono::Duration::hours(1);
        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(source.has_changed("readme.md", past).await?);
        assert!(!source.has_changed("readme.md", future).await?);
        assert!(source.has_changed("missing.md", past).await?);
        Ok(())
    }

    #[test]
    fn test_resolve_link_relative_paths() {
        let source = FileSystemSource::new(
            "docs",
            PathBuf::from("/data"),
            vec!["md".to_string()],
            true,
        )
        .unwrap();

        assert_eq!(
            source.resolve_link("other.md", "guides/setup.md"),
            Some("guides/other.md".to_string())
        );
        assert_eq!(
            source.resolve_link("../intro.md", "guides/setup.md"),
            Some("intro.md".to_string())
        );
        assert_eq!(
            source.resolve_link("deep/más.md#section", "readme.md"),
            Some("deep/más.md".to_string())
        );

        // Out of bounds or foreign targets resolve to nothing.
        assert_eq!(source.resolve_link("../../escape.md", "readme.md"), None);
        assert_eq!(source.resolve_link("http://example.com/x.md", "readme.md"), None);
        assert_eq!(source.resolve_link("/absolute.md", "readme.md"), None);
        assert_eq!(source.resolve_link("image.png", "readme.md"), None);
        assert_eq!(source.resolve_link("#anchor-only", "readme.md"), None);
    }

    #[tokio::test]
    async fn test_registry_resolution_order() -> Result<()> {
        let (dir_a, _) = fixture().await?;
        let (dir_b, _) = fixture().await?;
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(FileSystemSource::new(
            "alpha",
            dir_a.path().to_path_buf(),
            vec!["md".to_string()],
            true,
        )?));
        registry.register(Arc::new(FileSystemSource::new(
            "beta",
            dir_b.path().to_path_buf(),
            vec!["md".to_string()],
            true,
        )?));

        // The originating source wins even though both could resolve.
        let resolved = registry.resolve_link("readme.md", "beta", "notes.md");
        assert_eq!(resolved, Some(("beta".to_string(), "readme.md".to_string())));

        let fallback = registry.resolve_link("readme.md", "unknown", "notes.md");
        assert_eq!(fallback, Some(("alpha".to_string(), "readme.md".to_string())));
        Ok(())
    }
}
