// Configuration
// Typed YAML configuration shared by coordinator and worker processes. The
// content-source and storage sections are the run's identity: their canonical
// serialization feeds run-id derivation, so field ordering here never matters.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable consulted when no --config flag is given.
pub const CONFIG_PATH_ENV: &str = "DOCFLOW_CONFIG_PATH";

/// Default config path when neither flag nor environment provides one.
pub const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub content_sources: Vec<SourceConfig>,
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    #[serde(default)]
    pub relationship_detection: RelationshipDetectionConfig,
    #[serde(default)]
    pub domain: DomainConfig,
}

/// Backend descriptor for the shared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Production backend; requires row-level locking for atomic claims.
    Postgres {
        dsn: String,
        #[serde(default)]
        max_connections: Option<u32>,
    },
    /// Single-process in-memory backend for tests and local experiments.
    Memory {},
}

/// A named content source. The adapter type tag selects the implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: SourceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceKind {
    Filesystem {
        base_path: PathBuf,
        #[serde(default = "default_extensions")]
        include_extensions: Vec<String>,
        #[serde(default = "default_true")]
        recursive: bool,
    },
}

fn default_extensions() -> Vec<String> {
    vec!["md".to_string(), "txt".to_string()]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// Coordinator enqueues and drains the queue in-process.
    Single,
    /// Coordinator enqueues and monitors; separate worker processes drain.
    Distributed,
    /// Worker process draining an existing run.
    Worker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub mode: ProcessingMode,
    #[serde(default = "default_max_link_depth")]
    pub max_link_depth: u32,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_seconds: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: u64,
}

fn default_max_link_depth() -> u32 {
    2
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    60
}

fn default_max_backoff() -> u64 {
    3600
}

/// Context encoding mode for contextual embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextFormat {
    /// Compact `[ROLE:type:id] content` prefix.
    Bracket,
    /// `<context role=".." type="..">content</context>` wrapping; tag
    /// overhead is charged against the token budget.
    Xml,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default = "default_context_format")]
    pub context_format: ContextFormat,
    /// How many cross-document context elements to admit per embedding.
    #[serde(default = "default_cross_document_limit")]
    pub cross_document_limit: usize,
    /// Environment variable holding the API key for HTTP providers.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            max_tokens: default_max_tokens(),
            dimension: default_dimension(),
            context_format: default_context_format(),
            cross_document_limit: default_cross_document_limit(),
            api_key_env: None,
            api_base: None,
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}

fn default_embedding_model() -> String {
    "docflow-hash-384".to_string()
}

fn default_max_tokens() -> usize {
    8192
}

fn default_dimension() -> usize {
    384
}

fn default_context_format() -> ContextFormat {
    ContextFormat::Bracket
}

fn default_cross_document_limit() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipDetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Emit semantic-similarity edges across documents after persist.
    #[serde(default)]
    pub cross_document_semantic: bool,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl Default for RelationshipDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cross_document_semantic: false,
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

fn default_similarity_threshold() -> f64 {
    0.8
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Paths to ontology documents (YAML or JSON).
    #[serde(default)]
    pub ontologies: Vec<PathBuf>,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config path from an optional flag, the environment, or
    /// the default location.
    pub fn resolve_path(flag: Option<&str>) -> PathBuf {
        if let Some(path) = flag {
            return PathBuf::from(path);
        }
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(path);
        }
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw).context("Failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for source in &self.content_sources {
            ensure!(
                !source.name.trim().is_empty(),
                "Content source with empty name"
            );
            ensure!(
                seen.insert(source.name.as_str()),
                "Duplicate content source name: {}",
                source.name
            );
        }
        ensure!(
            self.processing.heartbeat_interval_seconds > 0,
            "heartbeat_interval_seconds must be positive"
        );
        ensure!(
            self.processing.heartbeat_timeout_seconds > self.processing.heartbeat_interval_seconds,
            "heartbeat_timeout_seconds must exceed heartbeat_interval_seconds"
        );
        if self.embedding.enabled {
            ensure!(
                self.embedding.max_tokens > 0,
                "embedding.max_tokens must be positive"
            );
            ensure!(
                self.embedding.dimension > 0,
                "embedding.dimension must be positive"
            );
        }
        Ok(())
    }

    /// The run's identity: a canonical JSON serialization of the
    /// content-sources array and storage descriptor, with object keys
    /// sorted at every level. Logging, embedding, and other sections do
    /// not participate, so restarts with tweaked observability settings
    /// resume the same run.
    pub fn identity_json(&self) -> Result<String> {
        let sources = serde_json::to_value(&self.content_sources)
            .context("Failed to serialize content sources")?;
        let storage =
            serde_json::to_value(&self.storage).context("Failed to serialize storage config")?;
        let identity = serde_json::json!({
            "content_sources": sources,
            "storage": storage,
        });
        Ok(canonical_json(&identity))
    }
}

/// Render a JSON value with object keys sorted recursively, so two
/// serializations of equal values are byte-identical.
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<&String, String> = map
                .iter()
                .map(|(k, v)| (k, canonical_json(v)))
                .collect();
            let body: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::String(k.clone()), v))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        serde_json::Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
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
    fn test_minimal_config_parses_with_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.processing.mode, ProcessingMode::Distributed);
        assert_eq!(config.processing.max_link_depth, 2);
        assert_eq!(config.processing.heartbeat_interval_seconds, 30);
        assert_eq!(config.processing.max_retries, 3);
        assert!(!config.embedding.enabled);
        assert_eq!(config.embedding.context_format, ContextFormat::Bracket);
        assert_eq!(config.content_sources.len(), 1);
    }

    #[test]
    fn test_duplicate_source_names_rejected() {
        let raw = r#"
storage:
  backend: memory
content_sources:
  - name: docs
    type: filesystem
    base_path: /a
  - name: docs
    type: filesystem
    base_path: /b
processing:
  mode: single
"#;
        assert!(Config::from_yaml(raw).is_err());
    }

    #[test]
    fn test_heartbeat_timeout_must_exceed_interval() {
        let raw = r#"
storage:
  backend: memory
processing:
  mode: single
  heartbeat_interval_seconds: 60
  heartbeat_timeout_seconds: 30
"#;
        assert!(Config::from_yaml(raw).is_err());
    }

    #[test]
    fn test_identity_json_ignores_embedding_section() {
        let mut with_embedding = String::from(MINIMAL);
        with_embedding.push_str("embedding:\n  enabled: true\n  model: some-model\n");

        let a = Config::from_yaml(MINIMAL).unwrap();
        let b = Config::from_yaml(&with_embedding).unwrap();
        assert_eq!(a.identity_json().unwrap(), b.identity_json().unwrap());
    }

    #[test]
    fn test_identity_json_tracks_source_changes() {
        let other = MINIMAL.replace("/data/docs", "/data/other");
        let a = Config::from_yaml(MINIMAL).unwrap();
        let b = Config::from_yaml(&other).unwrap();
        assert_ne!(a.identity_json().unwrap(), b.identity_json().unwrap());
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let v: serde_json::Value =
            serde_json::from_str(r#"{"b": 1, "a": {"d": 2, "c": [3, 4]}}"#).unwrap();
        assert_eq!(canonical_json(&v), r#"{"a":{"c":[3,4],"d":2},"b":1}"#);
    }
}
