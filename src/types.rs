// Validated Types
// Strongly-typed wrappers that enforce identity invariants at construction time.
// These types cannot be built from invalid data, so the queue, storage, and
// pipeline layers never have to re-check them.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Closed tag set for parsed structural elements.
///
/// Parsers may only emit these tags; anything format-specific goes through
/// `Custom` so the storage schema stays stable across parser plugins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Root,
    Body,
    Header,
    Paragraph,
    List,
    ListItem,
    Table,
    TableRow,
    TableCell,
    CodeBlock,
    TextBlock,
    Image,
    Footnote,
    Comment,
    Custom(String),
}

impl ElementType {
    /// Relative importance used by the contextual-embedding priority function.
    /// Headers carry the most signal about their neighborhood.
    pub fn importance(&self) -> f64 {
        match self {
            ElementType::Root => 0.2,
            ElementType::Header => 1.0,
            ElementType::Table => 0.8,
            ElementType::CodeBlock => 0.75,
            ElementType::Paragraph | ElementType::TextBlock => 0.7,
            ElementType::ListItem | ElementType::TableCell => 0.6,
            ElementType::List | ElementType::TableRow | ElementType::Body => 0.5,
            ElementType::Image => 0.4,
            ElementType::Footnote | ElementType::Comment => 0.3,
            ElementType::Custom(_) => 0.5,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ElementType::Root => "root",
            ElementType::Body => "body",
            ElementType::Header => "header",
            ElementType::Paragraph => "paragraph",
            ElementType::List => "list",
            ElementType::ListItem => "list_item",
            ElementType::Table => "table",
            ElementType::TableRow => "table_row",
            ElementType::TableCell => "table_cell",
            ElementType::CodeBlock => "code_block",
            ElementType::TextBlock => "text_block",
            ElementType::Image => "image",
            ElementType::Footnote => "footnote",
            ElementType::Comment => "comment",
            ElementType::Custom(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "root" => ElementType::Root,
            "body" => ElementType::Body,
            "header" => ElementType::Header,
            "paragraph" => ElementType::Paragraph,
            "list" => ElementType::List,
            "list_item" => ElementType::ListItem,
            "table" => ElementType::Table,
            "table_row" => ElementType::TableRow,
            "table_cell" => ElementType::TableCell,
            "code_block" => ElementType::CodeBlock,
            "text_block" => ElementType::TextBlock,
            "image" => ElementType::Image,
            "footnote" => ElementType::Footnote,
            "comment" => ElementType::Comment,
            other => ElementType::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Directed edge types between elements.
///
/// Structural edges are created during parsing, link edges during link
/// discovery, semantic edges during post-parse analysis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Contains,
    ContainedBy,
    NextSibling,
    Link,
    SemanticSimilarity,
    Custom(String),
}

/// Coarse partition of relationship types, used when deciding which edges
/// are replaced wholesale on re-ingest (structural) and which survive
/// (cross-document semantic).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    Structural,
    Link,
    Semantic,
}

impl RelationshipType {
    pub fn kind(&self) -> RelationshipKind {
        match self {
            RelationshipType::Contains
            | RelationshipType::ContainedBy
            | RelationshipType::NextSibling => RelationshipKind::Structural,
            RelationshipType::Link => RelationshipKind::Link,
            RelationshipType::SemanticSimilarity | RelationshipType::Custom(_) => {
                RelationshipKind::Semantic
            }
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RelationshipType::Contains => "contains",
            RelationshipType::ContainedBy => "contained_by",
            RelationshipType::NextSibling => "next_sibling",
            RelationshipType::Link => "link",
            RelationshipType::SemanticSimilarity => "semantic_similarity",
            RelationshipType::Custom(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "contains" => RelationshipType::Contains,
            "contained_by" => RelationshipType::ContainedBy,
            "next_sibling" => RelationshipType::NextSibling,
            "link" => RelationshipType::Link,
            "semantic_similarity" => RelationshipType::SemanticSimilarity,
            other => RelationshipType::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Queue item lifecycle.
///
/// `Pending` and `Retry` are claimable, `Processing` is held by a worker,
/// `Completed` and `Failed` are terminal. For a given (run_id, doc_id) at
/// most one item may be in a non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Pending,
    Processing,
    Completed,
    Failed,
    Retry,
}

impl QueueState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueState::Completed | QueueState::Failed)
    }

    pub fn as_str(&self) -> &str {
        match self {
            QueueState::Pending => "pending",
            QueueState::Processing => "processing",
            QueueState::Completed => "completed",
            QueueState::Failed => "failed",
            QueueState::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(QueueState::Pending),
            "processing" => Ok(QueueState::Processing),
            "completed" => Ok(QueueState::Completed),
            "failed" => Ok(QueueState::Failed),
            "retry" => Ok(QueueState::Retry),
            other => Err(anyhow::anyhow!("Unknown queue state: {other}")),
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Processing-run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Active,
    Completed,
    Failed,
    Abandoned,
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Active => "active",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(RunStatus::Active),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "abandoned" => Ok(RunStatus::Abandoned),
            other => Err(anyhow::anyhow!("Unknown run status: {other}")),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Worker registration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Idle,
    Stopped,
    Stale,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Stale => "stale",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(WorkerStatus::Active),
            "idle" => Ok(WorkerStatus::Idle),
            "stopped" => Ok(WorkerStatus::Stopped),
            "stale" => Ok(WorkerStatus::Stale),
            other => Err(anyhow::anyhow!("Unknown worker status: {other}")),
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A document identifier that is guaranteed to be usable as a storage key.
///
/// # Invariants
/// - Non-empty after trimming
/// - Length <= 1024 bytes
/// - No null bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValidatedDocumentId {
    inner: String,
}

impl ValidatedDocumentId {
    const MAX_LENGTH: usize = 1024;

    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        ensure!(!trimmed.is_empty(), "Document ID cannot be empty");
        ensure!(
            trimmed.len() <= Self::MAX_LENGTH,
            "Document ID exceeds maximum length of {} bytes",
            Self::MAX_LENGTH
        );
        ensure!(
            !trimmed.contains('\0'),
            "Document ID cannot contain null bytes"
        );
        Ok(Self {
            inner: trimmed.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn into_string(self) -> String {
        self.inner
    }
}

impl fmt::Display for ValidatedDocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A run identifier: lowercase hex, fixed width, derived from the config hash.
///
/// # Invariants
/// - Exactly 12 lowercase hex characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedRunId {
    inner: String,
}

impl ValidatedRunId {
    pub const LENGTH: usize = 12;

    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        ensure!(
            id.len() == Self::LENGTH,
            "Run ID must be exactly {} characters, got {}",
            Self::LENGTH,
            id.len()
        );
        ensure!(
            id.bytes()
                .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()),
            "Run ID must be lowercase hex: {id}"
        );
        Ok(Self { inner: id })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for ValidatedRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A worker identifier.
///
/// # Invariants
/// - Non-empty, <= 128 bytes
/// - Only alphanumeric, dash, underscore, dot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedWorkerId {
    inner: String,
}

impl ValidatedWorkerId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        ensure!(!id.is_empty(), "Worker ID cannot be empty");
        ensure!(
            id.len() <= Self::MAX_LENGTH,
            "Worker ID exceeds maximum length of {} bytes",
            Self::MAX_LENGTH
        );
        ensure!(
            id.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'),
            "Worker ID may only contain alphanumerics, dash, underscore, dot: {id}"
        );
        Ok(Self { inner: id })
    }

    /// Generate a fresh worker id from a random UUID fragment.
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            inner: format!("worker-{}", &suffix[..8]),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for ValidatedWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A content-source name as registered in config.
///
/// # Invariants
/// - Non-empty after trimming, <= 128 bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedSourceName {
    inner: String,
}

impl ValidatedSourceName {
    const MAX_LENGTH: usize = 128;

    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let trimmed = name.trim();
        ensure!(!trimmed.is_empty(), "Source name cannot be empty");
        ensure!(
            trimmed.len() <= Self::MAX_LENGTH,
            "Source name exceeds maximum length of {} bytes",
            Self::MAX_LENGTH
        );
        Ok(Self {
            inner: trimmed.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for ValidatedSourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// The edge type linking an element to an entity derived from it.
pub const DERIVED_FROM: &str = "DERIVED_FROM";
