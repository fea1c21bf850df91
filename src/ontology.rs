// Ontology Documents
// Declarative domain descriptions: vocabulary terms, element→entity
// extraction rules, and entity-relationship rules. Authored as YAML or JSON
// and loaded read-only at startup; the extraction engine lives in
// entity_extraction.rs.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A declarative ontology document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ontology {
    pub name: String,
    pub version: String,
    pub domain: String,
    #[serde(default)]
    pub terms: Vec<Term>,
    #[serde(default)]
    pub element_entity_mappings: Vec<ElementEntityMapping>,
    #[serde(default)]
    pub entity_relationship_rules: Vec<EntityRelationshipRule>,
}

/// A vocabulary item used for semantic classification of elements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Term {
    pub term_id: String,
    pub label: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Term {
    /// The text embedded when a semantic-similarity rule references this
    /// term: label plus synonyms plus description.
    pub fn embedding_text(&self) -> String {
        let mut parts = vec![self.label.clone()];
        parts.extend(self.synonyms.iter().cloned());
        if let Some(description) = &self.description {
            parts.push(description.clone());
        }
        parts.join(". ")
    }
}

/// For one entity_type: which element types to examine and the rules that
/// turn matching elements into entity candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementEntityMapping {
    pub entity_type: String,
    /// Element-type filter; empty means every element type.
    #[serde(default)]
    pub element_types: Vec<String>,
    pub extraction_rules: Vec<ExtractionRule>,
}

impl ElementEntityMapping {
    pub fn applies_to(&self, element_type: &str) -> bool {
        self.element_types.is_empty() || self.element_types.iter().any(|t| t == element_type)
    }
}

/// One extraction rule with its confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRule {
    #[serde(flatten)]
    pub kind: RuleKind,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    /// Match the element text against a regex; each capture (or whole
    /// match) yields one candidate name.
    RegexPattern { pattern: String },
    /// Candidate per keyword found in the element text.
    KeywordMatch { keywords: Vec<String> },
    /// Extract the candidate name from element metadata at a dotted path.
    MetadataField { field_path: String },
    /// Candidate when the element embedding is within `threshold` cosine
    /// similarity of the referenced term's embedding.
    SemanticSimilarity {
        term_id: String,
        #[serde(default = "default_similarity_threshold")]
        threshold: f64,
    },
}

fn default_similarity_threshold() -> f64 {
    0.75
}

/// Co-occurrence predicate constraining entity-relationship rules.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum CoOccurrence {
    SameDocument,
    /// Both entities derived from elements under the same nearest header.
    SameSection,
    /// Derived-from elements within N positions of each other.
    WithinElements { distance: u32 },
}

impl Default for CoOccurrence {
    fn default() -> Self {
        CoOccurrence::SameDocument
    }
}

/// Rule emitting a typed edge between two entities found in one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRelationshipRule {
    pub source_entity_type: String,
    pub target_entity_type: String,
    pub relationship_type: String,
    pub confidence_threshold: f64,
    #[serde(default)]
    pub co_occurrence: CoOccurrence,
}

impl Ontology {
    /// Load an ontology from a YAML or JSON file, selected by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read ontology file: {}", path.display()))?;
        let ontology: Ontology = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse ontology JSON: {}", path.display()))?,
            _ => serde_yaml::from_str(&raw)
                .with_context(|| format!("Failed to parse ontology YAML: {}", path.display()))?,
        };
        ontology.validate()?;
        Ok(ontology)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let ontology: Ontology =
            serde_yaml::from_str(raw).context("Failed to parse ontology YAML")?;
        ontology.validate()?;
        Ok(ontology)
    }

    pub fn term(&self, term_id: &str) -> Option<&Term> {
        self.terms.iter().find(|t| t.term_id == term_id)
    }

    /// Check structural validity: confidences in [0,1], regexes compile,
    /// semantic rules reference declared terms.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.name.trim().is_empty(), "Ontology name cannot be empty");
        ensure!(
            !self.domain.trim().is_empty(),
            "Ontology domain cannot be empty"
        );

        for mapping in &self.element_entity_mappings {
            ensure!(
                !mapping.extraction_rules.is_empty(),
                "Mapping for entity_type {} has no extraction rules",
                mapping.entity_type
            );
            for rule in &mapping.extraction_rules {
                ensure!(
                    (0.0..=1.0).contains(&rule.confidence),
                    "Rule confidence {} out of [0,1] for entity_type {}",
                    rule.confidence,
                    mapping.entity_type
                );
                match &rule.kind {
                    RuleKind::RegexPattern { pattern } => {
                        regex::Regex::new(pattern).with_context(|| {
                            format!(
                                "Invalid regex in {} rule: {pattern}",
                                mapping.entity_type
                            )
                        })?;
                    }
                    RuleKind::KeywordMatch { keywords } => {
                        ensure!(
                            !keywords.is_empty(),
                            "Keyword rule for {} has no keywords",
                            mapping.entity_type
                        );
                    }
                    RuleKind::MetadataField { field_path } => {
                        ensure!(
                            !field_path.trim().is_empty(),
                            "Metadata rule for {} has empty field_path",
                            mapping.entity_type
                        );
                    }
                    RuleKind::SemanticSimilarity { term_id, threshold } => {
                        ensure!(
                            self.term(term_id).is_some(),
                            "Semantic rule for {} references unknown term {term_id}",
                            mapping.entity_type
                        );
                        ensure!(
                            (0.0..=1.0).contains(threshold),
                            "Semantic threshold {threshold} out of [0,1]"
                        );
                    }
                }
            }
        }

        for rule in &self.entity_relationship_rules {
            ensure!(
                (0.0..=1.0).contains(&rule.confidence_threshold),
                "Relationship rule confidence_threshold {} out of [0,1]",
                rule.confidence_threshold
            );
        }
        Ok(())
    }
}
