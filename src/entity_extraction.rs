// Entity Extraction
// Runs ontology rules over a document's parsed elements: every applicable
// rule in declaration order, candidates normalized to stable entity ids,
// deduped per document, then pairwise relationship rules with co-occurrence
// predicates. The output feeds directly into the document persist plan.

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::contracts::{Entity, Metadata, PlannedEntityRelationship, PlannedMapping};
use crate::embeddings::{cosine_similarity, EmbeddingService};
use crate::ontology::{CoOccurrence, ElementEntityMapping, Ontology, RuleKind};
use crate::parser::ParsedElement;
use crate::types::ElementType;

/// Everything extraction produced for one document.
#[derive(Debug, Default)]
pub struct ExtractedEntities {
    /// Deduped by entity_id; entity_pk is unassigned.
    pub entities: Vec<Entity>,
    pub mappings: Vec<PlannedMapping>,
    pub relationships: Vec<PlannedEntityRelationship>,
}

/// Normalize (type, name) to the stable entity id.
/// Lowercased, whitespace collapsed to single dashes, punctuation dropped.
pub fn normalize_entity_id(entity_type: &str, name: &str) -> String {
    let normalize = |s: &str| {
        let mut out = String::with_capacity(s.len());
        let mut last_dash = true;
        for c in s.trim().to_lowercase().chars() {
            if c.is_alphanumeric() {
                out.push(c);
                last_dash = false;
            } else if !last_dash {
                out.push('-');
                last_dash = true;
            }
        }
        while out.ends_with('-') {
            out.pop();
        }
        out
    };
    format!("{}:{}", normalize(entity_type), normalize(name))
}

enum CompiledRule {
    Regex { pattern: Regex, confidence: f64 },
    Keywords { keywords: Vec<String>, confidence: f64 },
    MetadataField { field_path: String, confidence: f64 },
    Semantic {
        term_id: String,
        term_text: String,
        threshold: f64,
        confidence: f64,
    },
}

struct CompiledMapping {
    entity_type: String,
    element_types: Vec<String>,
    rules: Vec<CompiledRule>,
}

impl CompiledMapping {
    fn applies_to(&self, element_type: &ElementType) -> bool {
        self.element_types.is_empty()
            || self.element_types.iter().any(|t| t == element_type.as_str())
    }
}

struct CompiledOntology {
    domain: String,
    mappings: Vec<CompiledMapping>,
    relationship_rules: Vec<crate::ontology::EntityRelationshipRule>,
}

pub struct EntityExtractor {
    ontologies: Vec<CompiledOntology>,
    embeddings: Option<Arc<EmbeddingService>>,
}

/// Read a dotted path out of a metadata map.
fn metadata_path<'a>(metadata: &'a Metadata, path: &str) -> Option<&'a Value> {
    let mut current: &Value = metadata.get(path.split('.').next()?)?;
    for segment in path.split('.').skip(1) {
        current = current.get(segment)?;
    }
    Some(current)
}

fn value_as_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl EntityExtractor {
    pub fn new(
        ontologies: &[Ontology],
        embeddings: Option<Arc<EmbeddingService>>,
    ) -> Result<Self> {
        let mut compiled = Vec::with_capacity(ontologies.len());
        for ontology in ontologies {
            ontology.validate()?;
            let mappings = ontology
                .element_entity_mappings
                .iter()
                .map(|mapping| Self::compile_mapping(ontology, mapping))
                .collect::<Result<Vec<_>>>()?;
            compiled.push(CompiledOntology {
                domain: ontology.domain.clone(),
                mappings,
                relationship_rules: ontology.entity_relationship_rules.clone(),
            });
        }
        Ok(Self {
            ontologies: compiled,
            embeddings,
        })
    }

    fn compile_mapping(
        ontology: &Ontology,
        mapping: &ElementEntityMapping,
    ) -> Result<CompiledMapping> {
        let rules = mapping
            .extraction_rules
            .iter()
            .map(|rule| {
                Ok(match &rule.kind {
                    RuleKind::RegexPattern { pattern } => CompiledRule::Regex {
                        pattern: Regex::new(pattern)
                            .with_context(|| format!("Invalid pattern: {pattern}"))?,
                        confidence: rule.confidence,
                    },
                    RuleKind::KeywordMatch { keywords } => CompiledRule::Keywords {
                        keywords: keywords.clone(),
                        confidence: rule.confidence,
                    },
                    RuleKind::MetadataField { field_path } => CompiledRule::MetadataField {
                        field_path: field_path.clone(),
                        confidence: rule.confidence,
                    },
                    RuleKind::SemanticSimilarity { term_id, threshold } => {
                        let term = ontology
                            .term(term_id)
                            .with_context(|| format!("Unknown term: {term_id}"))?;
                        CompiledRule::Semantic {
                            term_id: term_id.clone(),
                            term_text: term.embedding_text(),
                            threshold: *threshold,
                            confidence: rule.confidence,
                        }
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(CompiledMapping {
            entity_type: mapping.entity_type.clone(),
            element_types: mapping.element_types.clone(),
            rules,
        })
    }

    /// Run all ontologies over the document's elements.
    pub async fn extract(&self, elements: &[ParsedElement]) -> Result<ExtractedEntities> {
        let mut result = ExtractedEntities::default();
        if self.ontologies.is_empty() {
            return Ok(result);
        }

        // entity_id → (entity, element ids it derives from)
        let mut found: HashMap<String, (Entity, Vec<String>)> = HashMap::new();
        let mut found_order: Vec<String> = Vec::new();

        for ontology in &self.ontologies {
            for element in elements {
                for mapping in &ontology.mappings {
                    if !mapping.applies_to(&element.element_type) {
                        continue;
                    }
                    for rule in &mapping.rules {
                        let candidates = self.evaluate_rule(rule, element).await?;
                        for (name, confidence) in candidates {
                            let entity_id = normalize_entity_id(&mapping.entity_type, &name);
                            if entity_id.ends_with(':') {
                                continue; // name normalized to nothing
                            }
                            let entry = found.entry(entity_id.clone()).or_insert_with(|| {
                                found_order.push(entity_id.clone());
                                let mut attributes = Metadata::new();
                                attributes.insert("confidence".to_string(), json!(confidence));
                                (
                                    Entity {
                                        entity_pk: 0,
                                        entity_id: entity_id.clone(),
                                        entity_type: mapping.entity_type.clone(),
                                        name: name.clone(),
                                        domain: ontology.domain.clone(),
                                        attributes,
                                    },
                                    Vec::new(),
                                )
                            });
                            // Highest confidence across rules wins.
                            let previous = entry
                                .0
                                .attributes
                                .get("confidence")
                                .and_then(Value::as_f64)
                                .unwrap_or(0.0);
                            if confidence > previous {
                                entry
                                    .0
                                    .attributes
                                    .insert("confidence".to_string(), json!(confidence));
                            }
                            if !entry.1.contains(&element.element_id) {
                                entry.1.push(element.element_id.clone());
                            }
                        }
                    }
                }
            }

            // Relationship rules see only this ontology's entities.
            let entities_here: Vec<&(Entity, Vec<String>)> = found_order
                .iter()
                .filter_map(|id| found.get(id))
                .filter(|(e, _)| e.domain == ontology.domain)
                .collect();
            Self::evaluate_relationship_rules(
                ontology,
                &entities_here,
                elements,
                &mut result.relationships,
            );
        }

        for entity_id in &found_order {
            let (entity, element_ids) = found.remove(entity_id).expect("ordered ids exist");
            for element_id in element_ids {
                result.mappings.push(PlannedMapping {
                    element_id,
                    entity_id: entity.entity_id.clone(),
                    domain: entity.domain.clone(),
                });
            }
            result.entities.push(entity);
        }

        debug!(
            entities = result.entities.len(),
            mappings = result.mappings.len(),
            relationships = result.relationships.len(),
            "entity extraction finished"
        );
        Ok(result)
    }

    async fn evaluate_rule(
        &self,
        rule: &CompiledRule,
        element: &ParsedElement,
    ) -> Result<Vec<(String, f64)>> {
        let mut candidates = Vec::new();
        match rule {
            CompiledRule::Regex { pattern, confidence } => {
                for captures in pattern.captures_iter(&element.text) {
                    let matched = captures
                        .get(1)
                        .or_else(|| captures.get(0))
                        .map(|m| m.as_str().to_string());
                    if let Some(name) = matched {
                        candidates.push((name, *confidence));
                    }
                }
            }
            CompiledRule::Keywords { keywords, confidence } => {
                let haystack = element.text.to_lowercase();
                for keyword in keywords {
                    if haystack.contains(&keyword.to_lowercase()) {
                        candidates.push((keyword.clone(), *confidence));
                    }
                }
            }
            CompiledRule::MetadataField { field_path, confidence } => {
                if let Some(value) = metadata_path(&element.metadata, field_path) {
                    if let Some(name) = value_as_name(value) {
                        candidates.push((name, *confidence));
                    }
                }
            }
            CompiledRule::Semantic {
                term_id,
                term_text,
                threshold,
                confidence,
            } => {
                let Some(embeddings) = &self.embeddings else {
                    debug!(%term_id, "semantic rule skipped: no embedding service");
                    return Ok(candidates);
                };
                if element.text.trim().is_empty() {
                    return Ok(candidates);
                }
                let element_vector = embeddings.embed_text(&element.text).await?;
                let term_vector = embeddings.embed_text(term_text).await?;
                let similarity = cosine_similarity(&element_vector, &term_vector);
                if similarity >= *threshold {
                    // Candidate name is the term itself; the element merely
                    // evidences it.
                    candidates.push((term_id.clone(), confidence * similarity));
                }
            }
        }
        Ok(candidates)
    }

    fn evaluate_relationship_rules(
        ontology: &CompiledOntology,
        entities: &[&(Entity, Vec<String>)],
        elements: &[ParsedElement],
        out: &mut Vec<PlannedEntityRelationship>,
    ) {
        if ontology.relationship_rules.is_empty() || entities.len() < 2 {
            return;
        }

        let positions: HashMap<&str, i32> = elements
            .iter()
            .map(|e| (e.element_id.as_str(), e.document_position))
            .collect();
        let sections = section_index(elements);

        for rule in &ontology.relationship_rules {
            for (source, source_elements) in entities {
                if source.entity_type != rule.source_entity_type {
                    continue;
                }
                for (target, target_elements) in entities {
                    if source.entity_id == target.entity_id
                        || target.entity_type != rule.target_entity_type
                    {
                        continue;
                    }
                    let co_occurs = match rule.co_occurrence {
                        CoOccurrence::SameDocument => true,
                        CoOccurrence::SameSection => source_elements.iter().any(|a| {
                            target_elements.iter().any(|b| {
                                sections.get(a.as_str()).is_some()
                                    && sections.get(a.as_str()) == sections.get(b.as_str())
                            })
                        }),
                        CoOccurrence::WithinElements { distance } => {
                            source_elements.iter().any(|a| {
                                target_elements.iter().any(|b| {
                                    match (positions.get(a.as_str()), positions.get(b.as_str())) {
                                        (Some(pa), Some(pb)) => {
                                            (pa - pb).unsigned_abs() <= distance
                                        }
                                        _ => false,
                                    }
                                })
                            })
                        }
                    };
                    if !co_occurs {
                        continue;
                    }

                    let source_confidence = source
                        .attributes
                        .get("confidence")
                        .and_then(Value::as_f64)
                        .unwrap_or(1.0);
                    let target_confidence = target
                        .attributes
                        .get("confidence")
                        .and_then(Value::as_f64)
                        .unwrap_or(1.0);
                    let combined = source_confidence * target_confidence;
                    if combined < rule.confidence_threshold {
                        continue;
                    }

                    out.push(PlannedEntityRelationship {
                        source_entity_id: source.entity_id.clone(),
                        target_entity_id: target.entity_id.clone(),
                        relationship_type: rule.relationship_type.clone(),
                        confidence: combined,
                        domain: ontology.domain.clone(),
                    });
                }
            }
        }
    }
}

/// Map each element to its section: the nearest header ancestor, or the
/// element itself when it is a header.
fn section_index(elements: &[ParsedElement]) -> HashMap<&str, &str> {
    let by_id: HashMap<&str, &ParsedElement> = elements
        .iter()
        .map(|e| (e.element_id.as_str(), e))
        .collect();

    let mut sections = HashMap::new();
    for element in elements {
        let mut current = Some(element);
        let section = loop {
            match current {
                Some(e) if e.element_type == ElementType::Header => break e.element_id.as_str(),
                Some(e) => {
                    current = e.parent_id.as_deref().and_then(|p| by_id.get(p).copied());
                }
                None => break "",
            }
        };
        sections.insert(element.element_id.as_str(), section);
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbeddingProvider;

    fn element(id: &str, parent: Option<&str>, etype: ElementType, text: &str, pos: i32) -> ParsedElement {
        ParsedElement {
            element_id: id.to_string(),
            parent_id: parent.map(String::from),
            element_type: etype,
            text: text.to_string(),
            content_location: Value::Null,
            content_hash: String::new(),
            element_order: pos,
            document_position: pos,
            metadata: Metadata::new(),
        }
    }

    fn ticker_ontology() -> Ontology {
        Ontology::from_yaml(
            r#"
name: finance
version: "1"
domain: finance
element_entity_mappings:
  - entity_type: ticker
    extraction_rules:
      - type: regex_pattern
        pattern: '\$([A-Z]{2,5})\b'
        confidence: 0.9
  - entity_type: exchange
    extraction_rules:
      - type: keyword_match
        keywords: [NASDAQ, NYSE]
        confidence: 0.6
entity_relationship_rules:
  - source_entity_type: ticker
    target_entity_type: exchange
    relationship_type: listed_on
    confidence_threshold: 0.5
    co_occurrence:
      scope: within_elements
      distance: 1
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_normalize_entity_id() {
        assert_eq!(normalize_entity_id("Ticker", "ACME Corp."), "ticker:acme-corp");
        assert_eq!(
            normalize_entity_id("metric", "  Net   Revenue "),
            "metric:net-revenue"
        );
        assert_eq!(
            normalize_entity_id("ticker", "ACME"),
            normalize_entity_id("ticker", "acme")
        );
    }

    #[tokio::test]
    async fn test_regex_extraction_dedupes_within_document() -> Result<()> {
        let extractor = EntityExtractor::new(&[ticker_ontology()], None)?;
        let elements = vec![
            element("e0", None, ElementType::Root, "", 0),
            element("e1", Some("e0"), ElementType::Paragraph, "Buy $ACME now", 1),
            element("e2", Some("e0"), ElementType::Paragraph, "$ACME and $WIDG", 2),
        ];

        let extracted = extractor.extract(&elements).await?;
        let ids: Vec<&str> = extracted.entities.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["ticker:acme", "ticker:widg"]);

        // ACME derives from both paragraphs.
        let acme_mappings: Vec<_> = extracted
            .mappings
            .iter()
            .filter(|m| m.entity_id == "ticker:acme")
            .collect();
        assert_eq!(acme_mappings.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_relationship_rule_respects_distance() -> Result<()> {
        let extractor = EntityExtractor::new(&[ticker_ontology()], None)?;

        // Adjacent: ticker at 1, exchange keyword at 2 → within distance 1
        let near = vec![
            element("e0", None, ElementType::Root, "", 0),
            element("e1", Some("e0"), ElementType::Paragraph, "$ACME surges", 1),
            element("e2", Some("e0"), ElementType::Paragraph, "listed on NASDAQ", 2),
        ];
        let extracted = extractor.extract(&near).await?;
        assert_eq!(extracted.relationships.len(), 1);
        let rel = &extracted.relationships[0];
        assert_eq!(rel.source_entity_id, "ticker:acme");
        assert_eq!(rel.target_entity_id, "exchange:nasdaq");
        assert_eq!(rel.relationship_type, "listed_on");
        assert!((rel.confidence - 0.9 * 0.6).abs() < 1e-9);

        // Far apart: positions 1 and 5 → no edge
        let far = vec![
            element("e0", None, ElementType::Root, "", 0),
            element("e1", Some("e0"), ElementType::Paragraph, "$ACME surges", 1),
            element("e2", Some("e0"), ElementType::Paragraph, "filler", 2),
            element("e3", Some("e0"), ElementType::Paragraph, "filler", 3),
            element("e4", Some("e0"), ElementType::Paragraph, "filler", 4),
            element("e5", Some("e0"), ElementType::Paragraph, "NASDAQ news", 5),
        ];
        let extracted = extractor.extract(&far).await?;
        assert!(extracted.relationships.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_metadata_field_rule() -> Result<()> {
        let ontology = Ontology::from_yaml(
            r#"
name: meta
version: "1"
domain: docs
element_entity_mappings:
  - entity_type: author
    extraction_rules:
      - type: metadata_field
        field_path: frontmatter.author
        confidence: 0.95
"#,
        )
        .unwrap();
        let extractor = EntityExtractor::new(&[ontology], None)?;

        let mut with_author = element("e1", Some("e0"), ElementType::Paragraph, "body", 1);
        with_author.metadata.insert(
            "frontmatter".to_string(),
            json!({"author": "Ada Lovelace"}),
        );
        let elements = vec![element("e0", None, ElementType::Root, "", 0), with_author];

        let extracted = extractor.extract(&elements).await?;
        assert_eq!(extracted.entities.len(), 1);
        assert_eq!(extracted.entities[0].entity_id, "author:ada-lovelace");
        assert_eq!(extracted.entities[0].name, "Ada Lovelace");
        Ok(())
    }

    #[tokio::test]
    async fn test_semantic_rule_without_embeddings_is_silent() -> Result<()> {
        let ontology = Ontology::from_yaml(
            r#"
name: sem
version: "1"
domain: docs
terms:
  - term_id: revenue
    label: Revenue
element_entity_mappings:
  - entity_type: metric
    extraction_rules:
      - type: semantic_similarity
        term_id: revenue
        confidence: 0.8
"#,
        )
        .unwrap();
        let extractor = EntityExtractor::new(&[ontology], None)?;
        let elements = vec![
            element("e0", None, ElementType::Root, "", 0),
            element("e1", Some("e0"), ElementType::Paragraph, "revenue grew", 1),
        ];
        let extracted = extractor.extract(&elements).await?;
        assert!(extracted.entities.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_semantic_rule_matches_identical_text() -> Result<()> {
        let ontology = Ontology::from_yaml(
            r#"
name: sem
version: "1"
domain: docs
terms:
  - term_id: revenue
    label: quarterly revenue growth
element_entity_mappings:
  - entity_type: metric
    extraction_rules:
      - type: semantic_similarity
        term_id: revenue
        threshold: 0.99
        confidence: 0.8
"#,
        )
        .unwrap();
        let service = Arc::new(EmbeddingService::with_provider(Box::new(
            HashEmbeddingProvider::new("t", 64)?,
        )));
        let extractor = EntityExtractor::new(&[ontology], Some(service))?;

        let elements = vec![
            element("e0", None, ElementType::Root, "", 0),
            // Identical wording → cosine similarity 1.0 under the hash model
            element("e1", Some("e0"), ElementType::Paragraph, "quarterly revenue growth", 1),
            element("e2", Some("e0"), ElementType::Paragraph, "unrelated llama content", 2),
        ];
        let extracted = extractor.extract(&elements).await?;
        assert_eq!(extracted.entities.len(), 1);
        assert_eq!(extracted.entities[0].entity_id, "metric:revenue");
        assert_eq!(extracted.mappings.len(), 1);
        assert_eq!(extracted.mappings[0].element_id, "e1");
        Ok(())
    }
}
