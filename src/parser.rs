// Document Parser Registry
// Format parsers turn a raw byte buffer into the canonical element and
// relationship lists. Parsers are pure over the buffer: identical input
// bytes must produce identical output, including ordering fields and
// content hashes. Dispatch is by doc_type tag through a registry built once
// per process.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::contracts::{Document, Element, Metadata, Relationship, CONTENT_PREVIEW_MAX};
use crate::types::{ElementType, RelationshipType};
use chrono::{DateTime, Utc};

/// Hex SHA-256 of a byte buffer; the stable content fingerprint used for
/// documents and elements alike.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A parsed element before persistence: carries the full text for the
/// embedding and extraction passes. The store only keeps the bounded
/// preview plus the content_location needed to resolve the text again.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedElement {
    pub element_id: String,
    pub parent_id: Option<String>,
    pub element_type: ElementType,
    pub text: String,
    pub content_location: Value,
    pub content_hash: String,
    pub element_order: i32,
    pub document_position: i32,
    pub metadata: Metadata,
}

impl ParsedElement {
    /// Bounded preview for fast scans, cut at a char boundary.
    pub fn content_preview(&self) -> String {
        if self.text.len() <= CONTENT_PREVIEW_MAX {
            return self.text.clone();
        }
        let mut end = CONTENT_PREVIEW_MAX;
        while !self.text.is_char_boundary(end) {
            end -= 1;
        }
        self.text[..end].to_string()
    }

    pub fn to_element(&self, doc_id: &str) -> Element {
        Element {
            element_id: self.element_id.clone(),
            element_pk: 0,
            doc_id: doc_id.to_string(),
            parent_id: self.parent_id.clone(),
            element_type: self.element_type.clone(),
            content_preview: self.content_preview(),
            content_location: self.content_location.clone(),
            content_hash: self.content_hash.clone(),
            element_order: self.element_order,
            document_position: self.document_position,
            metadata: self.metadata.clone(),
            embedding: None,
        }
    }
}

/// The parser contract's output: a document row, its elements with fully
/// populated ordering fields, and the relationships among them.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub document: Document,
    pub elements: Vec<ParsedElement>,
    pub relationships: Vec<Relationship>,
}

impl ParsedDocument {
    /// Hrefs of link relationships pointing outside this element set,
    /// candidates for link discovery.
    pub fn external_link_targets(&self) -> Vec<String> {
        let ids: std::collections::HashSet<&str> =
            self.elements.iter().map(|e| e.element_id.as_str()).collect();
        self.relationships
            .iter()
            .filter(|r| r.relationship_type == RelationshipType::Link)
            .filter(|r| !ids.contains(r.target_id.as_str()))
            .map(|r| r.target_id.clone())
            .collect()
    }
}

/// Trait for format parsers.
///
/// # Postconditions
/// - Exactly one root element with no parent
/// - `document_position` strictly increasing in emission order
/// - Every structural relationship's endpoints exist in the element set
/// - Output is deterministic for identical input bytes
pub trait DocumentParser: Send + Sync {
    fn name(&self) -> &str;

    /// Format tags this parser handles.
    fn doc_types(&self) -> &[&str];

    fn parse(
        &self,
        doc_id: &str,
        source: &str,
        content: &[u8],
        metadata: &Metadata,
    ) -> Result<ParsedDocument>;
}

/// Name→parser dispatch, built once per process from the registered
/// parsers' doc_type tags.
pub struct ParserRegistry {
    by_type: HashMap<String, Arc<dyn DocumentParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self {
            by_type: HashMap::new(),
        }
    }

    /// Registry with the in-tree parsers installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TextParser));
        registry.register(Arc::new(MarkdownParser));
        registry
    }

    pub fn register(&mut self, parser: Arc<dyn DocumentParser>) {
        for doc_type in parser.doc_types() {
            self.by_type.insert(doc_type.to_string(), parser.clone());
        }
    }

    pub fn get(&self, doc_type: &str) -> Option<Arc<dyn DocumentParser>> {
        self.by_type.get(doc_type).cloned()
    }

    pub fn parse(
        &self,
        doc_type: &str,
        doc_id: &str,
        source: &str,
        content: &[u8],
        metadata: &Metadata,
    ) -> Result<ParsedDocument> {
        let parser = self
            .get(doc_type)
            .with_context(|| format!("No parser registered for doc_type '{doc_type}'"))?;
        parser.parse(doc_id, source, content, metadata)
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Map a document name to its format tag by extension.
pub fn doc_type_for_name(name: &str) -> String {
    match name.rsplit('.').next().map(|e| e.to_ascii_lowercase()) {
        Some(ext) if ext == "md" || ext == "markdown" => "markdown".to_string(),
        _ => "text".to_string(),
    }
}

fn element_id(doc_id: &str, position: i32) -> String {
    format!("{doc_id}#{position:04}")
}

fn location(doc_id: &str, start: usize, end: usize) -> Value {
    json!({ "doc_id": doc_id, "start": start, "end": end })
}

fn now_pair(metadata: &Metadata) -> (DateTime<Utc>, DateTime<Utc>) {
    // Source adapters may supply a modification timestamp; fall back to now.
    let modified = metadata
        .get("modified_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let now = Utc::now();
    (now, modified.unwrap_or(now))
}

/// Emit contains / contained_by / next_sibling edges for a parsed element
/// tree. Relationship ids are deterministic in emission order.
pub fn structural_relationships(
    doc_id: &str,
    elements: &[ParsedElement],
) -> Vec<Relationship> {
    let mut relationships = Vec::new();
    let mut counter = 0usize;
    let mut push = |source: &str, target: &str, rtype: RelationshipType,
                    relationships: &mut Vec<Relationship>| {
        relationships.push(Relationship {
            relationship_id: format!("{doc_id}#rel{counter:04}"),
            source_id: source.to_string(),
            target_id: target.to_string(),
            relationship_type: rtype,
            metadata: Metadata::new(),
        });
        counter += 1;
    };

    for element in elements {
        if let Some(parent) = &element.parent_id {
            push(
                parent,
                &element.element_id,
                RelationshipType::Contains,
                &mut relationships,
            );
            push(
                &element.element_id,
                parent,
                RelationshipType::ContainedBy,
                &mut relationships,
            );
        }
    }

    // next_sibling: consecutive element_order under the same parent
    let mut by_parent: HashMap<Option<&str>, Vec<&ParsedElement>> = HashMap::new();
    for element in elements {
        by_parent
            .entry(element.parent_id.as_deref())
            .or_default()
            .push(element);
    }
    let mut parents: Vec<_> = by_parent.into_iter().collect();
    parents.sort_by_key(|(parent, _)| parent.map(String::from));
    for (_, mut siblings) in parents {
        siblings.sort_by_key(|e| e.element_order);
        for pair in siblings.windows(2) {
            push(
                &pair[0].element_id,
                &pair[1].element_id,
                RelationshipType::NextSibling,
                &mut relationships,
            );
        }
    }

    relationships
}

fn make_document(
    doc_id: &str,
    doc_type: &str,
    source: &str,
    content: &[u8],
    metadata: &Metadata,
) -> Document {
    let (created_at, updated_at) = now_pair(metadata);
    Document {
        doc_id: doc_id.to_string(),
        doc_type: doc_type.to_string(),
        source: source.to_string(),
        content_hash: content_hash(content),
        metadata: metadata.clone(),
        created_at,
        updated_at,
    }
}

/// Plain-text parser: paragraphs split on blank lines under a single root.
pub struct TextParser;

impl DocumentParser for TextParser {
    fn name(&self) -> &str {
        "text"
    }

    fn doc_types(&self) -> &[&str] {
        &["text", "txt"]
    }

    fn parse(
        &self,
        doc_id: &str,
        source: &str,
        content: &[u8],
        metadata: &Metadata,
    ) -> Result<ParsedDocument> {
        let text = String::from_utf8_lossy(content);
        let mut elements = Vec::new();
        let mut position = 0i32;

        let root_id = element_id(doc_id, position);
        elements.push(ParsedElement {
            element_id: root_id.clone(),
            parent_id: None,
            element_type: ElementType::Root,
            text: String::new(),
            content_location: location(doc_id, 0, content.len()),
            content_hash: content_hash(content),
            element_order: 0,
            document_position: position,
            metadata: Metadata::new(),
        });
        position += 1;

        let mut order = 0i32;
        let mut offset = 0usize;
        for block in text.split("\n\n") {
            let trimmed = block.trim();
            let start = offset;
            offset += block.len() + 2;
            if trimmed.is_empty() {
                continue;
            }
            elements.push(ParsedElement {
                element_id: element_id(doc_id, position),
                parent_id: Some(root_id.clone()),
                element_type: ElementType::Paragraph,
                text: trimmed.to_string(),
                content_location: location(doc_id, start, (start + block.len()).min(text.len())),
                content_hash: content_hash(trimmed.as_bytes()),
                element_order: order,
                document_position: position,
                metadata: Metadata::new(),
            });
            order += 1;
            position += 1;
        }

        let relationships = structural_relationships(doc_id, &elements);
        Ok(ParsedDocument {
            document: make_document(doc_id, "text", source, content, metadata),
            elements,
            relationships,
        })
    }
}

/// Markdown parser: headers, paragraphs, fenced code blocks, and lists,
/// nested under the most recent header of shallower level. Inline links
/// become link relationships for the discovery pass.
pub struct MarkdownParser;

static LINK_PATTERN: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
    regex::Regex::new(r"\[([^\]]*)\]\(([^)\s]+)\)").expect("static link pattern")
});

impl MarkdownParser {
    fn header_level(line: &str) -> Option<usize> {
        let hashes = line.bytes().take_while(|b| *b == b'#').count();
        if (1..=6).contains(&hashes) && line.as_bytes().get(hashes) == Some(&b' ') {
            Some(hashes)
        } else {
            None
        }
    }
}

impl DocumentParser for MarkdownParser {
    fn name(&self) -> &str {
        "markdown"
    }

    fn doc_types(&self) -> &[&str] {
        &["markdown", "md"]
    }

    fn parse(
        &self,
        doc_id: &str,
        source: &str,
        content: &[u8],
        metadata: &Metadata,
    ) -> Result<ParsedDocument> {
        let text = String::from_utf8_lossy(content);
        let mut elements: Vec<ParsedElement> = Vec::new();
        let mut position = 0i32;

        let root_id = element_id(doc_id, position);
        elements.push(ParsedElement {
            element_id: root_id.clone(),
            parent_id: None,
            element_type: ElementType::Root,
            text: String::new(),
            content_location: location(doc_id, 0, content.len()),
            content_hash: content_hash(content),
            element_order: 0,
            document_position: position,
            metadata: Metadata::new(),
        });
        position += 1;

        // (header level, element_id) stack; root acts as level 0
        let mut section_stack: Vec<(usize, String)> = vec![(0, root_id.clone())];
        // next element_order per parent id
        let mut order_within: HashMap<String, i32> = HashMap::new();
        let mut links: Vec<(String, String, String)> = Vec::new(); // (element, label, href)

        let next_order = |parent: &str, order_within: &mut HashMap<String, i32>| {
            let slot = order_within.entry(parent.to_string()).or_insert(0);
            let order = *slot;
            *slot += 1;
            order
        };

        let lines: Vec<&str> = text.lines().collect();
        let mut i = 0usize;
        while i < lines.len() {
            let line = lines[i];
            let trimmed = line.trim();

            if trimmed.is_empty() {
                i += 1;
                continue;
            }

            if let Some(level) = Self::header_level(trimmed) {
                while section_stack.last().map(|(l, _)| *l >= level).unwrap_or(false)
                    && section_stack.len() > 1
                {
                    section_stack.pop();
                }
                let parent = section_stack.last().expect("root always present").1.clone();
                let header_text = trimmed[level..].trim().to_string();
                let id = element_id(doc_id, position);
                let mut element_metadata = Metadata::new();
                element_metadata.insert("level".to_string(), json!(level));
                elements.push(ParsedElement {
                    element_id: id.clone(),
                    parent_id: Some(parent.clone()),
                    element_type: ElementType::Header,
                    text: header_text.clone(),
                    content_location: location(doc_id, i, i + 1),
                    content_hash: content_hash(header_text.as_bytes()),
                    element_order: next_order(&parent, &mut order_within),
                    document_position: position,
                    metadata: element_metadata,
                });
                for capture in LINK_PATTERN.captures_iter(&header_text) {
                    links.push((id.clone(), capture[1].to_string(), capture[2].to_string()));
                }
                section_stack.push((level, id));
                position += 1;
                i += 1;
                continue;
            }

            if trimmed.starts_with("```") {
                let mut body = Vec::new();
                let start = i;
                i += 1;
                while i < lines.len() && !lines[i].trim().starts_with("```") {
                    body.push(lines[i]);
                    i += 1;
                }
                i = (i + 1).min(lines.len());
                let parent = section_stack.last().expect("root always present").1.clone();
                let code = body.join("\n");
                elements.push(ParsedElement {
                    element_id: element_id(doc_id, position),
                    parent_id: Some(parent.clone()),
                    element_type: ElementType::CodeBlock,
                    text: code.clone(),
                    content_location: location(doc_id, start, i),
                    content_hash: content_hash(code.as_bytes()),
                    element_order: next_order(&parent, &mut order_within),
                    document_position: position,
                    metadata: Metadata::new(),
                });
                position += 1;
                continue;
            }

            let is_list_item = |l: &str| {
                let t = l.trim_start();
                t.starts_with("- ") || t.starts_with("* ") || t.starts_with("+ ")
            };

            if is_list_item(line) {
                let parent = section_stack.last().expect("root always present").1.clone();
                let list_id = element_id(doc_id, position);
                elements.push(ParsedElement {
                    element_id: list_id.clone(),
                    parent_id: Some(parent.clone()),
                    element_type: ElementType::List,
                    text: String::new(),
                    content_location: location(doc_id, i, i),
                    content_hash: String::new(),
                    element_order: next_order(&parent, &mut order_within),
                    document_position: position,
                    metadata: Metadata::new(),
                });
                position += 1;

                let list_start = i;
                while i < lines.len() && is_list_item(lines[i]) {
                    let item_text = lines[i].trim_start()[2..].trim().to_string();
                    let id = element_id(doc_id, position);
                    elements.push(ParsedElement {
                        element_id: id.clone(),
                        parent_id: Some(list_id.clone()),
                        element_type: ElementType::ListItem,
                        text: item_text.clone(),
                        content_location: location(doc_id, i, i + 1),
                        content_hash: content_hash(item_text.as_bytes()),
                        element_order: next_order(&list_id, &mut order_within),
                        document_position: position,
                        metadata: Metadata::new(),
                    });
                    for capture in LINK_PATTERN.captures_iter(&item_text) {
                        links.push((id.clone(), capture[1].to_string(), capture[2].to_string()));
                    }
                    position += 1;
                    i += 1;
                }
                // Fix the list's content_location now that its extent is known
                if let Some(list) = elements.iter_mut().find(|e| e.element_id == list_id) {
                    list.content_location = location(doc_id, list_start, i);
                }
                continue;
            }

            // Paragraph: consecutive non-blank, non-structural lines
            let start = i;
            let mut body = Vec::new();
            while i < lines.len() {
                let l = lines[i];
                let t = l.trim();
                if t.is_empty()
                    || Self::header_level(t).is_some()
                    || t.starts_with("```")
                    || is_list_item(l)
                {
                    break;
                }
                body.push(t);
                i += 1;
            }
            let paragraph = body.join(" ");
            let parent = section_stack.last().expect("root always present").1.clone();
            let id = element_id(doc_id, position);
            elements.push(ParsedElement {
                element_id: id.clone(),
                parent_id: Some(parent.clone()),
                element_type: ElementType::Paragraph,
                text: paragraph.clone(),
                content_location: location(doc_id, start, i),
                content_hash: content_hash(paragraph.as_bytes()),
                element_order: next_order(&parent, &mut order_within),
                document_position: position,
                metadata: Metadata::new(),
            });
            for capture in LINK_PATTERN.captures_iter(&paragraph) {
                links.push((id.clone(), capture[1].to_string(), capture[2].to_string()));
            }
            position += 1;
        }

        let mut relationships = structural_relationships(doc_id, &elements);
        for (index, (source_element, label, href)) in links.iter().enumerate() {
            let mut link_metadata = Metadata::new();
            link_metadata.insert("label".to_string(), json!(label));
            relationships.push(Relationship {
                relationship_id: format!("{doc_id}#link{index:04}"),
                source_id: source_element.clone(),
                target_id: href.clone(),
                relationship_type: RelationshipType::Link,
                metadata: link_metadata,
            });
        }

        Ok(ParsedDocument {
            document: make_document(doc_id, "markdown", source, content, metadata),
            elements,
            relationships,
        })
    }
}
