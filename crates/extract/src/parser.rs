//! Parser for the line-oriented entity/relationship records emitted by the extraction model.
//!
//! Every `("entity"` or `("relationship"` opener starts one record. A record that does not
//! match its full pattern becomes a [`ParseFailure`] and the remaining records still parse.

use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::schema::{scoped_id, ChunkGraph, DocumentGraph, Entity, Relationship, TypeTag};

pub const INFERRED_DESCRIPTION: &str = "inferred from relationship";

static RECORD_OPENER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\(\s*"(entity|relationship)""#).expect("valid opener pattern"));

static ENTITY_RECORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\A\(\s*"entity"\s*:\s*"([^"]+)"\s*:\s*"([^"]+)"\s*:\s*"([^"]+)"\s*\)"#)
        .expect("valid entity pattern")
});

static RELATIONSHIP_RECORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"\A\(\s*"relationship"\s*:\s*"([^"]+)"\s*:\s*"([^"]+)"\s*:\s*"([^"]+)"\s*:\s*"([^"]+)"\s*:\s*([^()]+?)\s*\)"#,
    )
    .expect("valid relationship pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Entity,
    Relationship,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Entity => f.write_str("entity"),
            RecordKind::Relationship => f.write_str("relationship"),
        }
    }
}

/// Why a single record was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseFailure {
    #[error("malformed {kind} record: {snippet}")]
    Malformed { kind: RecordKind, snippet: String },

    #[error("invalid weight '{raw}' on relationship {head} -> {tail}")]
    InvalidWeight { raw: String, head: String, tail: String },

    #[error("relationship points back at its own head '{name}'")]
    SelfLoop { name: String },
}

/// A record as written by the model, before document scoping.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRecord {
    Node {
        name: String,
        entity_type: String,
        description: String,
    },
    Edge {
        head: String,
        relation: String,
        tail: String,
        description: String,
        weight: f64,
    },
}

/// Parse every record in `raw`, one result per record opener.
pub fn parse_records(raw: &str) -> Vec<Result<ParsedRecord, ParseFailure>> {
    RECORD_OPENER
        .captures_iter(raw)
        .map(|caps| {
            let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
            let kind = match &caps[1] {
                "entity" => RecordKind::Entity,
                _ => RecordKind::Relationship,
            };
            parse_record(&raw[start..], kind)
        })
        .collect()
}

fn parse_record(text: &str, kind: RecordKind) -> Result<ParsedRecord, ParseFailure> {
    let malformed = || ParseFailure::Malformed {
        kind,
        snippet: snippet(text),
    };

    match kind {
        RecordKind::Entity => {
            let caps = ENTITY_RECORD.captures(text).ok_or_else(malformed)?;
            Ok(ParsedRecord::Node {
                name: caps[1].trim().to_string(),
                entity_type: caps[2].trim().to_string(),
                description: caps[3].to_string(),
            })
        }
        RecordKind::Relationship => {
            let caps = RELATIONSHIP_RECORD.captures(text).ok_or_else(malformed)?;
            let head = caps[1].trim().to_string();
            let tail = caps[3].trim().to_string();
            let raw_weight = caps[5].trim().trim_matches('"');

            let weight = match raw_weight.parse::<f64>() {
                Ok(w) if w.is_finite() && w >= 0.0 => w,
                _ => {
                    return Err(ParseFailure::InvalidWeight {
                        raw: raw_weight.to_string(),
                        head,
                        tail,
                    });
                }
            };

            if head == tail {
                return Err(ParseFailure::SelfLoop { name: head });
            }

            Ok(ParsedRecord::Edge {
                head,
                relation: caps[2].trim().to_string(),
                tail,
                description: caps[4].to_string(),
                weight,
            })
        }
    }
}

fn snippet(text: &str) -> String {
    let line = text.lines().next().unwrap_or("");
    line.chars().take(80).collect()
}

/// Parsed nodes and relationships of one chunk, plus the records that were skipped.
#[derive(Debug, Clone, Default)]
pub struct ParsedChunk {
    pub nodes: BTreeMap<String, Entity>,
    pub relationships: Vec<Relationship>,
    pub failures: Vec<ParseFailure>,
}

impl ParsedChunk {
    pub fn into_graph(self, chunk_id: Option<String>, text: String) -> ChunkGraph {
        ChunkGraph {
            chunk_id,
            text,
            nodes: self.nodes,
            relationships: self.relationships,
        }
    }
}

/// Raw model output for one chunk together with the chunk's metadata.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub chunk_id: Option<String>,
    pub title: String,
    pub text: String,
    pub raw: String,
}

#[derive(Debug, Default)]
pub struct ExtractionParser;

impl ExtractionParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse one chunk's raw output into document-scoped nodes and relationships.
    ///
    /// Node records are applied before relationship records, so an entity declared after
    /// the relationship that mentions it keeps its declared type and description.
    pub fn parse_chunk(&self, raw: &str, doc_id: &str, title: &str) -> ParsedChunk {
        let mut parsed = ParsedChunk::default();
        let mut edges = Vec::new();

        for record in parse_records(raw) {
            match record {
                Ok(ParsedRecord::Node {
                    name,
                    entity_type,
                    description,
                }) => {
                    let id = scoped_id(&name, doc_id);
                    parsed.nodes.insert(
                        id.clone(),
                        Entity {
                            id,
                            entity_type: TypeTag::from(entity_type),
                            description,
                            title: title.to_string(),
                            doc_id: doc_id.to_string(),
                        },
                    );
                }
                Ok(edge @ ParsedRecord::Edge { .. }) => edges.push(edge),
                Err(failure) => {
                    warn!(doc_id = doc_id, title = title, error = %failure, "Skipping extraction record");
                    parsed.failures.push(failure);
                }
            }
        }

        for edge in edges {
            let ParsedRecord::Edge {
                head,
                relation,
                tail,
                description,
                weight,
            } = edge
            else {
                continue;
            };

            let head = scoped_id(&head, doc_id);
            let tail = scoped_id(&tail, doc_id);
            for endpoint in [&head, &tail] {
                parsed
                    .nodes
                    .entry(endpoint.clone())
                    .or_insert_with(|| Entity {
                        id: endpoint.clone(),
                        entity_type: TypeTag::Unknown,
                        description: INFERRED_DESCRIPTION.to_string(),
                        title: title.to_string(),
                        doc_id: doc_id.to_string(),
                    });
            }

            parsed.relationships.push(Relationship {
                head,
                relation: TypeTag::from(relation),
                tail,
                description,
                weight,
            });
        }

        debug!(
            doc_id = doc_id,
            nodes = parsed.nodes.len(),
            relationships = parsed.relationships.len(),
            failures = parsed.failures.len(),
            "Parsed chunk"
        );
        parsed
    }

    /// Parse all chunks of a document. Returns the graph and the number of skipped records.
    pub fn parse_document(
        &self,
        doc_id: &str,
        filename: &str,
        chunks: Vec<RawChunk>,
    ) -> (DocumentGraph, usize) {
        let mut failures = 0;
        let graphs = chunks
            .into_iter()
            .map(|chunk| {
                let parsed = self.parse_chunk(&chunk.raw, doc_id, &chunk.title);
                failures += parsed.failures.len();
                parsed.into_graph(chunk.chunk_id, chunk.text)
            })
            .collect();

        (
            DocumentGraph {
                doc_id: doc_id.to_string(),
                filename: filename.to_string(),
                chunks: graphs,
            },
            failures,
        )
    }
}
