use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Separator between an entity name and its owning document id.
pub const DOC_SCOPE_SEPARATOR: &str = "__";

/// Free-form type label produced by the model, with an explicit unknown sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum TypeTag {
    #[default]
    Unknown,
    Named(String),
}

impl TypeTag {
    pub fn as_str(&self) -> &str {
        match self {
            TypeTag::Unknown => "unknown",
            TypeTag::Named(name) => name,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, TypeTag::Unknown)
    }
}

impl From<&str> for TypeTag {
    fn from(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("unknown") || trimmed == "未知" {
            TypeTag::Unknown
        } else {
            TypeTag::Named(trimmed.to_string())
        }
    }
}

impl From<String> for TypeTag {
    fn from(raw: String) -> Self {
        TypeTag::from(raw.as_str())
    }
}

impl From<TypeTag> for String {
    fn from(tag: TypeTag) -> Self {
        tag.as_str().to_string()
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: TypeTag,
    pub description: String,
    pub title: String,
    pub doc_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub head: String,
    pub relation: TypeTag,
    pub tail: String,
    pub description: String,
    pub weight: f64,
}

impl Relationship {
    pub fn is_self_loop(&self) -> bool {
        self.head == self.tail
    }
}

/// Structured extraction output for one chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkGraph {
    /// Id of the permanent chunk node; `None` when the chunk structure step did not align one.
    pub chunk_id: Option<String>,
    pub text: String,
    pub nodes: BTreeMap<String, Entity>,
    pub relationships: Vec<Relationship>,
}

impl ChunkGraph {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.relationships.is_empty()
    }

    /// Relationships whose head or tail is missing from the node map.
    pub fn dangling_relationships(&self) -> usize {
        self.relationships
            .iter()
            .filter(|r| !self.nodes.contains_key(&r.head) || !self.nodes.contains_key(&r.tail))
            .count()
    }
}

/// All chunk graphs of one source document, in chunk order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentGraph {
    pub doc_id: String,
    pub filename: String,
    pub chunks: Vec<ChunkGraph>,
}

/// Scope an entity name to its document so equal names in different documents never collide.
pub fn scoped_id(name: &str, doc_id: &str) -> String {
    format!("{}{}{}", name, DOC_SCOPE_SEPARATOR, doc_id)
}

/// The entity name with its document suffix removed.
pub fn display_name<'a>(id: &'a str, doc_id: &str) -> &'a str {
    id.strip_suffix(doc_id)
        .and_then(|rest| rest.strip_suffix(DOC_SCOPE_SEPARATOR))
        .unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tag_sentinel() {
        assert_eq!(TypeTag::from("unknown"), TypeTag::Unknown);
        assert_eq!(TypeTag::from("未知"), TypeTag::Unknown);
        assert_eq!(TypeTag::from("  "), TypeTag::Unknown);
        assert_eq!(TypeTag::from("Person"), TypeTag::Named("Person".into()));
        assert_eq!(TypeTag::Unknown.to_string(), "unknown");
    }

    #[test]
    fn test_type_tag_serializes_as_string() {
        let json = serde_json::to_string(&TypeTag::Named("Company".into())).unwrap();
        assert_eq!(json, "\"Company\"");
        let back: TypeTag = serde_json::from_str("\"unknown\"").unwrap();
        assert!(back.is_unknown());
    }

    #[test]
    fn test_scoped_and_display_names() {
        let id = scoped_id("Apple Inc.", "q7");
        assert_eq!(id, "Apple Inc.__q7");
        assert_eq!(display_name(&id, "q7"), "Apple Inc.");
        assert_eq!(display_name("snake__case__q7", "q7"), "snake__case");
        assert_eq!(display_name("unscoped", "q7"), "unscoped");
    }
}
