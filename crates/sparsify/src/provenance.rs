use extract::DocumentGraph;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

/// Canonical entity id -> ids of the chunks it appears in.
///
/// A present entry is never empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvenanceMap {
    entries: HashMap<String, BTreeSet<String>>,
}

impl ProvenanceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every chunk of every document that carries an aligned chunk id.
    pub fn build(documents: &[DocumentGraph]) -> Self {
        let mut map = Self::new();
        let mut skipped = 0;

        for doc in documents {
            for chunk in &doc.chunks {
                let Some(chunk_id) = chunk.chunk_id.as_deref().filter(|id| !id.is_empty()) else {
                    skipped += 1;
                    continue;
                };

                for entity_id in chunk.nodes.keys() {
                    map.insert(entity_id, chunk_id);
                }
            }
        }

        if skipped > 0 {
            debug!(skipped_chunks = skipped, "Chunks without an aligned chunk id were not indexed");
        }
        info!(entities = map.len(), "Entity provenance map built");
        map
    }

    pub fn insert(&mut self, entity_id: &str, chunk_id: &str) {
        self.entries
            .entry(entity_id.to_string())
            .or_default()
            .insert(chunk_id.to_string());
    }

    pub fn chunks_for(&self, entity_id: &str) -> Option<&BTreeSet<String>> {
        self.entries.get(entity_id)
    }

    /// Entities that appear in more than one chunk.
    pub fn bridge_entities(&self) -> HashSet<&str> {
        self.entries
            .iter()
            .filter(|(_, chunks)| chunks.len() > 1)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extract::{ChunkGraph, Entity, TypeTag};

    fn chunk(chunk_id: Option<&str>, ids: &[&str]) -> ChunkGraph {
        ChunkGraph {
            chunk_id: chunk_id.map(str::to_string),
            text: String::new(),
            nodes: ids
                .iter()
                .map(|id| {
                    (
                        id.to_string(),
                        Entity {
                            id: id.to_string(),
                            entity_type: TypeTag::Unknown,
                            description: String::new(),
                            title: String::new(),
                            doc_id: "d".into(),
                        },
                    )
                })
                .collect(),
            relationships: Vec::new(),
        }
    }

    #[test]
    fn test_build_collects_chunks_per_entity() {
        let docs = vec![
            DocumentGraph {
                doc_id: "d1".into(),
                filename: "f".into(),
                chunks: vec![chunk(Some("c1"), &["a", "b"]), chunk(Some("c2"), &["a"])],
            },
            DocumentGraph {
                doc_id: "d2".into(),
                filename: "g".into(),
                chunks: vec![chunk(Some("c3"), &["z"])],
            },
        ];

        let map = ProvenanceMap::build(&docs);

        assert_eq!(map.len(), 3);
        assert_eq!(
            map.chunks_for("a").unwrap().iter().collect::<Vec<_>>(),
            vec!["c1", "c2"]
        );
        assert_eq!(map.bridge_entities(), HashSet::from(["a"]));
    }

    #[test]
    fn test_chunks_without_id_are_skipped() {
        let docs = vec![DocumentGraph {
            doc_id: "d".into(),
            filename: "f".into(),
            chunks: vec![chunk(None, &["a"]), chunk(Some(""), &["b"]), chunk(Some("c"), &["a"])],
        }];

        let map = ProvenanceMap::build(&docs);

        assert_eq!(map.len(), 1);
        assert!(map.chunks_for("b").is_none());
        assert_eq!(map.chunks_for("a").unwrap().len(), 1);
        assert!(map.bridge_entities().is_empty());
    }
}
