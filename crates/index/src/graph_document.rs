//! Conversion of pruned chunk graphs into graph documents, the unit the store persists.

use anyhow::{Result, bail};
use dashmap::DashMap;
use extract::{ChunkGraph, Entity};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub node_type: String,
    pub description: String,
    pub title: String,
    pub doc_id: String,
}

impl From<&Entity> for GraphNode {
    fn from(entity: &Entity) -> Self {
        Self {
            id: entity.id.clone(),
            node_type: entity.entity_type.to_string(),
            description: entity.description.clone(),
            title: entity.title.clone(),
            doc_id: entity.doc_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphRelationship {
    pub source: Arc<GraphNode>,
    pub target: Arc<GraphNode>,
    pub rel_type: String,
    pub description: String,
    pub weight: f64,
}

/// The chunk a graph document was extracted from.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub chunk_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphDocument {
    pub nodes: Vec<Arc<GraphNode>>,
    pub relationships: Vec<GraphRelationship>,
    pub source: SourceRef,
}

/// Nodes shared across all graph documents of a run, keyed by entity id.
///
/// Concurrent inserts of the same id are fine: the first one wins and every caller gets
/// the same `Arc`.
#[derive(Debug, Default)]
pub struct NodeCache {
    nodes: DashMap<String, Arc<GraphNode>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert(&self, entity: &Entity) -> Arc<GraphNode> {
        self.nodes
            .entry(entity.id.clone())
            .or_insert_with(|| Arc::new(GraphNode::from(entity)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Build the graph document for one chunk.
///
/// Returns `Ok(None)` for a chunk with neither nodes nor relationships.
pub fn to_graph_document(
    chunk_id: &str,
    chunk: &ChunkGraph,
    cache: &NodeCache,
) -> Result<Option<GraphDocument>> {
    if chunk.is_empty() {
        return Ok(None);
    }

    let mut nodes = Vec::with_capacity(chunk.nodes.len());
    for (id, entity) in &chunk.nodes {
        if id.trim().is_empty() || entity.id.trim().is_empty() {
            bail!("Entity with empty id in chunk {}", chunk_id);
        }
        nodes.push(cache.get_or_insert(entity));
    }

    let mut relationships = Vec::with_capacity(chunk.relationships.len());
    for rel in &chunk.relationships {
        if !rel.weight.is_finite() {
            bail!(
                "Relationship {} -> {} has non-finite weight {} in chunk {}",
                rel.head, rel.tail, rel.weight, chunk_id
            );
        }

        let (Some(head), Some(tail)) = (chunk.nodes.get(&rel.head), chunk.nodes.get(&rel.tail)) else {
            debug!(chunk_id, head = %rel.head, tail = %rel.tail, "Skipping relationship with missing endpoint");
            continue;
        };

        relationships.push(GraphRelationship {
            source: cache.get_or_insert(head),
            target: cache.get_or_insert(tail),
            rel_type: rel.relation.to_string(),
            description: rel.description.clone(),
            weight: rel.weight,
        });
    }

    Ok(Some(GraphDocument {
        nodes,
        relationships,
        source: SourceRef {
            chunk_id: chunk_id.to_string(),
            text: chunk.text.clone(),
        },
    }))
}
