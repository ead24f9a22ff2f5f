//! Relationship pruning policies.
//!
//! Each policy decides, chunk by chunk, which relationships and nodes survive, using the
//! global [`ProvenanceMap`]. Exactly one policy runs per build.

use extract::{ChunkGraph, DocumentGraph, Relationship};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use crate::provenance::ProvenanceMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PruningPolicy {
    /// Keep relationships whose endpoints have different provenance, or share provenance
    /// spanning several chunks.
    RemoteRelation,
    /// Keep relationships touching a bridge entity, plus those touching their endpoints.
    TwoHopBridge,
    /// Keep only relationships between bridge entities, and only bridge nodes.
    #[default]
    BridgeOnly,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("unknown pruning policy '{0}' (expected remote-relation, two-hop-bridge or bridge-only)")]
pub struct UnknownPolicy(pub String);

impl FromStr for PruningPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "remote-relation" | "remote" => Ok(PruningPolicy::RemoteRelation),
            "two-hop-bridge" | "two-hop" | "2hop" => Ok(PruningPolicy::TwoHopBridge),
            "bridge-only" | "bridge" => Ok(PruningPolicy::BridgeOnly),
            _ => Err(UnknownPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for PruningPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PruningPolicy::RemoteRelation => "remote-relation",
            PruningPolicy::TwoHopBridge => "two-hop-bridge",
            PruningPolicy::BridgeOnly => "bridge-only",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SparsityReport {
    pub policy: PruningPolicy,
    pub relationships_before: usize,
    pub relationships_after: usize,
    pub bridge_entities: usize,
    pub orphans_dropped: usize,
}

impl SparsityReport {
    pub fn pruned(&self) -> usize {
        self.relationships_before - self.relationships_after
    }

    /// Fraction of relationships removed; 0.0 when there were none.
    pub fn ratio(&self) -> f64 {
        if self.relationships_before == 0 {
            0.0
        } else {
            self.pruned() as f64 / self.relationships_before as f64
        }
    }
}

impl PruningPolicy {
    /// Prune every chunk of every document in place.
    pub fn prune(&self, documents: &mut [DocumentGraph], provenance: &ProvenanceMap) -> SparsityReport {
        let bridges = provenance.bridge_entities();
        info!(
            policy = %self,
            entities = provenance.len(),
            bridge_entities = bridges.len(),
            "Pruning relationships"
        );

        let mut report = SparsityReport {
            policy: *self,
            bridge_entities: bridges.len(),
            ..SparsityReport::default()
        };

        for chunk in documents.iter_mut().flat_map(|doc| doc.chunks.iter_mut()) {
            report.relationships_before += chunk.relationships.len();
            self.prune_chunk(chunk, provenance, &bridges);
            report.orphans_dropped += self.drop_orphans(chunk);
            report.relationships_after += chunk.relationships.len();
        }

        info!(
            policy = %self,
            pruned = report.pruned(),
            sparsity = format!("{:.2}%", report.ratio() * 100.0),
            "Pruning complete"
        );
        report
    }

    pub fn prune_chunk(&self, chunk: &mut ChunkGraph, provenance: &ProvenanceMap, bridges: &HashSet<&str>) {
        match self {
            PruningPolicy::RemoteRelation => {
                let empty = BTreeSet::new();
                chunk.relationships.retain(|rel| {
                    let head = provenance.chunks_for(&rel.head).unwrap_or(&empty);
                    let tail = provenance.chunks_for(&rel.tail).unwrap_or(&empty);
                    let remote = head != tail;
                    let core_association = head == tail && head.len() > 1;
                    remote || core_association
                });
                keep_referenced_nodes(chunk);
            }
            PruningPolicy::TwoHopBridge => {
                let touches_bridge = |rel: &Relationship| {
                    bridges.contains(rel.head.as_str()) || bridges.contains(rel.tail.as_str())
                };

                let one_hop_entities: HashSet<String> = chunk
                    .relationships
                    .iter()
                    .filter(|rel| touches_bridge(rel))
                    .flat_map(|rel| [rel.head.clone(), rel.tail.clone()])
                    .collect();

                chunk.relationships.retain(|rel| {
                    touches_bridge(rel)
                        || one_hop_entities.contains(&rel.head)
                        || one_hop_entities.contains(&rel.tail)
                });
                keep_referenced_nodes(chunk);
            }
            PruningPolicy::BridgeOnly => {
                chunk.relationships.retain(|rel| {
                    bridges.contains(rel.head.as_str()) && bridges.contains(rel.tail.as_str())
                });
                if chunk.relationships.is_empty() {
                    chunk.nodes.clear();
                } else {
                    chunk.nodes.retain(|id, _| bridges.contains(id.as_str()));
                }
            }
        }
    }

    /// Remove relationships whose endpoints are not retained nodes, then reapply this
    /// policy's node rule. Returns how many relationships were removed.
    fn drop_orphans(&self, chunk: &mut ChunkGraph) -> usize {
        let before = chunk.relationships.len();
        let nodes = &chunk.nodes;
        chunk
            .relationships
            .retain(|rel| nodes.contains_key(&rel.head) && nodes.contains_key(&rel.tail));

        let dropped = before - chunk.relationships.len();
        if dropped > 0 {
            debug!(chunk_id = ?chunk.chunk_id, dropped, "Dropped relationships with missing endpoints");
            match self {
                PruningPolicy::BridgeOnly if chunk.relationships.is_empty() => chunk.nodes.clear(),
                PruningPolicy::BridgeOnly => {}
                _ => keep_referenced_nodes(chunk),
            }
        }
        dropped
    }
}

fn keep_referenced_nodes(chunk: &mut ChunkGraph) {
    let active: HashSet<&str> = chunk
        .relationships
        .iter()
        .flat_map(|rel| [rel.head.as_str(), rel.tail.as_str()])
        .collect();
    chunk.nodes.retain(|id, _| active.contains(id.as_str()));
}
