//! Document-local entity resolution.
//!
//! Near-duplicate entities are found by embedding similarity or name containment, confirmed
//! in batches by a [`ConfirmationOracle`], and collapsed into the more frequent entity.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::confirm::{CandidatePair, ConfirmationOracle, PairEntity};
use crate::schema::{display_name, DocumentGraph, Entity};

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.95;
pub const DEFAULT_CONFIRMATION_BATCH: usize = 10;

/// Embeds entity display names; output is order-aligned with input.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Cosine similarity of two vectors; 0.0 for empty, mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Losing entity id -> canonical entity id.
///
/// Every value is final: no value is also a key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeTable {
    links: BTreeMap<String, String>,
}

impl MergeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical id for `id` (itself when it was never merged away).
    pub fn resolve<'a>(&'a self, id: &'a str) -> &'a str {
        self.links.get(id).map(String::as_str).unwrap_or(id)
    }

    /// Merge `source` into `target`. Returns false when both already share a canonical id.
    pub fn record(&mut self, source: &str, target: &str) -> bool {
        let from = self.resolve(source).to_string();
        let to = self.resolve(target).to_string();
        if from == to {
            return false;
        }

        for value in self.links.values_mut() {
            if *value == from {
                *value = to.clone();
            }
        }
        self.links.insert(from, to);
        true
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.links.iter()
    }

    /// True when no mapped value has an outgoing mapping of its own.
    pub fn is_closed(&self) -> bool {
        self.links.values().all(|v| !self.links.contains_key(v))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolutionReport {
    pub entities: usize,
    pub candidate_pairs: usize,
    pub batches_submitted: usize,
    pub batches_discarded: usize,
    pub merges: usize,
}

pub struct EntityResolver {
    similarity_threshold: f32,
    batch_size: usize,
}

impl Default for EntityResolver {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD, DEFAULT_CONFIRMATION_BATCH)
    }
}

impl EntityResolver {
    pub fn new(similarity_threshold: f32, batch_size: usize) -> Self {
        Self {
            similarity_threshold,
            batch_size: batch_size.max(1),
        }
    }

    /// Collapse confirmed duplicates in `doc` and rewrite its relationships.
    ///
    /// Embedding or oracle failures never abort: the document keeps whatever merges were
    /// confirmed before the failure.
    pub async fn resolve_document(
        &self,
        doc: &mut DocumentGraph,
        embedder: &dyn Embedder,
        oracle: &dyn ConfirmationOracle,
    ) -> ResolutionReport {
        let mut report = ResolutionReport::default();
        let mut merges = MergeTable::new();

        if let Err(e) = self
            .find_merges(doc, embedder, oracle, &mut merges, &mut report)
            .await
        {
            warn!(doc_id = %doc.doc_id, error = %e, "Entity resolution stopped early");
        }

        report.merges = merges.len();
        if !merges.is_empty() {
            info!(doc_id = %doc.doc_id, merges = merges.len(), "Applying confirmed merges");
        }
        apply_merges(doc, &merges);
        report
    }

    async fn find_merges(
        &self,
        doc: &DocumentGraph,
        embedder: &dyn Embedder,
        oracle: &dyn ConfirmationOracle,
        merges: &mut MergeTable,
        report: &mut ResolutionReport,
    ) -> Result<()> {
        // Distinct ids in first-seen order, with chunk frequency and first-seen details
        let mut ids: Vec<&str> = Vec::new();
        let mut frequency: HashMap<&str, usize> = HashMap::new();
        let mut details: HashMap<&str, &Entity> = HashMap::new();

        for chunk in &doc.chunks {
            for (id, entity) in &chunk.nodes {
                let count = frequency.entry(id.as_str()).or_insert(0);
                if *count == 0 {
                    ids.push(id.as_str());
                    details.insert(id.as_str(), entity);
                }
                *count += 1;
            }
        }

        report.entities = ids.len();
        if ids.len() < 2 {
            debug!(doc_id = %doc.doc_id, "Too few entities to resolve");
            return Ok(());
        }

        let names: Vec<String> = ids
            .iter()
            .map(|id| display_name(id, &doc.doc_id).to_string())
            .collect();

        let embeddings = embedder.embed_texts(&names).await?;
        if embeddings.len() != names.len() {
            anyhow::bail!(
                "Embedding service returned {} vectors for {} names",
                embeddings.len(),
                names.len()
            );
        }

        let mut candidates: Vec<(usize, usize)> = Vec::new();
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                if self.is_candidate(&names[i], &names[j], &embeddings[i], &embeddings[j]) {
                    candidates.push((i, j));
                }
            }
        }

        report.candidate_pairs = candidates.len();
        if candidates.is_empty() {
            debug!(doc_id = %doc.doc_id, "No candidate pairs");
            return Ok(());
        }
        info!(doc_id = %doc.doc_id, candidates = candidates.len(), "Submitting candidate pairs for confirmation");

        let pair_entity = |idx: usize| {
            let entity = details[ids[idx]];
            PairEntity {
                id: ids[idx].to_string(),
                name: names[idx].clone(),
                entity_type: entity.entity_type.to_string(),
                description: entity.description.clone(),
            }
        };

        for (batch_no, batch) in candidates.chunks(self.batch_size).enumerate() {
            let pairs: Vec<CandidatePair> = batch
                .iter()
                .map(|&(i, j)| CandidatePair {
                    left: pair_entity(i),
                    right: pair_entity(j),
                })
                .collect();

            report.batches_submitted += 1;
            let answers = match oracle.confirm_pairs(&pairs).await {
                Ok(answers) if answers.len() == pairs.len() => answers,
                Ok(answers) => {
                    warn!(
                        doc_id = %doc.doc_id,
                        batch = batch_no + 1,
                        expected = pairs.len(),
                        got = answers.len(),
                        "Discarding confirmation batch with wrong answer count"
                    );
                    report.batches_discarded += 1;
                    continue;
                }
                Err(e) => {
                    warn!(doc_id = %doc.doc_id, batch = batch_no + 1, error = %e, "Discarding confirmation batch");
                    report.batches_discarded += 1;
                    continue;
                }
            };

            for (&(i, j), confirmed) in batch.iter().zip(answers) {
                if !confirmed {
                    continue;
                }
                // Compare the current canonical ids: the lower frequency loses, on a tie the
                // second entity's side loses
                let left = merges.resolve(ids[i]).to_string();
                let right = merges.resolve(ids[j]).to_string();
                if left == right {
                    continue;
                }
                let (source, target) = if frequency[left.as_str()] < frequency[right.as_str()] {
                    (left, right)
                } else {
                    (right, left)
                };
                merges.record(&source, &target);
            }
        }

        Ok(())
    }

    fn is_candidate(&self, a: &str, b: &str, emb_a: &[f32], emb_b: &[f32]) -> bool {
        let contained = !a.is_empty() && !b.is_empty() && (a.contains(b) || b.contains(a));
        contained || cosine_similarity(emb_a, emb_b) > self.similarity_threshold
    }
}

/// Rewrite every chunk of `doc` through `merges` and drop self-loops.
pub fn apply_merges(doc: &mut DocumentGraph, merges: &MergeTable) {
    for chunk in &mut doc.chunks {
        for (source, target) in merges.iter() {
            let Some(mut loser) = chunk.nodes.remove(source) else {
                continue;
            };

            match chunk.nodes.get_mut(target) {
                Some(winner) => {
                    if !loser.description.is_empty() {
                        if !winner.description.is_empty() {
                            winner.description.push(' ');
                        }
                        winner.description.push_str(&loser.description);
                    }
                }
                None => {
                    loser.id = target.clone();
                    chunk.nodes.insert(target.clone(), loser);
                }
            }
        }

        chunk.relationships.retain_mut(|rel| {
            rel.head = merges.resolve(&rel.head).to_string();
            rel.tail = merges.resolve(&rel.tail).to_string();
            !rel.is_self_loop()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{scoped_id, ChunkGraph, Relationship, TypeTag};
    use std::sync::Mutex;

    struct TableEmbedder(HashMap<&'static str, Vec<f32>>);

    #[async_trait]
    impl Embedder for TableEmbedder {
        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| self.0.get(t.as_str()).cloned().unwrap_or_else(|| vec![0.0, 0.0, 0.0]))
                .collect())
        }
    }

    type Answer = Box<dyn Fn(&[CandidatePair]) -> Result<Vec<bool>> + Send + Sync>;

    struct ScriptedOracle {
        answer: Answer,
        seen: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl ScriptedOracle {
        fn new(answer: impl Fn(&[CandidatePair]) -> Result<Vec<bool>> + Send + Sync + 'static) -> Self {
            Self {
                answer: Box::new(answer),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ConfirmationOracle for ScriptedOracle {
        async fn confirm_pairs(&self, batch: &[CandidatePair]) -> Result<Vec<bool>> {
            self.seen.lock().unwrap().push(
                batch
                    .iter()
                    .map(|p| (p.left.name.clone(), p.right.name.clone()))
                    .collect(),
            );
            (self.answer)(batch)
        }
    }

    fn entity(name: &str, description: &str) -> Entity {
        Entity {
            id: scoped_id(name, "q"),
            entity_type: TypeTag::Named("Company".into()),
            description: description.to_string(),
            title: "t".into(),
            doc_id: "q".into(),
        }
    }

    fn chunk(entities: Vec<Entity>, rels: Vec<(&str, &str)>) -> ChunkGraph {
        ChunkGraph {
            chunk_id: None,
            text: String::new(),
            nodes: entities.into_iter().map(|e| (e.id.clone(), e)).collect(),
            relationships: rels
                .into_iter()
                .map(|(h, t)| Relationship {
                    head: scoped_id(h, "q"),
                    relation: TypeTag::Named("related".into()),
                    tail: scoped_id(t, "q"),
                    description: String::new(),
                    weight: 1.0,
                })
                .collect(),
        }
    }

    fn document(chunks: Vec<ChunkGraph>) -> DocumentGraph {
        DocumentGraph {
            doc_id: "q".into(),
            filename: "f".into(),
            chunks,
        }
    }

    fn apple_embedder() -> TableEmbedder {
        TableEmbedder(HashMap::from([
            ("Apple Inc.", vec![1.0, 0.0, 0.0]),
            ("苹果公司", vec![0.97, 0.2431, 0.0]),
            ("Tim Cook", vec![0.0, 0.0, 1.0]),
        ]))
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[3.0, 4.0], &[4.0, 3.0]) - 0.96).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_merge_chain_is_fully_collapsed() {
        let mut table = MergeTable::new();
        assert!(table.record("A", "B"));
        assert!(table.record("B", "C"));

        assert_eq!(table.resolve("A"), "C");
        assert_eq!(table.resolve("B"), "C");
        assert!(table.is_closed());
    }

    #[test]
    fn test_merge_table_follows_existing_target_and_avoids_cycles() {
        let mut table = MergeTable::new();
        table.record("B", "C");
        table.record("A", "B");
        assert_eq!(table.resolve("A"), "C");

        // C -> A would close a loop through the existing A -> C link
        assert!(!table.record("C", "A"));
        assert!(table.is_closed());
        assert_eq!(table.resolve("C"), "C");
    }

    #[tokio::test]
    async fn test_three_chain_confirmation_maps_directly_to_final_target() {
        // Frequencies: A = 1, B = 2, C = 3
        let mut doc = document(vec![
            chunk(vec![entity("A", ""), entity("B", ""), entity("C", "")], vec![]),
            chunk(vec![entity("B", ""), entity("C", "")], vec![]),
            chunk(vec![entity("C", "")], vec![("C", "B")]),
        ]);
        let embedder = TableEmbedder(HashMap::from([
            ("A", vec![1.0, 0.0, 0.0]),
            ("B", vec![0.99, 0.1, 0.0]),
            ("C", vec![0.98, 0.2, 0.0]),
        ]));
        // Candidates in order: (A,B), (A,C), (B,C). Confirm A≡B and B≡C only.
        let oracle = ScriptedOracle::new(|batch| {
            Ok(batch
                .iter()
                .map(|p| !(p.left.name == "A" && p.right.name == "C"))
                .collect())
        });

        let resolver = EntityResolver::default();
        let report = resolver.resolve_document(&mut doc, &embedder, &oracle).await;

        assert_eq!(report.candidate_pairs, 3);
        assert_eq!(report.merges, 2);
        for c in &doc.chunks {
            assert!(!c.nodes.contains_key("A__q"));
            assert!(!c.nodes.contains_key("B__q"));
            assert!(c.nodes.contains_key("C__q"));
        }
        // C -> B became a self-loop and was dropped
        assert!(doc.chunks[2].relationships.is_empty());
    }

    #[tokio::test]
    async fn test_later_confirmation_never_moves_more_frequent_canonical() {
        // Frequencies: A = 1, B = 3, C = 2
        let mut doc = document(vec![
            chunk(vec![entity("A", ""), entity("B", ""), entity("C", "")], vec![]),
            chunk(vec![entity("B", ""), entity("C", "")], vec![]),
            chunk(vec![entity("B", "")], vec![]),
        ]);
        let embedder = TableEmbedder(HashMap::from([
            ("A", vec![1.0, 0.0, 0.0]),
            ("B", vec![0.99, 0.1, 0.0]),
            ("C", vec![0.98, 0.2, 0.0]),
        ]));
        // Confirm A≡B and A≡C only. After A -> B, the second pair compares B against C.
        let oracle = ScriptedOracle::new(|batch| {
            Ok(batch.iter().map(|p| p.left.name == "A").collect())
        });

        let report = EntityResolver::default()
            .resolve_document(&mut doc, &embedder, &oracle)
            .await;

        assert_eq!(report.merges, 2);
        for c in &doc.chunks {
            let ids: Vec<&String> = c.nodes.keys().collect();
            assert_eq!(ids, vec!["B__q"]);
        }
    }

    #[tokio::test]
    async fn test_apple_scenario_merges_into_more_frequent_entity() {
        let mut doc = document(vec![
            chunk(
                vec![
                    entity("Apple Inc.", "US technology company."),
                    entity("苹果公司", "Maker of the iPhone."),
                    entity("Tim Cook", "CEO."),
                ],
                vec![("Tim Cook", "苹果公司"), ("苹果公司", "Apple Inc.")],
            ),
            chunk(vec![entity("Apple Inc.", "Founded 1976.")], vec![]),
        ]);
        let oracle = ScriptedOracle::new(|batch| Ok(vec![true; batch.len()]));

        let report = EntityResolver::default()
            .resolve_document(&mut doc, &apple_embedder(), &oracle)
            .await;

        assert_eq!(report.candidate_pairs, 1);
        assert_eq!(report.merges, 1);
        let seen = oracle.seen.lock().unwrap();
        assert_eq!(seen[0], vec![("Apple Inc.".to_string(), "苹果公司".to_string())]);

        let first = &doc.chunks[0];
        assert_eq!(first.nodes.len(), 2);
        assert!(!first.nodes.contains_key("苹果公司__q"));
        assert_eq!(
            first.nodes["Apple Inc.__q"].description,
            "US technology company. Maker of the iPhone."
        );
        assert_eq!(first.relationships.len(), 1);
        assert_eq!(first.relationships[0].tail, "Apple Inc.__q");
        assert_eq!(first.dangling_relationships(), 0);
    }

    #[tokio::test]
    async fn test_loser_node_migrates_when_winner_absent_from_chunk() {
        let mut doc = document(vec![
            chunk(vec![entity("Apple Inc.", "a")], vec![]),
            chunk(vec![entity("Apple Inc.", "b")], vec![]),
            chunk(vec![entity("苹果公司", "c"), entity("Tim Cook", "d")], vec![("Tim Cook", "苹果公司")]),
        ]);
        let oracle = ScriptedOracle::new(|batch| Ok(vec![true; batch.len()]));

        EntityResolver::default()
            .resolve_document(&mut doc, &apple_embedder(), &oracle)
            .await;

        let third = &doc.chunks[2];
        let migrated = &third.nodes["Apple Inc.__q"];
        assert_eq!(migrated.id, "Apple Inc.__q");
        assert_eq!(migrated.description, "c");
        assert_eq!(third.relationships[0].tail, "Apple Inc.__q");
    }

    #[tokio::test]
    async fn test_substring_names_become_candidates() {
        let mut doc = document(vec![chunk(
            vec![entity("OpenAI", ""), entity("OpenAI Inc", ""), entity("Tim Cook", "")],
            vec![],
        )]);
        let oracle = ScriptedOracle::new(|batch| Ok(vec![false; batch.len()]));

        let report = EntityResolver::default()
            .resolve_document(&mut doc, &apple_embedder(), &oracle)
            .await;

        assert_eq!(report.candidate_pairs, 1);
        assert_eq!(report.merges, 0);
        assert_eq!(doc.chunks[0].nodes.len(), 3);
    }

    struct UniformEmbedder;

    #[async_trait]
    impl Embedder for UniformEmbedder {
        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[tokio::test]
    async fn test_bad_batch_is_discarded_and_next_batch_still_applies() {
        // 12 identical embeddings: 66 candidate pairs in 7 batches.
        // Batch 1 starts at (X00, X01), batch 2 at (X00, X11).
        let entities: Vec<Entity> = (0..12).map(|i| entity(&format!("X{i:02}"), "")).collect();
        let mut doc = document(vec![chunk(entities, vec![])]);
        let oracle = ScriptedOracle::new(|batch| {
            let first = &batch[0];
            if first.left.name == "X00" && first.right.name == "X01" {
                anyhow::bail!("model returned prose")
            } else if first.left.name == "X00" && first.right.name == "X11" {
                Ok(vec![true]) // wrong length
            } else {
                Ok(batch.iter().map(|p| p.left.name == "X10" && p.right.name == "X11").collect())
            }
        });

        let report = EntityResolver::default()
            .resolve_document(&mut doc, &UniformEmbedder, &oracle)
            .await;

        assert_eq!(report.candidate_pairs, 66);
        assert_eq!(report.batches_submitted, 7);
        assert_eq!(report.batches_discarded, 2);
        assert_eq!(report.merges, 1);
        // Equal frequency: the second entity of the pair loses
        assert!(!doc.chunks[0].nodes.contains_key("X11__q"));
        assert!(doc.chunks[0].nodes.contains_key("X10__q"));
    }

    #[tokio::test]
    async fn test_single_entity_is_noop() {
        let mut doc = document(vec![chunk(vec![entity("Solo", "")], vec![])]);
        let oracle = ScriptedOracle::new(|_| anyhow::bail!("should not be called"));

        let report = EntityResolver::default()
            .resolve_document(&mut doc, &apple_embedder(), &oracle)
            .await;

        assert_eq!(report.entities, 1);
        assert_eq!(report.batches_submitted, 0);
        assert!(oracle.seen.lock().unwrap().is_empty());
    }
}
