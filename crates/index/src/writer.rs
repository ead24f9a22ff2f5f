//! Graph Writer: converts pruned chunk graphs concurrently, writes them in batches and
//! consolidates chunk placeholders into permanent chunk nodes.

use anyhow::anyhow;
use extract::{ChunkGraph, DocumentGraph};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::graph_document::{GraphDocument, NodeCache, to_graph_document};
use crate::store::GraphStore;

const MIN_DOCUMENT_BATCH: usize = 10;
const MIN_MERGE_BATCH: usize = 20;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct WriteReport {
    pub chunks_skipped: usize,
    pub documents_converted: usize,
    pub conversion_errors: usize,
    pub documents_written: usize,
    pub documents_failed: usize,
    pub chunks_merged: usize,
    pub merge_failures: usize,
}

/// Batch size for graph documents: scaled down for small totals, never below the floor.
pub fn document_batch_size(total: usize, batch_size: usize) -> usize {
    batch_size.min(MIN_DOCUMENT_BATCH.max(total / 10)).max(1)
}

pub fn merge_batch_size(total: usize, batch_size: usize) -> usize {
    batch_size.min(MIN_MERGE_BATCH.max(total / 5)).max(1)
}

pub struct GraphWriter {
    store: Arc<dyn GraphStore>,
    cache: Arc<NodeCache>,
    batch_size: usize,
    max_workers: usize,
}

impl GraphWriter {
    pub fn new(store: Arc<dyn GraphStore>, batch_size: usize, max_workers: usize) -> Self {
        Self {
            store,
            cache: Arc::new(NodeCache::new()),
            batch_size: batch_size.max(1),
            max_workers: max_workers.max(1),
        }
    }

    pub fn with_cache(mut self, cache: Arc<NodeCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cached_nodes(&self) -> usize {
        self.cache.len()
    }

    /// Convert, write and consolidate every chunk. Individual failures are logged and
    /// counted, never returned.
    pub async fn write(&self, documents: &[DocumentGraph]) -> WriteReport {
        let mut report = WriteReport::default();

        let mut chunks = Vec::new();
        for chunk in documents.iter().flat_map(|doc| doc.chunks.iter()) {
            match &chunk.chunk_id {
                Some(id) if !id.is_empty() => chunks.push((id.clone(), chunk.clone())),
                _ => report.chunks_skipped += 1,
            }
        }
        if report.chunks_skipped > 0 {
            warn!(skipped = report.chunks_skipped, "Skipping chunks without a chunk id");
        }

        let converted = self.convert_all(chunks, &mut report).await;
        let graph_documents: Vec<GraphDocument> = converted.into_iter().flatten().collect();
        report.documents_converted = graph_documents.len();

        let written = self.write_documents(graph_documents, &mut report).await;
        self.merge_chunks(written, &mut report).await;

        info!(
            converted = report.documents_converted,
            conversion_errors = report.conversion_errors,
            written = report.documents_written,
            failed = report.documents_failed,
            merged = report.chunks_merged,
            merge_failures = report.merge_failures,
            "Graph write complete"
        );
        report
    }

    /// Results come back in submission order regardless of completion order.
    async fn convert_all(
        &self,
        chunks: Vec<(String, ChunkGraph)>,
        report: &mut WriteReport,
    ) -> Vec<Option<GraphDocument>> {
        let total = chunks.len();
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();

        for (idx, (chunk_id, chunk)) in chunks.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let cache = self.cache.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (idx, chunk_id, Err(anyhow!("worker pool closed")));
                };
                let id = chunk_id.clone();
                let result = tokio::task::spawn_blocking(move || to_graph_document(&id, &chunk, &cache))
                    .await
                    .unwrap_or_else(|e| Err(anyhow!("conversion task failed: {}", e)));
                (idx, chunk_id, result)
            });
        }

        let mut slots: Vec<Option<GraphDocument>> = (0..total).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, _, Ok(document))) => slots[idx] = document,
                Ok((idx, chunk_id, Err(e))) => {
                    report.conversion_errors += 1;
                    error!(
                        position = idx,
                        chunk_id = %chunk_id,
                        error = %e,
                        error_count = report.conversion_errors,
                        "Failed to convert chunk"
                    );
                }
                Err(e) => {
                    report.conversion_errors += 1;
                    error!(error = %e, error_count = report.conversion_errors, "Conversion worker aborted");
                }
            }
        }
        slots
    }

    /// Returns the chunk ids of the documents that were persisted, in write order.
    async fn write_documents(&self, documents: Vec<GraphDocument>, report: &mut WriteReport) -> Vec<String> {
        if documents.is_empty() {
            return Vec::new();
        }

        let total = documents.len();
        let size = document_batch_size(total, self.batch_size);
        info!(documents = documents.len(), batch_size = size, "Writing graph documents");

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();

        for (batch_idx, batch) in documents.chunks(size).map(<[GraphDocument]>::to_vec).enumerate() {
            let semaphore = semaphore.clone();
            let store = self.store.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (batch_idx, Vec::new());
                };
                (batch_idx, write_batch(store.as_ref(), batch_idx, batch).await)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "Write worker aborted"),
            }
        }
        outcomes.sort_by_key(|(idx, _)| *idx);

        let written: Vec<String> = outcomes.into_iter().flat_map(|(_, ids)| ids).collect();
        report.documents_written = written.len();
        report.documents_failed = total - written.len();
        written
    }

    async fn merge_chunks(&self, chunk_ids: Vec<String>, report: &mut WriteReport) {
        let mut seen = HashSet::new();
        let unique: Vec<String> = chunk_ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        if unique.is_empty() {
            return;
        }

        let size = merge_batch_size(unique.len(), self.batch_size);
        info!(chunks = unique.len(), batch_size = size, "Merging chunk placeholders");

        for (batch_idx, batch) in unique.chunks(size).enumerate() {
            match self.store.merge_chunk_containers(batch).await {
                Ok(()) => report.chunks_merged += batch.len(),
                Err(e) => {
                    warn!(batch = batch_idx, size = batch.len(), error = %e, "Merge batch failed, retrying one by one");
                    for chunk_id in batch {
                        match self.store.merge_chunk_containers(std::slice::from_ref(chunk_id)).await {
                            Ok(()) => report.chunks_merged += 1,
                            Err(e) => {
                                report.merge_failures += 1;
                                error!(chunk_id = %chunk_id, error = %e, "Failed to merge chunk");
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Write one batch, falling back to one document at a time. Returns the chunk ids written.
async fn write_batch(store: &dyn GraphStore, batch_idx: usize, batch: Vec<GraphDocument>) -> Vec<String> {
    match store.add_graph_documents(&batch).await {
        Ok(()) => {
            debug!(batch = batch_idx, size = batch.len(), "Batch written");
            batch.into_iter().map(|d| d.source.chunk_id).collect()
        }
        Err(e) => {
            warn!(batch = batch_idx, size = batch.len(), error = %e, "Batch write failed, retrying one by one");
            let mut written = Vec::new();
            for document in batch {
                match store.add_graph_documents(std::slice::from_ref(&document)).await {
                    Ok(()) => written.push(document.source.chunk_id),
                    Err(e) => {
                        error!(chunk_id = %document.source.chunk_id, error = %e, "Failed to write graph document");
                    }
                }
            }
            written
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use extract::{Entity, Relationship, TypeTag};
    use ingest::SourceDocument;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rejects any batch containing a poisoned chunk id.
    #[derive(Default)]
    struct MockStore {
        poisoned: HashSet<String>,
        written: Mutex<Vec<String>>,
        merged: Mutex<Vec<String>>,
        write_calls: AtomicUsize,
    }

    impl MockStore {
        fn poisoned(ids: &[&str]) -> Self {
            Self {
                poisoned: ids.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl GraphStore for MockStore {
        async fn write_chunk_structure(&self, document: &SourceDocument) -> Result<Vec<String>> {
            Ok(document.chunks.iter().map(|c| c.chunk_id.clone()).collect())
        }

        async fn add_graph_documents(&self, documents: &[GraphDocument]) -> Result<()> {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(bad) = documents.iter().find(|d| self.poisoned.contains(&d.source.chunk_id)) {
                bail!("malformed document {}", bad.source.chunk_id);
            }
            let mut written = self.written.lock().unwrap();
            written.extend(documents.iter().map(|d| d.source.chunk_id.clone()));
            Ok(())
        }

        async fn merge_chunk_containers(&self, chunk_ids: &[String]) -> Result<()> {
            if chunk_ids.iter().any(|id| id == "merge-fails") {
                bail!("merge rejected");
            }
            self.merged.lock().unwrap().extend(chunk_ids.iter().cloned());
            Ok(())
        }
    }

    fn entity(id: &str) -> Entity {
        Entity {
            id: id.to_string(),
            entity_type: TypeTag::from("person"),
            description: String::new(),
            title: String::new(),
            doc_id: "d1".into(),
        }
    }

    fn chunk(chunk_id: Option<&str>, names: &[&str]) -> ChunkGraph {
        let nodes = names.iter().map(|n| (n.to_string(), entity(n))).collect();
        let relationships = names
            .windows(2)
            .map(|pair| Relationship {
                head: pair[0].to_string(),
                relation: TypeTag::from("knows"),
                tail: pair[1].to_string(),
                description: String::new(),
                weight: 1.0,
            })
            .collect();
        ChunkGraph {
            chunk_id: chunk_id.map(str::to_string),
            text: String::new(),
            nodes,
            relationships,
        }
    }

    fn document(chunks: Vec<ChunkGraph>) -> Vec<DocumentGraph> {
        vec![DocumentGraph {
            doc_id: "d1".into(),
            filename: "hotpot_d1".into(),
            chunks,
        }]
    }

    #[test]
    fn test_batch_sizes_adapt_to_volume() {
        assert_eq!(document_batch_size(5, 50), 10);
        assert_eq!(document_batch_size(300, 50), 30);
        assert_eq!(document_batch_size(10_000, 50), 50);
        assert_eq!(merge_batch_size(30, 50), 20);
        assert_eq!(merge_batch_size(150, 50), 30);
        assert_eq!(merge_batch_size(1_000, 50), 50);
    }

    #[tokio::test]
    async fn test_malformed_document_does_not_abort_batch() {
        let store = Arc::new(MockStore::poisoned(&["c2"]));
        let writer = GraphWriter::new(store.clone(), 50, 4);
        let docs = document(vec![
            chunk(Some("c1"), &["A", "B"]),
            chunk(Some("c2"), &["C", "D"]),
            chunk(Some("c3"), &["E", "F"]),
        ]);

        let report = writer.write(&docs).await;

        assert_eq!(report.documents_converted, 3);
        assert_eq!(report.documents_written, 2);
        assert_eq!(report.documents_failed, 1);
        // One failed batch call, then three single-document retries
        assert_eq!(store.write_calls.load(Ordering::SeqCst), 4);
        assert_eq!(*store.written.lock().unwrap(), vec!["c1", "c3"]);
        assert_eq!(*store.merged.lock().unwrap(), vec!["c1", "c3"]);
        assert_eq!(report.chunks_merged, 2);
    }

    #[tokio::test]
    async fn test_skips_empty_and_unaligned_chunks_and_keeps_order() {
        let store = Arc::new(MockStore::default());
        let writer = GraphWriter::new(store.clone(), 50, 2);
        let docs = document(vec![
            chunk(Some("c1"), &[]),
            chunk(None, &["A", "B"]),
            chunk(Some("c2"), &["A", "B"]),
            chunk(Some("c3"), &["B", "C"]),
            chunk(Some("c4"), &["C", "D"]),
        ]);

        let report = writer.write(&docs).await;

        assert_eq!(report.chunks_skipped, 1);
        assert_eq!(report.documents_converted, 3);
        assert_eq!(report.conversion_errors, 0);
        assert_eq!(*store.written.lock().unwrap(), vec!["c2", "c3", "c4"]);
        // A, B, C and D are shared through the node cache
        assert_eq!(writer.cached_nodes(), 4);
    }

    #[tokio::test]
    async fn test_conversion_error_is_counted_not_fatal() {
        let store = Arc::new(MockStore::default());
        let writer = GraphWriter::new(store.clone(), 50, 4);
        let mut bad = chunk(Some("c2"), &["A", "B"]);
        bad.relationships[0].weight = f64::INFINITY;
        let docs = document(vec![chunk(Some("c1"), &["A", "B"]), bad, chunk(Some("c3"), &["C", "D"])]);

        let report = writer.write(&docs).await;

        assert_eq!(report.conversion_errors, 1);
        assert_eq!(report.documents_converted, 2);
        assert_eq!(report.documents_written, 2);
        assert_eq!(*store.written.lock().unwrap(), vec!["c1", "c3"]);
    }

    #[tokio::test]
    async fn test_merge_falls_back_to_single_chunks() {
        let store = Arc::new(MockStore::default());
        let writer = GraphWriter::new(store.clone(), 50, 4);
        let docs = document(vec![
            chunk(Some("c1"), &["A", "B"]),
            chunk(Some("merge-fails"), &["C", "D"]),
            chunk(Some("c3"), &["E", "F"]),
        ]);

        let report = writer.write(&docs).await;

        assert_eq!(report.documents_written, 3);
        assert_eq!(report.chunks_merged, 2);
        assert_eq!(report.merge_failures, 1);
        assert_eq!(*store.merged.lock().unwrap(), vec!["c1", "c3"]);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_ids_merge_once() {
        let store = Arc::new(MockStore::default());
        let writer = GraphWriter::new(store.clone(), 50, 4);
        let docs = document(vec![chunk(Some("c1"), &["A", "B"]), chunk(Some("c1"), &["C", "D"])]);

        let report = writer.write(&docs).await;

        assert_eq!(report.documents_written, 2);
        assert_eq!(report.chunks_merged, 1);
        assert_eq!(*store.merged.lock().unwrap(), vec!["c1"]);
    }
}
