//! The build pipeline.
//!
//! Stages run strictly in order and each one sees the previous stage's complete output:
//! chunk structure, extraction, parsing, entity resolution, provenance indexing, pruning
//! and writing. Per-run state lives in a [`BuildContext`] owned by a single build.

use anyhow::{Context, Result, anyhow};
use extract::{
    ChunkExtractor, ConfirmationOracle, DocumentGraph, Embedder, EntityResolver, ExtractionParser,
    RawChunk,
};
use index::{GraphStore, GraphWriter, NodeCache};
use ingest::SourceDocument;
use sparsify::{ProvenanceMap, PruningPolicy};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::cache::{CachedEmbedder, ResponseCache};
use crate::config::AppConfig;
use crate::metrics::{BuildMetrics, BuildStats, TimedOperation};
use crate::retry::RetryPolicy;

/// Per-run state threaded through every stage.
struct BuildContext {
    sources: Vec<SourceDocument>,
    /// Aligned with `sources[i].chunks`; `None` when the chunk structure step failed.
    chunk_ids: Vec<Vec<Option<String>>>,
    /// Raw model output per chunk, aligned the same way.
    raw_outputs: Vec<Vec<String>>,
    graphs: Vec<DocumentGraph>,
    provenance: ProvenanceMap,
    node_cache: Arc<NodeCache>,
    stats: BuildStats,
}

impl BuildContext {
    fn new(sources: Vec<SourceDocument>) -> Self {
        let mut stats = BuildStats::new();
        stats.documents = sources.len();
        stats.chunks = sources.iter().map(|s| s.chunks.len()).sum();
        Self {
            sources,
            chunk_ids: Vec::new(),
            raw_outputs: Vec::new(),
            graphs: Vec::new(),
            provenance: ProvenanceMap::new(),
            node_cache: Arc::new(NodeCache::new()),
            stats,
        }
    }
}

pub struct GraphBuilder {
    extractor: Arc<dyn ChunkExtractor>,
    oracle: Arc<dyn ConfirmationOracle>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn GraphStore>,
    cache: Arc<ResponseCache>,
    retry: RetryPolicy,
    metrics: Arc<BuildMetrics>,
    parser: ExtractionParser,
    resolver: EntityResolver,
    policy: PruningPolicy,
    batch_size: usize,
    max_workers: usize,
    max_llm_calls: usize,
    request_timeout: Duration,
    dataset_limit: Option<usize>,
}

impl GraphBuilder {
    pub fn new(
        config: &AppConfig,
        extractor: Arc<dyn ChunkExtractor>,
        oracle: Arc<dyn ConfirmationOracle>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn GraphStore>,
    ) -> Self {
        let cache = Arc::new(ResponseCache::from_config(&config.cache));
        let pipeline = &config.pipeline;
        Self {
            extractor,
            oracle,
            embedder: Arc::new(CachedEmbedder::new(embedder, cache.clone())),
            store,
            cache,
            retry: RetryPolicy::from_config(&config.retry),
            metrics: Arc::new(BuildMetrics::new()),
            parser: ExtractionParser::new(),
            resolver: EntityResolver::new(pipeline.similarity_threshold, pipeline.confirmation_batch),
            policy: pipeline.pruning_policy,
            batch_size: pipeline.batch_size,
            max_workers: pipeline.max_workers,
            max_llm_calls: config.concurrency.max_concurrent_llm_calls.max(1),
            request_timeout: Duration::from_secs(config.concurrency.request_timeout_secs.max(1)),
            dataset_limit: pipeline.dataset_limit,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<BuildMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<BuildMetrics> {
        self.metrics.clone()
    }

    pub fn policy(&self) -> PruningPolicy {
        self.policy
    }

    /// Load a JSON Lines dataset and build its graph. Failing to read the dataset is the
    /// only error returned.
    pub async fn build_from_path(&self, path: &Path) -> Result<BuildStats> {
        let documents = match ingest::ingest_dataset(path, self.dataset_limit).await {
            Ok(documents) => documents,
            Err(e) => {
                self.metrics.record_start();
                self.metrics.record_failure();
                return Err(e).with_context(|| format!("Failed to load dataset {}", path.display()));
            }
        };
        Ok(self.build(documents).await)
    }

    pub async fn build(&self, documents: Vec<SourceDocument>) -> BuildStats {
        self.metrics.record_start();
        let total = TimedOperation::start();
        let mut ctx = BuildContext::new(documents);
        info!(
            run_id = %ctx.stats.run_id,
            documents = ctx.stats.documents,
            chunks = ctx.stats.chunks,
            policy = %self.policy,
            "Starting graph build"
        );

        let timer = TimedOperation::start();
        self.write_structure(&mut ctx).await;
        ctx.stats.record_stage("structure", timer);

        let timer = TimedOperation::start();
        self.extract_all(&mut ctx).await;
        ctx.stats.record_stage("extract", timer);

        let timer = TimedOperation::start();
        self.parse_all(&mut ctx);
        ctx.stats.record_stage("parse", timer);

        let timer = TimedOperation::start();
        self.resolve_all(&mut ctx).await;
        ctx.stats.record_stage("resolve", timer);

        let timer = TimedOperation::start();
        ctx.provenance = ProvenanceMap::build(&ctx.graphs);
        ctx.stats.record_stage("provenance", timer);

        let timer = TimedOperation::start();
        ctx.stats.sparsity = self.policy.prune(&mut ctx.graphs, &ctx.provenance);
        ctx.stats.record_stage("prune", timer);

        let timer = TimedOperation::start();
        let writer = GraphWriter::new(self.store.clone(), self.batch_size, self.max_workers)
            .with_cache(ctx.node_cache.clone());
        ctx.stats.write = writer.write(&ctx.graphs).await;
        ctx.stats.record_stage("write", timer);

        let elapsed = total.elapsed();
        ctx.stats.total_ms = elapsed.as_secs_f64() * 1000.0;
        ctx.stats.cache = self.cache.stats();
        self.metrics.record_build(&ctx.stats, elapsed);

        info!(
            run_id = %ctx.stats.run_id,
            merges = ctx.stats.resolution.merges,
            sparsity = format!("{:.2}%", ctx.stats.sparsity.ratio() * 100.0),
            written = ctx.stats.write.documents_written,
            total_ms = ctx.stats.total_ms,
            "Graph build complete"
        );
        ctx.stats
    }

    async fn write_structure(&self, ctx: &mut BuildContext) {
        for source in &ctx.sources {
            let expected = source.chunks.len();
            let ids = match self.store.write_chunk_structure(source).await {
                Ok(ids) if ids.len() == expected => ids.into_iter().map(Some).collect(),
                Ok(ids) => {
                    warn!(file_name = %source.filename, expected, got = ids.len(), "Chunk ids do not line up with chunks");
                    ctx.stats.structure_failures += 1;
                    vec![None; expected]
                }
                Err(e) => {
                    warn!(file_name = %source.filename, error = %e, "Failed to write chunk structure");
                    ctx.stats.structure_failures += 1;
                    vec![None; expected]
                }
            };
            ctx.chunk_ids.push(ids);
        }
    }

    async fn extract_all(&self, ctx: &mut BuildContext) {
        ctx.raw_outputs = ctx
            .sources
            .iter()
            .map(|s| vec![String::new(); s.chunks.len()])
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.max_llm_calls));
        let mut tasks = JoinSet::new();

        for (doc_idx, source) in ctx.sources.iter().enumerate() {
            for (chunk_idx, chunk) in source.chunks.iter().enumerate() {
                let semaphore = semaphore.clone();
                let extractor = self.extractor.clone();
                let cache = self.cache.clone();
                let retry = self.retry.clone();
                let timeout = self.request_timeout;
                let text = chunk.text.clone();

                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return (doc_idx, chunk_idx, Err(anyhow!("extraction pool closed")));
                    };
                    if let Some(cached) = cache.get_llm_response(&text) {
                        return (doc_idx, chunk_idx, Ok(cached));
                    }

                    let result = retry
                        .retry("extract_chunk", || {
                            let extractor = extractor.clone();
                            let text = text.clone();
                            async move {
                                match tokio::time::timeout(timeout, extractor.extract(&text)).await {
                                    Ok(result) => result,
                                    Err(_) => Err(anyhow!("extraction timed out after {:?}", timeout)),
                                }
                            }
                        })
                        .await;

                    if let Ok(raw) = &result {
                        cache.set_llm_response(&text, raw.clone());
                    }
                    (doc_idx, chunk_idx, result)
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((doc_idx, chunk_idx, Ok(raw))) => ctx.raw_outputs[doc_idx][chunk_idx] = raw,
                Ok((doc_idx, chunk_idx, Err(e))) => {
                    ctx.stats.extraction_errors += 1;
                    error!(
                        doc_id = %ctx.sources[doc_idx].doc_id,
                        chunk = chunk_idx,
                        error = %e,
                        "Extraction failed, chunk contributes nothing"
                    );
                }
                Err(e) => {
                    ctx.stats.extraction_errors += 1;
                    error!(error = %e, "Extraction worker aborted");
                }
            }
        }
    }

    fn parse_all(&self, ctx: &mut BuildContext) {
        let raw_outputs = std::mem::take(&mut ctx.raw_outputs);
        for ((source, ids), raws) in ctx.sources.iter().zip(&ctx.chunk_ids).zip(raw_outputs) {
            let chunks: Vec<RawChunk> = source
                .chunks
                .iter()
                .zip(ids)
                .zip(raws)
                .map(|((chunk, id), raw)| RawChunk {
                    chunk_id: id.clone(),
                    title: chunk.title.clone(),
                    text: chunk.text.clone(),
                    raw,
                })
                .collect();

            let (graph, failures) = self.parser.parse_document(&source.doc_id, &source.filename, chunks);
            ctx.stats.parse_failures += failures;
            ctx.graphs.push(graph);
        }
    }

    async fn resolve_all(&self, ctx: &mut BuildContext) {
        for graph in ctx.graphs.iter_mut() {
            let report = self
                .resolver
                .resolve_document(graph, self.embedder.as_ref(), self.oracle.as_ref())
                .await;
            ctx.stats.add_resolution(&report);
        }
    }
}
