use anyhow::Result;
use async_trait::async_trait;
use ingest::SourceDocument;

use crate::graph_document::GraphDocument;

/// Persistence seam for the build pipeline.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create the permanent document and chunk nodes for one source document and return
    /// the chunk ids, aligned with `document.chunks`.
    async fn write_chunk_structure(&self, document: &SourceDocument) -> Result<Vec<String>>;

    /// Persist a batch of graph documents. The whole batch succeeds or fails together.
    async fn add_graph_documents(&self, documents: &[GraphDocument]) -> Result<()>;

    /// Move the `MENTIONS` edges of each chunk's placeholder onto its permanent chunk node,
    /// then delete the placeholder.
    async fn merge_chunk_containers(&self, chunk_ids: &[String]) -> Result<()>;
}
