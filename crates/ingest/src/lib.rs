pub mod chunk;
pub mod reader;

pub use chunk::{Chunk, SourceDocument};
pub use reader::{DatasetReader, DatasetRecord};

use anyhow::Result;
use std::path::Path;

/// Main ingestion entry point: load a dataset file into chunked documents
pub async fn ingest_dataset(path: &Path, limit: Option<usize>) -> Result<Vec<SourceDocument>> {
    DatasetReader::read_jsonl(path, limit).await
}
