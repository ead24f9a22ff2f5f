use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

use crate::chunk::{Chunk, SourceDocument};

/// One dataset record: a question id plus titled paragraphs of sentences.
#[derive(Debug, Deserialize)]
pub struct DatasetRecord {
    pub id: String,
    pub context: RecordContext,
}

#[derive(Debug, Deserialize)]
pub struct RecordContext {
    pub title: Vec<String>,
    pub sentences: Vec<Vec<String>>,
}

pub struct DatasetReader;

impl DatasetReader {
    /// Read a JSON Lines dataset, one document per record.
    pub async fn read_jsonl(path: &Path, limit: Option<usize>) -> Result<Vec<SourceDocument>> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        if extension != "jsonl" && extension != "json" {
            anyhow::bail!("Unsupported dataset format: {}", extension);
        }

        let raw = fs::read_to_string(path)
            .await
            .context(format!("Failed to read dataset: {:?}", path))?;

        let source = path.to_string_lossy().to_string();
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| source.clone());

        let mut documents = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if limit.is_some_and(|max| documents.len() >= max) {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }

            let record: DatasetRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) => {
                    warn!(line = line_no + 1, error = %e, "Skipping unreadable dataset record");
                    continue;
                }
            };

            documents.push(Self::record_to_document(record, &basename, &source));
        }

        info!(documents = documents.len(), source = %source, "Dataset loaded");
        Ok(documents)
    }

    /// One chunk per titled paragraph: the title line followed by its sentences.
    pub fn record_to_document(record: DatasetRecord, basename: &str, source: &str) -> SourceDocument {
        let mut content = String::new();
        let mut chunks = Vec::new();

        for (position, (title, sentences)) in record
            .context
            .title
            .iter()
            .zip(record.context.sentences.iter())
            .enumerate()
        {
            for sentence in sentences {
                content.push_str(sentence);
                content.push('\n');
            }

            let text = format!("{}\n{}", title, sentences.join("\n"));
            chunks.push(Chunk::new(
                record.id.clone(),
                title.clone(),
                text,
                source.to_string(),
                position,
            ));
        }

        SourceDocument {
            doc_id: record.id.clone(),
            filename: format!("{}_{}", basename, record.id),
            content,
            chunks,
        }
    }
}
