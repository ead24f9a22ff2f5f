use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub doc_id: String,
    pub chunk_id: String,
    pub title: String,
    pub text: String,
    pub source: String,
    pub position: usize, // order of the chunk inside its document
}

impl Chunk {
    pub fn new(
        doc_id: String,
        title: String,
        text: String,
        source: String,
        position: usize,
    ) -> Self {
        // Generate stable chunk_id from content
        let chunk_id = Self::generate_chunk_id(&doc_id, &text, position);

        Self {
            doc_id,
            chunk_id,
            title,
            text,
            source,
            position,
        }
    }

    fn generate_chunk_id(doc_id: &str, text: &str, position: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(doc_id.as_bytes());
        hasher.update(text.as_bytes());
        hasher.update(position.to_string().as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16]) // Use first 16 bytes (32 hex chars)
    }
}

/// One source document and its chunks, in chunking order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub doc_id: String,
    pub filename: String,
    pub content: String,
    pub chunks: Vec<Chunk>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_is_stable() {
        let a = Chunk::new("d1".into(), "T".into(), "text".into(), "src".into(), 0);
        let b = Chunk::new("d1".into(), "T".into(), "text".into(), "src".into(), 0);
        let c = Chunk::new("d1".into(), "T".into(), "text".into(), "src".into(), 1);

        assert_eq!(a.chunk_id, b.chunk_id);
        assert_ne!(a.chunk_id, c.chunk_id);
        assert_eq!(a.chunk_id.len(), 32);
    }
}
