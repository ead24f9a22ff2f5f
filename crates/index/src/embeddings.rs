use anyhow::{Context, Result};
use async_trait::async_trait;
use extract::Embedder;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Clone)]
pub struct EmbeddingClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            base_url,
            model,
            client: reqwest::Client::new(),
        }
    }

    /// Generate embedding for text
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);

        let request = EmbeddingRequest {
            model: &self.model,
            prompt: text,
        };

        let response = self.client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send embedding request")?;

        if !response.status().is_success() {
            anyhow::bail!("Embedding request failed: {}", response.status());
        }

        let embedding_response: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        Ok(embedding_response.embedding)
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    /// One request per text; the endpoint takes a single prompt.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        debug!(count = texts.len(), model = %self.model, "Embedding entity names");

        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let vector = self.embed(text)
                .await
                .with_context(|| format!("Failed to embed '{}'", text))?;
            vectors.push(vector);
        }

        if let Some(first) = vectors.first() {
            let dim = first.len();
            if vectors.iter().any(|v| v.len() != dim) {
                anyhow::bail!("Embedding service returned vectors of differing dimension");
            }
        }
        Ok(vectors)
    }
}
