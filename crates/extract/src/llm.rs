use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::confirm::{parse_confirmation, CandidatePair, ConfirmationOracle};
use crate::prompt;

/// Turns chunk text into raw extraction records.
#[async_trait]
pub trait ChunkExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<String>;
}

#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaClient {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            base_url,
            model,
            client: reqwest::Client::new(),
        }
    }

    pub async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);

        let request = OllamaRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
        };

        let response = self.client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Ollama")?;

        if !response.status().is_success() {
            anyhow::bail!("Ollama request failed: {}", response.status());
        }

        let ollama_response: OllamaResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        Ok(ollama_response.response)
    }
}

#[async_trait]
impl ChunkExtractor for OllamaClient {
    async fn extract(&self, text: &str) -> Result<String> {
        let prompt = prompt::build_extraction_prompt(text);
        self.generate(&prompt).await
    }
}

#[async_trait]
impl ConfirmationOracle for OllamaClient {
    async fn confirm_pairs(&self, batch: &[CandidatePair]) -> Result<Vec<bool>> {
        let prompt = prompt::build_confirmation_prompt(batch);
        let response = self.generate(&prompt).await?;

        parse_confirmation(&response, batch.len())
            .with_context(|| format!("Unusable oracle response: {}", response.trim()))
    }
}
