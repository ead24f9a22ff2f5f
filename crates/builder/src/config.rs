use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sparsify::PruningPolicy;
use std::path::Path;
use std::str::FromStr;

/// Names the JSON file loaded before environment overrides are applied.
pub const CONFIG_PATH_VAR: &str = "GRAPH_BUILDER_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub neo4j: Neo4jConfig,
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub max_workers: usize,
    pub similarity_threshold: f32,
    pub confirmation_batch: usize,
    pub pruning_policy: PruningPolicy,
    pub dataset_limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_concurrent_llm_calls: usize,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: "password".to_string(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_workers: 4,
            similarity_threshold: extract::resolver::DEFAULT_SIMILARITY_THRESHOLD,
            confirmation_batch: extract::resolver::DEFAULT_CONFIRMATION_BATCH,
            pruning_policy: PruningPolicy::default(),
            dataset_limit: None,
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_llm_calls: 3,
            request_timeout_secs: 120,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

impl AppConfig {
    /// Defaults, then the file named by `GRAPH_BUILDER_CONFIG` (if set), then environment
    /// overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("NEO4J_URI") {
            self.neo4j.uri = v;
        }
        if let Some(v) = lookup("NEO4J_USER") {
            self.neo4j.user = v;
        }
        if let Some(v) = lookup("NEO4J_PASSWORD") {
            self.neo4j.password = v;
        }
        if let Some(v) = lookup("OLLAMA_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = lookup("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = lookup("EMBEDDING_MODEL") {
            self.llm.embedding_model = v;
        }
        if let Some(v) = lookup("BATCH_SIZE") {
            self.pipeline.batch_size = parse_var("BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("MAX_WORKERS") {
            self.pipeline.max_workers = parse_var("MAX_WORKERS", &v)?;
        }
        if let Some(v) = lookup("PRUNING_POLICY") {
            self.pipeline.pruning_policy = parse_var("PRUNING_POLICY", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.batch_size == 0 {
            anyhow::bail!("pipeline.batch_size must be at least 1");
        }
        if self.pipeline.max_workers == 0 {
            anyhow::bail!("pipeline.max_workers must be at least 1");
        }
        if self.pipeline.confirmation_batch == 0 {
            anyhow::bail!("pipeline.confirmation_batch must be at least 1");
        }
        let threshold = self.pipeline.similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            anyhow::bail!("pipeline.similarity_threshold must be in (0, 1], got {}", threshold);
        }
        if self.concurrency.max_concurrent_llm_calls == 0 {
            anyhow::bail!("concurrency.max_concurrent_llm_calls must be at least 1");
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: '{}'", name, raw))
}
