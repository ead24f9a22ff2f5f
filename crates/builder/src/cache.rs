use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use extract::Embedder;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::CacheConfig;

/// LLM responses and embeddings keyed by the SHA-256 of their input.
pub struct ResponseCache {
    embeddings: DashMap<String, Vec<f32>>,
    llm_responses: DashMap<String, String>,
    max_entries: usize,
    enabled: bool,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            embeddings: DashMap::new(),
            llm_responses: DashMap::new(),
            max_entries,
            enabled: max_entries > 0,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        if config.enabled {
            Self::new(config.max_entries)
        } else {
            Self::new(0)
        }
    }

    pub fn set_embedding(&self, text: &str, embedding: Vec<f32>) {
        if !self.enabled {
            return;
        }
        evict_if_full(&self.embeddings, self.max_entries);
        self.embeddings.insert(hash_text(text), embedding);
    }

    pub fn get_embedding(&self, text: &str) -> Option<Vec<f32>> {
        let found = self.embeddings.get(&hash_text(text)).map(|r| r.value().clone());
        self.count(found.is_some());
        found
    }

    pub fn set_llm_response(&self, prompt: &str, response: String) {
        if !self.enabled {
            return;
        }
        evict_if_full(&self.llm_responses, self.max_entries);
        self.llm_responses.insert(hash_text(prompt), response);
    }

    pub fn get_llm_response(&self, prompt: &str) -> Option<String> {
        let found = self.llm_responses.get(&hash_text(prompt)).map(|r| r.value().clone());
        self.count(found.is_some());
        found
    }

    fn count(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            embeddings_cached: self.embeddings.len(),
            llm_responses_cached: self.llm_responses.len(),
            hits,
            misses,
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
        }
    }
}

/// Drop a quarter of the entries once the map is full.
fn evict_if_full<V>(map: &DashMap<String, V>, max_entries: usize) {
    if map.len() < max_entries {
        return;
    }
    let to_remove: Vec<_> = map
        .iter()
        .take((max_entries / 4).max(1))
        .map(|r| r.key().clone())
        .collect();
    for key in to_remove {
        map.remove(&key);
    }
}

fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub embeddings_cached: usize,
    pub llm_responses_cached: usize,
    pub hits: usize,
    pub misses: usize,
    pub hit_rate: f64,
}

/// Serves repeated entity names from the cache and embeds only the rest.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Arc<ResponseCache>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, cache: Arc<ResponseCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors: Vec<Option<Vec<f32>>> = texts.iter().map(|t| self.cache.get_embedding(t)).collect();

        let missing: Vec<usize> = (0..texts.len()).filter(|&i| vectors[i].is_none()).collect();
        if !missing.is_empty() {
            let queries: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let fresh = self.inner.embed_texts(&queries).await?;
            if fresh.len() != queries.len() {
                anyhow::bail!(
                    "Embedder returned {} vectors for {} texts",
                    fresh.len(),
                    queries.len()
                );
            }
            for (idx, vector) in missing.into_iter().zip(fresh) {
                self.cache.set_embedding(&texts[idx], vector.clone());
                vectors[idx] = Some(vector);
            }
        }

        Ok(vectors.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingEmbedder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Embedder for RecordingEmbedder {
        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.seen.lock().unwrap().extend(texts.iter().cloned());
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        }
    }

    #[test]
    fn test_llm_response_hit_and_miss() {
        let cache = ResponseCache::new(10);
        assert!(cache.get_llm_response("prompt").is_none());
        cache.set_llm_response("prompt", "answer".into());
        assert_eq!(cache.get_llm_response("prompt").as_deref(), Some("answer"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_eviction_keeps_size_bounded() {
        let cache = ResponseCache::new(4);
        for i in 0..10 {
            cache.set_llm_response(&format!("p{}", i), "r".into());
        }
        assert!(cache.stats().llm_responses_cached <= 4);
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache = ResponseCache::from_config(&CacheConfig { enabled: false, max_entries: 100 });
        cache.set_embedding("Apple", vec![1.0]);
        assert!(cache.get_embedding("Apple").is_none());
    }

    #[tokio::test]
    async fn test_cached_embedder_only_embeds_misses() {
        let inner = Arc::new(RecordingEmbedder { seen: Mutex::new(Vec::new()) });
        let cache = Arc::new(ResponseCache::new(100));
        cache.set_embedding("Apple", vec![42.0]);
        let embedder = CachedEmbedder::new(inner.clone(), cache.clone());

        let texts = vec!["Apple".to_string(), "Banana".to_string()];
        let vectors = embedder.embed_texts(&texts).await.unwrap();

        assert_eq!(vectors, vec![vec![42.0], vec![6.0]]);
        assert_eq!(*inner.seen.lock().unwrap(), vec!["Banana".to_string()]);

        // Second call is served entirely from the cache
        embedder.embed_texts(&texts).await.unwrap();
        assert_eq!(inner.seen.lock().unwrap().len(), 1);
    }
}
