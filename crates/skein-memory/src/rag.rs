use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use skein_core::config::StoreConfig;
use skein_core::error::{Result, SkeinError};
use skein_core::traits::{EmbeddingProvider, VectorIndex};
use skein_core::types::SearchHit;

use crate::codec::encode_vector;

/// Nanosecond-resolution key source that never repeats a value.
///
/// Reads the wall clock, but when the clock has not moved past the last
/// issued value it hands out `last + 1` instead.
#[derive(Debug, Default)]
pub struct KeyGenerator {
    last: AtomicU64,
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Ingest and query text by embedding similarity.
pub struct VectorStore {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    index_name: String,
    key_prefix: String,
    keys: KeyGenerator,
}

impl VectorStore {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, index: Arc<dyn VectorIndex>) -> Self {
        let defaults = StoreConfig::default();
        Self {
            embedder,
            index,
            index_name: defaults.index_name,
            key_prefix: defaults.key_prefix,
            keys: KeyGenerator::new(),
        }
    }

    /// Take index name and key prefix from config.
    pub fn with_config(mut self, config: &StoreConfig) -> Self {
        self.index_name = config.index_name.clone();
        self.key_prefix = config.key_prefix.clone();
        self
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Embed `content`, rejecting blank input.
    pub async fn embed(&self, content: &str) -> Result<Vec<f32>> {
        if content.trim().is_empty() {
            return Err(SkeinError::EmptyContent);
        }
        let vector = self.embedder.embed(content).await.map_err(|e| match e {
            SkeinError::EmbeddingUnavailable(_) => e,
            other => SkeinError::EmbeddingUnavailable(other.to_string()),
        })?;
        if vector.is_empty() {
            return Err(SkeinError::EmbeddingUnavailable(format!(
                "{} returned an empty vector",
                self.embedder.model()
            )));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(SkeinError::EmbeddingUnavailable(format!(
                "{} returned non-finite values",
                self.embedder.model()
            )));
        }
        Ok(vector)
    }

    /// Embed and persist `content`, returning the new record's key.
    pub async fn ingest(&self, content: &str) -> Result<String> {
        let vector = self.embed(content).await?;
        let key = format!("{}{}", self.key_prefix, self.keys.next());
        self.index
            .put(&self.index_name, &key, content, &encode_vector(&vector))
            .await?;
        debug!(key = %key, dims = vector.len(), "Ingested record");
        Ok(key)
    }

    /// The `k` stored records closest to `content`, nearest first.
    pub async fn query(&self, content: &str, k: usize) -> Result<Vec<SearchHit>> {
        let vector = self.embed(content).await?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let raw = self.index.search(&self.index_name, &vector, k).await?;
        let total = raw.len();
        let hits: Vec<SearchHit> = raw
            .into_iter()
            .filter_map(|hit| match (hit.content, hit.score) {
                (Some(content), Some(score)) => Some(SearchHit { content, score }),
                _ => {
                    warn!(key = %hit.key, "Skipping malformed search result");
                    None
                }
            })
            .take(k)
            .collect();
        info!(k, returned = hits.len(), skipped = total.saturating_sub(hits.len()), "Vector query");
        Ok(hits)
    }

    pub async fn count(&self) -> Result<usize> {
        self.index.count(&self.index_name).await
    }
}
