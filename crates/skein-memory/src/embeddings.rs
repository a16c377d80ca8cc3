use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use skein_core::config::EmbeddingConfig;
use skein_core::error::{Result, SkeinError};
use skein_core::traits::EmbeddingProvider;

/// Build the embedder named by `config.provider`.
///
/// `"ollama"` selects the native Ollama API; anything else is treated as an
/// OpenAI-compatible `/embeddings` endpoint.
pub fn create_embedder(config: &EmbeddingConfig) -> Box<dyn EmbeddingProvider> {
    match config.provider.as_str() {
        "ollama" => Box::new(OllamaEmbeddingProvider::new(
            &config.base_url,
            &config.model,
            config.timeout_secs,
        )),
        _ => Box::new(HttpEmbeddingProvider::new(
            &config.base_url,
            config.api_key.as_deref(),
            &config.model,
            config.timeout_secs,
        )),
    }
}

fn http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

fn unavailable(context: &str, err: impl std::fmt::Display) -> SkeinError {
    SkeinError::EmbeddingUnavailable(format!("{}: {}", context, err))
}

fn non_empty(vector: Vec<f32>) -> Result<Vec<f32>> {
    if vector.is_empty() {
        return Err(SkeinError::EmbeddingUnavailable(
            "provider returned an empty vector".into(),
        ));
    }
    Ok(vector)
}

/// Embedder for Ollama's `/api/embeddings` endpoint.
pub struct OllamaEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaEmbeddingProvider {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Self {
        Self {
            client: http_client(timeout_secs),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

impl EmbeddingProvider for OllamaEmbeddingProvider {
    fn embed(&self, text: &str) -> BoxFuture<'_, Result<Vec<f32>>> {
        let text = text.to_string();
        Box::pin(async move {
            let url = format!("{}/api/embeddings", self.base_url);
            let resp = self
                .client
                .post(&url)
                .json(&OllamaRequest {
                    model: &self.model,
                    prompt: &text,
                })
                .send()
                .await
                .map_err(|e| unavailable("Embedding request failed", e))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(unavailable(
                    "Embedding API error",
                    format!("{}: {}", status, body),
                ));
            }

            let body: OllamaResponse = resp
                .json()
                .await
                .map_err(|e| unavailable("Failed to parse embedding response", e))?;
            debug!(model = %self.model, dims = body.embedding.len(), "Embedded text");
            non_empty(body.embedding)
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Embedder for OpenAI-compatible `/embeddings` endpoints.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpEmbeddingProvider {
    pub fn new(base_url: &str, api_key: Option<&str>, model: &str, timeout_secs: u64) -> Self {
        Self {
            client: http_client(timeout_secs),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(String::from),
            model: model.to_string(),
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn embed(&self, text: &str) -> BoxFuture<'_, Result<Vec<f32>>> {
        let text = text.to_string();
        Box::pin(async move {
            let url = format!("{}/embeddings", self.base_url);

            let mut req = self.client.post(&url).json(&EmbeddingRequest {
                model: &self.model,
                input: vec![&text],
            });
            if let Some(ref key) = self.api_key {
                req = req.bearer_auth(key);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| unavailable("Embedding request failed", e))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(unavailable(
                    "Embedding API error",
                    format!("{}: {}", status, body),
                ));
            }

            let body: EmbeddingResponse = resp
                .json()
                .await
                .map_err(|e| unavailable("Failed to parse embedding response", e))?;
            let vector = body
                .data
                .into_iter()
                .next()
                .map(|d| d.embedding)
                .unwrap_or_default();
            debug!(model = %self.model, dims = vector.len(), "Embedded text");
            non_empty(vector)
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Cosine distance, `1 - similarity`. Lower is closer.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    1.0 - cosine_similarity(a, b) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 0.0, 0.0];
        let sim = cosine_similarity(&a, &a);
        assert!((sim - 1.0).abs() < 1e-6);
        assert!(cosine_distance(&a, &a).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_opposite() {
        let d = cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((d - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_mismatched_or_empty() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_create_embedder_by_provider() {
        let mut config = EmbeddingConfig::default();
        assert_eq!(create_embedder(&config).model(), "nomic-embed-text");
        config.provider = "openai".into();
        config.model = "text-embedding-3-small".into();
        assert_eq!(create_embedder(&config).model(), "text-embedding-3-small");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unavailable() {
        let embedder = OllamaEmbeddingProvider::new("http://127.0.0.1:9", "nomic-embed-text", 2);
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, SkeinError::EmbeddingUnavailable(_)));
    }
}
