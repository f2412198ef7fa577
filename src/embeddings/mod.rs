//! Embedding service abstraction
//!
//! Maps text to fixed-dimension vectors through an Ollama-compatible HTTP
//! endpoint, with an optional redis cache in front keyed by a fingerprint
//! of the text. Cache failures are logged and never fail the call.

use crate::cache::{self, Cache};
use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Trait for embedding generation
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate the embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts, sequentially; the first
    /// failure aborts the batch
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            let embedding = self
                .embed(text)
                .await
                .map_err(|e| AppError::EmbeddingFailed(format!("failed to embed text {i}: {e}")))?;
            embeddings.push(embedding);
        }
        Ok(embeddings)
    }

    /// The configured embedding dimension
    fn dimension(&self) -> usize;
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

/// Embedding client for an Ollama-compatible back end
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
    cache: Option<Arc<Cache>>,
}

impl OllamaEmbedder {
    /// Build the embedder; `cache` enables the fingerprint-keyed cache
    pub fn new(config: &AppConfig, cache: Option<Arc<Cache>>) -> Self {
        let timeout = if config.embedding_timeout == 0 {
            Duration::from_secs(120)
        } else {
            config.embedding_timeout()
        };

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build embedding http client");

        debug!(
            model = %config.embedding_model,
            dimension = config.vector_dim,
            timeout_secs = timeout.as_secs(),
            cache = cache.is_some(),
            "Initialized embedding client"
        );

        Self {
            client,
            base_url: config.ollama_url.trim_end_matches('/').to_string(),
            model: config.embedding_model.clone(),
            dimension: config.vector_dim,
            cache,
        }
    }

    async fn request_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let request = EmbeddingRequest {
            model: &self.model,
            prompt: text,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::EmbeddingFailed(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::EmbeddingFailed(format!(
                "embedding API error {status}: {body}"
            )));
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| AppError::EmbeddingFailed(format!("failed to decode response: {e}")))?;

        if result.embedding.len() != self.dimension {
            return Err(AppError::DimensionMismatch {
                expected: self.dimension,
                actual: result.embedding.len(),
            });
        }

        Ok(result.embedding)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = cache::keys::embedding(&cache::fingerprint(text));

        if let Some(cache) = &self.cache {
            match cache.get::<Vec<f32>>(&key).await {
                Ok(Some(cached)) => {
                    debug!(text_length = text.len(), "Using cached embedding");
                    return Ok(cached);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Embedding cache read failed"),
            }
        }

        let embedding = self.request_embedding(text).await?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache
                .set_with_ttl(&key, &embedding, cache::EMBEDDING_TTL_SECS)
                .await
            {
                warn!(error = %e, "Failed to cache embedding");
            }
        }

        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic embedder for tests: the vector is derived from the text
/// fingerprint, so equal texts always embed identically
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let digest = cache::fingerprint(text);
        let bytes = digest.as_bytes();
        Ok((0..self.dimension)
            .map(|i| f32::from(bytes[i % bytes.len()]) / 255.0)
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(url: &str, dim: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.ollama_url = url.to_string();
        config.embedding_model = "test-model".to_string();
        config.vector_dim = dim;
        config
    }

    #[tokio::test]
    async fn embeds_through_the_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .and(body_partial_json(serde_json::json!({
                "model": "test-model",
                "prompt": "hello"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embedding": [0.1, 0.2, 0.3, 0.4]
            })))
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(&test_config(&server.uri(), 4), None);
        let embedding = embedder.embed("hello").await.unwrap();
        assert_eq!(embedding, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embedding": [0.1, 0.2]
            })))
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(&test_config(&server.uri(), 4), None);
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(
            err,
            AppError::DimensionMismatch { expected: 4, actual: 2 }
        ));
    }

    #[tokio::test]
    async fn api_errors_surface_as_embedding_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(&test_config(&server.uri(), 4), None);
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, AppError::EmbeddingFailed(_)));
    }

    #[tokio::test]
    async fn batch_reports_the_offending_index() {
        let server = MockServer::start().await;
        // First call succeeds, every later call fails
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embedding": [0.1, 0.2, 0.3, 0.4]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(&test_config(&server.uri(), 4), None);
        let err = embedder
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("text 1"));
    }

    #[tokio::test]
    async fn mock_embedder_is_deterministic() {
        let embedder = MockEmbedder::new(8);
        let a = embedder.embed("same text").await.unwrap();
        let b = embedder.embed("same text").await.unwrap();
        let c = embedder.embed("other text").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 8);
    }
}
