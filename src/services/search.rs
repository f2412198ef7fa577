//! Retrieval service
//!
//! Embeds the query and runs a filtered top-K search against the vector
//! index. Results keep the adapter's ranking and carry the raw L2 distance.

use crate::config::SharedConfig;
use crate::embeddings::Embedder;
use crate::errors::{AppError, Result};
use crate::vector::{ScoredChunk, VectorIndex};
use std::sync::Arc;
use tracing::debug;

pub struct SearchService {
    embedder: Arc<dyn Embedder>,
    vector: Arc<VectorIndex>,
    config: SharedConfig,
}

impl SearchService {
    pub fn new(embedder: Arc<dyn Embedder>, vector: Arc<VectorIndex>, config: SharedConfig) -> Self {
        Self {
            embedder,
            vector,
            config,
        }
    }

    /// Search a knowledge base (or all of them when `kb_id <= 0`). A
    /// non-positive `top_k` falls back to the configured default.
    pub async fn search(&self, query: &str, kb_id: i64, top_k: i64) -> Result<Vec<ScoredChunk>> {
        let top_k = if top_k <= 0 {
            self.config.snapshot().await.top_k
        } else {
            top_k as usize
        };

        let query_vector = self.embedder.embed(query).await.map_err(|e| match e {
            AppError::VectorUnavailable => e,
            other => AppError::RetrievalFailed(format!("query embedding failed: {other}")),
        })?;

        let mut hits = self
            .vector
            .search(&query_vector, kb_id, top_k)
            .await
            .map_err(|e| match e {
                AppError::VectorUnavailable => e,
                other => AppError::RetrievalFailed(other.to_string()),
            })?;

        // The adapter may return more than requested; keep its ranking
        hits.truncate(top_k);

        debug!(query_len = query.len(), kb_id, results = hits.len(), "Retrieval complete");
        Ok(hits)
    }
}
