//! Vector index adapter
//!
//! Maintains the long-lived connection to the Milvus vector store over its
//! HTTP API:
//! - collection/index bootstrap on connect
//! - a background reconnect loop with exponential backoff and a periodic
//!   health probe
//! - bounded-timeout insert, search, and delete-by-filter operations
//!
//! All operations fail fast while the adapter is disconnected; recovery
//! happens around requests, never inside one.

use crate::chunker::DocumentChunk;
use crate::config::AppConfig;
use crate::embeddings::Embedder;
use crate::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const COLLECTION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// A search hit from the vector index. `distance` is the raw L2 distance,
/// ascending means more similar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub id: String,
    pub content: String,
    pub distance: f32,
}

/// Connection settings captured at construction
#[derive(Debug, Clone)]
struct VectorConfig {
    address: String,
    collection: String,
    dimension: usize,
    connect_timeout: Duration,
    insert_timeout: Duration,
    keepalive_time: Duration,
    keepalive_timeout: Duration,
}

impl VectorConfig {
    fn from_app(config: &AppConfig) -> Self {
        Self {
            address: config.milvus_address.trim_end_matches('/').to_string(),
            collection: config.collection_name.clone(),
            dimension: config.vector_dim,
            connect_timeout: config.connect_timeout(),
            insert_timeout: config.insert_timeout(),
            keepalive_time: Duration::from_secs(config.grpc_keepalive_time),
            keepalive_timeout: Duration::from_secs(config.grpc_keepalive_timeout),
        }
    }
}

/// Thin client over the vector store's HTTP API, bound to one address
struct MilvusClient {
    http: reqwest::Client,
    base_url: String,
    collection: String,
}

impl MilvusClient {
    fn new(config: &VectorConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .http2_keep_alive_interval(config.keepalive_time)
            .http2_keep_alive_timeout(config.keepalive_timeout)
            .http2_keep_alive_while_idle(true)
            .build()
            .map_err(|e| AppError::VectorStore(format!("failed to build client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.address.clone(),
            collection: config.collection.clone(),
        })
    }

    /// POST one API call with a deadline; returns the `data` payload
    async fn call(&self, path: &str, body: Value, timeout: Duration) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        let response = tokio::time::timeout(timeout, self.http.post(&url).json(&body).send())
            .await
            .map_err(|_| {
                AppError::VectorStore(format!("{path} timed out after {}s", timeout.as_secs()))
            })?
            .map_err(|e| AppError::VectorStore(format!("{path} request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(AppError::VectorStore(format!("{path} returned {status}")));
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| AppError::VectorStore(format!("{path} bad response: {e}")))?;

        let code = envelope.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            let message = envelope
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(AppError::VectorStore(format!("{path} failed: {message}")));
        }

        Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
    }

    async fn has_collection(&self, timeout: Duration) -> Result<bool> {
        let data = self
            .call(
                "/v2/vectordb/collections/has",
                json!({ "collectionName": self.collection }),
                timeout,
            )
            .await?;
        Ok(data.get("has").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn create_collection(&self, dimension: usize, timeout: Duration) -> Result<()> {
        let schema = json!({
            "fields": [
                {
                    "fieldName": "id",
                    "dataType": "VarChar",
                    "isPrimary": true,
                    "elementTypeParams": { "max_length": "512" }
                },
                {
                    "fieldName": "content",
                    "dataType": "VarChar",
                    "elementTypeParams": { "max_length": "65535" }
                },
                {
                    "fieldName": "embedding",
                    "dataType": "FloatVector",
                    "elementTypeParams": { "dim": dimension }
                },
                { "fieldName": "kb_id", "dataType": "Int64" },
                { "fieldName": "doc_id", "dataType": "Int64" }
            ]
        });

        self.call(
            "/v2/vectordb/collections/create",
            json!({
                "collectionName": self.collection,
                "schema": schema,
            }),
            timeout,
        )
        .await?;
        Ok(())
    }

    async fn create_index(&self, timeout: Duration) -> Result<()> {
        self.call(
            "/v2/vectordb/indexes/create",
            json!({
                "collectionName": self.collection,
                "indexParams": [{
                    "fieldName": "embedding",
                    "indexName": "embedding_idx",
                    "metricType": "L2",
                    "params": { "index_type": "IVF_FLAT", "nlist": 1024 }
                }]
            }),
            timeout,
        )
        .await?;
        Ok(())
    }

    async fn load_collection(&self, timeout: Duration) -> Result<()> {
        self.call(
            "/v2/vectordb/collections/load",
            json!({ "collectionName": self.collection }),
            timeout,
        )
        .await?;
        Ok(())
    }

    async fn insert(&self, rows: Vec<Value>, timeout: Duration) -> Result<()> {
        self.call(
            "/v2/vectordb/entities/insert",
            json!({
                "collectionName": self.collection,
                "data": rows,
            }),
            timeout,
        )
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        filter: &str,
        limit: usize,
        timeout: Duration,
    ) -> Result<Vec<ScoredChunk>> {
        let data = self
            .call(
                "/v2/vectordb/entities/search",
                json!({
                    "collectionName": self.collection,
                    "data": [vector],
                    "annsField": "embedding",
                    "filter": filter,
                    "limit": limit,
                    "outputFields": ["id", "content"],
                }),
                timeout,
            )
            .await?;

        let hits: Vec<ScoredChunk> = serde_json::from_value(data)
            .map_err(|e| AppError::VectorStore(format!("bad search payload: {e}")))?;
        Ok(hits)
    }

    async fn delete(&self, filter: &str, timeout: Duration) -> Result<()> {
        self.call(
            "/v2/vectordb/entities/delete",
            json!({
                "collectionName": self.collection,
                "filter": filter,
            }),
            timeout,
        )
        .await?;
        Ok(())
    }
}

/// The guarded connection handle. Reconnect swaps and close take the write
/// lock; operations take a read-lock snapshot of the current client so a
/// swap never races an in-flight call.
struct Handle {
    client: Option<Arc<MilvusClient>>,
    connected: bool,
}

struct Inner {
    config: VectorConfig,
    state: RwLock<Handle>,
}

impl Inner {
    async fn snapshot(&self) -> Result<Arc<MilvusClient>> {
        let state = self.state.read().await;
        if !state.connected {
            return Err(AppError::VectorUnavailable);
        }
        state
            .client
            .clone()
            .ok_or(AppError::VectorUnavailable)
    }

    /// Dial, ensure the collection exists and is loaded, then swap the
    /// handle in under the write lock
    async fn connect(&self) -> Result<()> {
        info!(
            address = %self.config.address,
            collection = %self.config.collection,
            "Connecting to vector store"
        );

        let client = MilvusClient::new(&self.config)?;
        self.ensure_collection(&client).await?;

        let mut state = self.state.write().await;
        state.client = Some(Arc::new(client));
        state.connected = true;

        info!(address = %self.config.address, "Connected to vector store");
        Ok(())
    }

    /// Create the collection, its index, and load it when absent
    async fn ensure_collection(&self, client: &MilvusClient) -> Result<()> {
        debug!(collection = %self.config.collection, "Checking collection");
        let exists = client.has_collection(COLLECTION_CHECK_TIMEOUT).await?;

        if !exists {
            client
                .create_collection(self.config.dimension, self.config.connect_timeout)
                .await?;
            info!(collection = %self.config.collection, "Created vector collection");

            client.create_index(self.config.connect_timeout).await?;
            client.load_collection(self.config.connect_timeout).await?;
        }

        Ok(())
    }

    async fn mark_disconnected(&self) {
        let mut state = self.state.write().await;
        state.connected = false;
    }
}

/// Vector index adapter with a self-healing connection
pub struct VectorIndex {
    inner: Arc<Inner>,
    embedder: Arc<dyn Embedder>,
    shutdown: watch::Sender<bool>,
}

impl VectorIndex {
    /// Build the adapter and attempt an initial connection. A failed first
    /// connect is logged, not fatal: the background loop keeps retrying.
    pub async fn connect(config: &AppConfig, embedder: Arc<dyn Embedder>) -> Self {
        let inner = Arc::new(Inner {
            config: VectorConfig::from_app(config),
            state: RwLock::new(Handle {
                client: None,
                connected: false,
            }),
        });

        if let Err(e) = inner.connect().await {
            warn!(
                error = %e,
                address = %inner.config.address,
                "Initial vector store connection failed, will retry in background"
            );
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(reconnect_loop(inner.clone(), shutdown_rx));

        Self {
            inner,
            embedder,
            shutdown,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.read().await.connected
    }

    /// Embed and insert a batch of chunks as one multi-row insert. Partial
    /// success is not allowed: any error rejects the whole batch.
    pub async fn insert(&self, chunks: &[DocumentChunk], kb_id: i64, doc_id: i64) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        // Fail fast before paying for embeddings
        let client = self.inner.snapshot().await?;

        info!(chunk_count = chunks.len(), kb_id, doc_id, "Generating embeddings");

        let mut rows = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 && i % 10 == 0 {
                info!(processed = i, total = chunks.len(), "Embedding generation progress");
            }

            let embedding = self.embedder.embed(&chunk.content).await.map_err(|e| {
                error!(chunk_id = %chunk.id, error = %e, "Failed to generate embedding");
                e
            })?;

            rows.push(json!({
                "id": chunk.id,
                "content": chunk.content,
                "embedding": embedding,
                "kb_id": kb_id,
                "doc_id": doc_id,
            }));
        }

        info!(chunk_count = rows.len(), "Inserting into vector store");
        client.insert(rows, self.inner.config.insert_timeout).await?;

        info!(chunk_count = chunks.len(), kb_id, doc_id, "Vector insert complete");
        Ok(())
    }

    /// Top-K L2 search. A positive `kb_id` restricts results to that
    /// knowledge base.
    pub async fn search(
        &self,
        query_vector: &[f32],
        kb_id: i64,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let client = self.inner.snapshot().await?;

        let filter = if kb_id > 0 {
            format!("kb_id == {kb_id}")
        } else {
            String::new()
        };

        let hits = client
            .search(query_vector, &filter, top_k, self.inner.config.connect_timeout)
            .await?;

        debug!(results = hits.len(), kb_id, "Vector search complete");
        Ok(hits)
    }

    /// Delete every row belonging to a knowledge base
    pub async fn delete_by_kb(&self, kb_id: i64) -> Result<()> {
        let client = self.inner.snapshot().await?;
        client
            .delete(&format!("kb_id == {kb_id}"), self.inner.config.connect_timeout)
            .await?;
        info!(kb_id, "Deleted knowledge base vectors");
        Ok(())
    }

    /// Delete every row belonging to a document
    pub async fn delete_by_doc(&self, doc_id: i64) -> Result<()> {
        let client = self.inner.snapshot().await?;
        client
            .delete(&format!("doc_id == {doc_id}"), self.inner.config.connect_timeout)
            .await?;
        info!(doc_id, "Deleted document vectors");
        Ok(())
    }

    /// Stop the reconnect loop and drop the connection
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let mut state = self.inner.state.write().await;
        state.client = None;
        state.connected = false;
    }
}

/// Next backoff delay after a failed connect: doubled, capped
fn next_retry_delay(current: Duration) -> Duration {
    (current * 2).min(MAX_RETRY_DELAY)
}

/// Background loop: reconnect with exponential backoff while disconnected,
/// probe the collection while connected
async fn reconnect_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut retry_delay = INITIAL_RETRY_DELAY;

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(retry_delay) => {}
        }

        let connected = inner.state.read().await.connected;

        if !connected {
            info!(retry_delay_secs = retry_delay.as_secs(), "Attempting vector store reconnect");
            match inner.connect().await {
                Ok(()) => {
                    retry_delay = INITIAL_RETRY_DELAY;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        next_retry_secs = next_retry_delay(retry_delay).as_secs(),
                        "Vector store reconnect failed"
                    );
                    retry_delay = next_retry_delay(retry_delay);
                }
            }
        } else {
            // Lightweight liveness probe against the collection
            let client = inner.state.read().await.client.clone();
            if let Some(client) = client {
                if let Err(e) = client.has_collection(HEALTH_CHECK_TIMEOUT).await {
                    warn!(error = %e, "Vector store health check failed, marking disconnected");
                    inner.mark_disconnected().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkMetadata;
    use crate::embeddings::MockEmbedder;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(address: &str) -> AppConfig {
        let mut config = AppConfig::default();
        config.milvus_address = address.to_string();
        config.collection_name = "test_chunks".to_string();
        config.vector_dim = 4;
        config
    }

    fn ok_body(data: Value) -> Value {
        json!({ "code": 0, "data": data })
    }

    async fn mount_existing_collection(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/collections/has"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(json!({ "has": true }))))
            .mount(server)
            .await;
    }

    fn chunk(id: &str, content: &str) -> DocumentChunk {
        DocumentChunk {
            id: id.to_string(),
            content: content.to_string(),
            chunk_index: 0,
            total_chunks: 1,
            metadata: ChunkMetadata {
                file_name: "f.txt".to_string(),
                kb_id: 1,
                doc_id: 1,
                user_id: 1,
            },
        }
    }

    #[tokio::test]
    async fn connects_when_collection_exists() {
        let server = MockServer::start().await;
        mount_existing_collection(&server).await;

        let index = VectorIndex::connect(
            &test_config(&server.uri()),
            Arc::new(MockEmbedder::new(4)),
        )
        .await;

        assert!(index.is_connected().await);
        index.close().await;
    }

    #[tokio::test]
    async fn bootstraps_missing_collection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/collections/has"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(json!({ "has": false }))))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/collections/create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(Value::Null)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/indexes/create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(Value::Null)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/collections/load"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(Value::Null)))
            .expect(1)
            .mount(&server)
            .await;

        let index = VectorIndex::connect(
            &test_config(&server.uri()),
            Arc::new(MockEmbedder::new(4)),
        )
        .await;

        assert!(index.is_connected().await);
        index.close().await;
    }

    #[tokio::test]
    async fn operations_fail_fast_when_disconnected() {
        // Nothing listening at this address
        let index = VectorIndex::connect(
            &test_config("http://127.0.0.1:1"),
            Arc::new(MockEmbedder::new(4)),
        )
        .await;

        assert!(!index.is_connected().await);

        let err = index.search(&[0.0; 4], 1, 5).await.unwrap_err();
        assert!(matches!(err, AppError::VectorUnavailable));

        let err = index.insert(&[chunk("c1", "text")], 1, 1).await.unwrap_err();
        assert!(matches!(err, AppError::VectorUnavailable));

        let err = index.delete_by_doc(1).await.unwrap_err();
        assert!(matches!(err, AppError::VectorUnavailable));

        index.close().await;
    }

    #[tokio::test]
    async fn insert_sends_one_multi_row_call() {
        let server = MockServer::start().await;
        mount_existing_collection(&server).await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/entities/insert"))
            .and(body_partial_json(json!({ "collectionName": "test_chunks" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(json!({ "insertCount": 2 }))))
            .expect(1)
            .mount(&server)
            .await;

        let index = VectorIndex::connect(
            &test_config(&server.uri()),
            Arc::new(MockEmbedder::new(4)),
        )
        .await;

        index
            .insert(&[chunk("c1", "alpha"), chunk("c2", "beta")], 7, 9)
            .await
            .unwrap();
        index.close().await;
    }

    #[tokio::test]
    async fn search_filters_by_kb_and_maps_hits() {
        let server = MockServer::start().await;
        mount_existing_collection(&server).await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/entities/search"))
            .and(body_partial_json(json!({ "filter": "kb_id == 3" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(json!([
                { "id": "c1", "content": "para 1", "distance": 0.12 },
                { "id": "c2", "content": "para 2", "distance": 0.98 }
            ]))))
            .mount(&server)
            .await;

        let index = VectorIndex::connect(
            &test_config(&server.uri()),
            Arc::new(MockEmbedder::new(4)),
        )
        .await;

        let hits = index.search(&[0.1, 0.2, 0.3, 0.4], 3, 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "c1");
        assert!(hits[0].distance < hits[1].distance);
        index.close().await;
    }

    #[tokio::test]
    async fn delete_builds_filter_expressions() {
        let server = MockServer::start().await;
        mount_existing_collection(&server).await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/entities/delete"))
            .and(body_partial_json(json!({ "filter": "doc_id == 42" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(Value::Null)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/entities/delete"))
            .and(body_partial_json(json!({ "filter": "kb_id == 7" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(Value::Null)))
            .expect(1)
            .mount(&server)
            .await;

        let index = VectorIndex::connect(
            &test_config(&server.uri()),
            Arc::new(MockEmbedder::new(4)),
        )
        .await;

        index.delete_by_doc(42).await.unwrap();
        index.delete_by_kb(7).await.unwrap();
        index.close().await;
    }

    #[tokio::test]
    async fn store_side_errors_are_surfaced() {
        let server = MockServer::start().await;
        mount_existing_collection(&server).await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/entities/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 1100, "message": "collection not loaded"
            })))
            .mount(&server)
            .await;

        let index = VectorIndex::connect(
            &test_config(&server.uri()),
            Arc::new(MockEmbedder::new(4)),
        )
        .await;

        let err = index.search(&[0.0; 4], 0, 5).await.unwrap_err();
        assert!(err.to_string().contains("collection not loaded"));
        index.close().await;
    }

    #[test]
    fn retry_delay_doubles_to_the_cap() {
        let mut delay = INITIAL_RETRY_DELAY;
        let mut steps = 0;
        while delay < MAX_RETRY_DELAY {
            delay = next_retry_delay(delay);
            steps += 1;
        }
        assert_eq!(delay, MAX_RETRY_DELAY);
        // 1s doubles past 300s within nine steps, converging under the cap
        assert!(steps <= 9);
        assert_eq!(next_retry_delay(MAX_RETRY_DELAY), MAX_RETRY_DELAY);
    }
}
