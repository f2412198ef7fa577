//! Configuration for the ragforge service
//!
//! Knobs load from environment variables first (flat keys, e.g.
//! `MILVUS_ADDRESS`, `CHUNK_SIZE`), then non-empty rows from the
//! `system_configs` table override at startup and whenever an administrator
//! saves new values. Empty database values never override the environment.

use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Chunking strategy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    Length,
    Semantic,
}

impl ChunkingStrategy {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "length" => Some(ChunkingStrategy::Length),
            "semantic" => Some(ChunkingStrategy::Semantic),
            _ => None,
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    // Server
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_rust_log")]
    pub rust_log: String,

    // Relational store
    #[serde(default = "default_db_path")]
    pub db_path: String,

    // Cache
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    // Vector store
    #[serde(default = "default_milvus_address")]
    pub milvus_address: String,
    #[serde(default = "default_collection_name")]
    pub collection_name: String,
    #[serde(default = "default_vector_dim")]
    pub vector_dim: usize,

    // Embedding service
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,

    // LLM back end
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default)]
    pub openai_base_url: String,

    // RAG
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_chunking_strategy")]
    pub chunking_strategy: ChunkingStrategy,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    #[serde(default = "default_embedding_cache")]
    pub embedding_cache: bool,

    // Upload
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: usize,
    /// Comma-separated list of dotted suffixes
    #[serde(default = "default_allowed_file_types")]
    pub allowed_file_types: String,

    // Timeouts (seconds)
    #[serde(default = "default_index_timeout")]
    pub index_timeout: u64,
    #[serde(default = "default_milvus_insert_timeout")]
    pub milvus_insert_timeout: u64,
    #[serde(default = "default_milvus_connect_timeout")]
    pub milvus_connect_timeout: u64,
    #[serde(default = "default_embedding_timeout")]
    pub embedding_timeout: u64,
    #[serde(default = "default_grpc_keepalive_time")]
    pub grpc_keepalive_time: u64,
    #[serde(default = "default_grpc_keepalive_timeout")]
    pub grpc_keepalive_timeout: u64,

    // Authentication
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_jwt_expire_hours")]
    pub jwt_expire_hours: u64,
}

// Default value functions
fn default_server_host() -> String { "0.0.0.0".to_string() }
fn default_server_port() -> u16 { 8080 }
fn default_rust_log() -> String { "info".to_string() }
fn default_db_path() -> String { "./data/ragforge.db".to_string() }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_milvus_address() -> String { "http://localhost:19530".to_string() }
fn default_collection_name() -> String { "ragforge_documents".to_string() }
fn default_vector_dim() -> usize { 1024 }
fn default_ollama_url() -> String { "http://localhost:11434".to_string() }
fn default_embedding_model() -> String { "bge-m3".to_string() }
fn default_llm_model() -> String { "llama2".to_string() }
fn default_openai_model() -> String { "gpt-4o".to_string() }
fn default_chunk_size() -> usize { 500 }
fn default_chunk_overlap() -> usize { 50 }
fn default_chunking_strategy() -> ChunkingStrategy { ChunkingStrategy::Length }
fn default_top_k() -> usize { 5 }
fn default_score_threshold() -> f32 { 0.7 }
fn default_embedding_cache() -> bool { true }
fn default_max_upload_size() -> usize { 10 * 1024 * 1024 }
fn default_allowed_file_types() -> String {
    ".pdf,.txt,.md,.markdown,.json,.csv,.html,.htm".to_string()
}
fn default_index_timeout() -> u64 { 120 }
fn default_milvus_insert_timeout() -> u64 { 60 }
fn default_milvus_connect_timeout() -> u64 { 30 }
fn default_embedding_timeout() -> u64 { 120 }
fn default_grpc_keepalive_time() -> u64 { 30 }
fn default_grpc_keepalive_timeout() -> u64 { 5 }
fn default_jwt_secret() -> String { "change-me-in-production".to_string() }
fn default_jwt_expire_hours() -> u64 { 24 }

impl Default for AppConfig {
    fn default() -> Self {
        // Serde fills every field from its default fn
        serde_json::from_value(serde_json::json!({})).expect("defaults are total")
    }
}

impl AppConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// The dotted, lowercased suffixes accepted for upload
    pub fn allowed_types(&self) -> Vec<String> {
        self.allowed_file_types
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn index_timeout(&self) -> Duration {
        Duration::from_secs(self.index_timeout)
    }

    pub fn insert_timeout(&self) -> Duration {
        Duration::from_secs(self.milvus_insert_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.milvus_connect_timeout)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout)
    }

    /// Apply non-empty database rows on top of the current values.
    ///
    /// Unknown keys are ignored; unparsable values keep the current setting.
    pub fn apply_overrides<'a, I>(&mut self, rows: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in rows {
            if value.is_empty() {
                continue;
            }
            match key {
                "milvus_address" => self.milvus_address = value.to_string(),
                "collection_name" => self.collection_name = value.to_string(),
                "vector_dim" => parse_into(value, &mut self.vector_dim),
                "ollama_url" => self.ollama_url = value.to_string(),
                "embedding_model" => self.embedding_model = value.to_string(),
                "llm_model" => self.llm_model = value.to_string(),
                "openai_api_key" => self.openai_api_key = value.to_string(),
                "openai_model" => self.openai_model = value.to_string(),
                "openai_base_url" => self.openai_base_url = value.to_string(),
                "chunk_size" => parse_into(value, &mut self.chunk_size),
                "chunk_overlap" => parse_into(value, &mut self.chunk_overlap),
                "chunking_strategy" => {
                    if let Some(strategy) = ChunkingStrategy::parse(value) {
                        self.chunking_strategy = strategy;
                    }
                }
                "top_k" => parse_into(value, &mut self.top_k),
                "score_threshold" => parse_into(value, &mut self.score_threshold),
                "embedding_cache" => parse_into(value, &mut self.embedding_cache),
                "max_upload_size" => parse_into(value, &mut self.max_upload_size),
                "allowed_file_types" => self.allowed_file_types = value.to_string(),
                "index_timeout" => parse_into(value, &mut self.index_timeout),
                "milvus_insert_timeout" => parse_into(value, &mut self.milvus_insert_timeout),
                "milvus_connect_timeout" => parse_into(value, &mut self.milvus_connect_timeout),
                "embedding_timeout" => parse_into(value, &mut self.embedding_timeout),
                "grpc_keepalive_time" => parse_into(value, &mut self.grpc_keepalive_time),
                "grpc_keepalive_timeout" => parse_into(value, &mut self.grpc_keepalive_timeout),
                "jwt_secret" => self.jwt_secret = value.to_string(),
                "jwt_expire_hours" => parse_into(value, &mut self.jwt_expire_hours),
                _ => {}
            }
        }
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, target: &mut T) {
    if let Ok(parsed) = value.parse() {
        *target = parsed;
    }
}

/// Shared, runtime-updatable configuration handle
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<AppConfig>>,
}

impl SharedConfig {
    pub fn new(config: AppConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Clone the current configuration
    pub async fn snapshot(&self) -> AppConfig {
        self.inner.read().await.clone()
    }

    /// Apply database overrides to the live configuration
    pub async fn apply_overrides(&self, rows: &[(String, String)]) {
        let mut guard = self.inner.write().await;
        guard.apply_overrides(rows.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = AppConfig::default();
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.chunk_overlap, 50);
        assert_eq!(config.chunking_strategy, ChunkingStrategy::Length);
        assert_eq!(config.vector_dim, 1024);
        assert_eq!(config.top_k, 5);
        assert!(config.embedding_cache);
    }

    #[test]
    fn allowed_types_splits_and_lowercases() {
        let mut config = AppConfig::default();
        config.allowed_file_types = ".PDF, .md ,.txt".to_string();
        assert_eq!(config.allowed_types(), vec![".pdf", ".md", ".txt"]);
    }

    #[test]
    fn overrides_apply_non_empty_values() {
        let mut config = AppConfig::default();
        config.apply_overrides([
            ("chunk_size", "800"),
            ("chunking_strategy", "semantic"),
            ("milvus_address", "http://milvus:19530"),
        ]);
        assert_eq!(config.chunk_size, 800);
        assert_eq!(config.chunking_strategy, ChunkingStrategy::Semantic);
        assert_eq!(config.milvus_address, "http://milvus:19530");
    }

    #[test]
    fn empty_values_do_not_override() {
        let mut config = AppConfig::default();
        let before = config.milvus_address.clone();
        config.apply_overrides([("milvus_address", ""), ("chunk_size", "")]);
        assert_eq!(config.milvus_address, before);
        assert_eq!(config.chunk_size, 500);
    }

    #[test]
    fn unparsable_values_keep_current_setting() {
        let mut config = AppConfig::default();
        config.apply_overrides([("chunk_size", "not-a-number")]);
        assert_eq!(config.chunk_size, 500);
    }
}
