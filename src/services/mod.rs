//! Service layer
//!
//! A container for all services, injected into route handlers.

pub mod chat;
pub mod ingest;
pub mod search;

use crate::auth::JwtManager;
use crate::cache::Cache;
use crate::config::SharedConfig;
use crate::db::Repository;
use crate::embeddings::Embedder;
use crate::parser::DocumentParser;
use crate::vector::VectorIndex;
use chat::{ChatService, LlmClient};
use ingest::DocumentService;
use search::SearchService;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: SharedConfig,
    pub repo: Repository,
    pub cache: Arc<Cache>,
    pub vector: Arc<VectorIndex>,
    pub jwt: JwtManager,
    pub documents: Arc<DocumentService>,
    pub search: Arc<SearchService>,
    pub chat: Arc<ChatService>,
}

impl AppState {
    pub fn new(
        config: SharedConfig,
        repo: Repository,
        cache: Arc<Cache>,
        embedder: Arc<dyn Embedder>,
        vector: Arc<VectorIndex>,
        jwt: JwtManager,
        llm: Option<LlmClient>,
    ) -> Self {
        let search = Arc::new(SearchService::new(
            embedder,
            vector.clone(),
            config.clone(),
        ));
        let documents = Arc::new(DocumentService::new(
            repo.clone(),
            DocumentParser::new(),
            vector.clone(),
            config.clone(),
        ));
        let chat = Arc::new(ChatService::new(
            repo.clone(),
            cache.clone(),
            search.clone(),
            config.clone(),
            llm,
        ));

        Self {
            config,
            repo,
            cache,
            vector,
            jwt,
            documents,
            search,
            chat,
        }
    }
}
