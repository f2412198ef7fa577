//! ragforge — retrieval-augmented generation service
//!
//! Startup order: configuration → logging → relational store → cache →
//! embedder → vector adapter → services → HTTP. Shutdown reverses it.

mod auth;
mod cache;
mod chunker;
mod config;
mod db;
mod embeddings;
mod errors;
mod middleware;
mod parser;
mod routes;
mod services;
mod vector;

use crate::embeddings::{Embedder, OllamaEmbedder};
use crate::services::chat::LlmClient;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let mut app_config = config::AppConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&app_config.rust_log)),
        )
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting ragforge");

    // Relational store and schema
    let conn = db::connect(&app_config.db_path).await?;
    db::bootstrap(&conn).await?;
    let repo = db::Repository::new(conn);
    info!(db_path = %app_config.db_path, "Database ready");

    // Non-empty database rows override the environment
    let rows = repo.all_configs().await?;
    app_config.apply_overrides(rows.iter().map(|r| (r.key.as_str(), r.value.as_str())));
    info!(
        config_rows = rows.len(),
        milvus_address = %app_config.milvus_address,
        ollama_url = %app_config.ollama_url,
        embedding_model = %app_config.embedding_model,
        "Configuration loaded"
    );

    // Cache
    let cache = Arc::new(cache::Cache::connect(&app_config.redis_url).await?);
    info!(redis_url = %app_config.redis_url, "Cache ready");

    // Embedder, with the cache in front when enabled
    let embedding_cache = app_config.embedding_cache.then(|| cache.clone());
    let embedder: Arc<dyn Embedder> = Arc::new(OllamaEmbedder::new(&app_config, embedding_cache));

    // Vector adapter; a failed first connect is retried in the background
    let vector = Arc::new(vector::VectorIndex::connect(&app_config, embedder.clone()).await);

    let jwt = auth::JwtManager::new(&app_config.jwt_secret, app_config.jwt_expire_hours);
    let llm = LlmClient::from_config(&app_config);

    let addr = SocketAddr::new(app_config.server_host.parse()?, app_config.server_port);
    // Leave the multipart framing some room beyond the document cap
    let max_body_size = app_config.max_upload_size + 1024 * 1024;

    let state = services::AppState::new(
        config::SharedConfig::new(app_config),
        repo,
        cache,
        embedder,
        vector.clone(),
        jwt,
        llm,
    );

    let app = routes::create_router(state, max_body_size);

    info!(%addr, "Listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Reverse of startup: stop the vector adapter's background loop last
    vector.close().await;
    info!("Server exited");
    Ok(())
}

/// Graceful shutdown on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown"),
        _ = terminate => info!("Received SIGTERM, starting shutdown"),
    }
}
