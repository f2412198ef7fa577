//! HTTP routing
//!
//! Assembles the `/api` router: public auth + health endpoints, the
//! bearer-authenticated API, and the admin-gated system/user surface,
//! behind tracing, CORS, and request-id layers.

pub mod auth;
pub mod chat;
pub mod documents;
pub mod knowledge_bases;
pub mod system;
pub mod users;

use crate::middleware::{require_admin, require_auth};
use crate::services::AppState;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post, put};
use axum::{middleware, Router};
use serde::Deserialize;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

/// Common pagination query parameters
#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

fn default_page() -> u64 {
    1
}

fn default_page_size() -> u64 {
    10
}

impl Pagination {
    /// Clamp to sane bounds: page >= 1, page_size in 1..=100
    pub fn clamped(&self) -> (u64, u64) {
        let page = self.page.max(1);
        let page_size = if (1..=100).contains(&self.page_size) {
            self.page_size
        } else {
            default_page_size()
        };
        (page, page_size)
    }
}

/// Create the main application router
pub fn create_router(state: AppState, max_body_size: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let public_routes = Router::new()
        .route("/health", get(system::health))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login));

    let authed_routes = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/auth/profile", get(auth::profile))
        .route("/auth/refresh", post(auth::refresh))
        .route(
            "/knowledge-bases",
            post(knowledge_bases::create).get(knowledge_bases::list),
        )
        .route(
            "/knowledge-bases/:id",
            get(knowledge_bases::get)
                .put(knowledge_bases::update)
                .delete(knowledge_bases::remove),
        )
        .route("/knowledge-bases/:id/documents", get(documents::list_by_kb))
        .route("/documents", get(documents::list_all))
        .route("/documents/upload", post(documents::upload))
        .route("/documents/search", post(documents::search))
        .route("/documents/:id", delete(documents::remove))
        .route("/chat", post(chat::chat))
        .route("/chat/stream", post(chat::chat_stream))
        .route("/chat/conversations", get(chat::list_conversations))
        .route("/chat/conversations/:id", get(chat::get_conversation))
        .route("/system/stats", get(system::stats))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let admin_routes = Router::new()
        .route(
            "/system/config",
            get(system::get_config).put(system::update_config),
        )
        .route("/users", get(users::list).post(users::create))
        .route(
            "/users/:id",
            get(users::get).put(users::update).delete(users::remove),
        )
        .route("/users/:id/status", put(users::update_status))
        .layer(middleware::from_fn(require_admin))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let api = public_routes.merge(authed_routes).merge(admin_routes);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(DefaultBodyLimit::max(max_body_size))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_clamps_out_of_range_values() {
        let p = Pagination { page: 0, page_size: 0 };
        assert_eq!(p.clamped(), (1, 10));

        let p = Pagination { page: 3, page_size: 500 };
        assert_eq!(p.clamped(), (3, 10));

        let p = Pagination { page: 2, page_size: 25 };
        assert_eq!(p.clamped(), (2, 25));
    }
}
