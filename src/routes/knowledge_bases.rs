//! Knowledge base handlers

use crate::auth::CurrentUser;
use crate::errors::{AppError, Result};
use crate::routes::Pagination;
use crate::services::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: String,

    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// POST /api/knowledge-bases
pub async fn create(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    request
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let kb = state
        .repo
        .create_knowledge_base(request.name, request.description, user.id)
        .await?;

    tracing::info!(kb_id = kb.id, user_id = user.id, "Knowledge base created");

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "knowledge_base": kb })),
    ))
}

/// GET /api/knowledge-bases?page&page_size
pub async fn list(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
) -> Result<Json<serde_json::Value>> {
    let (page, page_size) = pagination.clamped();
    let (kbs, total) = state.repo.list_knowledge_bases(page, page_size).await?;

    Ok(Json(json!({
        "success": true,
        "knowledge_bases": kbs,
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}

/// GET /api/knowledge-bases/{id}
pub async fn get(
    State(state): State<AppState>,
    Path(kb_id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    let kb = state
        .repo
        .find_knowledge_base(kb_id)
        .await?
        .ok_or_else(|| AppError::not_found("knowledge base", kb_id))?;

    Ok(Json(json!({ "success": true, "knowledge_base": kb })))
}

/// PUT /api/knowledge-bases/{id}
pub async fn update(
    State(state): State<AppState>,
    Path(kb_id): Path<i64>,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<serde_json::Value>> {
    let kb = state
        .repo
        .update_knowledge_base(kb_id, request.name, request.description)
        .await?;

    Ok(Json(json!({ "success": true, "knowledge_base": kb })))
}

/// DELETE /api/knowledge-bases/{id}
///
/// Cascades to the knowledge base's documents and vector rows.
pub async fn remove(
    State(state): State<AppState>,
    Path(kb_id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    state.documents.delete_knowledge_base(kb_id).await?;

    Ok(Json(json!({
        "success": true,
        "message": "Knowledge base deleted successfully",
    })))
}
