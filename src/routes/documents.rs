//! Document handlers: multipart upload, vector search, listings, delete

use crate::auth::CurrentUser;
use crate::errors::{AppError, Result};
use crate::routes::Pagination;
use crate::services::AppState;
use axum::{
    extract::{Multipart, Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,

    #[serde(default)]
    pub kb_id: i64,

    #[serde(default)]
    pub top_k: i64,
}

/// A ranked search hit; `distance` is the raw L2 distance, lower is closer
#[derive(Debug, Serialize)]
pub struct DocResult {
    pub id: String,
    pub content: String,
    pub distance: f32,
}

/// POST /api/documents/upload (multipart: `file`, `kb_id`)
pub async fn upload(
    State(state): State<AppState>,
    user: CurrentUser,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>> {
    let mut kb_id: Option<i64> = None;
    let mut file: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("invalid multipart body: {e}")))?
    {
        match field.name() {
            Some("kb_id") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(format!("invalid kb_id field: {e}")))?;
                kb_id = text.trim().parse().ok();
            }
            Some("file") => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| AppError::MissingField("file name".to_string()))?;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(format!("failed to read file: {e}")))?;
                file = Some((filename, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let kb_id = kb_id.ok_or_else(|| AppError::Validation("invalid knowledge base ID".to_string()))?;
    let (filename, data) =
        file.ok_or_else(|| AppError::MissingField("file".to_string()))?;

    info!(
        filename = %filename,
        file_size = data.len(),
        kb_id,
        user_id = user.id,
        "Starting document upload"
    );

    let (document, chunk_count) = state
        .documents
        .upload_document(&filename, data, kb_id, user.id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": "Document uploaded successfully",
        "document_id": document.id,
        "chunk_count": chunk_count,
    })))
}

/// POST /api/documents/search
pub async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<serde_json::Value>> {
    if request.query.trim().is_empty() {
        return Err(AppError::MissingField("query".to_string()));
    }

    let hits = state
        .search
        .search(&request.query, request.kb_id, request.top_k)
        .await?;

    let documents: Vec<DocResult> = hits
        .into_iter()
        .map(|hit| DocResult {
            id: hit.id,
            content: hit.content,
            distance: hit.distance,
        })
        .collect();

    Ok(Json(json!({
        "success": true,
        "query": request.query,
        "documents": documents,
        "timestamp": Utc::now().timestamp(),
    })))
}

/// GET /api/knowledge-bases/{id}/documents
pub async fn list_by_kb(
    State(state): State<AppState>,
    Path(kb_id): Path<i64>,
    Query(pagination): Query<Pagination>,
) -> Result<Json<serde_json::Value>> {
    let (page, page_size) = pagination.clamped();
    let (documents, total) = state
        .repo
        .list_documents_by_kb(kb_id, page, page_size)
        .await?;

    Ok(Json(json!({
        "success": true,
        "documents": documents,
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}

/// GET /api/documents
pub async fn list_all(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
) -> Result<Json<serde_json::Value>> {
    let (page, page_size) = pagination.clamped();
    let (documents, total) = state.repo.list_all_documents(page, page_size).await?;

    let documents: Vec<serde_json::Value> = documents
        .into_iter()
        .map(|(document, kb)| {
            let mut value = serde_json::to_value(&document).unwrap_or_default();
            if let (Some(object), Some(kb)) = (value.as_object_mut(), kb) {
                object.insert("kb_name".to_string(), json!(kb.name));
            }
            value
        })
        .collect();

    Ok(Json(json!({
        "success": true,
        "documents": documents,
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}

/// DELETE /api/documents/{id}
pub async fn remove(
    State(state): State<AppState>,
    Path(doc_id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    state.documents.delete_document(doc_id).await?;

    Ok(Json(json!({
        "success": true,
        "message": "Document deleted successfully",
    })))
}
