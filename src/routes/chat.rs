//! Chat handlers: synchronous chat, SSE streaming, conversation listings
//!
//! The streaming handler frames every event as
//! `data: {"type": "...", "data": {...}}`. The completed exchange is
//! persisted only after the token stream ends cleanly; a client disconnect
//! drops the stream and nothing is stored for that turn.

use crate::auth::CurrentUser;
use crate::errors::Result;
use crate::routes::Pagination;
use crate::services::AppState;
use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tracing::error;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,

    #[serde(default)]
    pub conversation_id: Option<String>,

    #[serde(default)]
    pub kb_id: i64,

    #[serde(default)]
    pub use_rag: bool,
}

/// POST /api/chat
pub async fn chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<ChatRequest>,
) -> Result<Json<serde_json::Value>> {
    let (reply, conversation_id, context) = state
        .chat
        .chat(
            &request.message,
            request.conversation_id,
            user.id,
            request.kb_id,
            request.use_rag,
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": reply,
        "conversation_id": conversation_id,
        "context": context,
        "timestamp": Utc::now().timestamp(),
    })))
}

fn sse_event(event_type: &str, data: serde_json::Value) -> std::result::Result<Event, Infallible> {
    let payload = json!({ "type": event_type, "data": data });
    Ok(Event::default().data(payload.to_string()))
}

/// POST /api/chat/stream
pub async fn chat_stream(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<ChatRequest>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        yield sse_event("start", json!({
            "conversation_id": request.conversation_id,
            "message": "Starting chat",
        }));

        let turn = state
            .chat
            .chat_stream(
                &request.message,
                request.conversation_id.clone(),
                user.id,
                request.kb_id,
                request.use_rag,
            )
            .await;

        let (mut tokens, conversation_id, _context, retrieved) = match turn {
            Ok(parts) => parts,
            Err(e) => {
                error!(error = %e, "Failed to start stream chat");
                yield sse_event("error", json!({ "message": "Failed to process chat request" }));
                return;
            }
        };

        if !retrieved.is_empty() {
            yield sse_event("context", json!({ "documents": retrieved }));
        }

        // Forward tokens while buffering the full reply for persistence
        let mut full_reply = String::new();
        while let Some(item) = tokens.next().await {
            match item {
                Ok(content) => {
                    if !content.is_empty() {
                        full_reply.push_str(&content);
                        yield sse_event("content", json!({ "content": content }));
                    }
                }
                Err(e) => {
                    error!(error = %e, "Error reading model stream");
                    yield sse_event("error", json!({ "message": "Stream interrupted" }));
                    // Partial output is never persisted
                    return;
                }
            }
        }

        state
            .chat
            .persist_exchange(user.id, &conversation_id, &request.message, &full_reply)
            .await;

        yield sse_event("end", json!({
            "conversation_id": conversation_id,
            "message": "Completed",
            "timestamp": Utc::now().timestamp(),
        }));
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /api/chat/conversations
pub async fn list_conversations(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(pagination): Query<Pagination>,
) -> Result<Json<serde_json::Value>> {
    let (page, page_size) = pagination.clamped();
    let (conversations, total) = state
        .chat
        .list_conversations(user.id, page, page_size)
        .await?;

    Ok(Json(json!({
        "success": true,
        "conversations": conversations,
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}

/// GET /api/chat/conversations/{id}
pub async fn get_conversation(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(conversation_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let messages = state
        .chat
        .conversation_messages(&conversation_id, user.id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "id": conversation_id,
        "messages": messages,
    })))
}
