//! Error types for the ragforge service
//!
//! Provides:
//! - Distinct error kinds for each failure mode in the pipeline
//! - HTTP status code mapping
//! - The `{"success": false, "message": "..."}` response envelope

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    // Authentication / authorization
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Token expired")]
    ExpiredToken,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    // Resource errors
    #[error("{resource} not found")]
    NotFound { resource: String, id: String },

    #[error("{0}")]
    Duplicate(String),

    // Ingestion pipeline
    #[error("file type {0} is not allowed")]
    UnsupportedFileType(String),

    #[error("failed to parse document: {0}")]
    ParseFailed(String),

    #[error("document processing timeout after {timeout_secs}s")]
    IndexTimeout { timeout_secs: u64 },

    // Embedding service
    #[error("embedding service error: {0}")]
    EmbeddingFailed(String),

    #[error("unexpected embedding dimension: got {actual}, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    // Vector store
    #[error("vector database is not available")]
    VectorUnavailable,

    #[error("vector store error: {0}")]
    VectorStore(String),

    #[error("failed to retrieve documents: {0}")]
    RetrievalFailed(String),

    // Collaborators
    #[error("cache error: {0}")]
    Cache(String),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(#[from] config::ConfigError),

    // Internal
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for not-found errors
    pub fn not_found(resource: &str, id: impl ToString) -> Self {
        AppError::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation(_)
            | AppError::MissingField(_)
            | AppError::Duplicate(_)
            | AppError::UnsupportedFileType(_) => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            AppError::Unauthorized(_) | AppError::InvalidToken | AppError::ExpiredToken => {
                StatusCode::UNAUTHORIZED
            }

            // 403 Forbidden
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,

            // 404 Not Found
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,

            // 408 Request Timeout
            AppError::IndexTimeout { .. } => StatusCode::REQUEST_TIMEOUT,

            // 500 Internal Server Error
            AppError::ParseFailed(_)
            | AppError::EmbeddingFailed(_)
            | AppError::DimensionMismatch { .. }
            | AppError::VectorUnavailable
            | AppError::VectorStore(_)
            | AppError::RetrievalFailed(_)
            | AppError::Cache(_)
            | AppError::Database(_)
            | AppError::HttpClient(_)
            | AppError::Serialization(_)
            | AppError::Configuration(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        if self.is_server_error() {
            tracing::error!(error = %message, status = status.as_u16(), "Server error");
        } else {
            tracing::debug!(error = %message, status = status.as_u16(), "Client error");
        }

        let body = Json(json!({
            "success": false,
            "message": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_maps_to_bad_request_with_stable_message() {
        let err = AppError::Duplicate("document already exists in this knowledge base".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            err.to_string(),
            "document already exists in this knowledge base"
        );
    }

    #[test]
    fn index_timeout_maps_to_408() {
        let err = AppError::IndexTimeout { timeout_secs: 120 };
        assert_eq!(err.status_code(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn vector_unavailable_has_stable_message() {
        let err = AppError::VectorUnavailable;
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "vector database is not available");
    }

    #[test]
    fn not_found_maps_to_404() {
        let err = AppError::not_found("document", 42);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert!(err.to_string().contains("document"));
    }
}
