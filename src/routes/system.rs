//! System handlers: health, stats, and the admin configuration surface

use crate::errors::{AppError, Result};
use crate::services::AppState;
use axum::{extract::State, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

/// Values the config endpoint never echoes back
const MASKED_KEYS: [&str; 2] = ["openai_api_key", "jwt_secret"];

#[derive(Debug, Deserialize)]
pub struct UpdateConfigRequest {
    pub configs: BTreeMap<String, serde_json::Value>,
}

/// GET /api/health (public)
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "ragforge",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().timestamp(),
    }))
}

/// GET /api/system/config (admin)
pub async fn get_config(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let snapshot = state.config.snapshot().await;
    let mut config = serde_json::to_value(&snapshot)?;

    if let Some(object) = config.as_object_mut() {
        for key in MASKED_KEYS {
            if object
                .get(key)
                .and_then(serde_json::Value::as_str)
                .is_some_and(|v| !v.is_empty())
            {
                object.insert(key.to_string(), json!("********"));
            }
        }
    }

    Ok(Json(json!({ "success": true, "config": config })))
}

/// PUT /api/system/config (admin)
///
/// Persists the rows, then applies them to the live configuration the same
/// way database rows override the environment at startup.
pub async fn update_config(
    State(state): State<AppState>,
    Json(request): Json<UpdateConfigRequest>,
) -> Result<Json<serde_json::Value>> {
    let mut rows = BTreeMap::new();
    for (key, value) in request.configs {
        rows.insert(key, stringify_config_value(value)?);
    }

    state.repo.save_configs(&rows).await?;

    let pairs: Vec<(String, String)> = rows.into_iter().collect();
    state.config.apply_overrides(&pairs).await;

    tracing::info!(updated = pairs.len(), "System configuration updated");

    Ok(Json(json!({
        "success": true,
        "message": "Configuration updated successfully",
    })))
}

/// Convert an arbitrary JSON value into the stored string form
fn stringify_config_value(value: serde_json::Value) -> Result<String> {
    use serde_json::Value;

    Ok(match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => {
            let strings: Vec<String> = items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s),
                    other => Some(other.to_string()),
                })
                .collect();
            strings.join(",")
        }
        Value::Null => String::new(),
        other => serde_json::to_string(&other)
            .map_err(|e| AppError::Validation(format!("unsupported config value: {e}")))?,
    })
}

/// GET /api/system/stats
pub async fn stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let users = state.repo.count_users().await?;
    let knowledge_bases = state.repo.count_knowledge_bases().await?;
    let documents = state.repo.count_documents().await?;
    let conversations = state.repo.count_chat_histories().await?;

    Ok(Json(json!({
        "success": true,
        "stats": {
            "users": users,
            "knowledge_bases": knowledge_bases,
            "documents": documents,
            "conversations": conversations,
            "vector_store_connected": state.vector.is_connected().await,
        },
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_values_stringify_like_the_storage_format() {
        assert_eq!(stringify_config_value(json!("abc")).unwrap(), "abc");
        assert_eq!(stringify_config_value(json!(42)).unwrap(), "42");
        assert_eq!(stringify_config_value(json!(1.5)).unwrap(), "1.5");
        assert_eq!(stringify_config_value(json!(true)).unwrap(), "true");
        assert_eq!(
            stringify_config_value(json!([".pdf", ".md"])).unwrap(),
            ".pdf,.md"
        );
        assert_eq!(stringify_config_value(json!(null)).unwrap(), "");
    }
}
