//! Authentication handlers: register, login, logout, profile, refresh

use crate::auth::{self, CurrentUser};
use crate::db::models::User;
use crate::errors::{AppError, Result};
use crate::services::AppState;
use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 2, max = 100))]
    pub name: String,

    #[validate(email)]
    pub email: String,

    #[validate(length(min = 6))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,

    #[validate(length(min = 6))]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role_name: String,
    pub status: String,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UserResponse {
    pub fn from_user(user: &User, role_name: &str) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            role_name: role_name.to_string(),
            status: user.status.clone(),
            last_login_at: user.last_login_at,
            created_at: user.created_at,
        }
    }
}

fn validation_error(e: validator::ValidationErrors) -> AppError {
    AppError::Validation(e.to_string().replace('\n', "; "))
}

/// POST /api/auth/register
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    request.validate().map_err(validation_error)?;

    if state
        .repo
        .find_user_by_email(&request.email)
        .await?
        .is_some()
    {
        return Err(AppError::Duplicate("email already exists".to_string()));
    }

    let role = state
        .repo
        .find_role_by_name("user")
        .await?
        .ok_or_else(|| AppError::Internal("default role missing".to_string()))?;

    let user = state
        .repo
        .create_user(
            request.name,
            request.email,
            auth::hash_password(&request.password)?,
            role.id,
            "active".to_string(),
        )
        .await?;

    tracing::info!(user_id = user.id, email = %user.email, "User registered");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "user": UserResponse::from_user(&user, &role.name),
        })),
    ))
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>> {
    request.validate().map_err(validation_error)?;

    let user = state
        .repo
        .find_user_by_email(&request.email)
        .await?
        .ok_or_else(|| AppError::Unauthorized("invalid email or password".to_string()))?;

    if user.status != "active" {
        return Err(AppError::Unauthorized("user account is disabled".to_string()));
    }

    if !auth::verify_password(&request.password, &user.password) {
        return Err(AppError::Unauthorized("invalid email or password".to_string()));
    }

    let role = state
        .repo
        .find_role_by_id(user.role_id)
        .await?
        .ok_or_else(|| AppError::Internal("user role missing".to_string()))?;

    let (token, expires_at) = state.jwt.generate_token(user.id, &user.email, &role.name)?;
    state.repo.record_login(user.id).await?;

    tracing::info!(user_id = user.id, "User logged in");

    Ok(Json(json!({
        "success": true,
        "token": token,
        "expires_at": expires_at,
        "user": UserResponse::from_user(&user, &role.name),
    })))
}

/// POST /api/auth/logout
///
/// Tokens are stateless; logout is an acknowledgement for the client.
pub async fn logout(user: CurrentUser) -> Json<serde_json::Value> {
    tracing::info!(user_id = user.id, "User logged out");
    Json(json!({ "success": true, "message": "Logged out" }))
}

/// GET /api/auth/profile
pub async fn profile(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<serde_json::Value>> {
    let user = state
        .repo
        .find_user_by_id(current.id)
        .await?
        .ok_or_else(|| AppError::not_found("user", current.id))?;

    let role = state
        .repo
        .find_role_by_id(user.role_id)
        .await?
        .ok_or_else(|| AppError::Internal("user role missing".to_string()))?;

    Ok(Json(json!({
        "success": true,
        "user": UserResponse::from_user(&user, &role.name),
    })))
}

/// POST /api/auth/refresh
pub async fn refresh(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<serde_json::Value>> {
    let (token, expires_at) = state
        .jwt
        .generate_token(current.id, &current.email, &current.role)?;

    Ok(Json(json!({
        "success": true,
        "token": token,
        "expires_at": expires_at,
    })))
}
