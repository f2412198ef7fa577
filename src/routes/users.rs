//! User administration handlers, admin-gated

use crate::auth::{self, CurrentUser};
use crate::errors::{AppError, Result};
use crate::routes::auth::UserResponse;
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
pub struct CreateUserRequest {
    #[validate(length(min = 2, max = 100))]
    pub name: String,

    #[validate(email)]
    pub email: String,

    #[validate(length(min = 6))]
    pub password: String,

    #[serde(default)]
    pub role_name: Option<String>,

    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub role_name: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

fn validate_status(status: &str) -> Result<()> {
    if status == "active" || status == "inactive" {
        Ok(())
    } else {
        Err(AppError::Validation(
            "status must be active or inactive".to_string(),
        ))
    }
}

/// GET /api/users
pub async fn list(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
) -> Result<Json<serde_json::Value>> {
    let (page, page_size) = pagination.clamped();
    let (users, total) = state.repo.list_users(page, page_size).await?;

    let users: Vec<UserResponse> = users
        .iter()
        .map(|(user, role)| {
            UserResponse::from_user(user, role.as_ref().map(|r| r.name.as_str()).unwrap_or(""))
        })
        .collect();

    Ok(Json(json!({
        "success": true,
        "users": users,
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}

/// GET /api/users/{id}
pub async fn get(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    let user = state
        .repo
        .find_user_by_id(user_id)
        .await?
        .ok_or_else(|| AppError::not_found("user", user_id))?;

    let role = state.repo.find_role_by_id(user.role_id).await?;

    Ok(Json(json!({
        "success": true,
        "user": UserResponse::from_user(&user, role.as_ref().map(|r| r.name.as_str()).unwrap_or("")),
    })))
}

/// POST /api/users
pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    request
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    if state
        .repo
        .find_user_by_email(&request.email)
        .await?
        .is_some()
    {
        return Err(AppError::Duplicate("email already exists".to_string()));
    }

    let role_name = request.role_name.as_deref().unwrap_or("user");
    let role = state
        .repo
        .find_role_by_name(role_name)
        .await?
        .ok_or_else(|| AppError::not_found("role", role_name))?;

    let status = request.status.unwrap_or_else(|| "active".to_string());
    validate_status(&status)?;

    let user = state
        .repo
        .create_user(
            request.name,
            request.email,
            auth::hash_password(&request.password)?,
            role.id,
            status,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "user": UserResponse::from_user(&user, &role.name),
        })),
    ))
}

/// PUT /api/users/{id}
pub async fn update(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Json(request): Json<UpdateUserRequest>,
) -> Result<Json<serde_json::Value>> {
    let role_id = match request.role_name {
        Some(role_name) => Some(
            state
                .repo
                .find_role_by_name(&role_name)
                .await?
                .ok_or_else(|| AppError::not_found("role", &role_name))?
                .id,
        ),
        None => None,
    };

    if let Some(ref status) = request.status {
        validate_status(status)?;
    }

    let password_hash = match request.password {
        Some(password) => {
            if password.chars().count() < 6 {
                return Err(AppError::Validation(
                    "password must be at least 6 characters".to_string(),
                ));
            }
            Some(auth::hash_password(&password)?)
        }
        None => None,
    };

    let user = state
        .repo
        .update_user(
            user_id,
            request.name,
            request.email,
            password_hash,
            role_id,
            request.status,
        )
        .await?;

    let role = state.repo.find_role_by_id(user.role_id).await?;

    Ok(Json(json!({
        "success": true,
        "user": UserResponse::from_user(&user, role.as_ref().map(|r| r.name.as_str()).unwrap_or("")),
    })))
}

/// DELETE /api/users/{id}
pub async fn remove(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(user_id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    if current.id == user_id {
        return Err(AppError::Validation(
            "cannot delete your own account".to_string(),
        ));
    }

    let deleted = state.repo.delete_user(user_id).await?;
    if !deleted {
        return Err(AppError::not_found("user", user_id));
    }

    Ok(Json(json!({
        "success": true,
        "message": "User deleted successfully",
    })))
}

/// PUT /api/users/{id}/status
pub async fn update_status(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Json<serde_json::Value>> {
    validate_status(&request.status)?;

    let user = state
        .repo
        .update_user(user_id, None, None, None, None, Some(request.status))
        .await?;

    Ok(Json(json!({
        "success": true,
        "user": { "id": user.id, "status": user.status },
    })))
}
