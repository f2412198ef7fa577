//! Request middleware
//!
//! Bearer-token authentication and the admin role gate. Successful
//! authentication stores a `CurrentUser` in the request extensions for the
//! `CurrentUser` extractor.

use crate::auth::{extract_bearer, CurrentUser};
use crate::errors::AppError;
use crate::services::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

/// Validate the bearer token and attach the user to the request
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("authorization header required".to_string()))?;

    let token = extract_bearer(header)
        .ok_or_else(|| AppError::Unauthorized("invalid authorization header format".to_string()))?;

    let claims = state.jwt.validate_token(token)?;
    let user_id: i64 = claims
        .sub
        .parse()
        .map_err(|_| AppError::InvalidToken)?;

    request.extensions_mut().insert(CurrentUser {
        id: user_id,
        email: claims.email,
        role: claims.role,
    });

    Ok(next.run(request).await)
}

/// Reject requests from non-admin users; must run after `require_auth`
pub async fn require_admin(request: Request, next: Next) -> Result<Response, AppError> {
    let user = request
        .extensions()
        .get::<CurrentUser>()
        .ok_or_else(|| AppError::Forbidden("role information not found".to_string()))?;

    if !user.is_admin() {
        return Err(AppError::Forbidden("insufficient permissions".to_string()));
    }

    Ok(next.run(request).await)
}
