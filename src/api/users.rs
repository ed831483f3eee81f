//! User profile endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::{
    error::AppResult,
    models::user::{UpdateUser, UserResponse},
    AppState,
};

use super::AuthenticatedUser;

/// Get the calling user's profile
#[utoipa::path(
    get,
    path = "/users/info",
    tag = "users",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Current user", body = UserResponse),
        (status = 401, description = "Not authenticated", body = crate::error::ErrorResponse),
        (status = 404, description = "Account no longer exists", body = crate::error::ErrorResponse)
    )
)]
pub async fn get_me(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<UserResponse>> {
    let user = state.services.users.get_user(claims.user_id).await?;
    Ok(Json(user.into()))
}

/// Update the calling user's display name
#[utoipa::path(
    put,
    path = "/users/info",
    tag = "users",
    security(("bearer_auth" = [])),
    request_body = UpdateUser,
    responses(
        (status = 200, description = "Profile updated", body = UserResponse),
        (status = 400, description = "Invalid input", body = crate::error::ErrorResponse),
        (status = 404, description = "Account no longer exists", body = crate::error::ErrorResponse)
    )
)]
pub async fn update_me(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(changes): Json<UpdateUser>,
) -> AppResult<Json<UserResponse>> {
    let user = state
        .services
        .users
        .update_user(claims.user_id, changes)
        .await?;
    Ok(Json(user.into()))
}

/// Soft delete a user account
#[utoipa::path(
    delete,
    path = "/management/users/{id}",
    tag = "management",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "User ID")
    ),
    responses(
        (status = 204, description = "User deleted"),
        (status = 403, description = "Staff role required", body = crate::error::ErrorResponse),
        (status = 404, description = "User not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn delete_user(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    claims.require_staff()?;

    state.services.users.delete_user(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
