use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use super::auth::{CurrentUser, User};

#[derive(Serialize, ToSchema)]
pub struct UserEnvelope {
    user: User,
}

/// The signed-in user.
#[utoipa::path(
    get,
    path = "/v1/users",
    responses(
        (status = 200, description = "Current user", body = UserEnvelope),
        (status = 401, description = "Not signed in", body = super::auth::ErrorResponse),
    ),
    tag = "users"
)]
pub async fn me(CurrentUser(user): CurrentUser) -> Json<UserEnvelope> {
    Json(UserEnvelope {
        user: user.as_ref().clone(),
    })
}

/// Same payload, admin only.
#[utoipa::path(
    get,
    path = "/v1/users/admin",
    responses(
        (status = 200, description = "Current user, who is an admin", body = UserEnvelope),
        (status = 401, description = "Not signed in", body = super::auth::ErrorResponse),
        (status = 403, description = "Not an admin", body = super::auth::ErrorResponse),
    ),
    tag = "users"
)]
pub async fn admin(CurrentUser(user): CurrentUser) -> Json<UserEnvelope> {
    Json(UserEnvelope {
        user: user.as_ref().clone(),
    })
}
