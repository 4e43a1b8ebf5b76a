//! Route handlers.

pub mod auth;
pub mod health;
pub mod root;
pub mod users;

use axum::response::IntoResponse;

use crate::api::error::ApiError;

/// Fallback for unknown routes.
pub async fn not_found() -> impl IntoResponse {
    ApiError::NotFound
}
