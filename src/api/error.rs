//! HTTP error taxonomy shared by the gateway and handlers.

use axum::{
    http::{header::SET_COOKIE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

pub(crate) const MSG_INVALID_SESSION: &str = "invalid or missing authentication token";
pub(crate) const MSG_AUTH_REQUIRED: &str = "you must be authenticated to access this resource";
pub(crate) const MSG_FORBIDDEN: &str =
    "your user account doesn't have the necessary permissions to access this resource";
pub(crate) const MSG_NOT_FOUND: &str = "the requested resource could not be found";
pub(crate) const MSG_RATE_LIMITED: &str = "rate limit exceeded";
pub(crate) const MSG_INTERNAL: &str =
    "the server encountered a problem and could not process your request";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Client-correctable input problem.
    #[error("{0}")]
    InvalidInput(String),
    /// Missing, invalid, or expired session. Always clears the session cookie.
    #[error("{message}")]
    Unauthenticated {
        message: &'static str,
        clear_cookie: Option<HeaderValue>,
    },
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("rate limited")]
    RateLimited,
    /// Dependency or internal failure; details are logged, never returned.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::InvalidInput(message) => (status, Json(json!({ "error": message }))).into_response(),
            Self::Unauthenticated {
                message,
                clear_cookie,
            } => {
                let mut response = (status, Json(json!({ "error": message }))).into_response();
                if let Some(cookie) = clear_cookie {
                    response.headers_mut().append(SET_COOKIE, cookie);
                }
                response
            }
            Self::Forbidden => (status, Json(json!({ "error": MSG_FORBIDDEN }))).into_response(),
            Self::NotFound => (status, Json(json!({ "error": MSG_NOT_FOUND }))).into_response(),
            Self::RateLimited => {
                (status, Json(json!({ "error": MSG_RATE_LIMITED }))).into_response()
            }
            Self::Internal(err) => {
                error!("internal error: {err:#}");
                (status, Json(json!({ "error": MSG_INTERNAL }))).into_response()
            }
        }
    }
}
