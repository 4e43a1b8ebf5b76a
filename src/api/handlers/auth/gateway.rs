//! Request gateway middleware.
//!
//! Layer order, outermost first: `rate_limit`, `cors`, then `authenticate`.
//! `require_authenticated` and `require_admin` are route layers placed on
//! protected routes only.

use anyhow::{anyhow, Context, Result};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
            ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
            ACCESS_CONTROL_REQUEST_METHOD, ORIGIN, VARY,
        },
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use url::Url;
use std::{net::SocketAddr, sync::Arc};
use tracing::{debug, warn};

use super::{
    cookie::extract_session_token,
    identity::{self, Denial, Identity},
    rate_limit::{client_key, RateLimitDecision},
    session::{SessionError, SCOPE_AUTHENTICATION},
    state::AuthState,
    utils::valid_session_token_shape,
};
use crate::api::error::{ApiError, MSG_AUTH_REQUIRED, MSG_INVALID_SESSION};

/// Token-bucket limit per client IP. Passes everything through when disabled.
pub async fn rate_limit(
    State(auth_state): State<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(limiter) = auth_state.rate_limiter() else {
        return next.run(request).await;
    };

    let Some(ConnectInfo(peer)) = request.extensions().get::<ConnectInfo<SocketAddr>>() else {
        return ApiError::Internal(anyhow!("peer address unavailable")).into_response();
    };
    let key = match client_key(&peer.to_string()) {
        Ok(key) => key,
        Err(err) => return ApiError::Internal(err.into()).into_response(),
    };

    match limiter.allow(&key).await {
        RateLimitDecision::Allowed => next.run(request).await,
        RateLimitDecision::Limited => {
            debug!(client = %key, "rate limit exceeded");
            ApiError::RateLimited.into_response()
        }
    }
}

/// Cross-origin grant for the single frontend origin.
#[derive(Clone, Debug)]
pub struct CorsPolicy {
    allow_origin: HeaderValue,
}

impl CorsPolicy {
    /// # Errors
    /// Returns an error if the client address is not an absolute URL with a host.
    pub fn new(client_address: &str) -> Result<Self> {
        Ok(Self {
            allow_origin: client_origin(client_address)?,
        })
    }

    fn grant(&self, headers: &mut HeaderMap) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin.clone());
        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
}

fn client_origin(client_address: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(client_address)
        .with_context(|| format!("Invalid client address: {client_address}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("Client address must include a valid host: {client_address}"))?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build client origin header")
}

fn has_header(headers: &HeaderMap, name: &HeaderName) -> bool {
    headers.get(name).is_some_and(|value| !value.is_empty())
}

/// `OPTIONS` carrying both `Origin` and `Access-Control-Request-Method`.
fn is_preflight(method: &Method, headers: &HeaderMap) -> bool {
    *method == Method::OPTIONS
        && has_header(headers, &ORIGIN)
        && has_header(headers, &ACCESS_CONTROL_REQUEST_METHOD)
}

/// Grant the client origin whenever `Origin` is present and answer preflights
/// with `200` before identity resolution. Anything else continues inward.
pub async fn cors(
    State(policy): State<Arc<CorsPolicy>>,
    request: Request,
    next: Next,
) -> Response {
    if is_preflight(request.method(), request.headers()) {
        let mut response = StatusCode::OK.into_response();
        let headers = response.headers_mut();
        policy.grant(headers);
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("PATCH, DELETE, GET, POST"),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Authorization"),
        );
        return response;
    }

    let has_origin = has_header(request.headers(), &ORIGIN);
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    if has_origin {
        policy.grant(headers);
    }
    headers.append(VARY, HeaderValue::from_static("Origin"));
    headers.append(
        VARY,
        HeaderValue::from_static("Access-Control-Request-Method"),
    );
    response
}

/// Attach an [`Identity`] to the request from the `session` cookie.
pub async fn authenticate(
    State(auth_state): State<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let resolved = resolve_identity(&auth_state, request.headers()).await;
    match resolved {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}

/// No cookie means anonymous. A cookie that is malformed or unknown is a `401`
/// that also clears it; store failures are a `500`.
///
/// # Errors
/// Returns the [`ApiError`] the request should be answered with.
pub async fn resolve_identity(
    auth_state: &AuthState,
    headers: &HeaderMap,
) -> Result<Identity, ApiError> {
    let Some(token) = extract_session_token(headers) else {
        return Ok(Identity::Anonymous);
    };
    if !valid_session_token_shape(&token) {
        debug!("malformed session cookie");
        return Err(auth_state.cookies().unauthenticated(MSG_INVALID_SESSION));
    }

    match auth_state
        .sessions()
        .resolve(SCOPE_AUTHENTICATION, &token)
        .await
    {
        Ok(user) => Ok(Identity::authenticated(user)),
        Err(SessionError::NotFound) => {
            debug!("unknown or expired session");
            Err(auth_state.cookies().unauthenticated(MSG_INVALID_SESSION))
        }
        Err(err) => {
            warn!("session lookup failed: {err}");
            Err(ApiError::Internal(
                anyhow!(err).context("failed to resolve session"),
            ))
        }
    }
}

/// Route layer: anonymous callers get `401`.
pub async fn require_authenticated(
    State(auth_state): State<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Response {
    guard(&auth_state, request, next, identity::require_authenticated).await
}

/// Route layer: `401` for anonymous callers, `403` for non-admins.
pub async fn require_admin(
    State(auth_state): State<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Response {
    guard(&auth_state, request, next, identity::require_admin).await
}

async fn guard(
    auth_state: &AuthState,
    request: Request,
    next: Next,
    check: fn(&Identity) -> Result<&super::storage::User, Denial>,
) -> Response {
    let Some(identity) = request.extensions().get::<Identity>() else {
        return ApiError::Internal(anyhow!("identity missing; authenticate layer not installed"))
            .into_response();
    };
    let verdict = check(identity).map(|_| ());
    match verdict {
        Ok(()) => next.run(request).await,
        Err(Denial::Unauthenticated) => auth_state
            .cookies()
            .unauthenticated(MSG_AUTH_REQUIRED)
            .into_response(),
        Err(Denial::Forbidden) => ApiError::Forbidden.into_response(),
    }
}
