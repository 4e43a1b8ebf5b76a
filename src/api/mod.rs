//! HTTP surface: router assembly, middleware stack, and listener.

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Extension, MatchedPath},
    http::{HeaderName, HeaderValue, Request},
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, task::JoinHandle};
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;

pub mod error;
pub mod handlers;
mod openapi;

pub use openapi::openapi;

use handlers::{
    auth::{gateway, magic_link, oauth, session, AuthState},
    health, not_found, root, users,
};

/// Build the full application router.
///
/// Layers run outermost first: request id, trace, rate limit, CORS,
/// authenticate, then the route (with its guard, if any).
///
/// # Errors
/// Returns an error if the configured client address is not a usable origin.
pub fn router(auth_state: Arc<AuthState>) -> Result<Router> {
    let cors = Arc::new(gateway::CorsPolicy::new(
        auth_state.config().client_address(),
    )?);

    let authenticated = Router::new()
        .route("/v1/auth/logout", delete(session::logout))
        .route("/v1/users", get(users::me))
        .route_layer(from_fn_with_state(
            auth_state.clone(),
            gateway::require_authenticated,
        ));

    let admin = Router::new()
        .route("/v1/users/admin", get(users::admin))
        .route_layer(from_fn_with_state(
            auth_state.clone(),
            gateway::require_admin,
        ));

    let app = Router::new()
        .route("/", get(root::root))
        .route("/v1/healthcheck", get(health::health))
        .route("/v1/auth/magic-link", post(magic_link::request_magic_link))
        .route(
            "/v1/auth/magic-link/:token",
            get(magic_link::redeem_magic_link),
        )
        .route("/v1/auth/github/login", get(oauth::github_login))
        .route("/v1/auth/github/callback", get(oauth::github_callback))
        .merge(authenticated)
        .merge(admin)
        .merge(openapi::swagger_ui())
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(from_fn_with_state(auth_state.clone(), gateway::rate_limit))
                .layer(from_fn_with_state(cors, gateway::cors))
                .layer(from_fn_with_state(auth_state.clone(), gateway::authenticate))
                .layer(Extension(auth_state)),
        );

    Ok(app)
}

/// Serve until Ctrl-C or SIGTERM, then stop the rate limiter reaper.
///
/// # Errors
/// Returns an error if the listener cannot bind or the server fails.
pub async fn new(
    port: u16,
    auth_state: Arc<AuthState>,
    reaper: Option<JoinHandle<()>>,
) -> Result<()> {
    let app = router(auth_state)?;

    let listener = TcpListener::bind(format!("::0:{port}"))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;

    info!("Listening on [::]:{}", port);

    // The rate limiter keys on the peer address, so connect info is required.
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    info!("Gracefully shutdown");

    served.context("Server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
