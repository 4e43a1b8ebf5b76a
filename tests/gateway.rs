use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_METHOD, CONTENT_TYPE, COOKIE,
            LOCATION, ORIGIN, SET_COOKIE, VARY,
        },
        HeaderValue, Method, Request, Response, StatusCode,
    },
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tower::ServiceExt;
use url::Url;
use wdt::api::{
    self,
    handlers::auth::{
        magic_link::MAGIC_LINK_TOKEN_NAME,
        storage::{find_or_create_user, NewUser},
        AuthConfig, AuthState, EmailMessage, Mailer, MemoryStore, OAuthProfile, OAuthProvider,
        RateLimitConfig, RateLimiter, Role, SignedTokenCodec, User, SCOPE_AUTHENTICATION,
    },
};

const CLIENT: &str = "http://localhost:3000";
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<EmailMessage>>,
}

impl RecordingMailer {
    fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        self.sent
            .lock()
            .map_err(|_| anyhow!("mailer poisoned"))?
            .push(message.clone());
        Ok(())
    }
}

struct FakeGithub;

#[async_trait]
impl OAuthProvider for FakeGithub {
    fn authorize_url(&self, state: &str) -> Result<Url> {
        Ok(Url::parse_with_params(
            "https://github.example/login/oauth/authorize",
            &[("state", state)],
        )?)
    }

    async fn fetch_profile(&self, code: &str) -> Result<OAuthProfile> {
        if code == "good-code" {
            Ok(OAuthProfile {
                email: "Octo@Example.com".to_string(),
                display_name: "The Octocat".to_string(),
                avatar_url: "https://avatars.example/octo.png".to_string(),
            })
        } else {
            Err(anyhow!("bad code"))
        }
    }
}

struct Harness {
    app: Router,
    state: Arc<AuthState>,
    store: Arc<MemoryStore>,
    mailer: Arc<RecordingMailer>,
}

struct Options {
    store: MemoryStore,
    rate_limit: bool,
    oauth: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            store: MemoryStore::new(),
            rate_limit: false,
            oauth: false,
        }
    }
}

fn harness(options: Options) -> Result<Harness> {
    let store = Arc::new(options.store);
    let mailer = Arc::new(RecordingMailer::default());
    let mut state = AuthState::new(
        AuthConfig::new(CLIENT.to_string()),
        SignedTokenCodec::ephemeral(MAGIC_LINK_TOKEN_NAME)?,
        store.clone(),
        mailer.clone(),
    )?;
    if options.rate_limit {
        state = state.with_rate_limiter(Arc::new(RateLimiter::new(RateLimitConfig::new())));
    }
    if options.oauth {
        state = state.with_oauth(Arc::new(FakeGithub));
    }
    let state = Arc::new(state);
    Ok(Harness {
        app: api::router(state.clone())?,
        state,
        store,
        mailer,
    })
}

impl Harness {
    async fn send(&self, request: Request<Body>) -> Result<Response<Body>> {
        Ok(self.app.clone().oneshot(request).await?)
    }

    async fn user(&self, email: &str) -> Result<User> {
        find_or_create_user(
            self.store.as_ref(),
            NewUser {
                name: "test".to_string(),
                email: email.to_string(),
                image_url: None,
            },
            Duration::from_secs(3),
        )
        .await
    }

    async fn session_cookie(&self, user: &User) -> Result<String> {
        let token = self
            .state
            .sessions()
            .issue(user.id, DAY, SCOPE_AUTHENTICATION)
            .await?;
        Ok(format!("session={}", token.plaintext))
    }
}

fn request(method: Method, uri: &str) -> Request<Body> {
    request_from(method, uri, [127, 0, 0, 1])
}

fn request_from(method: Method, uri: &str, ip: [u8; 4]) -> Request<Body> {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("valid request");
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((ip, 40_000))));
    request
}

fn with_cookie(mut request: Request<Body>, cookie: &str) -> Request<Body> {
    if let Ok(value) = cookie.parse() {
        request.headers_mut().insert(COOKIE, value);
    }
    request
}

fn json_request(method: Method, uri: &str, body: &str) -> Request<Body> {
    let (mut parts, _) = request(method, uri).into_parts();
    parts
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Request::from_parts(parts, Body::from(body.to_string()))
}

async fn body_json(response: Response<Body>) -> Result<Value> {
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

fn set_cookies(response: &Response<Body>) -> Vec<String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok().map(ToString::to_string))
        .collect()
}

fn cookie_pair(set_cookie: &str) -> String {
    set_cookie.split(';').next().unwrap_or_default().to_string()
}

fn assert_clears_session(response: &Response<Body>) {
    let cookies = set_cookies(response);
    assert!(
        cookies
            .iter()
            .any(|cookie| cookie.starts_with("session=;") && cookie.contains("Max-Age=0")),
        "expected a clearing cookie, got {cookies:?}"
    );
}

#[tokio::test]
async fn anonymous_requests_pass_through() -> Result<()> {
    let h = harness(Options::default())?;
    let response = h.send(request(Method::GET, "/v1/healthcheck")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(set_cookies(&response).is_empty());
    assert!(response.headers().contains_key("x-request-id"));
    let body = body_json(response).await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["name"], "wdt");
    Ok(())
}

#[tokio::test]
async fn unknown_session_is_rejected_and_cleared() -> Result<()> {
    let h = harness(Options::default())?;
    let cookie = format!("session={}", "A".repeat(43));
    let response = h
        .send(with_cookie(request(Method::GET, "/v1/healthcheck"), &cookie))
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_clears_session(&response);
    let body = body_json(response).await?;
    assert_eq!(body["error"], "invalid or missing authentication token");
    Ok(())
}

#[tokio::test]
async fn malformed_session_is_rejected_without_lookup() -> Result<()> {
    let h = harness(Options {
        store: MemoryStore::new().with_latency(Duration::from_secs(3600)),
        ..Options::default()
    })?;
    let response = h
        .send(with_cookie(
            request(Method::GET, "/v1/healthcheck"),
            "session=short!",
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_clears_session(&response);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn slow_store_is_a_server_error() -> Result<()> {
    let h = harness(Options {
        store: MemoryStore::new().with_latency(Duration::from_secs(10)),
        ..Options::default()
    })?;
    let cookie = format!("session={}", "A".repeat(43));
    let response = h
        .send(with_cookie(request(Method::GET, "/v1/users"), &cookie))
        .await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(set_cookies(&response).is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rate_limit_runs_before_authentication() -> Result<()> {
    let h = harness(Options {
        rate_limit: true,
        ..Options::default()
    })?;
    let cookie = format!("session={}", "A".repeat(43));

    for _ in 0..4 {
        let response = h
            .send(with_cookie(request(Method::GET, "/v1/users"), &cookie))
            .await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    let limited = h
        .send(with_cookie(request(Method::GET, "/v1/users"), &cookie))
        .await?;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(set_cookies(&limited).is_empty());

    // Another client has its own bucket.
    let other = h
        .send(request_from(Method::GET, "/v1/healthcheck", [10, 0, 0, 2]))
        .await?;
    assert_eq!(other.status(), StatusCode::OK);

    // Two tokens are back after a second.
    tokio::time::advance(Duration::from_secs(1)).await;
    for _ in 0..2 {
        let response = h.send(request(Method::GET, "/v1/healthcheck")).await?;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let limited = h.send(request(Method::GET, "/v1/healthcheck")).await?;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    Ok(())
}

#[tokio::test]
async fn missing_peer_address_is_a_server_error_when_limiting() -> Result<()> {
    let h = harness(Options {
        rate_limit: true,
        ..Options::default()
    })?;
    let request = Request::builder()
        .uri("/v1/healthcheck")
        .body(Body::empty())?;
    let response = h.send(request).await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    Ok(())
}

#[tokio::test]
async fn preflight_short_circuits_before_authentication() -> Result<()> {
    let h = harness(Options::default())?;
    let mut preflight = with_cookie(
        request(Method::OPTIONS, "/v1/users"),
        &format!("session={}", "A".repeat(43)),
    );
    preflight.headers_mut().insert(ORIGIN, CLIENT.parse()?);
    preflight
        .headers_mut()
        .insert(ACCESS_CONTROL_REQUEST_METHOD, "GET".parse()?);

    let response = h.send(preflight).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok()),
        Some(CLIENT)
    );
    assert_eq!(
        response
            .headers()
            .get(ACCESS_CONTROL_ALLOW_CREDENTIALS)
            .and_then(|v| v.to_str().ok()),
        Some("true")
    );
    assert_eq!(
        response
            .headers()
            .get(ACCESS_CONTROL_ALLOW_METHODS)
            .and_then(|v| v.to_str().ok()),
        Some("PATCH, DELETE, GET, POST")
    );
    assert!(set_cookies(&response).is_empty());
    Ok(())
}

#[tokio::test]
async fn options_without_preflight_headers_is_authenticated() -> Result<()> {
    let h = harness(Options::default())?;

    let bare = h
        .send(with_cookie(
            request(Method::OPTIONS, "/v1/users"),
            "session=short!",
        ))
        .await?;
    assert_eq!(bare.status(), StatusCode::UNAUTHORIZED);
    assert_clears_session(&bare);
    assert!(bare.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());

    let mut origin_only = with_cookie(request(Method::OPTIONS, "/v1/users"), "session=short!");
    origin_only.headers_mut().insert(ORIGIN, CLIENT.parse()?);
    let response = h.send(origin_only).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_clears_session(&response);
    assert_eq!(
        response
            .headers()
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok()),
        Some(CLIENT)
    );
    Ok(())
}

#[tokio::test]
async fn cors_grant_follows_the_origin_header() -> Result<()> {
    let h = harness(Options::default())?;

    let same_site = h.send(request(Method::GET, "/v1/healthcheck")).await?;
    assert_eq!(same_site.status(), StatusCode::OK);
    assert!(same_site.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    assert!(same_site
        .headers()
        .get(ACCESS_CONTROL_ALLOW_CREDENTIALS)
        .is_none());
    let vary: Vec<_> = same_site
        .headers()
        .get_all(VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    assert!(vary.contains(&"Origin"), "vary: {vary:?}");
    assert!(vary.contains(&"Access-Control-Request-Method"), "vary: {vary:?}");

    // The grant always names the configured client; browsers reject a mismatch.
    let mut cross_site = request(Method::GET, "/v1/healthcheck");
    cross_site
        .headers_mut()
        .insert(ORIGIN, "https://evil.example".parse()?);
    let response = h.send(cross_site).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok()),
        Some(CLIENT)
    );
    Ok(())
}

#[tokio::test]
async fn magic_link_round_trip() -> Result<()> {
    let h = harness(Options::default())?;

    let response = h
        .send(json_request(
            Method::POST,
            "/v1/auth/magic-link",
            r#"{"email":"  Alice@Example.com "}"#,
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await?["message"], "success");

    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "alice@example.com");
    let start = sent[0]
        .html
        .find("/v1/auth/magic-link/")
        .context("link missing from email")?;
    let path: String = sent[0].html[start..]
        .chars()
        .take_while(|c| *c != '"')
        .collect();

    let redeemed = h.send(request(Method::GET, &path)).await?;
    assert_eq!(redeemed.status(), StatusCode::FOUND);
    assert_eq!(
        redeemed
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok()),
        Some(CLIENT)
    );
    let session = set_cookies(&redeemed)
        .into_iter()
        .find(|cookie| cookie.starts_with("session=") && !cookie.starts_with("session=;"))
        .context("session cookie missing")?;
    assert!(session.contains("HttpOnly"));
    assert!(session.contains("Path=/v1"));

    let me = h
        .send(with_cookie(
            request(Method::GET, "/v1/users"),
            &cookie_pair(&session),
        ))
        .await?;
    assert_eq!(me.status(), StatusCode::OK);
    let body = body_json(me).await?;
    assert_eq!(body["user"]["email"], "alice@example.com");
    assert_eq!(body["user"]["name"], "alice");
    assert_eq!(body["user"]["role"], "user");

    // The link is stateless, so it can be redeemed again until it expires.
    let again = h.send(request(Method::GET, &path)).await?;
    assert_eq!(again.status(), StatusCode::FOUND);
    Ok(())
}

#[tokio::test]
async fn magic_link_request_validates_input() -> Result<()> {
    let h = harness(Options::default())?;
    let bad_email = h
        .send(json_request(
            Method::POST,
            "/v1/auth/magic-link",
            r#"{"email":"not-an-email"}"#,
        ))
        .await?;
    assert_eq!(bad_email.status(), StatusCode::BAD_REQUEST);

    let bad_body = h
        .send(json_request(Method::POST, "/v1/auth/magic-link", "{"))
        .await?;
    assert_eq!(bad_body.status(), StatusCode::BAD_REQUEST);
    assert!(h.mailer.sent().is_empty());
    Ok(())
}

#[tokio::test]
async fn tampered_magic_link_is_unauthorized() -> Result<()> {
    let h = harness(Options::default())?;
    let response = h
        .send(request(Method::GET, "/v1/auth/magic-link/not-a-real-token"))
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_clears_session(&response);
    Ok(())
}

#[tokio::test]
async fn signed_in_users_cannot_request_links() -> Result<()> {
    let h = harness(Options::default())?;
    let user = h.user("bob@example.com").await?;
    let cookie = h.session_cookie(&user).await?;
    let response = h
        .send(with_cookie(
            json_request(
                Method::POST,
                "/v1/auth/magic-link",
                r#"{"email":"bob@example.com"}"#,
            ),
            &cookie,
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn logout_revokes_every_session() -> Result<()> {
    let h = harness(Options::default())?;
    let user = h.user("carol@example.com").await?;
    let laptop = h.session_cookie(&user).await?;
    let phone = h.session_cookie(&user).await?;

    let response = h
        .send(with_cookie(request(Method::DELETE, "/v1/auth/logout"), &laptop))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_clears_session(&response);
    assert_eq!(
        body_json(response).await?["message"],
        "you have been logged out"
    );
    assert_eq!(h.store.session_count(user.id).await, 0);

    for cookie in [&laptop, &phone] {
        let response = h
            .send(with_cookie(request(Method::GET, "/v1/users"), cookie))
            .await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

#[tokio::test]
async fn logout_requires_a_session() -> Result<()> {
    let h = harness(Options::default())?;
    let response = h.send(request(Method::DELETE, "/v1/auth/logout")).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        body_json(response).await?["error"],
        "you must be authenticated to access this resource"
    );
    Ok(())
}

#[tokio::test]
async fn admin_guard_checks_authentication_then_role() -> Result<()> {
    let h = harness(Options::default())?;

    let anonymous = h.send(request(Method::GET, "/v1/users/admin")).await?;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let user = h.user("dave@example.com").await?;
    let cookie = h.session_cookie(&user).await?;
    let forbidden = h
        .send(with_cookie(request(Method::GET, "/v1/users/admin"), &cookie))
        .await?;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    assert!(h.store.set_role(user.id, Role::Admin).await);
    let allowed = h
        .send(with_cookie(request(Method::GET, "/v1/users/admin"), &cookie))
        .await?;
    assert_eq!(allowed.status(), StatusCode::OK);
    assert_eq!(body_json(allowed).await?["user"]["role"], "admin");
    Ok(())
}

#[tokio::test]
async fn github_routes_are_hidden_when_unconfigured() -> Result<()> {
    let h = harness(Options::default())?;
    let response = h.send(request(Method::GET, "/v1/auth/github/login")).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn github_sign_in_round_trip() -> Result<()> {
    let h = harness(Options {
        oauth: true,
        ..Options::default()
    })?;

    let login = h.send(request(Method::GET, "/v1/auth/github/login")).await?;
    assert_eq!(login.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = Url::parse(
        login
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .context("missing location")?,
    )?;
    let state = location
        .query_pairs()
        .find(|(key, _)| key == "state")
        .map(|(_, value)| value.into_owned())
        .context("missing state")?;
    let state_cookie = set_cookies(&login)
        .into_iter()
        .find(|cookie| cookie.starts_with("oauth_state="))
        .context("missing state cookie")?;
    assert_eq!(cookie_pair(&state_cookie), format!("oauth_state={state}"));

    let mismatch = h
        .send(with_cookie(
            request(
                Method::GET,
                "/v1/auth/github/callback?code=good-code&state=forged",
            ),
            &cookie_pair(&state_cookie),
        ))
        .await?;
    assert_eq!(mismatch.status(), StatusCode::BAD_REQUEST);

    let callback = h
        .send(with_cookie(
            request(
                Method::GET,
                &format!("/v1/auth/github/callback?code=good-code&state={state}"),
            ),
            &cookie_pair(&state_cookie),
        ))
        .await?;
    assert_eq!(callback.status(), StatusCode::FOUND);
    let session = set_cookies(&callback)
        .into_iter()
        .find(|cookie| cookie.starts_with("session=") && !cookie.starts_with("session=;"))
        .context("session cookie missing")?;

    let me = h
        .send(with_cookie(
            request(Method::GET, "/v1/users"),
            &cookie_pair(&session),
        ))
        .await?;
    let body = body_json(me).await?;
    assert_eq!(body["user"]["email"], "octo@example.com");
    assert_eq!(body["user"]["name"], "The Octocat");
    assert_eq!(body["user"]["imageUrl"], "https://avatars.example/octo.png");
    Ok(())
}

#[tokio::test]
async fn unknown_routes_are_json_404() -> Result<()> {
    let h = harness(Options::default())?;
    let response = h.send(request(Method::GET, "/v1/tools")).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        body_json(response).await?["error"],
        "the requested resource could not be found"
    );
    Ok(())
}
