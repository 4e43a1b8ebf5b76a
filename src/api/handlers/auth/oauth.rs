//! GitHub sign-in.
//!
//! Flow Overview:
//! 1) `GET /v1/auth/github/login` stores a random `state` in a short-lived cookie
//!    and redirects to GitHub's consent page.
//! 2) `GET /v1/auth/github/callback` checks the returned `state` against the cookie,
//!    exchanges the code for a profile, finds or creates the account, and issues a
//!    session exactly like a magic link would.
//!
//! When no client id/secret is configured both routes answer `404`.

use axum::{
    extract::{Extension, Query},
    http::{
        header::{LOCATION, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::IntoResponse,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, info_span, Instrument};
use url::Url;

use super::{
    cookie::{extract_cookie, OAUTH_STATE_COOKIE_NAME},
    identity::Identity,
    session::SCOPE_AUTHENTICATION,
    state::AuthState,
    storage::{find_or_create_user, NewUser},
    utils::{constant_time_eq, generate_oauth_state, normalize_email},
};
use crate::api::error::ApiError;

const GITHUB_AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const GITHUB_API_URL: &str = "https://api.github.com";
const GITHUB_SCOPE: &str = "user:email";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Cookie path shared by the login and callback routes.
pub const OAUTH_COOKIE_PATH: &str = "/v1/auth/github";
const OAUTH_STATE_TTL_SECONDS: i64 = 10 * 60;

/// What the provider tells us about the account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OAuthProfile {
    pub email: String,
    pub display_name: String,
    pub avatar_url: String,
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Consent URL embedding `state`.
    ///
    /// # Errors
    /// Returns an error if the URL cannot be built.
    fn authorize_url(&self, state: &str) -> Result<Url>;

    /// Exchange an authorization code for the account profile.
    async fn fetch_profile(&self, code: &str) -> Result<OAuthProfile>;
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct GithubUser {
    login: String,
    name: Option<String>,
    email: Option<String>,
    #[serde(default)]
    avatar_url: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct GithubEmail {
    pub email: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub verified: bool,
}

/// The account's primary address, if GitHub reports one.
#[must_use]
pub fn select_primary_email(emails: &[GithubEmail]) -> Option<&str> {
    emails
        .iter()
        .find(|entry| entry.primary)
        .map(|entry| entry.email.as_str())
}

pub struct GithubOAuth {
    client: reqwest::Client,
    client_id: String,
    client_secret: SecretString,
    redirect_url: String,
}

impl std::fmt::Debug for GithubOAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubOAuth")
            .field("client_id", &self.client_id)
            .field("redirect_url", &self.redirect_url)
            .finish_non_exhaustive()
    }
}

impl GithubOAuth {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(client_id: String, client_secret: SecretString, api_base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build OAuth client")?;
        Ok(Self {
            client,
            client_id,
            client_secret,
            redirect_url: format!(
                "{}/v1/auth/github/callback",
                api_base_url.trim_end_matches('/')
            ),
        })
    }

    async fn exchange_code(&self, code: &str) -> Result<String> {
        let span = info_span!("oauth.exchange", provider = "github");
        let response: AccessTokenResponse = self
            .client
            .post(GITHUB_TOKEN_URL)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("code", code),
                ("redirect_uri", self.redirect_url.as_str()),
            ])
            .send()
            .instrument(span)
            .await
            .context("failed to reach GitHub token endpoint")?
            .error_for_status()
            .context("GitHub token endpoint failed")?
            .json()
            .await
            .context("invalid GitHub token response")?;

        match (response.access_token, response.error) {
            (Some(token), _) if !token.is_empty() => Ok(token),
            (_, Some(error)) => Err(anyhow!("GitHub rejected the code: {error}")),
            _ => Err(anyhow!("GitHub returned no access token")),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, token: &str, path: &str) -> Result<T> {
        let span = info_span!("oauth.api", provider = "github", path);
        self.client
            .get(format!("{GITHUB_API_URL}{path}"))
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .instrument(span)
            .await
            .with_context(|| format!("failed to reach GitHub {path}"))?
            .error_for_status()
            .with_context(|| format!("GitHub {path} failed"))?
            .json()
            .await
            .with_context(|| format!("invalid GitHub {path} response"))
    }
}

#[async_trait]
impl OAuthProvider for GithubOAuth {
    fn authorize_url(&self, state: &str) -> Result<Url> {
        Url::parse_with_params(
            GITHUB_AUTHORIZE_URL,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_url.as_str()),
                ("scope", GITHUB_SCOPE),
                ("state", state),
            ],
        )
        .context("failed to build GitHub authorize URL")
    }

    async fn fetch_profile(&self, code: &str) -> Result<OAuthProfile> {
        let token = self.exchange_code(code).await?;
        let user: GithubUser = self.get(&token, "/user").await?;

        // Private addresses are omitted from /user; fall back to the primary one.
        let email = match user.email.filter(|email| !email.is_empty()) {
            Some(email) => email,
            None => {
                let emails: Vec<GithubEmail> = self.get(&token, "/user/emails").await?;
                select_primary_email(&emails)
                    .map(ToString::to_string)
                    .ok_or_else(|| anyhow!("GitHub account has no primary email"))?
            }
        };

        Ok(OAuthProfile {
            email,
            display_name: user.name.filter(|name| !name.is_empty()).unwrap_or(user.login),
            avatar_url: user.avatar_url,
        })
    }
}

/// Start GitHub sign-in.
#[utoipa::path(
    get,
    path = "/v1/auth/github/login",
    responses(
        (status = 307, description = "Redirect to GitHub"),
        (status = 400, description = "Already signed in", body = super::ErrorResponse),
        (status = 404, description = "GitHub sign-in not configured", body = super::ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn github_login(
    auth_state: Extension<Arc<AuthState>>,
    identity: Identity,
) -> Result<impl IntoResponse, ApiError> {
    let provider = auth_state.oauth().ok_or(ApiError::NotFound)?;
    if !identity.is_anonymous() {
        return Err(ApiError::InvalidInput(
            "you are already signed in".to_string(),
        ));
    }

    let state = generate_oauth_state()?;
    let url = provider.authorize_url(&state)?;
    let cookie = auth_state
        .cookies()
        .oauth_state(&state, OAUTH_COOKIE_PATH, OAUTH_STATE_TTL_SECONDS, Utc::now())
        .map_err(|err| anyhow!("failed to build state cookie: {err}"))?;
    let location =
        HeaderValue::from_str(url.as_str()).map_err(|err| anyhow!("invalid authorize URL: {err}"))?;

    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, cookie);
    headers.insert(LOCATION, location);
    Ok((StatusCode::TEMPORARY_REDIRECT, headers))
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
}

/// Finish GitHub sign-in.
#[utoipa::path(
    get,
    path = "/v1/auth/github/callback",
    params(
        ("code" = String, Query, description = "Authorization code"),
        ("state" = String, Query, description = "State issued by the login route"),
    ),
    responses(
        (status = 302, description = "Signed in; redirects to the client"),
        (status = 400, description = "Missing code or state mismatch", body = super::ErrorResponse),
        (status = 404, description = "GitHub sign-in not configured", body = super::ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn github_callback(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
    identity: Identity,
    Query(query): Query<CallbackQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let provider = auth_state.oauth().ok_or(ApiError::NotFound)?;
    if !identity.is_anonymous() {
        return Err(ApiError::InvalidInput(
            "you are already signed in".to_string(),
        ));
    }

    let expected = extract_cookie(&headers, OAUTH_STATE_COOKIE_NAME);
    let state_ok = match (expected.as_deref(), query.state.as_deref()) {
        (Some(expected), Some(received)) => constant_time_eq(expected.as_bytes(), received.as_bytes()),
        _ => false,
    };
    if !state_ok {
        debug!("oauth state mismatch");
        return Err(ApiError::InvalidInput("invalid oauth state".to_string()));
    }
    let Some(code) = query.code.filter(|code| !code.is_empty()) else {
        return Err(ApiError::InvalidInput(
            "missing authorization code".to_string(),
        ));
    };

    let profile = provider.fetch_profile(&code).await?;
    let config = auth_state.config();
    let user = find_or_create_user(
        auth_state.store(),
        NewUser {
            name: profile.display_name,
            email: normalize_email(&profile.email),
            image_url: Some(profile.avatar_url),
        },
        config.store_timeout(),
    )
    .await?;

    let now = Utc::now();
    let session = auth_state
        .sessions()
        .issue_at(user.id, config.session_ttl(), SCOPE_AUTHENTICATION, now)
        .await?;
    let cookie = auth_state
        .cookies()
        .session(&session.plaintext, session.expiry, now)
        .map_err(|err| anyhow!("failed to build session cookie: {err}"))?;
    let location = HeaderValue::from_str(config.client_address())
        .map_err(|err| anyhow!("invalid client address: {err}"))?;

    let mut response_headers = HeaderMap::new();
    response_headers.append(SET_COOKIE, cookie);
    if let Some(clear) = auth_state.cookies().clear_oauth_state(OAUTH_COOKIE_PATH) {
        response_headers.append(SET_COOKIE, clear);
    }
    response_headers.insert(LOCATION, location);
    info!(user_id = user.id, "signed in with GitHub");
    Ok((StatusCode::FOUND, response_headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(address: &str, primary: bool) -> GithubEmail {
        GithubEmail {
            email: address.to_string(),
            primary,
            verified: true,
        }
    }

    #[test]
    fn primary_email_is_selected() {
        let emails = vec![email("a@example.com", false), email("b@example.com", true)];
        assert_eq!(select_primary_email(&emails), Some("b@example.com"));
    }

    #[test]
    fn no_primary_email() {
        assert_eq!(select_primary_email(&[email("a@example.com", false)]), None);
        assert_eq!(select_primary_email(&[]), None);
    }

    #[test]
    fn github_emails_deserialize() -> Result<()> {
        let emails: Vec<GithubEmail> = serde_json::from_str(
            r#"[{"email":"a@example.com","primary":true,"verified":true,"visibility":"private"}]"#,
        )?;
        assert_eq!(select_primary_email(&emails), Some("a@example.com"));
        Ok(())
    }

    #[test]
    fn authorize_url_carries_state_and_callback() -> Result<()> {
        let provider = GithubOAuth::new(
            "client-id".to_string(),
            SecretString::from("secret"),
            "https://api.example.com/",
        )?;
        let url = provider.authorize_url("abc123")?;
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        assert!(url.as_str().starts_with(GITHUB_AUTHORIZE_URL));
        assert!(pairs.contains(&("state".to_string(), "abc123".to_string())));
        assert!(pairs.contains(&("client_id".to_string(), "client-id".to_string())));
        assert!(pairs.contains(&(
            "redirect_uri".to_string(),
            "https://api.example.com/v1/auth/github/callback".to_string()
        )));
        Ok(())
    }

    #[test]
    fn debug_hides_secret() -> Result<()> {
        let provider = GithubOAuth::new(
            "client-id".to_string(),
            SecretString::from("top-secret"),
            "http://localhost:8080",
        )?;
        assert!(!format!("{provider:?}").contains("top-secret"));
        Ok(())
    }
}
