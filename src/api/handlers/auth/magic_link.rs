//! Passwordless sign-in by email.
//!
//! Flow Overview:
//! 1) `POST /v1/auth/magic-link` finds or creates the account and emails a link
//!    carrying an encrypted `{email, exp}` claim set.
//! 2) `GET /v1/auth/magic-link/:token` decrypts the claims, checks expiry, issues a
//!    session, sets the cookie, and redirects to the client.
//!
//! Links are stateless and may be redeemed more than once until they expire.

use axum::{
    extract::{Extension, Path},
    http::{
        header::{LOCATION, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::IntoResponse,
    Json,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};
use utoipa::ToSchema;

use super::{
    codec::{Claims, SignedTokenCodec, TokenError},
    identity::Identity,
    mailer::EmailMessage,
    session::SCOPE_AUTHENTICATION,
    state::AuthState,
    storage::{bounded, find_or_create_user, NewUser},
    utils::{name_from_email, normalize_email, valid_email},
};
use crate::api::error::{ApiError, MSG_INVALID_SESSION};

/// Codec name bound into every magic-link token.
pub const MAGIC_LINK_TOKEN_NAME: &str = "magic-link";

const CLAIM_EMAIL: &str = "email";
const CLAIM_EXPIRY: &str = "exp";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MagicLinkClaims {
    pub email: String,
    pub expiry: DateTime<Utc>,
}

impl MagicLinkClaims {
    /// # Errors
    /// Returns an error if `ttl` does not fit a timestamp.
    pub fn new(email: String, now: DateTime<Utc>, ttl: Duration) -> Result<Self> {
        let ttl = chrono::Duration::from_std(ttl).context("invalid magic link ttl")?;
        Ok(Self {
            email,
            expiry: now + ttl,
        })
    }

    /// # Errors
    /// Returns an error if encryption fails.
    pub fn encode(&self, codec: &SignedTokenCodec) -> Result<String> {
        let mut claims = Claims::new();
        claims.insert(CLAIM_EMAIL.to_string(), self.email.clone());
        claims.insert(
            CLAIM_EXPIRY.to_string(),
            self.expiry.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        codec.encode(&claims)
    }

    /// Decode and check expiry.
    ///
    /// # Errors
    /// `InvalidToken` for tampered or malformed tokens, `TokenExpired` once
    /// `now` reaches the expiry.
    pub fn decode(
        codec: &SignedTokenCodec,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, TokenError> {
        let claims = codec.decode_required(token, &[CLAIM_EMAIL, CLAIM_EXPIRY])?;
        let expiry = claims
            .get(CLAIM_EXPIRY)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|expiry| expiry.with_timezone(&Utc))
            .ok_or(TokenError::InvalidToken)?;
        if now >= expiry {
            return Err(TokenError::TokenExpired);
        }
        let email = claims
            .get(CLAIM_EMAIL)
            .cloned()
            .ok_or(TokenError::InvalidToken)?;
        Ok(Self { email, expiry })
    }
}

#[derive(Deserialize, ToSchema)]
pub struct MagicLinkRequest {
    email: String,
}

/// Email a sign-in link.
#[utoipa::path(
    post,
    path = "/v1/auth/magic-link",
    request_body = MagicLinkRequest,
    responses(
        (status = 201, description = "Link sent", body = super::MessageResponse),
        (status = 400, description = "Invalid email or already signed in", body = super::ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn request_magic_link(
    auth_state: Extension<Arc<AuthState>>,
    identity: Identity,
    payload: Option<Json<MagicLinkRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    if !identity.is_anonymous() {
        return Err(ApiError::InvalidInput(
            "you are already signed in".to_string(),
        ));
    }
    let Some(Json(request)) = payload else {
        return Err(ApiError::InvalidInput("invalid request body".to_string()));
    };
    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return Err(ApiError::InvalidInput("invalid email address".to_string()));
    }

    let config = auth_state.config();
    let user = find_or_create_user(
        auth_state.store(),
        NewUser {
            name: name_from_email(&email),
            email: email.clone(),
            image_url: None,
        },
        config.store_timeout(),
    )
    .await?;

    let claims = MagicLinkClaims::new(user.email.clone(), Utc::now(), config.magic_link_ttl())?;
    let token = claims.encode(auth_state.codec())?;
    let link = format!("{}/v1/auth/magic-link/{token}", config.api_base_url());
    let message = EmailMessage::magic_link(&user.email, &link, config.magic_link_ttl().as_secs() / 60);
    auth_state
        .mailer()
        .send(&message)
        .await
        .context("failed to send magic link email")?;

    info!(user_id = user.id, "magic link sent");
    Ok((StatusCode::CREATED, Json(json!({ "message": "success" }))))
}

/// Redeem a sign-in link.
#[utoipa::path(
    get,
    path = "/v1/auth/magic-link/{token}",
    params(("token" = String, Path, description = "Token from the emailed link")),
    responses(
        (status = 302, description = "Signed in; redirects to the client"),
        (status = 400, description = "Already signed in", body = super::ErrorResponse),
        (status = 401, description = "Invalid or expired link", body = super::ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn redeem_magic_link(
    auth_state: Extension<Arc<AuthState>>,
    identity: Identity,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !identity.is_anonymous() {
        return Err(ApiError::InvalidInput(
            "you are already signed in".to_string(),
        ));
    }

    let now = Utc::now();
    let claims = match MagicLinkClaims::decode(auth_state.codec(), &token, now) {
        Ok(claims) => claims,
        Err(err) => {
            debug!("rejected magic link: {err}");
            return Err(auth_state.cookies().unauthenticated(MSG_INVALID_SESSION));
        }
    };

    let config = auth_state.config();
    let user = bounded(
        config.store_timeout(),
        "find user",
        auth_state.store().find_user(None, Some(&claims.email)),
    )
    .await?
    .ok_or_else(|| auth_state.cookies().unauthenticated(MSG_INVALID_SESSION))?;

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

    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, cookie);
    headers.insert(LOCATION, location);
    info!(user_id = user.id, "signed in with magic link");
    Ok((StatusCode::FOUND, headers))
}
