//! Session and OAuth-state cookies.

use anyhow::{anyhow, Result};
use axum::http::{
    header::{InvalidHeaderValue, COOKIE},
    HeaderMap, HeaderValue,
};
use chrono::{DateTime, Utc};

use crate::api::error::ApiError;

pub const SESSION_COOKIE_NAME: &str = "session";
pub const OAUTH_STATE_COOKIE_NAME: &str = "oauth_state";

const EXPIRED: &str = "Thu, 01 Jan 1970 00:00:00 GMT";
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Attributes shared by every cookie the API sets.
#[derive(Clone, Debug)]
pub struct CookiePolicy {
    path: String,
    secure: bool,
}

impl CookiePolicy {
    /// # Errors
    /// Returns an error if `path` is not an absolute, header-safe path.
    pub fn new(path: &str, secure: bool) -> Result<Self> {
        let valid = path.starts_with('/')
            && path
                .bytes()
                .all(|b| b.is_ascii_graphic() && b != b';' && b != b',');
        if !valid {
            return Err(anyhow!("invalid cookie path: {path}"));
        }
        Ok(Self {
            path: path.to_string(),
            secure,
        })
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn secure(&self) -> bool {
        self.secure
    }

    /// Session cookie valid until `expiry`.
    ///
    /// # Errors
    /// Returns an error if the token contains bytes not allowed in a header.
    pub fn session(
        &self,
        token: &str,
        expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<HeaderValue, InvalidHeaderValue> {
        let max_age = (expiry - now).num_seconds().max(0);
        self.build(
            SESSION_COOKIE_NAME,
            token,
            &self.path,
            &expiry.format(HTTP_DATE).to_string(),
            max_age,
        )
    }

    /// Cookie that makes the browser drop the session.
    #[must_use]
    pub fn clear(&self) -> Option<HeaderValue> {
        self.build(SESSION_COOKIE_NAME, "", &self.path, EXPIRED, 0).ok()
    }

    /// Short-lived cookie holding the OAuth `state` between login and callback.
    ///
    /// # Errors
    /// Returns an error if the state contains bytes not allowed in a header.
    pub fn oauth_state(
        &self,
        state: &str,
        path: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<HeaderValue, InvalidHeaderValue> {
        let expiry = now + chrono::Duration::seconds(ttl_seconds);
        self.build(
            OAUTH_STATE_COOKIE_NAME,
            state,
            path,
            &expiry.format(HTTP_DATE).to_string(),
            ttl_seconds,
        )
    }

    #[must_use]
    pub fn clear_oauth_state(&self, path: &str) -> Option<HeaderValue> {
        self.build(OAUTH_STATE_COOKIE_NAME, "", path, EXPIRED, 0).ok()
    }

    /// `401` that also clears the session cookie.
    #[must_use]
    pub fn unauthenticated(&self, message: &'static str) -> ApiError {
        ApiError::Unauthenticated {
            message,
            clear_cookie: self.clear(),
        }
    }

    fn build(
        &self,
        name: &str,
        value: &str,
        path: &str,
        expires: &str,
        max_age: i64,
    ) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut cookie = format!(
            "{name}={value}; Path={path}; Expires={expires}; Max-Age={max_age}; HttpOnly; SameSite=Lax"
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie)
    }
}

/// Value of the named cookie across all `Cookie` headers.
///
/// An empty value is treated as absent.
#[must_use]
pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[must_use]
pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    extract_cookie(headers, SESSION_COOKIE_NAME)
}
