//! Opaque session tokens and the logout endpoint.
//!
//! A session token is 32 random bytes, base64url encoded. The plaintext is handed
//! to the client exactly once (in the `session` cookie); only its SHA-256 is stored.

use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::{fmt, sync::Arc, time::Duration};
use tracing::{debug, instrument};

use super::{
    identity::CurrentUser,
    state::AuthState,
    storage::{Store, User},
    utils::{generate_session_token, hash_session_token},
};
use crate::api::error::ApiError;

/// Scope for browser sign-in sessions.
pub const SCOPE_AUTHENTICATION: &str = "authentication";

/// Default bound on every session store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No live session matches; also used for expired tokens.
    #[error("session not found")]
    NotFound,
    #[error("session store timed out")]
    Timeout,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// A freshly issued session.
#[derive(Clone)]
pub struct SessionToken {
    pub plaintext: String,
    pub hash: Vec<u8>,
    pub user_id: i64,
    pub scope: String,
    pub expiry: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("plaintext", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("scope", &self.scope)
            .field("expiry", &self.expiry)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Issues, resolves, and revokes session tokens against a [`Store`].
#[derive(Clone)]
pub struct SessionTokenStore {
    store: Arc<dyn Store>,
    timeout: Duration,
}

impl fmt::Debug for SessionTokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokenStore")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SessionTokenStore {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Mint and persist a new token. Every call produces a fresh token.
    ///
    /// # Errors
    /// `Timeout` when the store exceeds the deadline, `Store` for other failures.
    pub async fn issue(
        &self,
        user_id: i64,
        ttl: Duration,
        scope: &str,
    ) -> Result<SessionToken, SessionError> {
        self.issue_at(user_id, ttl, scope, Utc::now()).await
    }

    /// # Errors
    /// See [`Self::issue`].
    #[instrument(skip(self, ttl, now))]
    pub async fn issue_at(
        &self,
        user_id: i64,
        ttl: Duration,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionToken, SessionError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|err| anyhow!("invalid session ttl: {err}"))?;
        let plaintext = generate_session_token()?;
        let hash = hash_session_token(&plaintext);
        let expiry = now + ttl;

        self.call(
            "insert session",
            self.store.insert_session(&hash, user_id, scope, expiry),
        )
        .await?;
        debug!("issued session");

        Ok(SessionToken {
            plaintext,
            hash,
            user_id,
            scope: scope.to_string(),
            expiry,
            created_at: now,
        })
    }

    /// Resolve a plaintext token to its owner.
    ///
    /// # Errors
    /// `NotFound` when no unexpired token with this scope exists.
    pub async fn resolve(&self, scope: &str, plaintext: &str) -> Result<User, SessionError> {
        self.resolve_at(scope, plaintext, Utc::now()).await
    }

    /// # Errors
    /// See [`Self::resolve`].
    pub async fn resolve_at(
        &self,
        scope: &str,
        plaintext: &str,
        now: DateTime<Utc>,
    ) -> Result<User, SessionError> {
        let hash = hash_session_token(plaintext);
        let record = self
            .call("find session", self.store.find_session(&hash, scope, now))
            .await?
            .ok_or(SessionError::NotFound)?;
        if now >= record.expiry {
            return Err(SessionError::NotFound);
        }
        Ok(record.user)
    }

    /// Delete every token of `scope` owned by `user_id`. Idempotent.
    ///
    /// # Errors
    /// `Timeout` or `Store` when the deletion fails.
    #[instrument(skip(self))]
    pub async fn revoke_all(&self, scope: &str, user_id: i64) -> Result<u64, SessionError> {
        let removed = self
            .call("delete sessions", self.store.delete_sessions(scope, user_id))
            .await?;
        debug!(removed, "revoked sessions");
        Ok(removed)
    }

    async fn call<T, F>(&self, operation: &'static str, call: F) -> Result<T, SessionError>
    where
        F: std::future::Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(|err| SessionError::Store(err.context(operation))),
            Err(_) => {
                debug!(operation, "session store deadline elapsed");
                Err(SessionError::Timeout)
            }
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self::Internal(anyhow!(err))
    }
}

/// Sign out everywhere.
#[utoipa::path(
    delete,
    path = "/v1/auth/logout",
    responses(
        (status = 200, description = "All sessions revoked and cookie cleared", body = super::MessageResponse),
        (status = 401, description = "Not signed in", body = super::ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn logout(
    auth_state: Extension<Arc<AuthState>>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    auth_state
        .sessions()
        .revoke_all(SCOPE_AUTHENTICATION, user.id)
        .await?;

    let mut headers = HeaderMap::new();
    if let Some(cookie) = auth_state.cookies().clear() {
        headers.insert(SET_COOKIE, cookie);
    }
    Ok((
        StatusCode::OK,
        headers,
        Json(json!({ "message": "you have been logged out" })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::auth::{
        storage::{find_or_create_user, MemoryStore, NewUser},
        utils::valid_session_token_shape,
    };
    use anyhow::Result;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    async fn setup() -> Result<(Arc<MemoryStore>, SessionTokenStore, User)> {
        let store = Arc::new(MemoryStore::new());
        let user = find_or_create_user(
            store.as_ref(),
            NewUser {
                name: "alice".to_string(),
                email: "alice@example.com".to_string(),
                image_url: None,
            },
            DEFAULT_STORE_TIMEOUT,
        )
        .await?;
        let sessions = SessionTokenStore::new(store.clone(), DEFAULT_STORE_TIMEOUT);
        Ok((store, sessions, user))
    }

    #[tokio::test]
    async fn issue_then_resolve() -> Result<()> {
        let (_store, sessions, user) = setup().await?;
        let token = sessions.issue(user.id, DAY, SCOPE_AUTHENTICATION).await?;
        assert!(valid_session_token_shape(&token.plaintext));
        assert_eq!(token.expiry - token.created_at, chrono::Duration::hours(24));

        let resolved = sessions
            .resolve(SCOPE_AUTHENTICATION, &token.plaintext)
            .await?;
        assert_eq!(resolved.id, user.id);
        Ok(())
    }

    #[tokio::test]
    async fn only_the_hash_is_persisted() -> Result<()> {
        let (store, sessions, user) = setup().await?;
        let token = sessions.issue(user.id, DAY, SCOPE_AUTHENTICATION).await?;
        let hashes = store.stored_hashes().await;
        assert_eq!(hashes, vec![hash_session_token(&token.plaintext)]);
        assert_ne!(hashes[0], token.plaintext.as_bytes());
        Ok(())
    }

    #[tokio::test]
    async fn issue_never_reuses_tokens() -> Result<()> {
        let (store, sessions, user) = setup().await?;
        let first = sessions.issue(user.id, DAY, SCOPE_AUTHENTICATION).await?;
        let second = sessions.issue(user.id, DAY, SCOPE_AUTHENTICATION).await?;
        assert_ne!(first.plaintext, second.plaintext);
        assert_eq!(store.session_count(user.id).await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn resolve_rejects_expired_unknown_and_wrong_scope() -> Result<()> {
        let (_store, sessions, user) = setup().await?;
        let now = Utc::now();
        let token = sessions
            .issue_at(user.id, DAY, SCOPE_AUTHENTICATION, now)
            .await?;

        let at_expiry = sessions
            .resolve_at(SCOPE_AUTHENTICATION, &token.plaintext, token.expiry)
            .await;
        assert!(matches!(at_expiry, Err(SessionError::NotFound)));

        let unknown = sessions
            .resolve(SCOPE_AUTHENTICATION, "A".repeat(43).as_str())
            .await;
        assert!(matches!(unknown, Err(SessionError::NotFound)));

        let scoped = sessions.resolve("activation", &token.plaintext).await;
        assert!(matches!(scoped, Err(SessionError::NotFound)));
        Ok(())
    }

    #[tokio::test]
    async fn revoke_all_is_idempotent() -> Result<()> {
        let (_store, sessions, user) = setup().await?;
        let first = sessions.issue(user.id, DAY, SCOPE_AUTHENTICATION).await?;
        let second = sessions.issue(user.id, DAY, SCOPE_AUTHENTICATION).await?;

        assert_eq!(sessions.revoke_all(SCOPE_AUTHENTICATION, user.id).await?, 2);
        assert_eq!(sessions.revoke_all(SCOPE_AUTHENTICATION, user.id).await?, 0);
        for token in [first, second] {
            let result = sessions
                .resolve(SCOPE_AUTHENTICATION, &token.plaintext)
                .await;
            assert!(matches!(result, Err(SessionError::NotFound)));
        }
        Ok(())
    }

    #[tokio::test]
    async fn issue_for_missing_user_is_a_store_error() -> Result<()> {
        let (_store, sessions, _user) = setup().await?;
        let result = sessions.issue(999, DAY, SCOPE_AUTHENTICATION).await;
        assert!(matches!(result, Err(SessionError::Store(_))));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out() {
        let store = Arc::new(MemoryStore::new().with_latency(Duration::from_secs(10)));
        let sessions = SessionTokenStore::new(store, DEFAULT_STORE_TIMEOUT);
        let result = sessions
            .resolve(SCOPE_AUTHENTICATION, "A".repeat(43).as_str())
            .await;
        assert!(matches!(result, Err(SessionError::Timeout)));
    }

    #[test]
    fn debug_redacts_plaintext() {
        let now = Utc::now();
        let token = SessionToken {
            plaintext: "secret-token".to_string(),
            hash: vec![1, 2, 3],
            user_id: 1,
            scope: SCOPE_AUTHENTICATION.to_string(),
            expiry: now,
            created_at: now,
        };
        assert!(!format!("{token:?}").contains("secret-token"));
    }
}
