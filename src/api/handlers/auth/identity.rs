//! The identity attached to every request by the gateway.
//!
//! Flow Overview: the `authenticate` middleware resolves the session cookie and
//! stores an [`Identity`] in the request extensions. Handlers pull it back out
//! with the [`Identity`] or [`CurrentUser`] extractors.

use anyhow::anyhow;
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use std::sync::Arc;

use super::{state::AuthState, storage::Role, storage::User};
use crate::api::error::{ApiError, MSG_AUTH_REQUIRED};

/// Who is making the request.
///
/// Anonymous is a variant, not an empty user record, so "is anonymous" can
/// never be confused with a user whose fields happen to be blank.
#[derive(Clone, Debug)]
pub enum Identity {
    Anonymous,
    Authenticated(Arc<User>),
}

impl Identity {
    #[must_use]
    pub fn authenticated(user: User) -> Self {
        Self::Authenticated(Arc::new(user))
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }

    #[must_use]
    pub fn user(&self) -> Option<&User> {
        match self {
            Self::Anonymous => None,
            Self::Authenticated(user) => Some(user),
        }
    }
}

/// Why a guard refused a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Denial {
    Unauthenticated,
    Forbidden,
}

/// Authentication first, then authorization.
///
/// # Errors
/// `Denial::Unauthenticated` for anonymous callers.
pub fn require_authenticated(identity: &Identity) -> Result<&User, Denial> {
    identity.user().ok_or(Denial::Unauthenticated)
}

/// # Errors
/// `Denial::Unauthenticated` for anonymous callers, `Denial::Forbidden` for non-admins.
pub fn require_admin(identity: &Identity) -> Result<&User, Denial> {
    let user = require_authenticated(identity)?;
    if user.role == Role::Admin {
        Ok(user)
    } else {
        Err(Denial::Forbidden)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .cloned()
            .ok_or_else(|| ApiError::Internal(anyhow!("identity missing; authenticate layer not installed")))
    }
}

/// Extractor for handlers that need a signed-in user.
#[derive(Clone, Debug)]
pub struct CurrentUser(pub Arc<User>);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Identity::from_request_parts(parts, state).await? {
            Identity::Authenticated(user) => Ok(Self(user)),
            Identity::Anonymous => Err(ApiError::Unauthenticated {
                message: MSG_AUTH_REQUIRED,
                clear_cookie: parts
                    .extensions
                    .get::<Arc<AuthState>>()
                    .and_then(|auth| auth.cookies().clear()),
            }),
        }
    }
}
