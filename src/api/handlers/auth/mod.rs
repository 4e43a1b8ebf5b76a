//! Gateway, sessions, and sign-in handlers.
//!
//! This module owns everything between the socket and a route handler: rate
//! limiting, session resolution, authorization guards, and the two ways of
//! minting a session (magic link and GitHub OAuth).
//!
//! ## Session Tokens
//!
//! Sessions are opaque 32-byte random tokens delivered in the `session` cookie.
//! Only `SHA-256(token)` is stored, so a database leak does not leak sessions.
//! Sessions last 24 hours by default and are revoked all at once on logout.
//!
//! ## Magic Links
//!
//! Magic-link tokens are not stored. They are `ChaCha20-Poly1305` sealed claim
//! sets (`email`, `exp`) so any modification is rejected. The key is random per
//! process unless `WDT_MAGIC_LINK_KEY` is set, which means links do not survive
//! a restart by default.
//!
//! ## Rate Limiting
//!
//! - **Bucket:** 2 tokens per second, burst of 4, keyed by client IP.
//! - **Reaper:** every 60 seconds, clients idle for more than 3 minutes are dropped.

pub mod codec;
pub mod cookie;
pub mod gateway;
pub mod identity;
pub mod magic_link;
pub mod mailer;
pub mod oauth;
pub mod rate_limit;
pub mod session;
pub mod state;
pub mod storage;
mod utils;

use serde::Serialize;
use utoipa::ToSchema;

pub use codec::{SignedTokenCodec, TokenError};
pub use identity::{CurrentUser, Identity};
pub use mailer::{EmailMessage, LogMailer, Mailer, ResendMailer};
pub use oauth::{GithubOAuth, OAuthProfile, OAuthProvider};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use session::{SessionError, SessionTokenStore, SCOPE_AUTHENTICATION};
pub use state::{AuthConfig, AuthState};
pub use storage::{MemoryStore, PgStore, Role, Store, User};

#[derive(Serialize, ToSchema)]
pub struct MessageResponse {
    message: String,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    error: String,
}
