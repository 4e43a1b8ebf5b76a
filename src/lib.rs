//! # wdt (Web Dev Tools API)
//!
//! `wdt` is the backend for the Web Dev Tools directory. The directory CRUD
//! lives behind narrow collaborators; this crate owns the request gateway that
//! every route goes through.
//!
//! ## Gateway
//!
//! Each inbound request is classified before a handler runs:
//!
//! 1. **Rate limit:** a per-client token bucket keyed by source IP (2 req/s, burst 4).
//!    Idle clients are evicted by a background reaper.
//! 2. **CORS:** the configured client address is the only allowed origin. Preflights
//!    are answered immediately.
//! 3. **Identity:** the `session` cookie is resolved into an authenticated user, or the
//!    request continues as anonymous. Unknown or malformed cookies are rejected with
//!    `401` and cleared.
//!
//! ## Authentication
//!
//! Authentication is passwordless. A magic link carries an encrypted, expiring claim
//! set; redeeming it mints an opaque session token. Only the SHA-256 of a session
//! token is persisted. GitHub OAuth is supported as a second way to mint a session.

pub mod api;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
