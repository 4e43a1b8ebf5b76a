//! Email and token helpers shared by the sign-in flows and the gateway.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

const SESSION_TOKEN_BYTES: usize = 32;
const OAUTH_STATE_BYTES: usize = 16;

/// Length of a session token once rendered as unpadded URL-safe base64.
pub(crate) const SESSION_TOKEN_LEN: usize = 43;

static EMAIL_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// `local@domain.tld` with no whitespace; expects normalized input.
pub(crate) fn valid_email(email: &str) -> bool {
    EMAIL_PATTERN
        .get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok())
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(email))
}

/// Display name for accounts created from a bare address.
pub(crate) fn name_from_email(email: &str) -> String {
    email.split('@').next().unwrap_or_default().to_string()
}

fn random_token<const N: usize>(purpose: &str) -> Result<String> {
    let mut bytes = [0u8; N];
    OsRng
        .try_fill_bytes(&mut bytes)
        .with_context(|| format!("failed to generate {purpose}"))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Plaintext for the `session` cookie. Only its hash is ever stored.
pub(crate) fn generate_session_token() -> Result<String> {
    random_token::<SESSION_TOKEN_BYTES>("session token")
}

/// Random value for the OAuth `state` round trip.
pub(crate) fn generate_oauth_state() -> Result<String> {
    random_token::<OAUTH_STATE_BYTES>("oauth state")
}

/// `SHA-256(token)`, the only form a session token is persisted in.
pub(crate) fn hash_session_token(token: &str) -> Vec<u8> {
    Sha256::digest(token.as_bytes()).to_vec()
}

/// Cheap shape check run before any store lookup.
pub(crate) fn valid_session_token_shape(token: &str) -> bool {
    token.len() == SESSION_TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Constant-time byte comparison for hashes and state values.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}
