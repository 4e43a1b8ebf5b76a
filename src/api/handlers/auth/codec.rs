//! Tamper-evident, self-contained tokens built from a small claim set.
//!
//! Layout: `base64url(nonce (12 bytes) || ChaCha20-Poly1305(json(claims)))`.
//! The token name is bound as associated data, so a token minted for one
//! purpose never decodes under another.
//!
//! The key lives in memory only. Unless a key is configured, restarting the
//! process invalidates every outstanding token.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use std::collections::BTreeMap;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Upper bound on an encoded token; anything larger is rejected before decoding.
const MAX_TOKEN_LEN: usize = 4096;

pub type Claims = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// Malformed input, failed integrity check, or a missing required claim.
    #[error("invalid token")]
    InvalidToken,
    /// Cryptographically valid, but past its embedded expiry.
    #[error("token expired")]
    TokenExpired,
}

pub struct SignedTokenCodec {
    name: &'static str,
    cipher: ChaCha20Poly1305,
}

impl SignedTokenCodec {
    /// Build a codec with a fresh random key held only by this process.
    ///
    /// # Errors
    /// Returns an error if the OS RNG is unavailable.
    pub fn ephemeral(name: &'static str) -> Result<Self> {
        let mut key = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut key)
            .context("failed to generate token codec key")?;
        Self::from_key(name, &key)
    }

    /// Build a codec from a configured 32-byte key.
    ///
    /// # Errors
    /// Returns an error if the key is not exactly 32 bytes.
    pub fn from_key(name: &'static str, key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(anyhow!(
                "token codec key must be {KEY_LEN} bytes, got {}",
                key.len()
            ));
        }
        Ok(Self {
            name,
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        })
    }

    /// Build a codec from a base64 (standard or URL-safe) encoded key.
    ///
    /// # Errors
    /// Returns an error if the value is not valid base64 or not 32 bytes.
    pub fn from_base64_key(name: &'static str, encoded: &str) -> Result<Self> {
        let trimmed = encoded.trim();
        let key = base64::engine::general_purpose::STANDARD
            .decode(trimmed)
            .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
            .context("token codec key is not valid base64")?;
        Self::from_key(name, &key)
    }

    /// Encrypt and authenticate a claim set into a URL-safe string.
    ///
    /// # Errors
    /// Returns an error if serialization, the RNG, or encryption fails.
    pub fn encode(&self, claims: &Claims) -> Result<String> {
        let plaintext = serde_json::to_vec(claims).context("failed to serialize claims")?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .context("failed to generate token nonce")?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &plaintext,
                    aad: self.name.as_bytes(),
                },
            )
            .map_err(|e| anyhow!("token encryption failure: {e}"))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(combined))
    }

    /// Verify and decrypt a token back into its claim set.
    ///
    /// # Errors
    /// Returns `TokenError::InvalidToken` for any malformed or modified input.
    pub fn decode(&self, token: &str) -> Result<Claims, TokenError> {
        if token.is_empty() || token.len() > MAX_TOKEN_LEN {
            return Err(TokenError::InvalidToken);
        }
        let combined = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|_| TokenError::InvalidToken)?;
        if combined.len() < NONCE_LEN + TAG_LEN {
            return Err(TokenError::InvalidToken);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: self.name.as_bytes(),
                },
            )
            .map_err(|_| TokenError::InvalidToken)?;

        serde_json::from_slice(&plaintext).map_err(|_| TokenError::InvalidToken)
    }

    /// Decode and require every listed claim to be present and non-empty.
    ///
    /// # Errors
    /// Returns `TokenError::InvalidToken` when decoding fails or a claim is missing.
    pub fn decode_required(&self, token: &str, required: &[&str]) -> Result<Claims, TokenError> {
        let claims = self.decode(token)?;
        let complete = required
            .iter()
            .all(|claim| claims.get(*claim).is_some_and(|value| !value.is_empty()));
        if complete {
            Ok(claims)
        } else {
            Err(TokenError::InvalidToken)
        }
    }
}

impl std::fmt::Debug for SignedTokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedTokenCodec")
            .field("name", &self.name)
            .field("key", &"***")
            .finish()
    }
}
