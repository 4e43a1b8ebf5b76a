//! Auth state and configuration shared by the gateway and auth handlers.

use anyhow::Result;
use std::{fmt, sync::Arc, time::Duration};

use super::{
    codec::SignedTokenCodec,
    cookie::CookiePolicy,
    mailer::Mailer,
    oauth::OAuthProvider,
    rate_limit::RateLimiter,
    session::{SessionTokenStore, DEFAULT_STORE_TIMEOUT},
    storage::Store,
};

const DEFAULT_SESSION_TTL_SECONDS: u64 = 24 * 60 * 60;
const DEFAULT_MAGIC_LINK_TTL_SECONDS: u64 = 60 * 60;
const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";
const DEFAULT_COOKIE_PATH: &str = "/v1";

#[derive(Clone, Debug)]
pub struct AuthConfig {
    client_address: String,
    api_base_url: String,
    session_ttl_seconds: u64,
    magic_link_ttl_seconds: u64,
    store_timeout: Duration,
    cookie_path: String,
}

impl AuthConfig {
    /// `client_address` is the browser origin allowed by CORS and the post-login
    /// redirect target.
    #[must_use]
    pub fn new(client_address: String) -> Self {
        Self {
            client_address: client_address.trim_end_matches('/').to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            magic_link_ttl_seconds: DEFAULT_MAGIC_LINK_TTL_SECONDS,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            cookie_path: DEFAULT_COOKIE_PATH.to_string(),
        }
    }

    #[must_use]
    pub fn with_api_base_url(mut self, url: String) -> Self {
        self.api_base_url = url.trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: u64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_magic_link_ttl_seconds(mut self, seconds: u64) -> Self {
        self.magic_link_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_cookie_path(mut self, path: String) -> Self {
        self.cookie_path = path;
        self
    }

    #[must_use]
    pub fn client_address(&self) -> &str {
        &self.client_address
    }

    #[must_use]
    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }

    #[must_use]
    pub fn magic_link_ttl(&self) -> Duration {
        Duration::from_secs(self.magic_link_ttl_seconds)
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    #[must_use]
    pub fn cookie_path(&self) -> &str {
        &self.cookie_path
    }

    /// Cookies are only marked secure when the API or the client is served over HTTPS.
    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.api_base_url.starts_with("https://") || self.client_address.starts_with("https://")
    }
}

pub struct AuthState {
    config: AuthConfig,
    codec: SignedTokenCodec,
    store: Arc<dyn Store>,
    sessions: SessionTokenStore,
    cookies: CookiePolicy,
    mailer: Arc<dyn Mailer>,
    oauth: Option<Arc<dyn OAuthProvider>>,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthState")
            .field("config", &self.config)
            .field("codec", &self.codec)
            .field("cookies", &self.cookies)
            .field("oauth", &self.oauth.is_some())
            .field("rate_limited", &self.rate_limiter.is_some())
            .finish_non_exhaustive()
    }
}

impl AuthState {
    /// # Errors
    /// Returns an error if the configured cookie path is invalid.
    pub fn new(
        config: AuthConfig,
        codec: SignedTokenCodec,
        store: Arc<dyn Store>,
        mailer: Arc<dyn Mailer>,
    ) -> Result<Self> {
        let cookies = CookiePolicy::new(config.cookie_path(), config.cookie_secure())?;
        let sessions = SessionTokenStore::new(store.clone(), config.store_timeout());
        Ok(Self {
            config,
            codec,
            store,
            sessions,
            cookies,
            mailer,
            oauth: None,
            rate_limiter: None,
        })
    }

    #[must_use]
    pub fn with_oauth(mut self, provider: Arc<dyn OAuthProvider>) -> Self {
        self.oauth = Some(provider);
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn codec(&self) -> &SignedTokenCodec {
        &self.codec
    }

    #[must_use]
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionTokenStore {
        &self.sessions
    }

    #[must_use]
    pub fn cookies(&self) -> &CookiePolicy {
        &self.cookies
    }

    #[must_use]
    pub fn mailer(&self) -> &dyn Mailer {
        self.mailer.as_ref()
    }

    #[must_use]
    pub fn oauth(&self) -> Option<&dyn OAuthProvider> {
        self.oauth.as_deref()
    }

    /// `None` when rate limiting is disabled.
    #[must_use]
    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }
}
