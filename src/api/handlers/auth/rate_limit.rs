//! Per-client token bucket rate limiting.
//!
//! Flow Overview:
//! 1) Derive a client key from the peer address (port stripped).
//! 2) Lazily create a full bucket on first sight; every call refreshes `last_seen`.
//! 3) A background reaper evicts clients idle longer than the threshold.
//!
//! Scaling: single process, in memory. One lock guards the whole client map;
//! the critical sections are O(1) and never await I/O.

use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::debug;

const DEFAULT_RATE_PER_SECOND: f64 = 2.0;
const DEFAULT_BURST: u32 = 4;
const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(3 * 60);
const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientKeyError {
    #[error("remote address has no port: {0}")]
    MissingPort(String),
    #[error("malformed remote address: {0}")]
    Malformed(String),
}

/// Derive the rate limiting key from a `host:port` peer address.
///
/// A missing or unparsable port means the service sits behind something it
/// was not configured for, so this is an error rather than a fallback.
///
/// # Errors
/// Returns `ClientKeyError` when the address has no port or an invalid host.
pub fn client_key(remote_addr: &str) -> Result<String, ClientKeyError> {
    let trimmed = remote_addr.trim();
    let (host, port) = if let Some(rest) = trimmed.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| ClientKeyError::Malformed(trimmed.to_string()))?;
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| ClientKeyError::MissingPort(trimmed.to_string()))?;
        (host, port)
    } else {
        let (host, port) = trimmed
            .rsplit_once(':')
            .ok_or_else(|| ClientKeyError::MissingPort(trimmed.to_string()))?;
        if host.contains(':') {
            // Bare IPv6 without brackets is ambiguous.
            return Err(ClientKeyError::Malformed(trimmed.to_string()));
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(ClientKeyError::Malformed(trimmed.to_string()));
    }
    if port.parse::<u16>().is_err() {
        return Err(ClientKeyError::MissingPort(trimmed.to_string()));
    }
    Ok(host.to_string())
}

#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    rate_per_second: f64,
    burst: u32,
    idle_threshold: Duration,
    reap_interval: Duration,
}

impl RateLimitConfig {
    /// Default policy: refill 2 tokens/s, burst 4, evict after 3 idle minutes,
    /// reap once a minute.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rate_per_second: DEFAULT_RATE_PER_SECOND,
            burst: DEFAULT_BURST,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            reap_interval: DEFAULT_REAP_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_rate_per_second(mut self, rate: f64) -> Self {
        self.rate_per_second = rate;
        self
    }

    #[must_use]
    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    #[must_use]
    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Clamp values that would make the limiter reject everything or spin.
    #[must_use]
    pub fn normalize(self) -> Self {
        let rate_per_second = if self.rate_per_second.is_finite() && self.rate_per_second > 0.0 {
            self.rate_per_second
        } else {
            DEFAULT_RATE_PER_SECOND
        };
        let reap_interval = if self.reap_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.reap_interval
        };
        Self {
            rate_per_second,
            burst: self.burst.max(1),
            idle_threshold: self.idle_threshold,
            reap_interval,
        }
    }

    #[must_use]
    pub fn rate_per_second(&self) -> f64 {
        self.rate_per_second
    }

    #[must_use]
    pub fn burst(&self) -> u32 {
        self.burst
    }

    #[must_use]
    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }

    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        self.reap_interval
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct ClientEntry {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    clients: Mutex<HashMap<String, ClientEntry>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: config.normalize(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub async fn allow(&self, key: &str) -> RateLimitDecision {
        self.allow_at(key, Instant::now()).await
    }

    /// Consume one token for `key` if available. `last_seen` is refreshed
    /// whether or not the call is allowed.
    pub async fn allow_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let burst = f64::from(self.config.burst);
        let mut clients = self.clients.lock().await;
        let entry = clients.entry(key.to_string()).or_insert(ClientEntry {
            tokens: burst,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.saturating_duration_since(entry.last_refill);
        entry.tokens = (entry.tokens + elapsed.as_secs_f64() * self.config.rate_per_second).min(burst);
        entry.last_refill = now;
        entry.last_seen = now;

        if entry.tokens >= 1.0 {
            entry.tokens -= 1.0;
            RateLimitDecision::Allowed
        } else {
            RateLimitDecision::Limited
        }
    }

    pub async fn touch(&self, key: &str) {
        self.touch_at(key, Instant::now()).await;
    }

    /// Refresh `last_seen` for a known client without consuming a token.
    pub async fn touch_at(&self, key: &str, now: Instant) {
        let mut clients = self.clients.lock().await;
        if let Some(entry) = clients.get_mut(key) {
            entry.last_seen = now;
        }
    }

    /// Evict clients idle for longer than the threshold. Returns how many were removed.
    pub async fn reap_idle_at(&self, now: Instant) -> usize {
        let threshold = self.config.idle_threshold;
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= threshold);
        before - clients.len()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.clients.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    /// Run the idle reaper on a fixed cadence until the handle is aborted.
    #[must_use]
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.config.reap_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = limiter.reap_idle_at(Instant::now()).await;
                if removed > 0 {
                    debug!(removed, "rate limiter evicted idle clients");
                }
            }
        })
    }
}
