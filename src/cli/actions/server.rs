use crate::api::{
    self,
    handlers::auth::{
        magic_link::MAGIC_LINK_TOKEN_NAME, AuthConfig, AuthState, GithubOAuth, LogMailer, Mailer,
        PgStore, RateLimitConfig, RateLimiter, ResendMailer, SignedTokenCodec, Store,
    },
};
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: SecretString,
    pub client_address: String,
    pub api_base_url: String,
    pub session_ttl_seconds: u64,
    pub magic_link_ttl_seconds: u64,
    pub magic_link_key: Option<SecretString>,
    pub resend_api_key: Option<SecretString>,
    pub email_from: String,
    pub github_client_id: Option<String>,
    pub github_client_secret: Option<SecretString>,
    pub rate_limit_rps: f64,
    pub rate_limit_burst: u32,
    pub rate_limit_disabled: bool,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable, a key is malformed, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(args.dsn.expose_secret())
        .await
        .context("Failed to connect to database")?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));

    let codec = match &args.magic_link_key {
        Some(key) => SignedTokenCodec::from_base64_key(MAGIC_LINK_TOKEN_NAME, key.expose_secret())
            .context("Invalid magic link key")?,
        None => {
            warn!("No magic link key configured; links will not survive a restart");
            SignedTokenCodec::ephemeral(MAGIC_LINK_TOKEN_NAME)?
        }
    };

    let mailer: Arc<dyn Mailer> = match args.resend_api_key {
        Some(key) => Arc::new(ResendMailer::new(key, args.email_from.clone())?),
        None => {
            warn!("No Resend API key configured; emails will only be logged");
            Arc::new(LogMailer)
        }
    };

    let config = AuthConfig::new(args.client_address.clone())
        .with_api_base_url(args.api_base_url.clone())
        .with_session_ttl_seconds(args.session_ttl_seconds)
        .with_magic_link_ttl_seconds(args.magic_link_ttl_seconds);
    let mut auth_state = AuthState::new(config, codec, store, mailer)?;

    match (args.github_client_id, args.github_client_secret) {
        (Some(client_id), Some(client_secret)) => {
            let provider = GithubOAuth::new(client_id, client_secret, &args.api_base_url)?;
            auth_state = auth_state.with_oauth(Arc::new(provider));
        }
        _ => info!("GitHub sign-in disabled"),
    }

    let reaper = if args.rate_limit_disabled {
        warn!("Rate limiting disabled");
        None
    } else {
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::new()
                .with_rate_per_second(args.rate_limit_rps)
                .with_burst(args.rate_limit_burst),
        ));
        let handle = limiter.spawn_reaper();
        auth_state = auth_state.with_rate_limiter(limiter);
        Some(handle)
    };

    api::new(args.port, Arc::new(auth_state), reaper).await
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("dsn", redact_dsn(args.dsn.expose_secret())),
        ("client_address", args.client_address.clone()),
        ("api_base_url", args.api_base_url.clone()),
        ("session_ttl_seconds", args.session_ttl_seconds.to_string()),
        (
            "magic_link_ttl_seconds",
            args.magic_link_ttl_seconds.to_string(),
        ),
        ("magic_link_key_set", args.magic_link_key.is_some().to_string()),
        ("resend_api_key_set", args.resend_api_key.is_some().to_string()),
        ("email_from", args.email_from.clone()),
        (
            "github_client_id",
            args.github_client_id
                .clone()
                .unwrap_or_else(|| "n/a".to_string()),
        ),
        (
            "rate_limit",
            if args.rate_limit_disabled {
                "disabled".to_string()
            } else {
                format!("{}/s burst {}", args.rate_limit_rps, args.rate_limit_burst)
            },
        ),
    ];
    log_entries("Startup configuration", &entries);
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() && parsed.set_password(Some("REDACTED")).is_err() {
                return "invalid-dsn".to_string();
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    info!("{}", format_entries(title, entries));
}

fn format_entries(title: &str, entries: &[(&str, String)]) -> String {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let header = format!(
        "wdt {} - {}\n\n{title}:",
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    entries.iter().fold(header, |mut message, (key, value)| {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        message.push_str(&format!("\n  {key}:{padding} {value}"));
        message
    })
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    if trimmed.len() > 7 {
        trimmed[..7].to_string()
    } else {
        trimmed.to_string()
    }
}
