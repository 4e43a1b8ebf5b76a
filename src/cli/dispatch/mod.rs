use crate::cli::{
    actions::{server::Args, Action},
    commands::{auth::*, ARG_DSN, ARG_PORT},
};
use anyhow::{Context, Result};
use secrecy::SecretString;

/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .map(SecretString::from)
        .context("missing required argument: --dsn")?;
    let client_address = matches
        .get_one::<String>(ARG_CLIENT_ADDRESS)
        .cloned()
        .context("missing required argument: --client-address")?;
    let api_base_url = matches
        .get_one::<String>(ARG_API_BASE_URL)
        .cloned()
        .unwrap_or_else(|| "http://localhost:8080".to_string());
    let email_from = matches
        .get_one::<String>(ARG_EMAIL_FROM)
        .cloned()
        .unwrap_or_else(|| crate::api::handlers::auth::mailer::DEFAULT_EMAIL_FROM.to_string());

    let secret = |id: &str| matches.get_one::<String>(id).cloned().map(SecretString::from);

    Ok(Action::Server(Args {
        port,
        dsn,
        client_address,
        api_base_url,
        session_ttl_seconds: matches
            .get_one::<u64>(ARG_SESSION_TTL_SECONDS)
            .copied()
            .unwrap_or(86_400),
        magic_link_ttl_seconds: matches
            .get_one::<u64>(ARG_MAGIC_LINK_TTL_SECONDS)
            .copied()
            .unwrap_or(3_600),
        magic_link_key: secret(ARG_MAGIC_LINK_KEY),
        resend_api_key: secret(ARG_RESEND_API_KEY),
        email_from,
        github_client_id: matches.get_one::<String>(ARG_GITHUB_CLIENT_ID).cloned(),
        github_client_secret: secret(ARG_GITHUB_CLIENT_SECRET),
        rate_limit_rps: matches
            .get_one::<f64>(ARG_RATE_LIMIT_RPS)
            .copied()
            .unwrap_or(2.0),
        rate_limit_burst: matches
            .get_one::<u32>(ARG_RATE_LIMIT_BURST)
            .copied()
            .unwrap_or(4),
        rate_limit_disabled: matches.get_flag(ARG_RATE_LIMIT_DISABLED),
    }))
}
