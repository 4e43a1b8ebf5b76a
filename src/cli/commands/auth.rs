use clap::{Arg, ArgAction, Command};

pub const ARG_CLIENT_ADDRESS: &str = "client-address";
pub const ARG_API_BASE_URL: &str = "api-base-url";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";
pub const ARG_MAGIC_LINK_TTL_SECONDS: &str = "magic-link-ttl-seconds";
pub const ARG_MAGIC_LINK_KEY: &str = "magic-link-key";
pub const ARG_RESEND_API_KEY: &str = "resend-api-key";
pub const ARG_EMAIL_FROM: &str = "email-from";
pub const ARG_GITHUB_CLIENT_ID: &str = "github-client-id";
pub const ARG_GITHUB_CLIENT_SECRET: &str = "github-client-secret";
pub const ARG_RATE_LIMIT_RPS: &str = "rate-limit-rps";
pub const ARG_RATE_LIMIT_BURST: &str = "rate-limit-burst";
pub const ARG_RATE_LIMIT_DISABLED: &str = "rate-limit-disabled";

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_session_args(command);
    let command = with_email_args(command);
    let command = with_oauth_args(command);
    with_rate_limit_args(command)
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_CLIENT_ADDRESS)
                .long(ARG_CLIENT_ADDRESS)
                .help("Frontend origin: the only CORS origin and the post-login redirect")
                .env("WDT_CLIENT_ADDRESS")
                .required(true),
        )
        .arg(
            Arg::new(ARG_API_BASE_URL)
                .long(ARG_API_BASE_URL)
                .help("Public base URL of this API, used in magic links")
                .env("WDT_API_BASE_URL")
                .default_value("http://localhost:8080"),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Session lifetime in seconds")
                .env("WDT_SESSION_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_MAGIC_LINK_TTL_SECONDS)
                .long(ARG_MAGIC_LINK_TTL_SECONDS)
                .help("Magic link validity in seconds")
                .env("WDT_MAGIC_LINK_TTL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_MAGIC_LINK_KEY)
                .long(ARG_MAGIC_LINK_KEY)
                .help("Base64 32-byte key for magic links (default: random per process)")
                .long_help(
                    "Base64 encoded 32-byte key used to seal magic links. When unset a random key is generated at startup, so links stop working after a restart.",
                )
                .env("WDT_MAGIC_LINK_KEY")
                .hide_env_values(true),
        )
}

fn with_email_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_RESEND_API_KEY)
                .long(ARG_RESEND_API_KEY)
                .help("Resend API key; emails are only logged when unset")
                .env("WDT_RESEND_API_KEY")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_EMAIL_FROM)
                .long(ARG_EMAIL_FROM)
                .help("Sender address for outgoing email")
                .env("WDT_EMAIL_FROM")
                .default_value(crate::api::handlers::auth::mailer::DEFAULT_EMAIL_FROM),
        )
}

fn with_oauth_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_GITHUB_CLIENT_ID)
                .long(ARG_GITHUB_CLIENT_ID)
                .help("GitHub OAuth client id; GitHub sign-in is disabled when unset")
                .env("WDT_GITHUB_CLIENT_ID")
                .requires(ARG_GITHUB_CLIENT_SECRET),
        )
        .arg(
            Arg::new(ARG_GITHUB_CLIENT_SECRET)
                .long(ARG_GITHUB_CLIENT_SECRET)
                .help("GitHub OAuth client secret")
                .env("WDT_GITHUB_CLIENT_SECRET")
                .hide_env_values(true)
                .requires(ARG_GITHUB_CLIENT_ID),
        )
}

fn with_rate_limit_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_RATE_LIMIT_RPS)
                .long(ARG_RATE_LIMIT_RPS)
                .help("Tokens refilled per second for each client")
                .env("WDT_RATE_LIMIT_RPS")
                .default_value("2")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_BURST)
                .long(ARG_RATE_LIMIT_BURST)
                .help("Bucket capacity for each client")
                .env("WDT_RATE_LIMIT_BURST")
                .default_value("4")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_DISABLED)
                .long(ARG_RATE_LIMIT_DISABLED)
                .help("Disable per-client rate limiting")
                .env("WDT_RATE_LIMIT_DISABLED")
                .action(ArgAction::SetTrue),
        )
}
