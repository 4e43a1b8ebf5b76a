use crate::cli::{actions::Action, commands, dispatch, telemetry};
use anyhow::Result;

/// Map verbosity count to tracing level
const fn get_verbosity_level(verbosity: u8) -> Option<tracing::Level> {
    match verbosity {
        0 => None,
        1 => Some(tracing::Level::WARN),
        2 => Some(tracing::Level::INFO),
        3 => Some(tracing::Level::DEBUG),
        _ => Some(tracing::Level::TRACE),
    }
}

/// Main entry point for the CLI - builds and returns the Action
///
/// # Errors
///
/// Returns an error if `.env` is unreadable, or if argument parsing, telemetry
/// initialization, or action dispatch fails
pub fn start() -> Result<Action> {
    // A missing .env is fine; a malformed one is not.
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            return Err(err.into());
        }
    }

    let matches = commands::new().get_matches();

    let verbosity_level = get_verbosity_level(
        matches
            .get_one::<u8>(commands::logging::ARG_VERBOSITY)
            .copied()
            .unwrap_or(0),
    );

    let log_format = if matches.get_flag(commands::logging::ARG_LOG_JSON) {
        telemetry::LogFormat::Json
    } else {
        telemetry::LogFormat::Text
    };

    telemetry::init(verbosity_level, log_format)?;

    dispatch::handler(&matches)
}
