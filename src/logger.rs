//! Logging initialisation via tracing-subscriber.
//!
//! The worker resolves one effective level (CLI `-v` flags > `RUST_LOG` >
//! `[worker].log_level`) and installs a single global subscriber with it.

use std::path::Path;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::error::AppError;

/// Build the filter for `level`.
///
/// With `forced` (a level given on the command line) the explicit level wins
/// and `RUST_LOG` is only consulted when `level` does not parse. Otherwise
/// `RUST_LOG` wins and `level` is the fallback.
fn resolve_filter(level: &str, forced: bool) -> Result<EnvFilter, AppError> {
    if forced {
        return EnvFilter::try_new(level).or_else(|level_err| {
            EnvFilter::try_from_default_env().map_err(|env_err| {
                AppError::Logger(format!(
                    "invalid log level '{level}': {level_err}; RUST_LOG parse failed: {env_err}"
                ))
            })
        });
    }
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| AppError::Logger(format!("invalid log level '{level}': {e}")))
}

/// Install the global subscriber. Logs go to `log_file` (append mode) when
/// given, stderr otherwise. Fails if a subscriber is already installed.
pub fn init(level: &str, forced: bool, log_file: Option<&Path>) -> Result<(), AppError> {
    let filter = resolve_filter(level, forced)?;

    let writer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    AppError::Logger(format!("cannot open log file {}: {e}", path.display()))
                })?;
            BoxMakeWriter::new(file)
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .try_init()
        .map_err(|e| AppError::Logger(format!("failed to set subscriber: {e}")))
}

/// Validate a configured level string before the logger exists.
pub fn parse_level(level: &str) -> Result<LevelFilter, AppError> {
    if level.is_empty() {
        return Err(AppError::Logger("log level must not be empty".into()));
    }
    level
        .parse::<LevelFilter>()
        .map_err(|_| AppError::Logger(format!("unrecognised log level: '{level}'")))
}

/// Map a `-v` count onto a level; `0` keeps the configured level.
pub fn level_for_verbosity(verbosity: u8) -> Option<&'static str> {
    match verbosity {
        0 => None,
        1 => Some("warn"),
        2 => Some("info"),
        3 => Some("debug"),
        _ => Some("trace"),
    }
}
