//! Tracing subscriber setup.

use std::io::{self, IsTerminal};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(String),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Install the global subscriber. The filter comes from `RUST_LOG`, falling
/// back to `info`.
///
/// # Errors
///
/// Fails when the filter does not parse or a global subscriber is already set.
pub fn init_tracing(format: LogFormat) -> Result<(), TelemetryError> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => EnvFilter::try_new(directives).map_err(|e| TelemetryError::Filter(e.to_string()))?,
        Err(_) => EnvFilter::new("info"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr);

    match format {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .try_init()
            .map_err(|e| TelemetryError::Subscriber(e.to_string())),
        LogFormat::Pretty => builder
            .with_ansi(io::stderr().is_terminal())
            .try_init()
            .map_err(|e| TelemetryError::Subscriber(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_fails_cleanly() {
        let _ = init_tracing(LogFormat::Pretty);
        assert!(matches!(
            init_tracing(LogFormat::Json),
            Err(TelemetryError::Subscriber(_))
        ));
    }

    #[test]
    fn log_format_parses_from_config() {
        let format: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, LogFormat::Json);
    }
}
