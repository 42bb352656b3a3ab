//! Process-wide tracing setup shared by binaries and test harnesses.

use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "BREWSTOCK_LOG_FORMAT";

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    Json,
    /// Human-readable multi-line output for local runs.
    Pretty,
}

/// A `BREWSTOCK_LOG_FORMAT` value that names no known format.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown log format '{0}'")]
pub struct UnknownLogFormat(pub String);

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(UnknownLogFormat(other.to_owned())),
        }
    }
}

/// Initialize tracing with the format named by `BREWSTOCK_LOG_FORMAT`
/// (JSON when unset or unrecognized) and the `RUST_LOG` filter.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    let format = std::env::var(LOG_FORMAT_ENV)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default();
    init_with(format);
}

/// Initialize tracing with an explicit format. Returns false when a global
/// subscriber was already installed.
pub fn init_with(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Pretty => builder.pretty().try_init().is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("text".parse::<LogFormat>(), Ok(LogFormat::Pretty));
    }

    #[test]
    fn unknown_format_is_a_typed_error() {
        let err = " XML ".parse::<LogFormat>().unwrap_err();
        assert_eq!(err, UnknownLogFormat("xml".to_owned()));
        assert_eq!(err.to_string(), "unknown log format 'xml'");
    }

    #[test]
    fn second_init_is_a_no_op() {
        init();
        assert!(!init_with(LogFormat::Pretty));
        tracing::info!(movement_id = 1, "subscriber installed");
    }
}
