//! Subscriber setup for the `tracing` events the residency core emits.
//!
//! # Environment Variables
//!
//! - `DRM_RESIDENCY_LOG`: filter directive (e.g. `debug`, `drm_residency::residency=trace`).
//!   Falls back to `RUST_LOG`, then `warn`.
//! - `DRM_RESIDENCY_LOG_FORMAT`: `human` (default) or `json`.

use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "warn";
const LOG_FILTER_ENV: &str = "DRM_RESIDENCY_LOG";
const LOG_FORMAT_ENV: &str = "DRM_RESIDENCY_LOG_FORMAT";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("invalid log format: {0}")]
    InvalidFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "pretty" => Some(Self::Human),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

fn filter_directive(lookup: &impl Fn(&str) -> Option<String>) -> String {
    lookup(LOG_FILTER_ENV)
        .or_else(|| lookup("RUST_LOG"))
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_owned())
}

/// Install the global subscriber from the process environment.
///
/// Idempotent: if a subscriber is already installed (by an earlier call or
/// by the embedding application) this returns `Ok(())` and changes nothing.
///
/// # Errors
/// An unparsable filter or format value.
pub fn init_logging() -> Result<(), LoggingError> {
    init_logging_with(|key| std::env::var(key).ok())
}

/// [`init_logging`] with an injected variable lookup.
///
/// # Errors
/// An unparsable filter or format value.
pub fn init_logging_with(lookup: impl Fn(&str) -> Option<String>) -> Result<(), LoggingError> {
    let directive = filter_directive(&lookup);
    let filter =
        EnvFilter::try_new(&directive).map_err(|e| LoggingError::InvalidFilter(format!("{directive}: {e}")))?;

    let format = match lookup(LOG_FORMAT_ENV) {
        Some(raw) => LogFormat::parse(&raw).ok_or(LoggingError::InvalidFormat(raw))?,
        None => LogFormat::Human,
    };

    // An already installed subscriber is kept.
    let _ = match format {
        LogFormat::Human => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .try_init(),
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" human "), Some(LogFormat::Human));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn filter_falls_back_to_rust_log_then_default() {
        let only_rust_log = |key: &str| (key == "RUST_LOG").then(|| "debug".to_owned());
        assert_eq!(filter_directive(&only_rust_log), "debug");
        assert_eq!(filter_directive(&|_: &str| None), DEFAULT_FILTER);

        let both = |key: &str| match key {
            LOG_FILTER_ENV => Some("trace".to_owned()),
            _ => Some("info".to_owned()),
        };
        assert_eq!(filter_directive(&both), "trace");
    }

    #[test]
    fn init_is_idempotent() {
        assert!(init_logging_with(|_| None).is_ok());
        assert!(init_logging_with(|_| None).is_ok());
    }

    #[test]
    fn bad_format_is_reported() {
        let lookup = |key: &str| (key == LOG_FORMAT_ENV).then(|| "xml".to_owned());
        assert!(matches!(
            init_logging_with(lookup),
            Err(LoggingError::InvalidFormat(_))
        ));
    }
}
