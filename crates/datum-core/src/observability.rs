//! Logging setup and span helpers.
//!
//! Registry operations run inside a span named after the operation and the
//! collection they touch, so a JSON log line can be traced back to the
//! collection it changed.

use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON structured logs.
    Json,
    /// Pretty-printed logs.
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(crate::error::Error::InvalidInput(format!(
                "unknown log format '{other}' (expected 'json' or 'pretty')"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call more than once; only the first call installs a subscriber.
///
/// # Environment Variables
///
/// - `RUST_LOG`: log levels (e.g. `info`, `datum_registry=debug`)
///
/// # Example
///
/// ```rust
/// use datum_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                if let Err(err) = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .try_init()
                {
                    tracing::debug!(error = %err, "global subscriber already installed");
                }
            }
            LogFormat::Pretty => {
                if let Err(err) = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .try_init()
                {
                    tracing::debug!(error = %err, "global subscriber already installed");
                }
            }
        }
    });
}

/// Creates a span for a registry operation on one collection.
///
/// # Example
///
/// ```rust
/// use datum_core::observability::registry_span;
///
/// let span = registry_span("certify", "calibs/2024");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn registry_span(operation: &str, collection: &str) -> Span {
    tracing::info_span!("registry", op = operation, collection = collection)
}

/// Creates a span for dimension-universe construction.
#[must_use]
pub fn universe_span(version: u32) -> Span {
    tracing::debug_span!("universe", version = version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn registry_span_can_be_entered() {
        let span = registry_span("associate", "tagged");
        let _guard = span.enter();
        tracing::info!("inside registry span");
    }

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
