//! Logging initialization and span helpers.
//!
//! All depot components log through `tracing`; binaries and test harnesses
//! call [`init_logging`] once at startup.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = crate::Error;

    fn from_str(value: &str) -> crate::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(crate::Error::InvalidInput(format!(
                "log format must be json or pretty (got {other})"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops. Levels come from
/// `RUST_LOG` (e.g. `info`, `depot_catalog=debug`), defaulting to `info`.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .try_init();
            }
            LogFormat::Pretty => {
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .try_init();
            }
        }
    });
}

/// Creates a span for pipeline operations.
///
/// ```rust
/// use depot_core::observability::pipeline_span;
///
/// let span = pipeline_span("catalog.generate", "stable");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn pipeline_span(operation: &str, target: &str) -> Span {
    tracing::info_span!("pipeline", op = operation, target = target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_succeeds() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn test_pipeline_span_creates_span() {
        let span = pipeline_span("manifest.generate", "testing");
        let _guard = span.enter();
        tracing::info!("message in span");
    }

    #[test]
    fn test_log_format_parses() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" pretty ".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
