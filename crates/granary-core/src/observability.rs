//! Observability infrastructure for granary.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors for consistent observability
//! across the pipeline components.

use std::str::FromStr;
use std::sync::Once;

use serde::Deserialize;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Error;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(Error::InvalidInput(format!(
                "unknown log format '{other}': expected json or pretty"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `granary_flow=debug`)
///
/// # Example
///
/// ```rust
/// use granary_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for event-routing operations with standard fields.
///
/// # Example
///
/// ```rust
/// use granary_core::observability::routing_span;
///
/// let span = routing_span("handle_event", "raw/cihr/2024.csv");
/// let _guard = span.enter();
/// // ... route the event
/// ```
#[must_use]
pub fn routing_span(operation: &str, key: &str) -> Span {
    tracing::info_span!("routing", op = operation, key = key)
}

/// Creates a span for job-run operations.
///
/// # Example
///
/// ```rust
/// use granary_core::observability::run_span;
///
/// let span = run_span("execute", "01J8ZV2Q4R", "clean-cihr");
/// let _guard = span.enter();
/// // ... drive the run
/// ```
#[must_use]
pub fn run_span(operation: &str, run_id: &str, definition: &str) -> Span {
    tracing::info_span!(
        "run",
        op = operation,
        run_id = run_id,
        definition = definition,
    )
}
