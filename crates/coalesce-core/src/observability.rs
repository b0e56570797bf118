//! Observability infrastructure for the coalescing service.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors shared by the listener,
//! the scrubber and the read API.

use std::fmt;
use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{
    EnvFilter, fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Reads the format from `COALESCE_LOG_FORMAT` (`json` or anything else).
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var("COALESCE_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Pretty,
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
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `coalesce_flow=debug`)
///
/// # Example
///
/// ```rust
/// use coalesce_core::observability::{LogFormat, init_logging};
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
                    .with(tracing_fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for routing one bus notification.
///
/// # Example
///
/// ```rust
/// use coalesce_core::observability::router_span;
///
/// let span = router_span("exchange/taskcluster-queue/v1/task-pending", 42);
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn router_span(exchange: &str, delivery_tag: u64) -> Span {
    tracing::info_span!("route", exchange = exchange, delivery_tag = delivery_tag)
}

/// Creates a span for scrubbing one commonality key.
#[must_use]
pub fn scrub_span(key: &str) -> Span {
    tracing::info_span!("scrub", key = key)
}

/// Wrapper that hides a secret value from `Debug` and `Display` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Redacted<T>(pub T);

impl<T> Redacted<T> {
    /// Returns a reference to the wrapped secret.
    pub const fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> From<T> for Redacted<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T: FromStr> FromStr for Redacted<T> {
    type Err = T::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}
