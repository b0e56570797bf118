//! Process-local observability metrics.
//!
//! Recorded through the `metrics` crate facade and exported in Prometheus
//! text format once [`init_metrics`] has installed the recorder; before that
//! every call is a no-op. These complement the store-persisted
//! [`crate::stats::StatsCounter`], which is shared across processes.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `coalesce_notifications_total` | Counter | `outcome` | Routed notifications by outcome |
//! | `coalesce_route_duration_seconds` | Histogram | - | Time to route and settle one message |
//! | `coalesce_resubscribes_total` | Counter | `reason` | Subscription restarts |
//! | `coalesce_scrub_jobs_total` | Counter | `result` | Scrubbed jobs by result |
//! | `coalesce_scrub_duration_seconds` | Histogram | - | Duration of one scrub pass |

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Routed notifications by outcome.
    pub const NOTIFICATIONS_TOTAL: &str = "coalesce_notifications_total";
    /// Histogram: Time to route and settle one message.
    pub const ROUTE_DURATION_SECONDS: &str = "coalesce_route_duration_seconds";
    /// Counter: Subscription restarts by reason.
    pub const RESUBSCRIBES_TOTAL: &str = "coalesce_resubscribes_total";
    /// Counter: Scrubbed jobs by result.
    pub const SCRUB_JOBS_TOTAL: &str = "coalesce_scrub_jobs_total";
    /// Histogram: Duration of one scrub pass.
    pub const SCRUB_DURATION_SECONDS: &str = "coalesce_scrub_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Routing outcome (inserted, removed, `skipped_attempt`, or an error kind).
    pub const OUTCOME: &str = "outcome";
    /// Resubscribe reason (`read_timeout`, `stream_closed`, `transport_error`).
    pub const REASON: &str = "reason";
    /// Scrub result (retained, removed, `oracle_error`).
    pub const RESULT: &str = "result";
}

// ============================================================================
// Prometheus Recorder
// ============================================================================

static PROMETHEUS: OnceLock<std::result::Result<PrometheusHandle, String>> = OnceLock::new();

/// Installs the global Prometheus recorder and describes every metric.
///
/// Safe to call multiple times; later calls return the same handle.
///
/// # Errors
///
/// Returns a configuration error if another recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle> {
    PROMETHEUS
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| e.to_string())?;

            describe_counter!(names::NOTIFICATIONS_TOTAL, "Routed notifications by outcome");
            describe_histogram!(
                names::ROUTE_DURATION_SECONDS,
                "Time to route and settle one message in seconds"
            );
            describe_counter!(names::RESUBSCRIBES_TOTAL, "Subscription restarts by reason");
            describe_counter!(names::SCRUB_JOBS_TOTAL, "Scrubbed jobs by result");
            describe_histogram!(
                names::SCRUB_DURATION_SECONDS,
                "Duration of one scrub pass in seconds"
            );

            tracing::info!("prometheus metrics recorder initialized");
            Ok(handle)
        })
        .clone()
        .map_err(|e| Error::configuration(format!("failed to install prometheus recorder: {e}")))
}

/// Returns the global Prometheus handle, if initialized.
#[must_use]
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS.get().and_then(|installed| installed.as_ref().ok()).cloned()
}

/// Handler for the `/metrics` endpoint.
pub async fn serve_metrics() -> impl IntoResponse {
    match prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        ),
    }
}

/// Router exposing `/metrics`.
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(serve_metrics))
}

/// Serves `/metrics` on `port` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns a configuration error if the port cannot be bound or the server
/// fails.
pub async fn serve(port: u16, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::configuration(format!("failed to bind metrics port {addr}: {e}")))?;
    tracing::info!(%addr, "serving metrics");

    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::configuration(format!("metrics server error: {e}")))
}

// ============================================================================
// Metric Recording
// ============================================================================

/// High-level interface for recording coalescing metrics.
#[derive(Debug, Clone, Default)]
pub struct CoalesceMetrics;

impl CoalesceMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records the outcome of routing one notification.
    pub fn record_notification(&self, outcome: &'static str) {
        counter!(names::NOTIFICATIONS_TOTAL, labels::OUTCOME => outcome).increment(1);
    }

    /// Records how long routing and settling one message took.
    pub fn observe_route_duration(&self, duration: Duration) {
        histogram!(names::ROUTE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records a subscription restart.
    pub fn record_resubscribe(&self, reason: &'static str) {
        counter!(names::RESUBSCRIBES_TOTAL, labels::REASON => reason).increment(1);
    }

    /// Records the result of scrubbing one job.
    pub fn record_scrub_job(&self, result: &'static str) {
        counter!(names::SCRUB_JOBS_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Records the duration of one scrub pass.
    pub fn observe_scrub_duration(&self, duration: Duration) {
        histogram!(names::SCRUB_DURATION_SECONDS).record(duration.as_secs_f64());
    }
}

/// RAII guard for timing operations.
///
/// Automatically records duration when dropped.
///
/// ## Example
///
/// ```rust
/// use coalesce_flow::metrics::{CoalesceMetrics, TimingGuard};
///
/// let metrics = CoalesceMetrics::new();
///
/// {
///     let _guard = TimingGuard::new(|duration| metrics.observe_route_duration(duration));
///     // Route a message...
/// } // Duration recorded automatically on drop
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn metrics_endpoint_renders_recorded_series() {
        let handle = init_metrics().unwrap();
        assert!(init_metrics().is_ok());

        CoalesceMetrics::new().record_notification("inserted");
        assert!(handle.render().contains(names::NOTIFICATIONS_TOTAL));

        let response = metrics_router()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("outcome=\"inserted\""));
    }

    #[test]
    fn metrics_calls_do_not_panic() {
        let metrics = CoalesceMetrics::new();
        metrics.record_notification("inserted");
        metrics.record_resubscribe("read_timeout");
        metrics.record_scrub_job("retained");
        metrics.observe_route_duration(Duration::from_millis(3));
        metrics.observe_scrub_duration(Duration::from_secs(1));
    }

    #[test]
    fn timing_guard_measures_duration() {
        let mut recorded = None;
        {
            let _guard = TimingGuard::new(|d| recorded = Some(d));
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(recorded.is_some_and(|d| d >= Duration::from_millis(10)));
    }
}
