//! Read-only HTTP API over the coalesced lists.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use coalesce_core::observability::{LogFormat, init_logging};
use coalesce_flow::api::{ApiState, router};
use coalesce_flow::config::{Load, WebConfig};
use coalesce_flow::error::{Error, Result};
use coalesce_flow::index::CoalescingIndex;
use coalesce_flow::metrics;
use coalesce_flow::shutdown::cancel_on_signal;
use coalesce_flow::stats::StatsCounter;

#[tokio::main]
async fn main() -> ExitCode {
    init_logging(LogFormat::from_env());

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, kind = e.kind(), "web server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let config = WebConfig::load()?;
    tracing::info!(?config, "starting web server");
    metrics::init_metrics()?;

    let store = config.store.connect().await?;
    let keys = config.store.store_keys();
    let app = router(ApiState::new(
        CoalescingIndex::new(Arc::clone(&store), keys.clone()),
        StatsCounter::new(store, keys),
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::configuration(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(%addr, "listening");

    let shutdown = CancellationToken::new();
    let _signals = cancel_on_signal(shutdown.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::configuration(format!("server error: {e}")))
}
