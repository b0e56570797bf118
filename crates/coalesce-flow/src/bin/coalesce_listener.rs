//! Coalescing listener: consumes job lifecycle notifications from Pulse and
//! maintains the membership lists.
//!
//! Exits with status 1 after an orderly shutdown (SIGINT/SIGTERM) so a
//! supervisor always restarts it, and with status 1 on configuration or
//! fatal bus errors.

use std::process::ExitCode;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use coalesce_core::observability::{LogFormat, init_logging};
use coalesce_flow::bus::pulse::{PulseBus, PulseConfig};
use coalesce_flow::config::{ListenerConfig, Load};
use coalesce_flow::consumer::{BusConsumer, ConsumerReport};
use coalesce_flow::error::Result;
use coalesce_flow::index::CoalescingIndex;
use coalesce_flow::metrics;
use coalesce_flow::router::{EventRouter, RouterConfig};
use coalesce_flow::shutdown::cancel_on_signal;
use coalesce_flow::stats::StatsCounter;

#[derive(Debug, Serialize)]
struct RunSummary {
    received: u64,
    acked: u64,
    requeued: u64,
    rejected: u64,
    subscriptions: u64,
}

impl From<&ConsumerReport> for RunSummary {
    fn from(report: &ConsumerReport) -> Self {
        Self {
            received: report.received,
            acked: report.acked,
            requeued: report.requeued,
            rejected: report.rejected,
            subscriptions: report.subscriptions,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging(LogFormat::from_env());

    match run().await {
        Ok(report) => {
            let summary = RunSummary::from(&report);
            tracing::info!(
                summary = %serde_json::to_string(&summary).unwrap_or_default(),
                "listener shut down"
            );
            ExitCode::from(1)
        }
        Err(e) => {
            tracing::error!(error = %e, kind = e.kind(), "listener failed");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<ConsumerReport> {
    let config = ListenerConfig::load()?;
    tracing::info!(?config, "starting listener");
    metrics::init_metrics()?;

    let store = config.store.connect().await?;
    let keys = config.store.store_keys();
    let router = EventRouter::new(
        CoalescingIndex::new(Arc::clone(&store), keys.clone()),
        StatsCounter::new(store, keys),
        RouterConfig::for_namespace(&config.store.prefix),
    );
    let bus = PulseBus::new(PulseConfig {
        url: config.pulse_url.clone(),
        username: config.pulse_username.clone(),
        password: config.pulse_password.clone(),
        prefetch: 1,
    });

    let shutdown = CancellationToken::new();
    let signals = cancel_on_signal(shutdown.clone());
    let exporter = config
        .metrics_port
        .map(|port| tokio::spawn(metrics::serve(port, shutdown.clone())));

    let result = BusConsumer::new(bus, config.binding(), router, config.consumer())
        .run(shutdown.clone())
        .await;

    shutdown.cancel();
    if let Err(e) = signals.await {
        tracing::warn!(error = %e, "signal task failed");
    }
    if let Some(exporter) = exporter {
        match exporter.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "metrics server failed"),
            Err(e) => tracing::warn!(error = %e, "metrics task failed"),
            Ok(Ok(())) => {}
        }
    }
    result
}
