//! Stale-list scrubber: removes jobs that are no longer pending according to
//! the Taskcluster queue.
//!
//! Runs one pass and exits unless `COALESCE_SCRUB_INTERVAL_SECS` is set, in
//! which case it repeats until SIGINT/SIGTERM.

use std::process::ExitCode;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use coalesce_core::observability::{LogFormat, init_logging};
use coalesce_flow::config::{Load, ScrubberConfig};
use coalesce_flow::error::Result;
use coalesce_flow::index::CoalescingIndex;
use coalesce_flow::metrics;
use coalesce_flow::oracle::queue::QueueOracle;
use coalesce_flow::scrub::{ScrubReport, Scrubber};
use coalesce_flow::shutdown::cancel_on_signal;
use coalesce_flow::stats::StatsCounter;

#[derive(Debug, Serialize)]
struct RunSummary {
    pass_id: String,
    keys_inspected: usize,
    jobs_inspected: usize,
    jobs_removed: usize,
    keys_removed: usize,
    oracle_failures: usize,
    elapsed_ms: u128,
}

impl From<&ScrubReport> for RunSummary {
    fn from(report: &ScrubReport) -> Self {
        Self {
            pass_id: report.pass_id.to_string(),
            keys_inspected: report.keys_inspected,
            jobs_inspected: report.jobs_inspected,
            jobs_removed: report.jobs_removed,
            keys_removed: report.keys_removed,
            oracle_failures: report.oracle_failures,
            elapsed_ms: report.elapsed.as_millis(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging(LogFormat::from_env());

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, kind = e.kind(), "scrubber failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let config = ScrubberConfig::load()?;
    tracing::info!(?config, "starting scrubber");
    metrics::init_metrics()?;

    let store = config.store.connect().await?;
    let keys = config.store.store_keys();
    let scrubber = Scrubber::new(
        CoalescingIndex::new(Arc::clone(&store), keys.clone()),
        StatsCounter::new(store, keys),
        QueueOracle::new(&config.root_url, config.oracle_timeout())?,
        config.scrub(),
    );

    let shutdown = CancellationToken::new();
    let exporter = config
        .metrics_port
        .map(|port| tokio::spawn(metrics::serve(port, shutdown.clone())));

    let result = match config.interval() {
        None => scrubber.run_pass().await.map(|report| {
            let summary = RunSummary::from(&report);
            tracing::info!(
                summary = %serde_json::to_string(&summary).unwrap_or_default(),
                "scrub finished"
            );
        }),
        Some(interval) => {
            let signals = cancel_on_signal(shutdown.clone());
            let passes = scrubber.run_periodic(interval, shutdown.clone()).await;
            if let Err(e) = signals.await {
                tracing::warn!(error = %e, "signal task failed");
            }
            tracing::info!(passes, "scrubber exiting");
            Ok(())
        }
    };

    shutdown.cancel();
    if let Some(exporter) = exporter {
        match exporter.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "metrics server failed"),
            Err(e) => tracing::warn!(error = %e, "metrics task failed"),
            Ok(Ok(())) => {}
        }
    }
    result
}
