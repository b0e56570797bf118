//! Bus consumer loop.
//!
//! [`BusConsumer`] keeps one subscription open and feeds every delivered
//! message through the [`EventRouter`], settling it according to
//! [`Settlement::for_result`]. Messages are processed strictly one at a time.
//!
//! ## Connection handling
//!
//! | Condition | Action |
//! |-----------|--------|
//! | no message within `read_timeout` | unsubscribe, resubscribe |
//! | broker closed the stream | resubscribe |
//! | transport or settle error | resubscribe |
//! | subscribe failed | back off, retry (bounded) |
//! | shutdown requested | unsubscribe, return |
//!
//! A message that was delivered but not settled when the subscription ends
//! is redelivered by the broker to the next subscription.
//!
//! ## Redelivery
//!
//! A requeued message comes straight back to the head of the queue, so every
//! requeue waits [`ConsumerConfig::requeue_delay`] first. A message that
//! fails again after redelivery is rejected and parked on the dead-letter
//! queue, which lets the messages behind it through (store outages excepted;
//! see [`Settlement::for_result`]).

use std::time::Duration;

use tokio::time::error::Elapsed;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use coalesce_core::observability::router_span;
use coalesce_core::KvStore;

use crate::bus::{Binding, Bus, InboundMessage, Settlement, Subscription};
use crate::error::{Error, Result};
use crate::metrics::{CoalesceMetrics, TimingGuard};
use crate::router::EventRouter;

/// Default read timeout before the subscription is recycled.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Default delay between failed subscribe attempts.
pub const DEFAULT_RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

/// Default number of consecutive subscribe failures tolerated.
pub const DEFAULT_MAX_SUBSCRIBE_FAILURES: u32 = 10;

/// Default pause before a failed message is handed back to the broker.
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// Consumer loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Longest wait for a message before the subscription is recycled.
    pub read_timeout: Duration,
    /// Delay before retrying a failed subscribe.
    pub resubscribe_backoff: Duration,
    /// Consecutive subscribe failures after which the loop gives up.
    pub max_subscribe_failures: u32,
    /// Pause before settling a message as [`Settlement::Requeue`].
    pub requeue_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            resubscribe_backoff: DEFAULT_RESUBSCRIBE_BACKOFF,
            max_subscribe_failures: DEFAULT_MAX_SUBSCRIBE_FAILURES,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
        }
    }
}

/// Counters for one run of the consumer loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    /// Messages received.
    pub received: u64,
    /// Messages acknowledged.
    pub acked: u64,
    /// Messages requeued for redelivery.
    pub requeued: u64,
    /// Messages rejected to the dead-letter queue.
    pub rejected: u64,
    /// Subscriptions opened, including the first.
    pub subscriptions: u64,
}

impl ConsumerReport {
    fn record(&mut self, settlement: Settlement) {
        match settlement {
            Settlement::Ack => self.acked += 1,
            Settlement::Requeue => self.requeued += 1,
            Settlement::Reject => self.rejected += 1,
        }
    }
}

enum Read {
    Shutdown,
    Next(std::result::Result<Result<Option<InboundMessage>>, Elapsed>),
}

enum Recycle {
    Shutdown,
    Resubscribe(&'static str),
}

/// Drives a bus subscription through the event router.
#[derive(Debug)]
pub struct BusConsumer<B, S: ?Sized> {
    bus: B,
    binding: Binding,
    router: EventRouter<S>,
    config: ConsumerConfig,
    metrics: CoalesceMetrics,
}

impl<B, S> BusConsumer<B, S>
where
    B: Bus,
    S: KvStore + ?Sized,
{
    /// Creates a consumer.
    #[must_use]
    pub fn new(bus: B, binding: Binding, router: EventRouter<S>, config: ConsumerConfig) -> Self {
        Self {
            bus,
            binding,
            router,
            config,
            metrics: CoalesceMetrics::new(),
        }
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns a bus error if subscribing fails
    /// [`ConsumerConfig::max_subscribe_failures`] times in a row.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<ConsumerReport> {
        let mut report = ConsumerReport::default();
        let mut failures = 0_u32;

        loop {
            if shutdown.is_cancelled() {
                return Ok(report);
            }

            let mut subscription = match self.bus.subscribe(&self.binding).await {
                Ok(subscription) => {
                    failures = 0;
                    report.subscriptions += 1;
                    subscription
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, failures, "subscribe failed");
                    if failures >= self.config.max_subscribe_failures {
                        return Err(Error::bus(format!(
                            "giving up after {failures} consecutive subscribe failures: {e}"
                        )));
                    }
                    tokio::select! {
                        biased;
                        () = shutdown.cancelled() => return Ok(report),
                        () = tokio::time::sleep(self.config.resubscribe_backoff) => {}
                    }
                    continue;
                }
            };

            match self.drain(&mut subscription, &shutdown, &mut report).await {
                Recycle::Shutdown => {
                    if let Err(e) = subscription.unsubscribe().await {
                        tracing::warn!(error = %e, "unsubscribe failed during shutdown");
                    }
                    tracing::info!(
                        received = report.received,
                        acked = report.acked,
                        requeued = report.requeued,
                        rejected = report.rejected,
                        "consumer stopped"
                    );
                    return Ok(report);
                }
                Recycle::Resubscribe(reason) => {
                    self.metrics.record_resubscribe(reason);
                    if let Err(e) = subscription.unsubscribe().await {
                        tracing::debug!(error = %e, "unsubscribe failed before resubscribe");
                    }
                    tracing::info!(reason, "resubscribing");
                }
            }
        }
    }

    async fn drain(
        &self,
        subscription: &mut B::Subscription,
        shutdown: &CancellationToken,
        report: &mut ConsumerReport,
    ) -> Recycle {
        loop {
            let read = tokio::select! {
                biased;
                () = shutdown.cancelled() => Read::Shutdown,
                next = tokio::time::timeout(
                    self.config.read_timeout,
                    subscription.next_message(),
                ) => Read::Next(next),
            };

            let message = match read {
                Read::Shutdown => return Recycle::Shutdown,
                Read::Next(Err(_)) => {
                    tracing::warn!(
                        timeout = ?self.config.read_timeout,
                        "no message before read timeout"
                    );
                    return Recycle::Resubscribe("read_timeout");
                }
                Read::Next(Ok(Ok(None))) => {
                    tracing::warn!("broker closed the subscription");
                    return Recycle::Resubscribe("stream_closed");
                }
                Read::Next(Ok(Err(e))) => {
                    tracing::warn!(error = %e, "failed to read from bus");
                    return Recycle::Resubscribe("transport_error");
                }
                Read::Next(Ok(Ok(Some(message)))) => message,
            };

            report.received += 1;
            let span = router_span(&message.exchange, message.delivery_tag);
            let processed = self
                .process(subscription, &message, shutdown, report)
                .instrument(span)
                .await;
            if let Err(e) = processed {
                tracing::warn!(
                    error = %e,
                    delivery_tag = message.delivery_tag,
                    "failed to settle message"
                );
                return Recycle::Resubscribe("transport_error");
            }
        }
    }

    async fn process(
        &self,
        subscription: &mut B::Subscription,
        message: &InboundMessage,
        shutdown: &CancellationToken,
        report: &mut ConsumerReport,
    ) -> Result<()> {
        let _timer = TimingGuard::new(|d| self.metrics.observe_route_duration(d));

        let result = self.router.route(message).await;
        let settlement = Settlement::for_result(&result, message.redelivered);
        match &result {
            Ok(outcome) => {
                self.metrics.record_notification(outcome.label());
                tracing::debug!(
                    outcome = outcome.label(),
                    redelivered = message.redelivered,
                    "routed"
                );
            }
            Err(e) => {
                self.metrics.record_notification(e.kind());
                tracing::warn!(
                    error = %e,
                    kind = e.kind(),
                    settlement = settlement.as_str(),
                    redelivered = message.redelivered,
                    "routing failed"
                );
            }
        }

        if settlement == Settlement::Requeue {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(self.config.requeue_delay) => {}
            }
        }

        subscription.settle(message.delivery_tag, settlement).await?;
        report.record(settlement);
        Ok(())
    }
}
