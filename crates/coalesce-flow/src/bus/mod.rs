//! Publish/subscribe bus abstraction.
//!
//! This module provides:
//!
//! - [`Bus`] / [`Subscription`]: Traits for consuming lifecycle notifications
//! - [`Binding`]: The exchanges and routing-key pattern a subscription uses
//! - [`InboundMessage`]: One delivered message with its routing annotations
//! - [`Settlement`]: How a delivered message is settled with the broker
//! - [`memory::InMemoryBus`]: In-memory bus for testing
//! - `pulse::PulseBus`: AMQP 0-9-1 transport (with the `pulse` feature)
//!
//! ## Routing annotations
//!
//! A message is delivered with its primary routing key plus any number of
//! carbon-copy (`CC`) routes. The commonality key rides in one of those
//! routes as `route.{namespace}{key}`; the subscription's routing-key
//! pattern `route.{namespace}#` restricts delivery to this service's
//! namespace on the broker side.

pub mod memory;
#[cfg(feature = "pulse")]
pub mod pulse;

use async_trait::async_trait;

use crate::error::Result;

/// Prefix the broker puts in front of every CC route.
pub const ROUTE_PREFIX: &str = "route.";

/// Exchange carrying job-submitted (pending) notifications.
pub const TASK_PENDING_EXCHANGE: &str = "exchange/taskcluster-queue/v1/task-pending";
/// Exchange carrying job-started (running) notifications.
pub const TASK_RUNNING_EXCHANGE: &str = "exchange/taskcluster-queue/v1/task-running";
/// Exchange carrying job-failed (exception) notifications.
pub const TASK_EXCEPTION_EXCHANGE: &str = "exchange/taskcluster-queue/v1/task-exception";

/// Default lifecycle exchanges.
pub const DEFAULT_EXCHANGES: &[&str] = &[
    TASK_PENDING_EXCHANGE,
    TASK_RUNNING_EXCHANGE,
    TASK_EXCEPTION_EXCHANGE,
];

/// What a subscription binds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Exchanges the queue is bound to.
    pub exchanges: Vec<String>,
    /// Routing-key pattern applied to every exchange binding.
    pub routing_key_pattern: String,
    /// Durable queue name.
    pub queue_name: String,
}

impl Binding {
    /// Builds the binding for a namespace: every exchange bound with
    /// `route.{namespace}#`.
    #[must_use]
    pub fn for_namespace(
        namespace: &str,
        exchanges: impl IntoIterator<Item = impl Into<String>>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            exchanges: exchanges.into_iter().map(Into::into).collect(),
            routing_key_pattern: format!("{ROUTE_PREFIX}{namespace}#"),
            queue_name: queue_name.into(),
        }
    }
}

/// A message delivered by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Broker-assigned tag used to settle the message.
    pub delivery_tag: u64,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Primary routing key.
    pub routing_key: String,
    /// Carbon-copy routes.
    pub cc: Vec<String>,
    /// Raw body.
    pub payload: Vec<u8>,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
}

impl InboundMessage {
    /// Returns the routing annotations: the primary routing key, then CC routes.
    pub fn routing_annotations(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.routing_key.as_str()).chain(self.cc.iter().map(String::as_str))
    }
}

/// How a delivered message is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Settlement {
    /// Processing finished; the broker may forget the message.
    Ack,
    /// Processing failed transiently; the broker redelivers the message.
    Requeue,
    /// The message cannot be processed; the broker moves it to the parking
    /// (dead-letter) queue, where it is kept for manual intervention.
    Reject,
}

impl Settlement {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Requeue => "requeue",
            Self::Reject => "reject",
        }
    }
}

/// Bus client able to open subscriptions.
///
/// ## Thread Safety
///
/// Implementations are `Send + Sync`; a subscription itself is driven by one
/// task at a time.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Subscription type produced by [`Bus::subscribe`].
    type Subscription: Subscription;

    /// Opens a subscription for `binding`.
    ///
    /// The queue and its bindings are declared idempotently, so calling this
    /// again after a disconnect resumes the same durable queue.
    async fn subscribe(&self, binding: &Binding) -> Result<Self::Subscription>;
}

/// One open subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next message.
    ///
    /// Returns `Ok(None)` when the broker closed the stream. Must be
    /// cancellation safe: dropping the future loses no message.
    async fn next_message(&mut self) -> Result<Option<InboundMessage>>;

    /// Settles a previously delivered message.
    async fn settle(&mut self, delivery_tag: u64, settlement: Settlement) -> Result<()>;

    /// Cancels the subscription. Unsettled messages return to the queue.
    async fn unsubscribe(&mut self) -> Result<()>;
}
