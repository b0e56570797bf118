//! In-memory bus for testing.
//!
//! Models a single durable queue with broker-side settlement:
//!
//! - Acked messages are forgotten.
//! - Requeued messages go back to the head of the queue, flagged `redelivered`.
//! - Rejected messages move to a dead-letter list.
//! - Unsettled messages return to the queue when their subscription ends.
//!
//! Faults can be scripted with [`InMemoryBus::inject`] and
//! [`InMemoryBus::fail_next_subscribes`] to exercise the consumer loop's
//! timeout and resubscribe paths.

use std::collections::{HashMap, VecDeque};
use std::future;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Binding, Bus, InboundMessage, Settlement, Subscription};
use crate::error::{Error, Result};

/// A message as published, before the broker assigns a delivery tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Exchange to publish to.
    pub exchange: String,
    /// Primary routing key.
    pub routing_key: String,
    /// Carbon-copy routes.
    pub cc: Vec<String>,
    /// Raw body.
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    /// Creates a message with no CC routes.
    #[must_use]
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            cc: Vec::new(),
            payload,
        }
    }

    /// Adds a CC route.
    #[must_use]
    pub fn with_cc(mut self, route: impl Into<String>) -> Self {
        self.cc.push(route.into());
        self
    }
}

/// A scripted transport fault, consumed by the next read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The read never completes (the consumer's read timeout must fire).
    Stall,
    /// The broker closes the stream.
    Close,
    /// The read fails with a transport error.
    Error(String),
}

/// A recorded settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    /// Delivery tag that was settled.
    pub delivery_tag: u64,
    /// Body of the settled message.
    pub payload: Vec<u8>,
    /// How it was settled.
    pub settlement: Settlement,
}

#[derive(Debug, Default)]
struct BusState {
    queue: VecDeque<InboundMessage>,
    in_flight: HashMap<u64, (u64, InboundMessage)>,
    dead_letters: Vec<InboundMessage>,
    settlements: Vec<SettlementRecord>,
    faults: VecDeque<Fault>,
    failing_subscribes: u32,
    bindings: Vec<Binding>,
    next_tag: u64,
    next_subscription: u64,
    open_subscriptions: usize,
    unsubscribes: usize,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BusState>,
    ready: Notify,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, BusState>> {
        self.state.lock().map_err(|_| poison_err())
    }
}

/// In-memory bus with one durable queue.
///
/// Cloning yields another handle to the same queue, so a test can keep
/// publishing while a consumer owns a clone.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    shared: Arc<Shared>,
}

impl InMemoryBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a message to the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus state is poisoned.
    pub fn publish(&self, message: OutboundMessage) -> Result<()> {
        {
            let mut state = self.shared.lock()?;
            state.queue.push_back(InboundMessage {
                delivery_tag: 0,
                exchange: message.exchange,
                routing_key: message.routing_key,
                cc: message.cc,
                payload: message.payload,
                redelivered: false,
            });
        }
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Scripts a fault for a future read.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus state is poisoned.
    pub fn inject(&self, fault: Fault) -> Result<()> {
        self.shared.lock()?.faults.push_back(fault);
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Makes the next `n` subscribe calls fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus state is poisoned.
    pub fn fail_next_subscribes(&self, n: u32) -> Result<()> {
        self.shared.lock()?.failing_subscribes = n;
        Ok(())
    }

    /// Returns every settlement in the order it happened.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus state is poisoned.
    pub fn settlements(&self) -> Result<Vec<SettlementRecord>> {
        Ok(self.shared.lock()?.settlements.clone())
    }

    /// Returns rejected (dead-lettered) messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus state is poisoned.
    pub fn dead_letters(&self) -> Result<Vec<InboundMessage>> {
        Ok(self.shared.lock()?.dead_letters.clone())
    }

    /// Returns the number of messages waiting for delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus state is poisoned.
    pub fn queued(&self) -> Result<usize> {
        Ok(self.shared.lock()?.queue.len())
    }

    /// Returns the number of delivered but unsettled messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus state is poisoned.
    pub fn in_flight(&self) -> Result<usize> {
        Ok(self.shared.lock()?.in_flight.len())
    }

    /// Returns every binding a subscription was opened with.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus state is poisoned.
    pub fn bindings(&self) -> Result<Vec<Binding>> {
        Ok(self.shared.lock()?.bindings.clone())
    }

    /// Returns the number of currently open subscriptions.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus state is poisoned.
    pub fn open_subscriptions(&self) -> Result<usize> {
        Ok(self.shared.lock()?.open_subscriptions)
    }

    /// Returns the number of explicit unsubscribe calls.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus state is poisoned.
    pub fn unsubscribes(&self) -> Result<usize> {
        Ok(self.shared.lock()?.unsubscribes)
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    type Subscription = InMemorySubscription;

    async fn subscribe(&self, binding: &Binding) -> Result<InMemorySubscription> {
        let mut state = self.shared.lock()?;
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(Error::bus("broker refused connection"));
        }
        state.bindings.push(binding.clone());
        state.next_subscription += 1;
        state.open_subscriptions += 1;
        Ok(InMemorySubscription {
            id: state.next_subscription,
            shared: Arc::clone(&self.shared),
            closed: false,
        })
    }
}

/// Subscription handle produced by [`InMemoryBus`].
#[derive(Debug)]
pub struct InMemorySubscription {
    id: u64,
    shared: Arc<Shared>,
    closed: bool,
}

enum Delivery {
    Message(InboundMessage),
    Fault(Fault),
}

impl InMemorySubscription {
    fn take_next(&self) -> Result<Option<Delivery>> {
        let mut state = self.shared.lock()?;
        if let Some(fault) = state.faults.pop_front() {
            return Ok(Some(Delivery::Fault(fault)));
        }
        let Some(mut message) = state.queue.pop_front() else {
            return Ok(None);
        };
        state.next_tag += 1;
        message.delivery_tag = state.next_tag;
        state
            .in_flight
            .insert(message.delivery_tag, (self.id, message.clone()));
        Ok(Some(Delivery::Message(message)))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut state = self.shared.lock()?;
        state.open_subscriptions = state.open_subscriptions.saturating_sub(1);

        let orphaned: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, (owner, _))| *owner == self.id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in orphaned {
            if let Some((_, mut message)) = state.in_flight.remove(&tag) {
                message.redelivered = true;
                state.queue.push_front(message);
            }
        }
        drop(state);
        self.shared.ready.notify_one();
        Ok(())
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next_message(&mut self) -> Result<Option<InboundMessage>> {
        if self.closed {
            return Err(Error::bus("subscription already closed"));
        }
        // Let other tasks run between deliveries, like a network read would.
        tokio::task::yield_now().await;
        loop {
            let notified = self.shared.ready.notified();
            match self.take_next()? {
                Some(Delivery::Message(message)) => return Ok(Some(message)),
                Some(Delivery::Fault(Fault::Stall)) => {
                    return future::pending::<Result<Option<InboundMessage>>>().await;
                }
                Some(Delivery::Fault(Fault::Close)) => return Ok(None),
                Some(Delivery::Fault(Fault::Error(message))) => return Err(Error::bus(message)),
                None => notified.await,
            }
        }
    }

    async fn settle(&mut self, delivery_tag: u64, settlement: Settlement) -> Result<()> {
        let mut state = self.shared.lock()?;
        let (owner, mut message) = state
            .in_flight
            .remove(&delivery_tag)
            .ok_or_else(|| Error::bus(format!("unknown delivery tag {delivery_tag}")))?;
        if owner != self.id {
            state.in_flight.insert(delivery_tag, (owner, message));
            return Err(Error::bus(format!(
                "delivery tag {delivery_tag} belongs to another subscription"
            )));
        }

        state.settlements.push(SettlementRecord {
            delivery_tag,
            payload: message.payload.clone(),
            settlement,
        });
        match settlement {
            Settlement::Ack => {}
            Settlement::Requeue => {
                message.redelivered = true;
                state.queue.push_front(message);
                drop(state);
                self.shared.ready.notify_one();
            }
            Settlement::Reject => state.dead_letters.push(message),
        }
        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        if !self.closed {
            self.shared.lock()?.unsubscribes += 1;
        }
        self.close()
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to release in-memory subscription");
        }
    }
}

fn poison_err() -> Error {
    Error::bus("in-memory bus lock poisoned")
}
