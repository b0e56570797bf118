//! AMQP 0-9-1 transport for the Pulse message bus.
//!
//! Each [`Bus::subscribe`] opens a fresh connection and channel, declares the
//! durable queue, binds it to every exchange, and starts a consumer with a
//! prefetch of one so at most one notification is unsettled at a time.
//!
//! Pulse requires queue names of the form `queue/{username}/{name}`; the
//! binding's queue name is qualified accordingly.
//!
//! ## Parking
//!
//! The work queue is declared with `x-dead-letter-exchange` pointing at
//! `exchange/{username}/{name}/parked`, a durable direct exchange bound to the
//! durable queue `queue/{username}/{name}/parked`. A message settled with
//! [`Settlement::Reject`] is routed there by the broker and stays until an
//! operator inspects or replays it.
//!
//! Queue arguments are fixed at declaration: a queue declared without them
//! must be deleted once before this transport can redeclare it.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::uri::AMQPUri;
use lapin::{Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};

use coalesce_core::Redacted;

use super::{Binding, Bus, InboundMessage, Settlement, Subscription};
use crate::error::{Error, Result};

/// Header carrying carbon-copy routes.
const CC_HEADER: &str = "CC";

/// Suffix of the parking exchange and queue names.
const PARKED_SUFFIX: &str = "parked";

/// Pulse connection settings.
#[derive(Debug, Clone)]
pub struct PulseConfig {
    /// Broker URL without credentials, e.g. `amqps://pulse.mozilla.org:5671`.
    pub url: String,
    /// Pulse username.
    pub username: String,
    /// Pulse password.
    pub password: Redacted<String>,
    /// Messages delivered before an ack is required.
    pub prefetch: u16,
}

impl PulseConfig {
    /// Qualifies a queue name with the Pulse user namespace.
    #[must_use]
    pub fn qualified_queue(&self, name: &str) -> String {
        format!("queue/{}/{name}", self.username)
    }

    /// Names the exchange rejected messages are dead-lettered to.
    #[must_use]
    pub fn parking_exchange(&self, name: &str) -> String {
        format!("exchange/{}/{name}/{PARKED_SUFFIX}", self.username)
    }

    /// Names the queue holding parked messages.
    #[must_use]
    pub fn parking_queue(&self, name: &str) -> String {
        format!("{}/{PARKED_SUFFIX}", self.qualified_queue(name))
    }

    fn uri(&self) -> Result<AMQPUri> {
        let mut uri: AMQPUri = self
            .url
            .parse()
            .map_err(|e: String| Error::configuration(format!("invalid pulse url: {e}")))?;
        uri.authority.userinfo.username.clone_from(&self.username);
        uri.authority
            .userinfo
            .password
            .clone_from(self.password.expose());
        Ok(uri)
    }
}

/// Pulse bus client.
#[derive(Debug, Clone)]
pub struct PulseBus {
    config: PulseConfig,
}

impl PulseBus {
    /// Creates a client; no connection is made until [`Bus::subscribe`].
    #[must_use]
    pub fn new(config: PulseConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Bus for PulseBus {
    type Subscription = PulseSubscription;

    async fn subscribe(&self, binding: &Binding) -> Result<PulseSubscription> {
        let connection =
            Connection::connect_uri(self.config.uri()?, ConnectionProperties::default())
                .await
            .map_err(|e| Error::bus_with_source("failed to connect to pulse", e))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::bus_with_source("failed to open channel", e))?;

        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| Error::bus_with_source("failed to set prefetch", e))?;

        let queue = self.config.qualified_queue(&binding.queue_name);
        let parking_exchange = self.config.parking_exchange(&binding.queue_name);
        declare_parking(
            &channel,
            &parking_exchange,
            &self.config.parking_queue(&binding.queue_name),
            &queue,
        )
        .await?;

        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                dead_letter_arguments(&parking_exchange, &queue),
            )
            .await
            .map_err(|e| Error::bus_with_source(format!("failed to declare {queue}"), e))?;

        for exchange in &binding.exchanges {
            channel
                .queue_bind(
                    &queue,
                    exchange,
                    &binding.routing_key_pattern,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| Error::bus_with_source(format!("failed to bind {exchange}"), e))?;
        }

        let consumer_tag = format!("coalesce-{}", ulid::Ulid::new());
        let consumer = channel
            .basic_consume(
                &queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::bus_with_source("failed to start consumer", e))?;

        tracing::info!(
            queue = %queue,
            exchanges = ?binding.exchanges,
            pattern = %binding.routing_key_pattern,
            "subscribed"
        );

        Ok(PulseSubscription {
            connection,
            channel,
            consumer,
            consumer_tag,
        })
    }
}

/// An open Pulse consumer.
pub struct PulseSubscription {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
    consumer_tag: String,
}

impl std::fmt::Debug for PulseSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulseSubscription")
            .field("consumer_tag", &self.consumer_tag)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Subscription for PulseSubscription {
    async fn next_message(&mut self) -> Result<Option<InboundMessage>> {
        let Some(delivery) = self.consumer.next().await else {
            return Ok(None);
        };
        let delivery = delivery.map_err(|e| Error::bus_with_source("delivery failed", e))?;

        let cc = delivery
            .properties
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get(CC_HEADER))
            .map(cc_routes)
            .unwrap_or_default();

        Ok(Some(InboundMessage {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            cc,
            payload: delivery.data,
            redelivered: delivery.redelivered,
        }))
    }

    async fn settle(&mut self, delivery_tag: u64, settlement: Settlement) -> Result<()> {
        let result = match settlement {
            Settlement::Ack => {
                self.channel
                    .basic_ack(delivery_tag, BasicAckOptions::default())
                    .await
            }
            Settlement::Requeue | Settlement::Reject => {
                self.channel
                    .basic_nack(
                        delivery_tag,
                        BasicNackOptions {
                            multiple: false,
                            requeue: settlement == Settlement::Requeue,
                        },
                    )
                    .await
            }
        };
        result.map_err(|e| Error::bus_with_source(format!("failed to {}", settlement.as_str()), e))
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| Error::bus_with_source("failed to cancel consumer", e))?;
        self.connection
            .close(200, "shutting down")
            .await
            .map_err(|e| Error::bus_with_source("failed to close connection", e))
    }
}

/// Declares the parking exchange and queue, bound by `routing_key`.
async fn declare_parking(
    channel: &Channel,
    exchange: &str,
    queue: &str,
    routing_key: &str,
) -> Result<()> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| Error::bus_with_source(format!("failed to declare {exchange}"), e))?;
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| Error::bus_with_source(format!("failed to declare {queue}"), e))?;
    channel
        .queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| Error::bus_with_source(format!("failed to bind {queue}"), e))
}

/// Work-queue arguments sending rejected messages to the parking exchange.
fn dead_letter_arguments(exchange: &str, routing_key: &str) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(LongString::from(exchange)),
    );
    arguments.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(LongString::from(routing_key)),
    );
    arguments
}

fn cc_routes(value: &AMQPValue) -> Vec<String> {
    match value {
        AMQPValue::FieldArray(routes) => {
            routes.as_slice().iter().filter_map(route_string).collect()
        }
        other => route_string(other).into_iter().collect(),
    }
}

fn route_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}
