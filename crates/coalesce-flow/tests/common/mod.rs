//! Shared fixtures for integration tests.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use coalesce_core::{CommonalityKey, InMemoryKvStore, JobId, StoreKeys};
use coalesce_flow::bus::memory::{InMemoryBus, OutboundMessage, SettlementRecord};
use coalesce_flow::bus::{
    Binding, TASK_EXCEPTION_EXCHANGE, TASK_PENDING_EXCHANGE, TASK_RUNNING_EXCHANGE,
};
use coalesce_flow::consumer::{BusConsumer, ConsumerConfig, ConsumerReport};
use coalesce_flow::error::Result;
use coalesce_flow::index::CoalescingIndex;
use coalesce_flow::router::{EventRouter, RouterConfig};
use coalesce_flow::stats::StatsCounter;

pub const NAMESPACE: &str = "coalesce.v1.";

pub fn key(s: &str) -> CommonalityKey {
    CommonalityKey::new(s).unwrap()
}

pub fn job(s: &str) -> JobId {
    JobId::new(s).unwrap()
}

/// Builds a notification the way the queue publishes it.
pub fn notification(
    state: &str,
    job_id: &str,
    attempt: u32,
    commonality_key: &str,
) -> OutboundMessage {
    let exchange = match state {
        "pending" => TASK_PENDING_EXCHANGE,
        "running" => TASK_RUNNING_EXCHANGE,
        _ => TASK_EXCEPTION_EXCHANGE,
    };
    let body = serde_json::json!({
        "version": 1,
        "runId": attempt,
        "status": {"taskId": job_id, "state": state, "retriesLeft": 5},
    });
    OutboundMessage::new(
        exchange,
        format!("primary.{job_id}.{attempt}"),
        serde_json::to_vec(&body).unwrap(),
    )
    .with_cc(format!("route.{NAMESPACE}{commonality_key}"))
}

/// Store, bus and the components wired over them.
pub struct Harness {
    pub store: Arc<InMemoryKvStore>,
    pub bus: InMemoryBus,
    pub index: CoalescingIndex<InMemoryKvStore>,
    pub stats: StatsCounter<InMemoryKvStore>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryKvStore::new());
        let keys = StoreKeys::default();
        Self {
            index: CoalescingIndex::new(Arc::clone(&store), keys.clone()),
            stats: StatsCounter::new(Arc::clone(&store), keys),
            store,
            bus: InMemoryBus::new(),
        }
    }

    pub fn router(&self) -> EventRouter<InMemoryKvStore> {
        EventRouter::new(
            self.index.clone(),
            self.stats.clone(),
            RouterConfig::for_namespace(NAMESPACE),
        )
    }

    pub fn binding() -> Binding {
        Binding::for_namespace(
            NAMESPACE,
            [TASK_PENDING_EXCHANGE, TASK_RUNNING_EXCHANGE, TASK_EXCEPTION_EXCHANGE],
            "coalesce",
        )
    }

    pub fn publish(&self, message: OutboundMessage) {
        self.bus.publish(message).unwrap();
    }

    /// Starts a consumer loop in the background.
    pub fn spawn_consumer(&self, config: ConsumerConfig) -> RunningConsumer {
        let consumer = BusConsumer::new(self.bus.clone(), Self::binding(), self.router(), config);
        let token = CancellationToken::new();
        let handle = {
            let token = token.clone();
            tokio::spawn(async move { consumer.run(token).await })
        };
        RunningConsumer { token, handle }
    }

    /// Waits until at least `n` messages have been settled.
    pub async fn wait_for_settlements(&self, n: usize) -> Vec<SettlementRecord> {
        self.wait_until(|settled| settled.len() >= n).await
    }

    /// Waits until the settlement history satisfies `done`.
    pub async fn wait_until(
        &self,
        done: impl Fn(&[SettlementRecord]) -> bool,
    ) -> Vec<SettlementRecord> {
        for _ in 0..2_000 {
            let settled = self.bus.settlements().unwrap();
            if done(&settled) {
                return settled;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for settlements");
    }
}

pub struct RunningConsumer {
    pub token: CancellationToken,
    pub handle: JoinHandle<Result<ConsumerReport>>,
}

impl RunningConsumer {
    pub async fn stop(self) -> ConsumerReport {
        self.token.cancel();
        self.handle.await.unwrap().unwrap()
    }
}
