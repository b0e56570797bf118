//! Bus consumer loop: settlement, redelivery, resubscription and shutdown.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::time::Duration;

use coalesce_flow::bus::memory::{Fault, OutboundMessage};
use coalesce_flow::bus::{Settlement, TASK_PENDING_EXCHANGE};
use coalesce_flow::consumer::ConsumerConfig;

use common::{Harness, job, key, notification};

#[tokio::test(start_paused = true)]
async fn store_failure_requeues_until_the_store_recovers() {
    let h = Harness::new();
    h.store.set_available(false);
    h.publish(notification("pending", "A", 0, "X"));

    let consumer = h.spawn_consumer(ConsumerConfig::default());
    h.wait_until(|s| s.iter().filter(|r| r.settlement == Settlement::Requeue).count() >= 2)
        .await;

    h.store.set_available(true);
    let settled = h
        .wait_until(|s| s.iter().any(|r| r.settlement == Settlement::Ack))
        .await;
    let report = consumer.stop().await;

    // Redelivered store failures are never parked.
    assert!(settled.iter().all(|r| r.settlement != Settlement::Reject));
    assert_eq!(settled.last().unwrap().settlement, Settlement::Ack);
    assert_eq!(report.acked, 1);
    assert!(report.requeued >= 2);
    assert_eq!(h.index.list(&key("X")).await.unwrap(), vec![job("A")]);
}

#[tokio::test(start_paused = true)]
async fn store_outage_requeues_at_the_configured_pace() {
    let h = Harness::new();
    h.store.set_available(false);
    h.publish(notification("pending", "A", 0, "X"));

    let config = ConsumerConfig {
        requeue_delay: Duration::from_secs(1),
        ..ConsumerConfig::default()
    };
    let consumer = h.spawn_consumer(config);
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let report = consumer.stop().await;

    assert!((3..=4).contains(&report.requeued), "requeued {}", report.requeued);
    assert_eq!(h.bus.queued().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn unrecognized_state_is_parked_after_one_redelivery() {
    let h = Harness::new();
    h.publish(notification("completed", "A", 0, "X"));

    let consumer = h.spawn_consumer(ConsumerConfig::default());
    let settled = h.wait_for_settlements(2).await;
    let report = consumer.stop().await;

    let outcomes: Vec<Settlement> = settled.iter().map(|r| r.settlement).collect();
    assert_eq!(outcomes, vec![Settlement::Requeue, Settlement::Reject]);
    assert_eq!(report.acked, 0);
    assert!(h.index.keys().await.unwrap().is_empty());
    // Kept for inspection, not dropped.
    assert_eq!(h.bus.dead_letters().unwrap().len(), 1);
    assert_eq!(h.bus.queued().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn pending_job_behind_an_unrecognized_state_is_still_listed() {
    let h = Harness::new();
    h.publish(notification("completed", "A", 0, "X"));
    h.publish(notification("pending", "B", 0, "X"));

    let consumer = h.spawn_consumer(ConsumerConfig::default());
    h.wait_until(|s| s.iter().any(|r| r.settlement == Settlement::Ack))
        .await;
    let report = consumer.stop().await;

    assert_eq!(h.index.list(&key("X")).await.unwrap(), vec![job("B")]);
    assert_eq!(report.acked, 1);
    assert_eq!(report.rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_and_unrouted_messages_are_dead_lettered() {
    let h = Harness::new();
    h.publish(
        OutboundMessage::new(TASK_PENDING_EXCHANGE, "primary", b"not json".to_vec())
            .with_cc("route.coalesce.v1.X"),
    );
    h.publish(
        OutboundMessage::new(
            TASK_PENDING_EXCHANGE,
            "primary",
            br#"{"attempt":0,"status":{"state":"pending","jobId":"A"}}"#.to_vec(),
        )
        .with_cc("route.someone-else.X"),
    );
    h.publish(notification("pending", "B", 0, "X"));

    let consumer = h.spawn_consumer(ConsumerConfig::default());
    let settled = h.wait_for_settlements(3).await;
    let report = consumer.stop().await;

    let outcomes: Vec<Settlement> = settled.iter().map(|r| r.settlement).collect();
    assert_eq!(
        outcomes,
        vec![Settlement::Reject, Settlement::Reject, Settlement::Ack]
    );
    assert_eq!(report.rejected, 2);
    assert_eq!(h.bus.dead_letters().unwrap().len(), 2);
    assert_eq!(h.index.list(&key("X")).await.unwrap(), vec![job("B")]);
}

#[tokio::test(start_paused = true)]
async fn closed_stream_resubscribes_and_continues() {
    let h = Harness::new();
    h.bus.inject(Fault::Close).unwrap();
    h.publish(notification("pending", "A", 0, "X"));

    let consumer = h.spawn_consumer(ConsumerConfig::default());
    h.wait_for_settlements(1).await;
    let report = consumer.stop().await;

    assert_eq!(report.subscriptions, 2);
    assert_eq!(report.acked, 1);
}

#[tokio::test(start_paused = true)]
async fn transport_error_resubscribes() {
    let h = Harness::new();
    h.bus.inject(Fault::Error("connection reset".into())).unwrap();
    h.publish(notification("pending", "A", 0, "X"));

    let consumer = h.spawn_consumer(ConsumerConfig::default());
    h.wait_for_settlements(1).await;
    let report = consumer.stop().await;

    assert_eq!(report.subscriptions, 2);
    assert_eq!(h.bus.bindings().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn silence_past_the_read_timeout_recycles_the_subscription() {
    let h = Harness::new();
    let config = ConsumerConfig {
        read_timeout: Duration::from_secs(1),
        ..ConsumerConfig::default()
    };

    let consumer = h.spawn_consumer(config);
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let report = consumer.stop().await;

    assert_eq!(report.subscriptions, 4);
    assert_eq!(report.received, 0);
    assert_eq!(h.bus.open_subscriptions().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_subscribes_back_off_and_retry() {
    let h = Harness::new();
    h.bus.fail_next_subscribes(2).unwrap();
    h.publish(notification("pending", "A", 0, "X"));

    let consumer = h.spawn_consumer(ConsumerConfig::default());
    h.wait_for_settlements(1).await;
    let report = consumer.stop().await;

    assert_eq!(report.subscriptions, 1);
    assert_eq!(report.acked, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_unsubscribes() {
    let h = Harness::new();
    let consumer = h.spawn_consumer(ConsumerConfig::default());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.bus.open_subscriptions().unwrap(), 1);

    let report = consumer.stop().await;
    assert_eq!(report.subscriptions, 1);
    assert_eq!(h.bus.unsubscribes().unwrap(), 1);
    assert_eq!(h.bus.open_subscriptions().unwrap(), 0);
}
