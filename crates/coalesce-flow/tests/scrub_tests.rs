//! Stale-list scrubber against the in-memory oracle.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use coalesce_core::{InMemoryKvStore, KvStore, StoreKeys};
use coalesce_flow::notification::JobState;
use coalesce_flow::oracle::memory::InMemoryOracle;
use coalesce_flow::scrub::{ScrubConfig, Scrubber};
use coalesce_flow::stats::names;

use common::{Harness, job, key};

fn scrubber(
    h: &Harness,
    oracle: &Arc<InMemoryOracle>,
) -> Scrubber<InMemoryKvStore, Arc<InMemoryOracle>> {
    Scrubber::new(
        h.index.clone(),
        h.stats.clone(),
        Arc::clone(oracle),
        ScrubConfig {
            oracle_concurrency: 2,
        },
    )
}

#[tokio::test]
async fn pass_keeps_only_pending_jobs() {
    let h = Harness::new();
    for id in ["j1", "j2", "j3"] {
        h.index.insert(&key("X"), &job(id)).await.unwrap();
    }
    let oracle = Arc::new(InMemoryOracle::new());
    oracle.set_state(&job("j1"), JobState::Pending);
    oracle.set_state(&job("j2"), JobState::Running);

    let report = scrubber(&h, &oracle).run_pass().await.unwrap();

    assert_eq!(h.index.list(&key("X")).await.unwrap(), vec![job("j1")]);
    assert_eq!(report.jobs_removed, 2);
    assert_eq!(h.stats.get(names::SCRUB_JOBS_REMOVED).await.unwrap(), 2);
}

#[tokio::test]
async fn transient_oracle_failure_keeps_the_job() {
    let h = Harness::new();
    h.index.insert(&key("X"), &job("j1")).await.unwrap();
    h.index.insert(&key("X"), &job("j2")).await.unwrap();
    let oracle = Arc::new(InMemoryOracle::new());
    oracle.set_unavailable(&job("j1"), "503 Service Unavailable");
    oracle.set_state(&job("j2"), JobState::Completed);

    let report = scrubber(&h, &oracle).run_pass().await.unwrap();

    assert_eq!(h.index.list(&key("X")).await.unwrap(), vec![job("j1")]);
    assert_eq!(report.oracle_failures, 1);
    // Not retried within the pass.
    assert_eq!(oracle.calls(&job("j1")), 1);
}

#[tokio::test]
async fn corrupt_list_entry_does_not_abort_the_pass() {
    let h = Harness::new();
    h.index.insert(&key("X"), &job("gone")).await.unwrap();
    h.store
        .list_push_unique(&StoreKeys::default().list(&key("X")), "")
        .await
        .unwrap();
    h.index.insert(&key("Y"), &job("waiting")).await.unwrap();
    let oracle = Arc::new(InMemoryOracle::new());
    oracle.set_state(&job("waiting"), JobState::Pending);

    let report = scrubber(&h, &oracle).run_pass().await.unwrap();

    assert_eq!(report.keys_inspected, 2);
    assert_eq!(report.jobs_removed, 1);
    assert!(h.index.list(&key("X")).await.unwrap().is_empty());
    assert_eq!(h.index.list(&key("Y")).await.unwrap(), vec![job("waiting")]);
}

#[tokio::test]
async fn emptied_keys_are_deregistered() {
    let h = Harness::new();
    h.index.insert(&key("stale"), &job("gone")).await.unwrap();
    h.index.insert(&key("live"), &job("waiting")).await.unwrap();
    let oracle = Arc::new(InMemoryOracle::new());
    oracle.set_state(&job("waiting"), JobState::Pending);

    let report = scrubber(&h, &oracle).run_pass().await.unwrap();

    assert_eq!(h.index.keys().await.unwrap(), vec![key("live")]);
    assert_eq!(report.keys_inspected, 2);
    assert_eq!(report.keys_removed, 1);
}

#[tokio::test]
async fn second_pass_finds_nothing_to_do() {
    let h = Harness::new();
    h.index.insert(&key("X"), &job("a")).await.unwrap();
    h.index.insert(&key("X"), &job("b")).await.unwrap();
    let oracle = Arc::new(InMemoryOracle::new());
    oracle.set_state(&job("a"), JobState::Pending);
    let scrubber = scrubber(&h, &oracle);

    scrubber.run_pass().await.unwrap();
    let second = scrubber.run_pass().await.unwrap();

    assert_eq!(second.jobs_removed, 0);
    assert_eq!(second.jobs_retained, 1);
    assert_eq!(h.stats.get(names::SCRUB_PASSES).await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scrub_and_live_routing_interleave_safely() {
    let h = Harness::new();
    let oracle = Arc::new(InMemoryOracle::new());
    for i in 0..50 {
        let id = format!("job-{i}");
        h.index.insert(&key("X"), &job(&id)).await.unwrap();
        if i % 2 == 0 {
            oracle.set_state(&job(&id), JobState::Pending);
        }
    }
    for i in 50..100 {
        oracle.set_state(&job(&format!("job-{i}")), JobState::Pending);
    }

    let scrubber = scrubber(&h, &oracle);
    let index = h.index.clone();
    let live = tokio::spawn(async move {
        for i in 50..100 {
            index.insert(&key("X"), &job(&format!("job-{i}"))).await.unwrap();
        }
    });
    let report = scrubber.run_pass().await.unwrap();
    live.await.unwrap();

    let list = h.index.list(&key("X")).await.unwrap();
    // Every pending job survives, whether or not the pass saw it.
    for i in (0..50).step_by(2) {
        assert!(list.contains(&job(&format!("job-{i}"))));
    }
    for i in 50..100 {
        assert!(list.contains(&job(&format!("job-{i}"))));
    }
    assert_eq!(report.jobs_removed, 25);
    assert_eq!(h.index.keys().await.unwrap(), vec![key("X")]);
}
