//! Stale-list scrubber: reconciles membership lists against the oracle.
//!
//! Live notifications can be lost (the listener was down past the broker's
//! retention, a message was dead-lettered), leaving jobs listed that are no
//! longer pending. A scrub pass walks every registered key and asks the
//! [`JobStatusOracle`] about every listed job:
//!
//! | Oracle answer | Action |
//! |---------------|--------|
//! | `pending` | keep |
//! | any other state, or not found | remove |
//! | transient failure | keep, retry next pass |
//!
//! After each key the scrubber prunes it, which deregisters keys whose list
//! ended up empty even if no removal of this pass emptied it.
//!
//! The scrubber runs concurrently with live routing. Both only use the
//! store's atomic operations, so the worst interleaving removes a job that a
//! late `pending` re-inserts, or leaves one that the next pass removes.
//!
//! A store failure aborts the pass; the next pass starts over.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use ulid::Ulid;

use coalesce_core::observability::scrub_span;
use coalesce_core::{CommonalityKey, JobId, KvStore};

use crate::error::Result;
use crate::index::CoalescingIndex;
use crate::metrics::CoalesceMetrics;
use crate::oracle::{JobStatusOracle, OracleError};
use crate::stats::{StatsCounter, names};

/// Default number of concurrent oracle lookups.
pub const DEFAULT_ORACLE_CONCURRENCY: usize = 4;

/// Scrubber settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrubConfig {
    /// Oracle lookups in flight at once, per key.
    pub oracle_concurrency: usize,
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self {
            oracle_concurrency: DEFAULT_ORACLE_CONCURRENCY,
        }
    }
}

/// Summary of one scrub pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrubReport {
    /// Identifier of the pass, for log correlation.
    pub pass_id: Ulid,
    /// When the pass started.
    pub started_at: DateTime<Utc>,
    /// Keys visited.
    pub keys_inspected: usize,
    /// Jobs looked up.
    pub jobs_inspected: usize,
    /// Jobs the oracle still reports as pending.
    pub jobs_retained: usize,
    /// Jobs removed from their list.
    pub jobs_removed: usize,
    /// Keys deregistered.
    pub keys_removed: usize,
    /// Jobs kept because the oracle could not answer.
    pub oracle_failures: usize,
    /// Wall-clock duration of the pass.
    pub elapsed: Duration,
}

impl ScrubReport {
    fn start() -> Self {
        Self {
            pass_id: Ulid::new(),
            started_at: Utc::now(),
            keys_inspected: 0,
            jobs_inspected: 0,
            jobs_retained: 0,
            jobs_removed: 0,
            keys_removed: 0,
            oracle_failures: 0,
            elapsed: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobVerdict {
    Retained,
    Removed { deregistered: bool },
    AlreadyGone,
    OracleFailed,
}

impl JobVerdict {
    const fn label(self) -> &'static str {
        match self {
            Self::Retained => "retained",
            Self::Removed { .. } => "removed",
            Self::AlreadyGone => "already_gone",
            Self::OracleFailed => "oracle_error",
        }
    }
}

/// Reconciles the coalescing index against a job-status oracle.
#[derive(Debug)]
pub struct Scrubber<S: ?Sized, O> {
    index: CoalescingIndex<S>,
    stats: StatsCounter<S>,
    oracle: O,
    config: ScrubConfig,
    metrics: CoalesceMetrics,
}

impl<S, O> Scrubber<S, O>
where
    S: KvStore + ?Sized,
    O: JobStatusOracle,
{
    /// Creates a scrubber.
    #[must_use]
    pub fn new(
        index: CoalescingIndex<S>,
        stats: StatsCounter<S>,
        oracle: O,
        config: ScrubConfig,
    ) -> Self {
        Self {
            index,
            stats,
            oracle,
            config,
            metrics: CoalesceMetrics::new(),
        }
    }

    /// Runs one pass over every registered key.
    ///
    /// # Errors
    ///
    /// Returns a store-unavailable error if the store fails; the pass stops
    /// at that point and removals already made stay applied.
    pub async fn run_pass(&self) -> Result<ScrubReport> {
        let started = Instant::now();
        let mut report = ScrubReport::start();
        tracing::info!(pass_id = %report.pass_id, "scrub pass started");

        let keys = self.index.keys().await?;
        for key in &keys {
            self.scrub_key(key, &mut report)
                .instrument(scrub_span(key.as_str()))
                .await?;
        }

        report.elapsed = started.elapsed();
        self.metrics.observe_scrub_duration(report.elapsed);
        self.record_stats(&report).await;

        tracing::info!(
            pass_id = %report.pass_id,
            keys_inspected = report.keys_inspected,
            jobs_inspected = report.jobs_inspected,
            jobs_removed = report.jobs_removed,
            keys_removed = report.keys_removed,
            oracle_failures = report.oracle_failures,
            elapsed = ?report.elapsed,
            "scrub pass completed"
        );
        Ok(report)
    }

    /// Runs a pass every `interval` until `shutdown` is cancelled.
    ///
    /// A failed pass is logged and the next one runs on schedule. Returns the
    /// number of passes that completed.
    pub async fn run_periodic(&self, interval: Duration, shutdown: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut completed = 0;

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.run_pass().await {
                Ok(_) => completed += 1,
                Err(e) => tracing::error!(error = %e, "scrub pass failed"),
            }
        }

        tracing::info!(completed, "scrubber stopped");
        completed
    }

    async fn scrub_key(&self, key: &CommonalityKey, report: &mut ScrubReport) -> Result<()> {
        let jobs = self.index.list(key).await?;
        report.keys_inspected += 1;
        report.jobs_inspected += jobs.len();

        let verdicts: Vec<Result<JobVerdict>> = stream::iter(jobs)
            .map(|job| self.scrub_job(key, job))
            .buffer_unordered(self.config.oracle_concurrency.max(1))
            .collect()
            .await;

        for verdict in verdicts {
            let verdict = verdict?;
            self.metrics.record_scrub_job(verdict.label());
            match verdict {
                JobVerdict::Retained => report.jobs_retained += 1,
                JobVerdict::Removed { deregistered } => {
                    report.jobs_removed += 1;
                    if deregistered {
                        report.keys_removed += 1;
                    }
                }
                JobVerdict::AlreadyGone => {}
                JobVerdict::OracleFailed => report.oracle_failures += 1,
            }
        }

        if self.index.prune(key).await? {
            tracing::info!(key = %key, "deregistered empty key");
            report.keys_removed += 1;
        }
        Ok(())
    }

    async fn scrub_job(&self, key: &CommonalityKey, job: JobId) -> Result<JobVerdict> {
        let state = match self.oracle.status(&job).await {
            Ok(state) if state.is_pending() => return Ok(JobVerdict::Retained),
            Ok(state) => state.to_string(),
            Err(OracleError::NotFound) => "not_found".to_string(),
            Err(OracleError::Transient(message)) => {
                tracing::warn!(
                    job_id = %job,
                    error = %message,
                    "oracle lookup failed; keeping job"
                );
                return Ok(JobVerdict::OracleFailed);
            }
        };

        let removal = self.index.remove(key, &job).await?;
        if removal.removed == 0 {
            return Ok(JobVerdict::AlreadyGone);
        }
        tracing::info!(key = %key, job_id = %job, state = %state, "removed stale job");
        Ok(JobVerdict::Removed {
            deregistered: removal.deregistered,
        })
    }

    async fn record_stats(&self, report: &ScrubReport) {
        let updates = [
            (names::SCRUB_JOBS_REMOVED, report.jobs_removed),
            (names::SCRUB_KEYS_REMOVED, report.keys_removed),
            (names::SCRUB_PASSES, 1),
        ];
        for (name, value) in updates {
            if value == 0 {
                continue;
            }
            let value = u64::try_from(value).unwrap_or(u64::MAX);
            if let Err(e) = self.stats.incr_by(name, value).await {
                tracing::warn!(error = %e, stat = name, "failed to record scrub stat");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::notification::JobState;
    use crate::oracle::memory::InMemoryOracle;
    use coalesce_core::{InMemoryKvStore, StoreKeys};

    struct Fixture {
        store: Arc<InMemoryKvStore>,
        oracle: Arc<InMemoryOracle>,
        scrubber: Scrubber<InMemoryKvStore, Arc<InMemoryOracle>>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryKvStore::new());
        let oracle = Arc::new(InMemoryOracle::new());
        let keys = StoreKeys::default();
        let scrubber = Scrubber::new(
            CoalescingIndex::new(Arc::clone(&store), keys.clone()),
            StatsCounter::new(Arc::clone(&store), keys),
            Arc::clone(&oracle),
            ScrubConfig::default(),
        );
        Fixture {
            store,
            oracle,
            scrubber,
        }
    }

    fn key(s: &str) -> CommonalityKey {
        CommonalityKey::new(s).unwrap()
    }

    fn job(s: &str) -> JobId {
        JobId::new(s).unwrap()
    }

    #[tokio::test]
    async fn removes_only_non_pending_jobs() {
        let f = fixture();
        for id in ["a", "b", "c"] {
            f.scrubber.index.insert(&key("k"), &job(id)).await.unwrap();
        }
        f.oracle.set_state(&job("a"), JobState::Pending);
        f.oracle.set_state(&job("b"), JobState::Completed);

        let report = f.scrubber.run_pass().await.unwrap();

        assert_eq!(report.jobs_inspected, 3);
        assert_eq!(report.jobs_retained, 1);
        assert_eq!(report.jobs_removed, 2);
        assert_eq!(report.keys_removed, 0);
        assert_eq!(f.scrubber.index.list(&key("k")).await.unwrap(), vec![job("a")]);
    }

    #[tokio::test]
    async fn oracle_failures_keep_the_job() {
        let f = fixture();
        f.scrubber.index.insert(&key("k"), &job("a")).await.unwrap();
        f.oracle.set_unavailable(&job("a"), "timeout");

        let report = f.scrubber.run_pass().await.unwrap();
        assert_eq!(report.oracle_failures, 1);
        assert_eq!(f.oracle.calls(&job("a")), 1);
        assert_eq!(f.scrubber.index.list(&key("k")).await.unwrap(), vec![job("a")]);
    }

    #[tokio::test]
    async fn emptied_key_is_deregistered_and_counted() {
        let f = fixture();
        f.scrubber.index.insert(&key("k"), &job("a")).await.unwrap();

        let report = f.scrubber.run_pass().await.unwrap();
        assert_eq!(report.keys_removed, 1);
        assert!(f.scrubber.index.keys().await.unwrap().is_empty());
        assert_eq!(f.scrubber.stats.get(names::SCRUB_KEYS_REMOVED).await.unwrap(), 1);
        assert_eq!(f.scrubber.stats.get(names::SCRUB_PASSES).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn orphaned_registry_entry_is_pruned() {
        let f = fixture();
        f.store.set_add("coalesce.v1.list_keys", "orphan").await.unwrap();

        let report = f.scrubber.run_pass().await.unwrap();
        assert_eq!(report.keys_inspected, 1);
        assert_eq!(report.keys_removed, 1);
        assert!(f.scrubber.index.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failure_aborts_the_pass() {
        let f = fixture();
        f.scrubber.index.insert(&key("k"), &job("a")).await.unwrap();
        f.store.set_available(false);

        let err = f.scrubber.run_pass().await.unwrap_err();
        assert!(err.is_store_unavailable());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_runs_until_cancelled() {
        let f = fixture();
        let token = CancellationToken::new();
        let stopper = {
            let token = token.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(25)).await;
                token.cancel();
            }
        };

        let (completed, ()) = tokio::join!(
            f.scrubber.run_periodic(Duration::from_secs(10), token.clone()),
            stopper
        );
        // Ticks at 0s, 10s and 20s.
        assert_eq!(completed, 3);
    }
}
