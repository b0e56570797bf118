//! Event router: maps one lifecycle notification to one index mutation.
//!
//! Routing a message runs these steps:
//!
//! 1. Validate the body ([`Notification::parse`]).
//! 2. Discard non-primary attempts (counted as `skipped_attempt`).
//! 3. Extract the commonality key from the routing annotations.
//! 4. Classify the state: `pending` inserts, `running`/`exception` removes,
//!    anything else is an error the consumer requeues once, then parks.
//! 5. Count the outcome in the stats counter.
//!
//! [`Settlement::for_result`] turns the result into the settlement the
//! consumer applies: only an outcome that completed against the store is
//! acknowledged.

use coalesce_core::{CommonalityKey, JobId, KvStore};

use crate::bus::{InboundMessage, ROUTE_PREFIX, Settlement};
use crate::error::{Error, Result};
use crate::index::{CoalescingIndex, Removal};
use crate::notification::{JobState, Lifecycle, Notification};
use crate::stats::{StatsCounter, names};

/// Router configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Annotation prefix that precedes the commonality key, e.g.
    /// `route.coalesce.v1.`.
    pub route_prefix: String,
}

impl RouterConfig {
    /// Builds the configuration for a namespace.
    #[must_use]
    pub fn for_namespace(namespace: &str) -> Self {
        Self {
            route_prefix: format!("{ROUTE_PREFIX}{namespace}"),
        }
    }
}

/// What routing one notification did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A pending job was inserted.
    Inserted {
        /// Commonality key.
        key: CommonalityKey,
        /// Job inserted.
        job_id: JobId,
        /// False if the job was already listed.
        appended: bool,
    },
    /// A job that left the pending state was removed.
    Removed {
        /// Commonality key.
        key: CommonalityKey,
        /// Job removed.
        job_id: JobId,
        /// Reported state (`running` or `exception`).
        state: JobState,
        /// What the removal changed.
        removal: Removal,
    },
    /// A non-primary attempt was discarded without touching the index.
    SkippedAttempt {
        /// Job the notification was about.
        job_id: JobId,
        /// Attempt number.
        attempt: u32,
    },
}

impl RouteOutcome {
    /// Stable label for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Inserted { .. } => "inserted",
            Self::Removed { .. } => "removed",
            Self::SkippedAttempt { .. } => "skipped_attempt",
        }
    }
}

impl Settlement {
    /// Chooses how to settle a message given its routing result and whether
    /// the broker delivered it before.
    ///
    /// | Result | First delivery | Redelivery |
    /// |--------|----------------|------------|
    /// | any outcome | `Ack` | `Ack` |
    /// | malformed body, no matching route | `Reject` | `Reject` |
    /// | store failure | `Requeue` | `Requeue` |
    /// | unrecognized state, anything else | `Requeue` | `Reject` |
    ///
    /// A message that failed once already is parked instead of requeued a
    /// second time, so it cannot block the queue behind it.
    #[must_use]
    pub fn for_result(result: &Result<RouteOutcome>, redelivered: bool) -> Self {
        match result {
            Ok(_) => Self::Ack,
            Err(Error::MalformedNotification { .. } | Error::Routing { .. }) => Self::Reject,
            Err(e) if e.is_store_unavailable() => Self::Requeue,
            Err(_) if redelivered => Self::Reject,
            Err(_) => Self::Requeue,
        }
    }
}

/// Routes notifications into the coalescing index.
#[derive(Debug)]
pub struct EventRouter<S: ?Sized> {
    index: CoalescingIndex<S>,
    stats: StatsCounter<S>,
    config: RouterConfig,
}

impl<S: ?Sized> Clone for EventRouter<S> {
    fn clone(&self) -> Self {
        Self {
            index: self.index.clone(),
            stats: self.stats.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: KvStore + ?Sized> EventRouter<S> {
    /// Creates a router.
    #[must_use]
    pub fn new(index: CoalescingIndex<S>, stats: StatsCounter<S>, config: RouterConfig) -> Self {
        Self {
            index,
            stats,
            config,
        }
    }

    /// Returns the router configuration.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Finds the commonality key in a message's routing annotations.
    ///
    /// The first annotation starting with the route prefix wins; the key is
    /// the remainder after the prefix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Routing`] if no annotation carries a non-empty key.
    pub fn extract_key<'a>(
        &self,
        annotations: impl IntoIterator<Item = &'a str>,
    ) -> Result<CommonalityKey> {
        let mut seen = Vec::new();
        for annotation in annotations {
            if let Some(rest) = annotation.strip_prefix(self.config.route_prefix.as_str()) {
                if let Ok(key) = CommonalityKey::new(rest) {
                    return Ok(key);
                }
            }
            seen.push(annotation.to_string());
        }
        Err(Error::Routing {
            namespace: self.config.route_prefix.clone(),
            annotations: seen,
        })
    }

    /// Routes one message.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedNotification`] if the body fails validation.
    /// - [`Error::Routing`] if no annotation matches the namespace.
    /// - [`Error::UnrecognizedState`] for states other than
    ///   pending/running/exception.
    /// - A store-unavailable error if the mutation could not be applied.
    pub async fn route(&self, message: &InboundMessage) -> Result<RouteOutcome> {
        let notification = Notification::parse(&message.payload)?;
        let job_id = notification.status.job_id.clone();

        if !notification.is_primary_attempt() {
            tracing::debug!(
                job_id = %job_id,
                attempt = notification.attempt,
                "skipping non-primary attempt"
            );
            self.count(names::SKIPPED_ATTEMPT).await;
            return Ok(RouteOutcome::SkippedAttempt {
                job_id,
                attempt: notification.attempt,
            });
        }

        let key = self.extract_key(message.routing_annotations())?;

        match notification.lifecycle() {
            Lifecycle::Pending => {
                let appended = self.index.insert(&key, &job_id).await?;
                self.count(names::PENDING).await;
                tracing::info!(key = %key, job_id = %job_id, appended, "job pending");
                Ok(RouteOutcome::Inserted {
                    key,
                    job_id,
                    appended,
                })
            }
            Lifecycle::Terminal(state) => {
                let removal = self.index.remove(&key, &job_id).await?;
                self.count(stat_for(&state)).await;
                tracing::info!(
                    key = %key,
                    job_id = %job_id,
                    state = %state,
                    removed = removal.removed,
                    deregistered = removal.deregistered,
                    "job left pending"
                );
                Ok(RouteOutcome::Removed {
                    key,
                    job_id,
                    state,
                    removal,
                })
            }
            Lifecycle::Unrecognized(state) => Err(Error::UnrecognizedState {
                state: state.to_string(),
                job_id: job_id.to_string(),
            }),
        }
    }

    // Runs after the mutation applied: failures are logged, never returned.
    async fn count(&self, name: &str) {
        if let Err(e) = self.stats.incr(name).await {
            tracing::warn!(error = %e, stat = name, "failed to increment stat");
        }
    }
}

fn stat_for(state: &JobState) -> &'static str {
    match state {
        JobState::Exception => names::EXCEPTION,
        _ => names::RUNNING,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bus::TASK_PENDING_EXCHANGE;
    use coalesce_core::{InMemoryKvStore, StoreKeys};

    fn router() -> (Arc<InMemoryKvStore>, EventRouter<InMemoryKvStore>) {
        let store = Arc::new(InMemoryKvStore::new());
        let keys = StoreKeys::default();
        let router = EventRouter::new(
            CoalescingIndex::new(Arc::clone(&store), keys.clone()),
            StatsCounter::new(Arc::clone(&store), keys),
            RouterConfig::for_namespace("coalesce.v1."),
        );
        (store, router)
    }

    fn message(attempt: u32, state: &str, job: &str, cc: &[&str]) -> InboundMessage {
        InboundMessage {
            delivery_tag: 1,
            exchange: TASK_PENDING_EXCHANGE.into(),
            routing_key: format!("primary.{job}.{attempt}"),
            cc: cc.iter().map(|s| (*s).to_string()).collect(),
            payload: format!(
                r#"{{"attempt":{attempt},"status":{{"state":"{state}","jobId":"{job}"}}}}"#
            )
            .into_bytes(),
            redelivered: false,
        }
    }

    #[test]
    fn key_extraction_strips_prefix() {
        let (_, router) = router();
        let key = router
            .extract_key(["primary.x", "route.other.k", "route.coalesce.v1.builds.linux"])
            .unwrap();
        assert_eq!(key.as_str(), "builds.linux");
    }

    #[test]
    fn key_extraction_ignores_empty_remainder() {
        let (_, router) = router();
        let err = router.extract_key(["route.coalesce.v1."]).unwrap_err();
        assert!(matches!(err, Error::Routing { .. }));
    }

    #[tokio::test]
    async fn pending_inserts_and_counts() {
        let (_, router) = router();
        let outcome = router
            .route(&message(0, "pending", "a", &["route.coalesce.v1.k"]))
            .await
            .unwrap();
        assert_eq!(outcome.label(), "inserted");
        assert_eq!(router.stats.get(names::PENDING).await.unwrap(), 1);
        assert_eq!(
            router.index.list(&CommonalityKey::new("k").unwrap()).await.unwrap(),
            vec![JobId::new("a").unwrap()]
        );
    }

    #[tokio::test]
    async fn exception_removes_and_counts() {
        let (_, router) = router();
        router
            .route(&message(0, "pending", "a", &["route.coalesce.v1.k"]))
            .await
            .unwrap();
        let outcome = router
            .route(&message(0, "exception", "a", &["route.coalesce.v1.k"]))
            .await
            .unwrap();

        let RouteOutcome::Removed { removal, state, .. } = outcome else {
            panic!("expected removal");
        };
        assert_eq!(state, JobState::Exception);
        assert!(removal.deregistered);
        assert_eq!(router.stats.get(names::EXCEPTION).await.unwrap(), 1);
        assert!(router.index.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_attempts_never_touch_the_index() {
        let (_, router) = router();
        let outcome = router
            .route(&message(1, "pending", "a", &["route.coalesce.v1.k"]))
            .await
            .unwrap();
        assert_eq!(outcome.label(), "skipped_attempt");
        assert!(router.index.keys().await.unwrap().is_empty());
        assert_eq!(router.stats.get(names::SKIPPED_ATTEMPT).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn completed_state_is_unrecognized() {
        let (_, router) = router();
        let result = router
            .route(&message(0, "completed", "a", &["route.coalesce.v1.k"]))
            .await;
        assert!(matches!(result, Err(Error::UnrecognizedState { .. })));
        assert_eq!(Settlement::for_result(&result, false), Settlement::Requeue);
        assert_eq!(Settlement::for_result(&result, true), Settlement::Reject);
    }

    #[tokio::test]
    async fn settlement_policy() {
        let (store, router) = router();

        let malformed = InboundMessage {
            payload: b"{}".to_vec(),
            ..message(0, "pending", "a", &[])
        };
        assert_eq!(
            Settlement::for_result(&router.route(&malformed).await, false),
            Settlement::Reject
        );

        let unrouted = router.route(&message(0, "pending", "a", &["route.elsewhere.k"])).await;
        assert_eq!(Settlement::for_result(&unrouted, false), Settlement::Reject);

        store.set_available(false);
        let unavailable = router
            .route(&message(0, "pending", "a", &["route.coalesce.v1.k"]))
            .await;
        assert!(unavailable.as_ref().is_err_and(Error::is_store_unavailable));
        assert_eq!(Settlement::for_result(&unavailable, false), Settlement::Requeue);
        // Store outages never park a message, however often it comes back.
        assert_eq!(Settlement::for_result(&unavailable, true), Settlement::Requeue);
    }
}
