//! Store-persisted stats counters.
//!
//! Counters are monotonically increasing integers kept in the shared store at
//! `{prefix}stats.{name}`, so every listener instance and the scrubber add to
//! the same totals. Operators read them through the read API.

use std::collections::BTreeMap;
use std::sync::Arc;

use coalesce_core::{KvStore, StoreKeys};

use crate::error::Result;

/// Well-known counter names.
pub mod names {
    /// Pending notifications inserted into a list.
    pub const PENDING: &str = "pending";
    /// Running notifications removed from a list.
    pub const RUNNING: &str = "running";
    /// Exception notifications removed from a list.
    pub const EXCEPTION: &str = "exception";
    /// Notifications discarded because they were not the primary attempt.
    pub const SKIPPED_ATTEMPT: &str = "skipped_attempt";
    /// Jobs removed by the scrubber.
    pub const SCRUB_JOBS_REMOVED: &str = "scrub.jobs_removed";
    /// Keys deregistered by the scrubber.
    pub const SCRUB_KEYS_REMOVED: &str = "scrub.keys_removed";
    /// Completed scrub passes.
    pub const SCRUB_PASSES: &str = "scrub.passes";

    /// Every well-known counter, in reporting order.
    pub const ALL: &[&str] = &[
        PENDING,
        RUNNING,
        EXCEPTION,
        SKIPPED_ATTEMPT,
        SCRUB_JOBS_REMOVED,
        SCRUB_KEYS_REMOVED,
        SCRUB_PASSES,
    ];
}

/// Named counters persisted in the shared store.
#[derive(Debug)]
pub struct StatsCounter<S: ?Sized> {
    store: Arc<S>,
    keys: StoreKeys,
}

impl<S: ?Sized> Clone for StatsCounter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keys: self.keys.clone(),
        }
    }
}

impl<S: KvStore + ?Sized> StatsCounter<S> {
    /// Creates a counter set over `store`.
    #[must_use]
    pub fn new(store: Arc<S>, keys: StoreKeys) -> Self {
        Self { store, keys }
    }

    /// Increments `name` by one.
    ///
    /// # Errors
    ///
    /// Returns a store-unavailable error if the store cannot be reached.
    pub async fn incr(&self, name: &str) -> Result<i64> {
        self.incr_by(name, 1).await
    }

    /// Increments `name` by `n`.
    ///
    /// # Errors
    ///
    /// Returns a store-unavailable error if the store cannot be reached.
    pub async fn incr_by(&self, name: &str, n: u64) -> Result<i64> {
        let delta = i64::try_from(n).unwrap_or(i64::MAX);
        Ok(self.store.incr_by(&self.keys.stat(name), delta).await?)
    }

    /// Returns the current value of `name` (zero when never incremented).
    ///
    /// # Errors
    ///
    /// Returns a store-unavailable error if the store cannot be reached.
    pub async fn get(&self, name: &str) -> Result<i64> {
        Ok(self.store.get_counter(&self.keys.stat(name)).await?)
    }

    /// Reads every counter in `names`.
    ///
    /// # Errors
    ///
    /// Returns a store-unavailable error if the store cannot be reached.
    pub async fn snapshot(&self, names: &[&str]) -> Result<BTreeMap<String, i64>> {
        let mut values = BTreeMap::new();
        for name in names {
            values.insert((*name).to_string(), self.get(name).await?);
        }
        Ok(values)
    }
}
