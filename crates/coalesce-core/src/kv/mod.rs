//! Pluggable key-value store for coalescing state.
//!
//! The [`KvStore`] trait is the only shared mutable resource of the service:
//! the Key Registry, every Membership List and the stats counters live behind
//! it. Nothing above this layer caches lists in process memory.
//!
//! ## Design Principles
//!
//! - **Atomic primitives**: set-add, set-remove, append-if-absent and
//!   remove-all-matching are each atomic at the store level, so concurrent
//!   writers (the live router and the scrubber) never lose an update
//! - **Compound operations**: [`KvStore::enroll`], [`KvStore::withdraw`] and
//!   [`KvStore::prune`] combine a list mutation with the matching registry
//!   update; backends override the default compositions with a single atomic
//!   step where the store allows it
//! - **Testability**: In-memory implementation for tests, Redis for production

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;

use crate::error::Result;

/// Result of removing a value from a membership list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Withdrawal {
    /// Number of occurrences removed from the list.
    pub removed: usize,
    /// Whether the registry entry was removed because the list became empty.
    pub deregistered: bool,
}

impl Withdrawal {
    /// Returns true if nothing was removed.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.removed == 0 && !self.deregistered
    }
}

/// Storage abstraction exposing the atomic primitives the coalescing index needs.
///
/// List indices follow Redis `LRANGE` semantics: inclusive on both ends,
/// negative values count from the tail (`-1` is the last element).
///
/// ## Errors
///
/// Every method fails with [`crate::Error::StoreUnavailable`] when the store
/// cannot be reached. Callers must not assume the mutation applied.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from the
/// consumer loop, the scrubber and the read API.
#[async_trait]
pub trait KvStore: Send + Sync {
    // --- Sets ---

    /// Adds `member` to `set`. Returns true if it was not already present.
    async fn set_add(&self, set: &str, member: &str) -> Result<bool>;

    /// Removes `member` from `set`. Returns true if it was present.
    async fn set_remove(&self, set: &str, member: &str) -> Result<bool>;

    /// Returns every member of `set`, in no particular order.
    async fn set_members(&self, set: &str) -> Result<Vec<String>>;

    // --- Lists ---

    /// Appends `value` to `list` unless it already occurs there.
    ///
    /// Returns true if the value was appended.
    async fn list_push_unique(&self, list: &str, value: &str) -> Result<bool>;

    /// Removes every occurrence of `value` from `list`.
    ///
    /// Returns the number of removed occurrences (zero is not an error).
    async fn list_remove_all(&self, list: &str, value: &str) -> Result<usize>;

    /// Returns the elements of `list` between `start` and `stop` inclusive.
    async fn list_range(&self, list: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    /// Returns the length of `list` (zero when it does not exist).
    async fn list_len(&self, list: &str) -> Result<usize>;

    // --- Counters ---

    /// Atomically adds `delta` to the counter at `key`, returning the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    /// Returns the current value of the counter at `key` (zero when unset).
    async fn get_counter(&self, key: &str) -> Result<i64>;

    // --- Compound operations ---

    /// Appends `value` to `list` if absent and registers `member` in `registry`.
    ///
    /// Returns true if the value was appended.
    async fn enroll(&self, registry: &str, list: &str, member: &str, value: &str) -> Result<bool> {
        let appended = self.list_push_unique(list, value).await?;
        self.set_add(registry, member).await?;
        Ok(appended)
    }

    /// Removes every occurrence of `value` from `list` and deregisters
    /// `member` from `registry` if the list is left empty.
    ///
    /// The registry check runs even when `value` was absent, so a key that
    /// stayed registered over an empty list is healed by any later removal.
    async fn withdraw(
        &self,
        registry: &str,
        list: &str,
        member: &str,
        value: &str,
    ) -> Result<Withdrawal> {
        let removed = self.list_remove_all(list, value).await?;
        let deregistered = self.prune(registry, list, member).await?;
        Ok(Withdrawal {
            removed,
            deregistered,
        })
    }

    /// Deregisters `member` from `registry` if `list` is empty.
    ///
    /// Returns true if the registry entry was removed.
    async fn prune(&self, registry: &str, list: &str, member: &str) -> Result<bool> {
        if self.list_len(list).await? == 0 {
            self.set_remove(registry, member).await
        } else {
            Ok(false)
        }
    }
}

/// Resolves Redis-style inclusive `start..=stop` indices against a list length.
///
/// Returns `None` when the range selects nothing.
#[must_use]
pub fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len_i = isize::try_from(len).ok()?;
    let start = if start < 0 { (len_i + start).max(0) } else { start };
    let stop = if stop < 0 { len_i + stop } else { stop.min(len_i - 1) };
    if start > stop || start >= len_i || stop < 0 {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}
