//! In-memory key-value store implementation for testing.
//!
//! This module provides [`InMemoryKvStore`], a simple in-memory implementation
//! of the [`KvStore`] trait suitable for testing and development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No cross-process sharing
//! - **Single-process only**: Lists are not visible across process boundaries
//! - **No persistence**: All state is lost when the process exits

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{KvStore, Withdrawal, resolve_range};
use crate::error::{Error, Result};

/// Internal store state protected by a single lock.
#[derive(Debug, Default)]
struct StoreState {
    sets: HashMap<String, BTreeSet<String>>,
    lists: HashMap<String, Vec<String>>,
    counters: HashMap<String, i64>,
}

impl StoreState {
    fn push_unique(&mut self, list: &str, value: &str) -> bool {
        let entries = self.lists.entry(list.to_string()).or_default();
        if entries.iter().any(|existing| existing == value) {
            return false;
        }
        entries.push(value.to_string());
        true
    }

    fn remove_all(&mut self, list: &str, value: &str) -> usize {
        let Some(entries) = self.lists.get_mut(list) else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|existing| existing != value);
        let removed = before - entries.len();
        // Redis drops a list key once it is empty.
        if entries.is_empty() {
            self.lists.remove(list);
        }
        removed
    }

    fn len(&self, list: &str) -> usize {
        self.lists.get(list).map_or(0, Vec::len)
    }

    fn set_add(&mut self, set: &str, member: &str) -> bool {
        self.sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string())
    }

    fn set_remove(&mut self, set: &str, member: &str) -> bool {
        let Some(members) = self.sets.get_mut(set) else {
            return false;
        };
        let removed = members.remove(member);
        if members.is_empty() {
            self.sets.remove(set);
        }
        removed
    }

    fn prune(&mut self, registry: &str, list: &str, member: &str) -> bool {
        if self.len(list) == 0 {
            self.set_remove(registry, member)
        } else {
            false
        }
    }
}

/// In-memory key-value store for testing.
///
/// Provides a thread-safe implementation of the [`KvStore`] trait using
/// `RwLock` for synchronization. Compound operations run under a single write
/// lock, mirroring the atomic scripts of the Redis backend.
///
/// [`InMemoryKvStore::set_available`] simulates an unreachable store: while
/// unavailable every call fails with [`Error::StoreUnavailable`].
///
/// ## Example
///
/// ```rust
/// use coalesce_core::kv::memory::InMemoryKvStore;
///
/// let store = InMemoryKvStore::new();
/// store.set_available(false);
/// // Every call now fails with StoreUnavailable...
/// ```
#[derive(Debug)]
pub struct InMemoryKvStore {
    state: RwLock<StoreState>,
    available: AtomicBool,
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a lock poison error to a store error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::store_unavailable("in-memory store lock poisoned")
}

impl InMemoryKvStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Marks the store reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::store_unavailable("in-memory store marked unavailable"))
        }
    }

    /// Returns true if `key` names any set, list or counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn contains_key(&self, key: &str) -> Result<bool> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.sets.contains_key(key)
            || state.lists.contains_key(key)
            || state.counters.contains_key(key))
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn set_add(&self, set: &str, member: &str) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.write().map_err(poison_err)?;
        Ok(state.set_add(set, member))
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.write().map_err(poison_err)?;
        Ok(state.set_remove(set, member))
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_push_unique(&self, list: &str, value: &str) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.write().map_err(poison_err)?;
        Ok(state.push_unique(list, value))
    }

    async fn list_remove_all(&self, list: &str, value: &str) -> Result<usize> {
        self.check_available()?;
        let mut state = self.state.write().map_err(poison_err)?;
        Ok(state.remove_all(list, value))
    }

    async fn list_range(&self, list: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.check_available()?;
        let state = self.state.read().map_err(poison_err)?;
        let Some(entries) = state.lists.get(list) else {
            return Ok(Vec::new());
        };
        Ok(resolve_range(entries.len(), start, stop)
            .map(|(from, to)| entries[from..=to].to_vec())
            .unwrap_or_default())
    }

    async fn list_len(&self, list: &str) -> Result<usize> {
        self.check_available()?;
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.len(list))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.check_available()?;
        let mut state = self.state.write().map_err(poison_err)?;
        let counter = state.counters.entry(key.to_string()).or_insert(0);
        *counter = counter
            .checked_add(delta)
            .ok_or_else(|| Error::InvalidInput(format!("counter {key} would overflow")))?;
        Ok(*counter)
    }

    async fn get_counter(&self, key: &str) -> Result<i64> {
        self.check_available()?;
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.counters.get(key).copied().unwrap_or(0))
    }

    async fn enroll(&self, registry: &str, list: &str, member: &str, value: &str) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.write().map_err(poison_err)?;
        let appended = state.push_unique(list, value);
        state.set_add(registry, member);
        drop(state);
        Ok(appended)
    }

    async fn withdraw(
        &self,
        registry: &str,
        list: &str,
        member: &str,
        value: &str,
    ) -> Result<Withdrawal> {
        self.check_available()?;
        let mut state = self.state.write().map_err(poison_err)?;
        let removed = state.remove_all(list, value);
        let deregistered = state.prune(registry, list, member);
        drop(state);
        Ok(Withdrawal {
            removed,
            deregistered,
        })
    }

    async fn prune(&self, registry: &str, list: &str, member: &str) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.write().map_err(poison_err)?;
        Ok(state.prune(registry, list, member))
    }
}
