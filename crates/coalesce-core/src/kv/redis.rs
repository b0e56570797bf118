//! Redis key-value store implementation.
//!
//! This module provides [`RedisKvStore`], the production implementation of the
//! [`KvStore`] trait.
//!
//! ## Atomicity
//!
//! Redis has no native "append unless present" list command, so
//! [`KvStore::list_push_unique`] and the compound operations run as Lua
//! scripts. Redis executes a script without interleaving other commands,
//! which gives the router and the scrubber the same atomic view the
//! in-memory backend gets from its single lock.
//!
//! Requires Redis 6.0.6 or newer (`LPOS`).
//!
//! ## Example
//!
//! ```rust,no_run
//! use coalesce_core::kv::redis::RedisKvStore;
//!
//! # async fn connect() -> coalesce_core::Result<()> {
//! let store = RedisKvStore::connect("redis://127.0.0.1:6379").await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError, Script};

use super::{KvStore, Withdrawal};
use crate::error::{Error, Result};

const PUSH_UNIQUE: &str = r"
if redis.call('LPOS', KEYS[1], ARGV[1]) then
  return 0
end
redis.call('RPUSH', KEYS[1], ARGV[1])
return 1
";

const ENROLL: &str = r"
local appended = 0
if not redis.call('LPOS', KEYS[1], ARGV[1]) then
  redis.call('RPUSH', KEYS[1], ARGV[1])
  appended = 1
end
redis.call('SADD', KEYS[2], ARGV[2])
return appended
";

const WITHDRAW: &str = r"
local removed = redis.call('LREM', KEYS[1], 0, ARGV[1])
local deregistered = 0
if redis.call('LLEN', KEYS[1]) == 0 then
  deregistered = redis.call('SREM', KEYS[2], ARGV[2])
end
return {removed, deregistered}
";

const PRUNE: &str = r"
if redis.call('LLEN', KEYS[1]) == 0 then
  return redis.call('SREM', KEYS[2], ARGV[1])
end
return 0
";

struct Scripts {
    push_unique: Script,
    enroll: Script,
    withdraw: Script,
    prune: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            push_unique: Script::new(PUSH_UNIQUE),
            enroll: Script::new(ENROLL),
            withdraw: Script::new(WITHDRAW),
            prune: Script::new(PRUNE),
        }
    }
}

/// Maps a redis error to a store-unavailable error naming the operation.
fn store_err(op: &'static str) -> impl FnOnce(RedisError) -> Error {
    move |e| Error::store_unavailable_with_source(format!("redis {op} failed"), e)
}

fn to_usize(value: i64, op: &'static str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| Error::store_unavailable(format!("redis {op} returned {value}")))
}

/// Redis-backed key-value store.
///
/// Cheap to clone: clones share one multiplexed connection.
#[derive(Clone)]
pub struct RedisKvStore {
    conn: MultiplexedConnection,
    scripts: Arc<Scripts>,
}

impl fmt::Debug for RedisKvStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisKvStore").finish_non_exhaustive()
    }
}

impl RedisKvStore {
    /// Connects to the Redis server at `url`.
    ///
    /// Credentials are taken from the URL (`redis://:password@host:port`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an unparseable URL and
    /// [`Error::StoreUnavailable`] if the connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::configuration(format!("invalid REDIS_URL: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_err("connect"))?;
        Ok(Self::from_connection(conn))
    }

    /// Wraps an existing multiplexed connection.
    #[must_use]
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            scripts: Arc::new(Scripts::load()),
        }
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn set_add(&self, set: &str, member: &str) -> Result<bool> {
        let added: i64 = self.conn().sadd(set, member).await.map_err(store_err("SADD"))?;
        Ok(added > 0)
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<bool> {
        let removed: i64 = self.conn().srem(set, member).await.map_err(store_err("SREM"))?;
        Ok(removed > 0)
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>> {
        self.conn().smembers(set).await.map_err(store_err("SMEMBERS"))
    }

    async fn list_push_unique(&self, list: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn();
        let appended: i64 = self
            .scripts
            .push_unique
            .key(list)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err("push-unique script"))?;
        Ok(appended == 1)
    }

    async fn list_remove_all(&self, list: &str, value: &str) -> Result<usize> {
        let removed: i64 = self
            .conn()
            .lrem(list, 0, value)
            .await
            .map_err(store_err("LREM"))?;
        to_usize(removed, "LREM")
    }

    async fn list_range(&self, list: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.conn()
            .lrange(list, start, stop)
            .await
            .map_err(store_err("LRANGE"))
    }

    async fn list_len(&self, list: &str) -> Result<usize> {
        let len: i64 = self.conn().llen(list).await.map_err(store_err("LLEN"))?;
        to_usize(len, "LLEN")
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.conn().incr(key, delta).await.map_err(store_err("INCRBY"))
    }

    async fn get_counter(&self, key: &str) -> Result<i64> {
        let value: Option<i64> = self.conn().get(key).await.map_err(store_err("GET"))?;
        Ok(value.unwrap_or(0))
    }

    async fn enroll(&self, registry: &str, list: &str, member: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn();
        let appended: i64 = self
            .scripts
            .enroll
            .key(list)
            .key(registry)
            .arg(value)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err("enroll script"))?;
        Ok(appended == 1)
    }

    async fn withdraw(
        &self,
        registry: &str,
        list: &str,
        member: &str,
        value: &str,
    ) -> Result<Withdrawal> {
        let mut conn = self.conn();
        let reply: Vec<i64> = self
            .scripts
            .withdraw
            .key(list)
            .key(registry)
            .arg(value)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err("withdraw script"))?;

        let [removed, deregistered] = reply[..] else {
            return Err(Error::store_unavailable(format!(
                "withdraw script returned {} values",
                reply.len()
            )));
        };
        Ok(Withdrawal {
            removed: to_usize(removed, "withdraw script")?,
            deregistered: deregistered > 0,
        })
    }

    async fn prune(&self, registry: &str, list: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = self
            .scripts
            .prune
            .key(list)
            .key(registry)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err("prune script"))?;
        Ok(removed > 0)
    }
}
