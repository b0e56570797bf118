//! Command-line and environment configuration for the binaries.
//!
//! Every setting can be given as a flag or an environment variable. Secrets
//! are wrapped in [`Redacted`] so the parsed configuration can be logged.
//!
//! ## Environment
//!
//! | Variable | Binary | Default |
//! |----------|--------|---------|
//! | `REDIS_URL` | all | required |
//! | `COALESCE_PREFIX` | all | `coalesce.v1.` |
//! | `PULSE_URL` | listener | `amqps://pulse.mozilla.org:5671` |
//! | `PULSE_USERNAME` / `PULSE_PASSWORD` | listener | required |
//! | `PULSE_QUEUE_NAME` | listener | `coalesce` |
//! | `PULSE_EXCHANGES` | listener | pending, running, exception |
//! | `COALESCE_READ_TIMEOUT_SECS` | listener | `300` |
//! | `COALESCE_RESUBSCRIBE_BACKOFF_MS` | listener | `1000` |
//! | `COALESCE_REQUEUE_DELAY_MS` | listener | `1000` |
//! | `COALESCE_METRICS_PORT` | listener, scrubber | unset (no exporter endpoint) |
//! | `TASKCLUSTER_ROOT_URL` | scrubber | `https://firefox-ci-tc.services.mozilla.com` |
//! | `COALESCE_SCRUB_INTERVAL_SECS` | scrubber | unset (one pass) |
//! | `COALESCE_SCRUB_CONCURRENCY` | scrubber | `4` |
//! | `COALESCE_ORACLE_TIMEOUT_SECS` | scrubber | `30` |
//! | `PORT` | web | `8080` |

use std::sync::Arc;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::{Args, Parser};

use coalesce_core::store_keys::DEFAULT_PREFIX;
use coalesce_core::{KvStore, Redacted, RedisKvStore, StoreKeys};

use crate::bus::{Binding, DEFAULT_EXCHANGES};
use crate::consumer::{ConsumerConfig, DEFAULT_MAX_SUBSCRIBE_FAILURES};
use crate::error::{Error, Result};
use crate::scrub::ScrubConfig;

/// Shared store settings.
#[derive(Debug, Clone, Args)]
pub struct StoreArgs {
    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", hide_env_values = true)]
    pub redis_url: Redacted<String>,

    /// Namespace prefix for every store key and route annotation.
    #[arg(long, env = "COALESCE_PREFIX", default_value = DEFAULT_PREFIX)]
    pub prefix: String,
}

impl StoreArgs {
    /// Returns the store key naming for the configured prefix.
    #[must_use]
    pub fn store_keys(&self) -> StoreKeys {
        StoreKeys::new(self.prefix.clone())
    }

    /// Connects to the shared store.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid URL, or a
    /// store-unavailable error if the server cannot be reached.
    pub async fn connect(&self) -> Result<Arc<dyn KvStore>> {
        let store = RedisKvStore::connect(self.redis_url.expose()).await?;
        Ok(Arc::new(store))
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "coalesce_listener", about = "Coalesces job lifecycle notifications")]
pub struct ListenerConfig {
    /// Store settings.
    #[command(flatten)]
    pub store: StoreArgs,

    /// Pulse broker URL.
    #[arg(long, env = "PULSE_URL", default_value = "amqps://pulse.mozilla.org:5671")]
    pub pulse_url: String,

    /// Pulse username.
    #[arg(long, env = "PULSE_USERNAME")]
    pub pulse_username: String,

    /// Pulse password.
    #[arg(long, env = "PULSE_PASSWORD", hide_env_values = true)]
    pub pulse_password: Redacted<String>,

    /// Durable queue name (qualified with the username by the broker).
    #[arg(long, env = "PULSE_QUEUE_NAME", default_value = "coalesce")]
    pub queue_name: String,

    /// Exchanges to bind, comma separated.
    #[arg(long, env = "PULSE_EXCHANGES", value_delimiter = ',')]
    pub exchanges: Vec<String>,

    /// Seconds without a message before the subscription is recycled.
    #[arg(long, env = "COALESCE_READ_TIMEOUT_SECS", default_value_t = 300)]
    pub read_timeout_secs: u64,

    /// Milliseconds to wait before retrying a failed subscribe.
    #[arg(long, env = "COALESCE_RESUBSCRIBE_BACKOFF_MS", default_value_t = 1000)]
    pub resubscribe_backoff_ms: u64,

    /// Milliseconds to wait before handing a failed message back to the broker.
    #[arg(long, env = "COALESCE_REQUEUE_DELAY_MS", default_value_t = 1000)]
    pub requeue_delay_ms: u64,

    /// Port serving Prometheus `/metrics`.
    #[arg(long, env = "COALESCE_METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

impl ListenerConfig {
    /// Builds the bus binding.
    #[must_use]
    pub fn binding(&self) -> Binding {
        let exchanges = if self.exchanges.is_empty() {
            DEFAULT_EXCHANGES.iter().map(|e| (*e).to_string()).collect()
        } else {
            self.exchanges.clone()
        };
        Binding::for_namespace(&self.store.prefix, exchanges, self.queue_name.clone())
    }

    /// Builds the consumer loop settings.
    #[must_use]
    pub fn consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            resubscribe_backoff: Duration::from_millis(self.resubscribe_backoff_ms),
            max_subscribe_failures: DEFAULT_MAX_SUBSCRIBE_FAILURES,
            requeue_delay: Duration::from_millis(self.requeue_delay_ms),
        }
    }

    fn validate(self) -> Result<Self> {
        if self.read_timeout_secs == 0 {
            return Err(Error::configuration("read timeout must be positive"));
        }
        validate_prefix(&self.store.prefix)?;
        Ok(self)
    }
}

/// Scrubber configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "coalesce_scrubber", about = "Removes stale jobs from membership lists")]
pub struct ScrubberConfig {
    /// Store settings.
    #[command(flatten)]
    pub store: StoreArgs,

    /// Root URL of the job-status service.
    #[arg(
        long,
        env = "TASKCLUSTER_ROOT_URL",
        default_value = "https://firefox-ci-tc.services.mozilla.com"
    )]
    pub root_url: String,

    /// Seconds between passes; a single pass runs when unset.
    #[arg(long, env = "COALESCE_SCRUB_INTERVAL_SECS")]
    pub interval_secs: Option<u64>,

    /// Concurrent oracle lookups.
    #[arg(long, env = "COALESCE_SCRUB_CONCURRENCY", default_value_t = 4)]
    pub concurrency: usize,

    /// Timeout for one oracle lookup, in seconds.
    #[arg(long, env = "COALESCE_ORACLE_TIMEOUT_SECS", default_value_t = 30)]
    pub oracle_timeout_secs: u64,

    /// Port serving Prometheus `/metrics` while the scrubber runs.
    #[arg(long, env = "COALESCE_METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

impl ScrubberConfig {
    /// Builds the scrubber settings.
    #[must_use]
    pub fn scrub(&self) -> ScrubConfig {
        ScrubConfig {
            oracle_concurrency: self.concurrency,
        }
    }

    /// Returns the pass interval, if periodic.
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.interval_secs.map(Duration::from_secs)
    }

    /// Returns the oracle request timeout.
    #[must_use]
    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs)
    }

    fn validate(self) -> Result<Self> {
        if self.concurrency == 0 {
            return Err(Error::configuration("scrub concurrency must be positive"));
        }
        if self.interval_secs == Some(0) {
            return Err(Error::configuration("scrub interval must be positive"));
        }
        validate_prefix(&self.store.prefix)?;
        Ok(self)
    }
}

/// Read API configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "coalesce_web", about = "Serves coalesced lists over HTTP")]
pub struct WebConfig {
    /// Store settings.
    #[command(flatten)]
    pub store: StoreArgs,

    /// Listen port.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,
}

impl WebConfig {
    fn validate(self) -> Result<Self> {
        validate_prefix(&self.store.prefix)?;
        Ok(self)
    }
}

/// Loads a configuration from process arguments and the environment.
pub trait Load: Sized {
    /// Parses and validates.
    ///
    /// `--help` and `--version` print and exit the process.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for missing or invalid settings.
    fn load() -> Result<Self> {
        Self::load_from(std::env::args_os())
    }

    /// Parses and validates the given arguments (plus the environment).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for missing or invalid settings.
    fn load_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone;
}

macro_rules! impl_load {
    ($($ty:ty),*) => {
        $(
            impl Load for $ty {
                fn load_from<I, T>(args: I) -> Result<Self>
                where
                    I: IntoIterator<Item = T>,
                    T: Into<std::ffi::OsString> + Clone,
                {
                    match <$ty as Parser>::try_parse_from(args) {
                        Ok(config) => config.validate(),
                        Err(e)
                            if matches!(
                                e.kind(),
                                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
                            ) =>
                        {
                            e.exit()
                        }
                        Err(e) => Err(Error::configuration(e.to_string())),
                    }
                }
            }
        )*
    };
}

impl_load!(ListenerConfig, ScrubberConfig, WebConfig);

fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Err(Error::configuration("prefix must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_defaults() {
        let config = ListenerConfig::load_from([
            "coalesce_listener",
            "--redis-url",
            "redis://localhost",
            "--pulse-username",
            "svc",
            "--pulse-password",
            "secret",
        ])
        .unwrap();

        let binding = config.binding();
        assert_eq!(binding.exchanges.len(), DEFAULT_EXCHANGES.len());
        assert_eq!(binding.routing_key_pattern, "route.coalesce.v1.#");
        assert_eq!(config.consumer().read_timeout, Duration::from_secs(300));
        assert_eq!(config.consumer().requeue_delay, Duration::from_secs(1));
        assert_eq!(config.metrics_port, None);
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn listener_exchanges_are_comma_separated() {
        let config = ListenerConfig::load_from([
            "coalesce_listener",
            "--redis-url",
            "redis://localhost",
            "--pulse-username",
            "svc",
            "--pulse-password",
            "pw",
            "--exchanges",
            "exchange/a,exchange/b",
        ])
        .unwrap();
        assert_eq!(config.binding().exchanges, vec!["exchange/a", "exchange/b"]);
    }

    #[test]
    fn scrubber_rejects_zero_concurrency() {
        let err = ScrubberConfig::load_from([
            "coalesce_scrubber",
            "--redis-url",
            "redis://localhost",
            "--concurrency",
            "0",
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn scrubber_is_one_shot_by_default() {
        let config =
            ScrubberConfig::load_from(["coalesce_scrubber", "--redis-url", "redis://localhost"])
                .unwrap();
        assert_eq!(config.interval(), None);
        assert_eq!(config.scrub().oracle_concurrency, 4);
    }

    #[test]
    fn web_port_flag() {
        let config = WebConfig::load_from([
            "coalesce_web",
            "--redis-url",
            "redis://localhost",
            "--port",
            "9000",
        ])
        .unwrap();
        assert_eq!(config.port, 9000);
    }
}
