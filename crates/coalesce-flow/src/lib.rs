//! # coalesce-flow
//!
//! Job coalescing: tracks, per commonality key, which jobs are still waiting
//! for a worker, so a scheduler can collapse redundant work.
//!
//! ## Components
//!
//! - **Coalescing Index** ([`index`]): Key Registry plus per-key Membership
//!   Lists in the shared store
//! - **Event Router** ([`router`]): Maps one lifecycle notification to one
//!   index mutation
//! - **Bus Consumer Loop** ([`consumer`]): Subscribes, routes, settles,
//!   resubscribes on silence or transport failure
//! - **Stale-List Scrubber** ([`scrub`]): Reconciles lists against the job
//!   status oracle ([`oracle`])
//! - **Stats Counter** ([`stats`]): Store-persisted counters
//! - **Read API** ([`api`]): Read-only HTTP view of lists and stats
//!
//! ## Data flow
//!
//! ```text
//! pulse bus ──► BusConsumer ──► EventRouter ──► CoalescingIndex ◄── Scrubber ◄── oracle
//!                                    │                 ▲
//!                                    └─► StatsCounter   └── read API
//! ```
//!
//! Nothing is cached between calls: every component talks to the shared
//! store, so several listeners, a scrubber and the read API can run at once.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod error;
pub mod index;
pub mod metrics;
pub mod notification;
pub mod oracle;
pub mod router;
pub mod scrub;
pub mod shutdown;
pub mod stats;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bus::memory::InMemoryBus;
    pub use crate::bus::{Binding, Bus, InboundMessage, Settlement, Subscription};
    pub use crate::consumer::{BusConsumer, ConsumerConfig, ConsumerReport};
    pub use crate::error::{Error, Result};
    pub use crate::index::{CoalescingIndex, Removal};
    pub use crate::notification::{JobState, Lifecycle, Notification};
    pub use crate::oracle::memory::InMemoryOracle;
    pub use crate::oracle::{JobStatusOracle, OracleError};
    pub use crate::router::{EventRouter, RouteOutcome, RouterConfig};
    pub use crate::scrub::{ScrubConfig, ScrubReport, Scrubber};
    pub use crate::stats::StatsCounter;
}
