//! # synwatch
//!
//! Passive TCP connection-attempt monitoring with threat scoring and
//! temporary blocking.
//!
//! ## Handshake Tracking
//!
//! - [`ConnectionTracker`] - Classifies every SYN as accepted or blocked (timed out)
//! - [`StatsAggregator`] - Attempt counts per destination port and source address
//!
//! ## Threat Response
//!
//! - [`ReputationEngine`] - Per-source score with port weights and a block threshold
//! - [`BlockManager`] - Temporary drop rules that expire on their own
//! - [`ResetScheduler`] - Periodic forgetting of reputation and blacklist
//!
//! ## Adapters
//!
//! - [`FirewallControl`] - `iptables` or dry-run drop rules
//! - [`Enricher`] - Best-effort location/ownership lookups
//! - [`StateStore`] - JSON or in-memory persistence
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use chrono::Utc;
//! use synwatch::{DryRunFirewall, Monitor, MemoryStateStore, Notifier, StaticEnricher, WatchConfig};
//!
//! # async fn run() -> synwatch::WatchResult<()> {
//! let monitor = Monitor::new(
//!     WatchConfig::default(),
//!     Arc::new(DryRunFirewall::new()),
//!     Arc::new(StaticEnricher::new()),
//!     Arc::new(MemoryStateStore::new()),
//!     Notifier::disabled(),
//! )?;
//! monitor.start().await;
//!
//! let line = "12:00:00.000001 IP 10.0.0.5.40000 > 10.0.0.1.22: Flags [S], seq 1, length 0";
//! monitor.handle_line(line, Utc::now());
//!
//! monitor.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod blocklist;
pub mod config;
pub mod enrich;
pub mod error;
pub mod event;
pub mod firewall;
pub mod monitor;
pub mod notice;
pub mod reputation;
pub mod reset;
pub mod stats;
pub mod store;
pub mod tracker;

// Re-export main types
pub use blocklist::{BlockEntry, BlockManager};
pub use config::{
    BlocklistConfig, EnrichmentConfig, FirewallConfig, ReputationConfig, ResetConfig,
    ScoreSource, TrackerConfig, WatchConfig, WatchConfigBuilder,
};
pub use enrich::{Enricher, GeoInfo, IpInfoEnricher, StaticEnricher};
pub use error::{FirewallAction, WatchError, WatchResult};
pub use event::{ConnectionEvent, ConnectionKey, TcpFlags, parse_tcpdump_line};
pub use firewall::{DryRunFirewall, FirewallControl, IptablesFirewall};
pub use monitor::{Monitor, MonitorSnapshot, ScoredSource};
pub use notice::{Notice, Notifier};
pub use reputation::{BlockReport, RecordOutcome, ReputationEngine, ReputationRecord};
pub use reset::ResetScheduler;
pub use stats::{IpCount, PortCount, StatsAggregator, StatsSnapshot};
pub use store::{JsonStateStore, MemoryStateStore, PersistedState, StateStore};
pub use tracker::{ConnectionRecord, ConnectionTracker, Outcome, TrackerTotals};

