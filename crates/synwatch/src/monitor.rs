//! The assembled monitor: tracker, statistics, reputation, blocks and reset.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::blocklist::{BlockEntry, BlockManager};
use crate::config::{ScoreSource, WatchConfig};
use crate::enrich::Enricher;
use crate::error::WatchResult;
use crate::event::{ConnectionEvent, parse_tcpdump_line};
use crate::firewall::FirewallControl;
use crate::notice::Notifier;
use crate::reputation::{ReputationEngine, ReputationRecord};
use crate::reset::ResetScheduler;
use crate::stats::{StatsAggregator, StatsSnapshot};
use crate::store::StateStore;
use crate::tracker::{ConnectionTracker, Outcome, TrackerTotals};

/// Point-in-time view of the whole monitor for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Attempt rankings.
    pub stats: StatsSnapshot,
    /// Handshake outcome totals.
    pub connections: TrackerTotals,
    /// Active blocks, oldest first.
    pub active_blocks: Vec<BlockEntry>,
    /// Sources blacklisted since the last reset.
    pub blacklisted: usize,
    /// Sources with a reputation record.
    pub tracked_sources: usize,
    /// Highest current scores.
    pub top_scores: Vec<ScoredSource>,
    /// When reputation was last reset.
    pub last_reset: Option<DateTime<Utc>>,
    /// Input lines that failed to parse.
    pub malformed_events: u64,
    /// Firewall commands that failed after all retries.
    pub firewall_failures: u64,
    /// Store writes that failed.
    pub persistence_failures: u64,
}

/// A source and its current reputation.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredSource {
    /// Source address.
    pub ip: IpAddr,
    /// Its record.
    #[serde(flatten)]
    pub record: ReputationRecord,
}

/// Passive connection-attempt monitor.
///
/// Feed it events with [`Monitor::handle_event`] (or raw capture lines with
/// [`Monitor::handle_line`]) from a single ingestion loop.
#[derive(Debug)]
pub struct Monitor<F, E> {
    config: WatchConfig,
    tracker: Arc<ConnectionTracker>,
    stats: Arc<StatsAggregator>,
    reputation: Arc<ReputationEngine<F, E>>,
    blocker: Arc<BlockManager<F>>,
    reset: Arc<ResetScheduler<F, E>>,
    store: Arc<dyn StateStore>,
    shutdown: CancellationToken,
    /// Blocks loaded from the store, adopted on `start`.
    restored_blocks: Mutex<Option<Vec<BlockEntry>>>,
    reset_task: Mutex<Option<JoinHandle<()>>>,
    events: AtomicU64,
    malformed: AtomicU64,
}

impl<F: FirewallControl, E: Enricher> Monitor<F, E> {
    /// Assemble a monitor from persisted state.
    ///
    /// The configured whitelist is merged into the persisted one.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Config` if the configuration is invalid.
    pub fn new(
        config: WatchConfig,
        firewall: Arc<F>,
        enricher: Arc<E>,
        store: Arc<dyn StateStore>,
        notifier: Notifier,
    ) -> WatchResult<Self> {
        config.validate()?;

        let mut persisted = store.load();
        let before = persisted.lists.whitelist.len();
        persisted.lists.whitelist.extend(config.whitelist.iter().copied());
        if persisted.lists.whitelist.len() != before {
            if let Err(e) = store.save_lists(&persisted.lists) {
                warn!(error = %e, "failed to persist seeded whitelist");
            }
        }

        let shutdown = CancellationToken::new();
        let tracker = Arc::new(ConnectionTracker::from_config(
            &config.tracker,
            notifier.clone(),
            shutdown.child_token(),
        ));
        let blocker = Arc::new(BlockManager::new(
            &config.blocklist,
            &config.firewall,
            firewall,
            Arc::clone(&store),
            notifier.clone(),
            shutdown.child_token(),
        ));
        let reputation = Arc::new(ReputationEngine::new(
            config.reputation.clone(),
            persisted.lists,
            persisted.reputation,
            Arc::clone(&store),
            Arc::clone(&blocker),
            enricher,
            notifier.clone(),
        ));
        let reset = Arc::new(ResetScheduler::new(
            config.reset.interval(),
            persisted.schedule,
            Arc::clone(&reputation),
            Arc::clone(&store),
            notifier,
        ));

        Ok(Self {
            config,
            tracker,
            stats: Arc::new(StatsAggregator::new()),
            reputation,
            blocker,
            reset,
            store,
            shutdown,
            restored_blocks: Mutex::new(Some(persisted.blocks)),
            reset_task: Mutex::new(None),
            events: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        })
    }

    /// Prepare the firewall, adopt persisted blocks and start the reset clock.
    ///
    /// A firewall that cannot be prepared is logged and tolerated.
    pub async fn start(&self) {
        if let Err(e) = self.blocker.prepare_firewall().await {
            warn!(error = %e, "firewall preparation failed, continuing");
        }

        if let Some(blocks) = self.restored_blocks.lock().take() {
            self.blocker.restore(blocks);
        }

        let mut task = self.reset_task.lock();
        if task.is_none() {
            let scheduler = Arc::clone(&self.reset);
            *task = Some(tokio::spawn(scheduler.run(self.shutdown.child_token())));
        }
        info!(
            timeout_secs = self.config.tracker.handshake_timeout_secs,
            threshold = self.config.reputation.threshold,
            block_secs = self.config.blocklist.block_duration_secs,
            "monitor started"
        );
    }

    /// Process one observed segment.
    pub fn handle_event(&self, event: &ConnectionEvent) -> Option<Outcome> {
        self.events.fetch_add(1, Ordering::Relaxed);
        let outcome = self.tracker.observe(event);

        let is_new = outcome == Some(Outcome::New);
        if is_new {
            self.stats.record_attempt(event.ip, event.dst_port);
        }

        let scored = match self.config.reputation.score_source {
            ScoreSource::NewConnections => is_new,
            ScoreSource::AllSegments => true,
        };
        if scored {
            self.reputation.record(event.ip, event.dst_port);
        }

        outcome
    }

    /// Parse and process one capture line; unparseable lines are dropped.
    pub fn handle_line(&self, line: &str, observed_at: DateTime<Utc>) -> Option<Outcome> {
        match parse_tcpdump_line(line, observed_at) {
            Ok(event) => self.handle_event(&event),
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                trace!(error = %e, "dropping capture line");
                None
            }
        }
    }

    /// Reset reputation and blacklist now, outside the schedule.
    pub fn reset_now(&self) {
        self.reset.reset_now();
    }

    /// Stop timers, wait for in-flight work and flush state.
    ///
    /// Active drop rules stay in place; their expiry is persisted.
    pub async fn shutdown(&self) {
        info!("monitor shutting down");
        self.shutdown.cancel();
        self.tracker.cancel_all();

        let task = self.reset_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "reset task ended abnormally");
            }
        }

        self.blocker.drain().await;
        self.reputation.drain().await;

        self.reputation.flush();
        self.blocker.flush();
        debug!(
            pending = self.tracker.pending_count(),
            blocks = self.blocker.active_count(),
            "state flushed"
        );
    }
}

impl<F, E> Monitor<F, E> {
    /// Snapshot with the top `n` of each ranking.
    #[must_use]
    pub fn snapshot(&self, n: usize) -> MonitorSnapshot {
        self.build_snapshot(self.stats.snapshot(n), n)
    }

    /// Final snapshot of the current counting period; counters start over.
    pub fn rotate_stats(&self, n: usize) -> MonitorSnapshot {
        self.build_snapshot(self.stats.rotate(n), n)
    }

    fn build_snapshot(&self, stats: StatsSnapshot, n: usize) -> MonitorSnapshot {
        MonitorSnapshot {
            taken_at: Utc::now(),
            stats,
            connections: self.tracker.totals(),
            active_blocks: self.blocker.active(),
            blacklisted: self.reputation.lists().blacklist.len(),
            tracked_sources: self.reputation.tracked_count(),
            top_scores: self
                .reputation
                .top_scores(n)
                .into_iter()
                .map(|(ip, record)| ScoredSource { ip, record })
                .collect(),
            last_reset: self.reset.last_reset(),
            malformed_events: self.malformed.load(Ordering::Relaxed),
            firewall_failures: self.blocker.firewall_failures(),
            persistence_failures: self.blocker.persistence_failures()
                + self.reputation.persistence_failures(),
        }
    }

    /// Events processed so far.
    #[must_use]
    pub fn events_processed(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// The handshake tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    /// The attempt counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    /// The reputation engine.
    #[must_use]
    pub fn reputation(&self) -> &Arc<ReputationEngine<F, E>> {
        &self.reputation
    }

    /// The block manager.
    #[must_use]
    pub fn blocker(&self) -> &Arc<BlockManager<F>> {
        &self.blocker
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// The effective configuration.
    #[must_use]
    pub const fn config(&self) -> &WatchConfig {
        &self.config
    }
}
