//! Threat scoring per source address.
//!
//! Every counted attempt adds a port-dependent weight to the source's score.
//! Once the score reaches the threshold the source is blacklisted, its record
//! is dropped and a block is issued. Enrichment runs alongside and only
//! feeds the block report.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::blocklist::BlockManager;
use crate::config::ReputationConfig;
use crate::enrich::{Enricher, GeoInfo, lookup_or_placeholder};
use crate::firewall::FirewallControl;
use crate::notice::{Notice, Notifier};
use crate::store::{ListsState, StateStore};

/// Accumulated behaviour of one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationRecord {
    /// First counted attempt since the last reset.
    pub first_seen: DateTime<Utc>,
    /// Distinct destination ports touched.
    pub ports_touched: BTreeSet<u16>,
    /// Attempts counted.
    pub attempt_count: u64,
    /// Threat score.
    pub score: u32,
}

impl ReputationRecord {
    /// Create an empty record.
    #[must_use]
    pub fn new(first_seen: DateTime<Utc>) -> Self {
        Self {
            first_seen,
            ports_touched: BTreeSet::new(),
            attempt_count: 0,
            score: 0,
        }
    }

    /// Count one attempt on `port` worth `weight` points.
    pub fn add_attempt(&mut self, port: u16, weight: u32) {
        self.ports_touched.insert(port);
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.score = self.score.saturating_add(weight);
    }
}

/// Everything known about a source at the moment it was blocked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockReport {
    /// Blocked source.
    pub ip: IpAddr,
    /// Enrichment (placeholder if the lookup failed).
    pub geo: GeoInfo,
    /// Ports touched before the block.
    pub ports_touched: Vec<u16>,
    /// Attempts counted before the block.
    pub attempt_count: u64,
    /// Score at the crossing.
    pub score: u32,
    /// First counted attempt.
    pub first_seen: DateTime<Utc>,
    /// Seconds between first attempt and block.
    pub time_to_block_secs: f64,
    /// How long the block lasts.
    pub block_duration_secs: u64,
    /// When the block was decided.
    pub blocked_at: DateTime<Utc>,
    /// Whether a new block was issued (false if one was already active).
    pub block_issued: bool,
}

/// Result of [`ReputationEngine::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Source is whitelisted; nothing changed.
    Whitelisted,
    /// Score updated, no action taken.
    Scored {
        /// Score after this attempt.
        score: u32,
    },
    /// Threshold reached: blacklisted, record dropped, block requested.
    ThresholdCrossed {
        /// Score at the crossing.
        score: u32,
        /// Whether the block manager accepted the block.
        block_issued: bool,
    },
}

/// Totals removed by a reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetSummary {
    /// Reputation records dropped.
    pub records_cleared: usize,
    /// Blacklist entries dropped.
    pub blacklist_cleared: usize,
}

#[derive(Debug, Default)]
struct ReputationState {
    records: BTreeMap<IpAddr, ReputationRecord>,
    lists: ListsState,
}

/// Per-source threat scoring and threshold enforcement.
#[derive(Debug)]
pub struct ReputationEngine<F, E> {
    config: ReputationConfig,
    state: Mutex<ReputationState>,
    store: Arc<dyn StateStore>,
    blocker: Arc<BlockManager<F>>,
    enricher: Arc<E>,
    notifier: Notifier,
    tasks: TaskTracker,
    crossings: AtomicU64,
    persistence_failures: AtomicU64,
}

impl<F: FirewallControl, E: Enricher> ReputationEngine<F, E> {
    /// Create an engine seeded with persisted lists and records.
    #[must_use]
    pub fn new(
        config: ReputationConfig,
        lists: ListsState,
        records: BTreeMap<IpAddr, ReputationRecord>,
        store: Arc<dyn StateStore>,
        blocker: Arc<BlockManager<F>>,
        enricher: Arc<E>,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(ReputationState { records, lists }),
            store,
            blocker,
            enricher,
            notifier,
            tasks: TaskTracker::new(),
            crossings: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
        }
    }

    /// Count one attempt from `ip` on `port`.
    pub fn record(self: &Arc<Self>, ip: IpAddr, port: u16) -> RecordOutcome {
        let record = {
            let mut state = self.state.lock();
            if state.lists.whitelist.contains(&ip) {
                return RecordOutcome::Whitelisted;
            }
            let blacklisted = state.lists.blacklist.contains(&ip);

            let weight = self.config.weight_for(port);
            let record = state
                .records
                .entry(ip)
                .or_insert_with(|| ReputationRecord::new(Utc::now()));
            record.add_attempt(port, weight);
            let score = record.score;
            debug!(ip = %ip, port, weight, score, attempts = record.attempt_count, "attempt scored");

            if score < self.config.threshold || blacklisted {
                self.persist_records(&state.records);
                return RecordOutcome::Scored { score };
            }

            let crossed = record.clone();
            state.lists.blacklist.insert(ip);
            self.persist_lists(&state.lists);
            state.records.remove(&ip);
            self.persist_records(&state.records);
            crossed
        };

        self.crossings.fetch_add(1, Ordering::Relaxed);
        let block_issued = self.blocker.block(ip).is_some();
        info!(
            ip = %ip,
            score = record.score,
            attempts = record.attempt_count,
            ports = ?record.ports_touched,
            "threat threshold crossed"
        );

        let score = record.score;
        self.spawn_report(ip, record, block_issued);
        RecordOutcome::ThresholdCrossed { score, block_issued }
    }

    fn spawn_report(self: &Arc<Self>, ip: IpAddr, record: ReputationRecord, block_issued: bool) {
        let engine = Arc::clone(self);
        let blocked_at = Utc::now();
        self.tasks.spawn(async move {
            let geo = lookup_or_placeholder(engine.enricher.as_ref(), ip).await;
            let time_to_block = (blocked_at - record.first_seen).num_milliseconds();
            #[allow(clippy::cast_precision_loss)]
            let time_to_block_secs = time_to_block.max(0) as f64 / 1000.0;

            info!(
                ip = %ip,
                country = %geo.country,
                org = %geo.org,
                time_to_block_secs,
                "source blocked"
            );
            engine.notifier.emit(Notice::Blocked(Box::new(BlockReport {
                ip,
                geo,
                ports_touched: record.ports_touched.into_iter().collect(),
                attempt_count: record.attempt_count,
                score: record.score,
                first_seen: record.first_seen,
                time_to_block_secs,
                block_duration_secs: engine.blocker.duration().as_secs(),
                blocked_at,
                block_issued,
            })));
        });
    }

    /// Forget every reputation record and empty the blacklist.
    ///
    /// Active blocks are left alone.
    pub fn reset(&self) -> ResetSummary {
        let mut state = self.state.lock();
        let summary = ResetSummary {
            records_cleared: state.records.len(),
            blacklist_cleared: state.lists.blacklist.len(),
        };
        state.records.clear();
        state.lists.blacklist.clear();
        self.persist_lists(&state.lists);
        self.persist_records(&state.records);
        info!(
            records = summary.records_cleared,
            blacklist = summary.blacklist_cleared,
            "reputation and blacklist reset"
        );
        summary
    }

    /// Wait for outstanding block reports.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl<F, E> ReputationEngine<F, E> {
    fn persist_records(&self, records: &BTreeMap<IpAddr, ReputationRecord>) {
        if let Err(e) = self.store.save_reputation(records) {
            self.persistence_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "failed to persist reputation");
        }
    }

    fn persist_lists(&self, lists: &ListsState) {
        if let Err(e) = self.store.save_lists(lists) {
            self.persistence_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "failed to persist lists");
        }
    }

    /// Write records and lists to the store.
    pub fn flush(&self) {
        let state = self.state.lock();
        self.persist_lists(&state.lists);
        self.persist_records(&state.records);
    }

    /// Whether `ip` is whitelisted.
    #[must_use]
    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.state.lock().lists.whitelist.contains(ip)
    }

    /// Whether `ip` has crossed the threshold since the last reset.
    #[must_use]
    pub fn is_blacklisted(&self, ip: &IpAddr) -> bool {
        self.state.lock().lists.blacklist.contains(ip)
    }

    /// Current lists.
    #[must_use]
    pub fn lists(&self) -> ListsState {
        self.state.lock().lists.clone()
    }

    /// Record for `ip`, if any.
    #[must_use]
    pub fn get(&self, ip: &IpAddr) -> Option<ReputationRecord> {
        self.state.lock().records.get(ip).cloned()
    }

    /// Current score of `ip` (zero without a record).
    #[must_use]
    pub fn score(&self, ip: &IpAddr) -> u32 {
        self.state.lock().records.get(ip).map_or(0, |r| r.score)
    }

    /// Number of sources with a record.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.state.lock().records.len()
    }

    /// The `n` highest-scoring sources.
    #[must_use]
    pub fn top_scores(&self, n: usize) -> Vec<(IpAddr, ReputationRecord)> {
        top_records(&self.state.lock().records, n)
    }

    /// Threshold crossings since start.
    #[must_use]
    pub fn crossings(&self) -> u64 {
        self.crossings.load(Ordering::Relaxed)
    }

    /// Store writes that failed.
    #[must_use]
    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
    }

    /// The scoring configuration.
    #[must_use]
    pub const fn config(&self) -> &ReputationConfig {
        &self.config
    }
}

/// Highest scores first, then earliest first seen.
#[must_use]
pub fn top_records(
    records: &BTreeMap<IpAddr, ReputationRecord>,
    n: usize,
) -> Vec<(IpAddr, ReputationRecord)> {
    let mut ranked: Vec<(IpAddr, ReputationRecord)> =
        records.iter().map(|(ip, r)| (*ip, r.clone())).collect();
    ranked.sort_by(|a, b| {
        b.1.score
            .cmp(&a.1.score)
            .then(a.1.first_seen.cmp(&b.1.first_seen))
    });
    ranked.truncate(n);
    ranked
}
