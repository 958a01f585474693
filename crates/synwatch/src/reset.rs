//! Periodic forgetting of reputation and blacklist.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blocklist::wall_duration;
use crate::enrich::Enricher;
use crate::firewall::FirewallControl;
use crate::notice::{Notice, Notifier};
use crate::reputation::{ReputationEngine, ResetSummary};
use crate::store::{ScheduleState, StateStore};

/// Clears reputation records and the blacklist on a fixed interval.
///
/// The clock is persisted, so a restart resumes the current period instead
/// of starting a new one; a period that ended while the monitor was down
/// triggers a reset right away.
#[derive(Debug)]
pub struct ResetScheduler<F, E> {
    interval: Duration,
    engine: Arc<ReputationEngine<F, E>>,
    store: Arc<dyn StateStore>,
    notifier: Notifier,
    last_reset: Mutex<Option<DateTime<Utc>>>,
}

impl<F: FirewallControl, E: Enricher> ResetScheduler<F, E> {
    /// Create a scheduler resuming from `schedule`.
    #[must_use]
    pub fn new(
        interval: Duration,
        schedule: ScheduleState,
        engine: Arc<ReputationEngine<F, E>>,
        store: Arc<dyn StateStore>,
        notifier: Notifier,
    ) -> Self {
        Self {
            interval,
            engine,
            store,
            notifier,
            last_reset: Mutex::new(schedule.last_reset),
        }
    }

    /// Time until the next reset is due, measured from `now`.
    ///
    /// Starts the clock if it has never run.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Duration {
        let mut last = self.last_reset.lock();
        let Some(last_reset) = *last else {
            *last = Some(now);
            self.persist(now);
            return self.interval;
        };
        (last_reset + wall_duration(self.interval) - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Reset now and restart the period.
    pub fn reset_now(&self) -> ResetSummary {
        let summary = self.engine.reset();
        let at = Utc::now();
        *self.last_reset.lock() = Some(at);
        self.persist(at);
        self.notifier.emit(Notice::Reset {
            at,
            records_cleared: summary.records_cleared,
            blacklist_cleared: summary.blacklist_cleared,
        });
        summary
    }

    fn persist(&self, at: DateTime<Utc>) {
        let schedule = ScheduleState { last_reset: Some(at) };
        if let Err(e) = self.store.save_schedule(&schedule) {
            warn!(error = %e, "failed to persist reset schedule");
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "reset scheduler started");
        loop {
            let delay = self.next_delay(Utc::now());
            debug!(delay_secs = delay.as_secs(), "next reputation reset scheduled");

            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {
                    self.reset_now();
                }
            }
        }
        debug!("reset scheduler stopped");
    }
}

impl<F, E> ResetScheduler<F, E> {
    /// When the last reset ran.
    #[must_use]
    pub fn last_reset(&self) -> Option<DateTime<Utc>> {
        *self.last_reset.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::IpAddr;

    use crate::blocklist::BlockManager;
    use crate::config::{BlocklistConfig, FirewallConfig, ReputationConfig};
    use crate::enrich::StaticEnricher;
    use crate::firewall::DryRunFirewall;
    use crate::store::{ListsState, MemoryStateStore};

    type Scheduler = ResetScheduler<DryRunFirewall, StaticEnricher>;
    type Engine = ReputationEngine<DryRunFirewall, StaticEnricher>;

    const DAY: Duration = Duration::from_secs(86_400);

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn setup(schedule: ScheduleState) -> (Arc<Scheduler>, Arc<Engine>, Arc<BlockManager<DryRunFirewall>>, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        let blocker = Arc::new(BlockManager::new(
            &BlocklistConfig::default(),
            &FirewallConfig::default(),
            Arc::new(DryRunFirewall::new()),
            store.clone(),
            Notifier::disabled(),
            CancellationToken::new(),
        ));
        let engine = Arc::new(ReputationEngine::new(
            ReputationConfig::default(),
            ListsState::default(),
            BTreeMap::new(),
            store.clone(),
            Arc::clone(&blocker),
            Arc::new(StaticEnricher::new()),
            Notifier::disabled(),
        ));
        let scheduler = Arc::new(ResetScheduler::new(
            DAY,
            schedule,
            Arc::clone(&engine),
            store.clone(),
            Notifier::disabled(),
        ));
        (scheduler, engine, blocker, store)
    }

    #[test]
    fn test_first_run_starts_clock() {
        let (scheduler, _, _, store) = setup(ScheduleState::default());
        let now = Utc::now();

        assert_eq!(scheduler.next_delay(now), DAY);
        assert_eq!(scheduler.last_reset(), Some(now));
        assert_eq!(store.state().schedule.last_reset, Some(now));
    }

    #[test]
    fn test_resumes_remaining_period() {
        let now = Utc::now();
        let (scheduler, _, _, _) = setup(ScheduleState {
            last_reset: Some(now - chrono::Duration::hours(20)),
        });

        assert_eq!(scheduler.next_delay(now), Duration::from_secs(4 * 3600));
    }

    #[test]
    fn test_overdue_period_resets_immediately() {
        let now = Utc::now();
        let (scheduler, _, _, _) = setup(ScheduleState {
            last_reset: Some(now - chrono::Duration::hours(30)),
        });

        assert_eq!(scheduler.next_delay(now), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_reset_keeps_blocks() {
        let (scheduler, engine, blocker, store) = setup(ScheduleState::default());
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(Arc::clone(&scheduler).run(shutdown.clone()));
        tokio::time::sleep(DAY - Duration::from_secs(60)).await;

        for _ in 0..5 {
            engine.record(ip("10.0.0.5"), 22);
        }
        engine.record(ip("10.0.0.6"), 80);
        assert!(engine.is_blacklisted(&ip("10.0.0.5")));
        assert_eq!(engine.tracked_count(), 1);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(engine.tracked_count(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(engine.tracked_count(), 0);
        assert!(!engine.is_blacklisted(&ip("10.0.0.5")));
        assert!(blocker.is_blocked(&ip("10.0.0.5")));
        assert!(store.state().schedule.last_reset.is_some());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
