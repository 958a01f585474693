//! Temporary blocks with automatic expiry.
//!
//! Each block owns one background task: it installs the drop rule, waits out
//! the block duration and then removes the rule. The task is the only path
//! that releases a block, so every rule is removed exactly once and never
//! before its expiry. Tasks stop early only when the monitor shuts down; the
//! persisted `expires_at` lets the next run pick them up again.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{BlocklistConfig, FirewallConfig};
use crate::error::FirewallAction;
use crate::firewall::FirewallControl;
use crate::notice::{Notice, Notifier};
use crate::store::StateStore;

/// Convert a std duration for wall-clock arithmetic.
pub(crate) fn wall_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// An active block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    /// Blocked source.
    pub ip: IpAddr,
    /// When the block was issued.
    pub blocked_at: DateTime<Utc>,
    /// When the drop rule is due to be removed.
    pub expires_at: DateTime<Utc>,
}

impl BlockEntry {
    /// Create an entry lasting `duration` from `blocked_at`.
    #[must_use]
    pub fn new(ip: IpAddr, blocked_at: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            ip,
            blocked_at,
            expires_at: blocked_at + wall_duration(duration),
        }
    }

    /// Time left at `now`; zero once expired.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the block is due for removal at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Retry policy for firewall commands.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
}

/// Owns the set of blocked sources and their drop rules.
#[derive(Debug)]
pub struct BlockManager<F> {
    firewall: Arc<F>,
    /// Active blocks (at most one per source).
    entries: Mutex<HashMap<IpAddr, BlockEntry>>,
    duration: Duration,
    retry: RetryPolicy,
    store: Arc<dyn StateStore>,
    notifier: Notifier,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    firewall_failures: AtomicU64,
    persistence_failures: AtomicU64,
}

impl<F: FirewallControl> BlockManager<F> {
    /// Create a block manager.
    #[must_use]
    pub fn new(
        blocklist: &BlocklistConfig,
        firewall_config: &FirewallConfig,
        firewall: Arc<F>,
        store: Arc<dyn StateStore>,
        notifier: Notifier,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            firewall,
            entries: Mutex::new(HashMap::new()),
            duration: blocklist.block_duration(),
            retry: RetryPolicy {
                max_attempts: firewall_config.max_attempts.max(1),
                backoff: firewall_config.retry_backoff(),
            },
            store,
            notifier,
            shutdown,
            tasks: TaskTracker::new(),
            firewall_failures: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
        }
    }

    /// Block `ip` for the configured duration.
    ///
    /// Returns the new entry, or `None` if `ip` is already blocked.
    pub fn block(self: &Arc<Self>, ip: IpAddr) -> Option<BlockEntry> {
        let entry = {
            let mut entries = self.entries.lock();
            if entries.contains_key(&ip) {
                debug!(ip = %ip, "already blocked");
                return None;
            }
            let entry = BlockEntry::new(ip, Utc::now(), self.duration);
            entries.insert(ip, entry.clone());
            self.persist(&entries);
            entry
        };

        info!(
            ip = %ip,
            expires_at = %entry.expires_at,
            duration_secs = self.duration.as_secs(),
            "blocking source"
        );
        self.spawn_lifecycle(entry.clone(), self.duration, true);
        Some(entry)
    }

    /// Re-adopt blocks persisted by a previous run.
    ///
    /// Expired entries are released immediately; live ones have their rule
    /// re-checked and expire after their remaining time.
    pub fn restore(self: &Arc<Self>, restored: Vec<BlockEntry>) -> usize {
        let now = Utc::now();
        let mut adopted = Vec::new();
        {
            let mut entries = self.entries.lock();
            for entry in restored {
                if entries.contains_key(&entry.ip) {
                    continue;
                }
                entries.insert(entry.ip, entry.clone());
                adopted.push(entry);
            }
            self.persist(&entries);
        }

        for entry in &adopted {
            if entry.is_expired(now) {
                debug!(ip = %entry.ip, "restored block already expired");
                self.spawn_lifecycle(entry.clone(), Duration::ZERO, false);
            } else {
                let remaining = entry.remaining(now);
                debug!(ip = %entry.ip, remaining_secs = remaining.as_secs(), "restored block resumed");
                self.spawn_lifecycle(entry.clone(), remaining, true);
            }
        }

        if !adopted.is_empty() {
            info!(count = adopted.len(), "restored active blocks");
        }
        adopted.len()
    }

    fn spawn_lifecycle(self: &Arc<Self>, entry: BlockEntry, wait: Duration, install: bool) {
        // Insert retries run inside the block's lifetime, not before it.
        let deadline = tokio::time::Instant::now() + wait;
        let manager = Arc::clone(self);
        self.tasks.spawn(async move {
            if install {
                manager.apply(FirewallAction::Insert, entry.ip).await;
            }

            tokio::select! {
                biased;
                () = manager.shutdown.cancelled() => {
                    debug!(ip = %entry.ip, "block timer stopped by shutdown");
                    return;
                }
                () = tokio::time::sleep_until(deadline) => {}
            }

            manager.unblock(entry.ip, entry.blocked_at).await;
        });
    }

    /// Release the block on `ip` issued at `blocked_at`.
    ///
    /// Removes the drop rule, then the entry. Only the entry's own timer
    /// calls this, so each rule is removed once.
    async fn unblock(&self, ip: IpAddr, blocked_at: DateTime<Utc>) -> bool {
        let current = self
            .entries
            .lock()
            .get(&ip)
            .is_some_and(|entry| entry.blocked_at == blocked_at);
        if !current {
            return false;
        }

        self.apply(FirewallAction::Remove, ip).await;

        let removed = {
            let mut entries = self.entries.lock();
            let removed = entries.remove(&ip);
            self.persist(&entries);
            removed
        };

        if let Some(entry) = removed {
            info!(ip = %ip, blocked_at = %entry.blocked_at, "block expired, source released");
            self.notifier.emit(Notice::Unblocked {
                entry,
                at: Utc::now(),
            });
        }
        true
    }

    /// Run a firewall command with retries. Returns whether it succeeded.
    async fn apply(&self, action: FirewallAction, ip: IpAddr) -> bool {
        let mut backoff = self.retry.backoff;
        for attempt in 1..=self.retry.max_attempts {
            let result = match action {
                FirewallAction::Insert => self.firewall.insert_drop_rule(ip).await,
                FirewallAction::Remove => self.firewall.remove_drop_rule(ip).await,
            };

            match result {
                Ok(()) => {
                    debug!(ip = %ip, action = %action, attempt, "firewall command applied");
                    return true;
                }
                Err(e) if attempt < self.retry.max_attempts && e.is_retryable() => {
                    warn!(ip = %ip, action = %action, attempt, error = %e, "firewall command failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    error!(ip = %ip, action = %action, attempts = attempt, error = %e, "firewall command gave up");
                    self.firewall_failures.fetch_add(1, Ordering::Relaxed);
                    self.notifier.emit(Notice::FirewallFailure {
                        ip,
                        action,
                        error: e.to_string(),
                    });
                    return false;
                }
            }
        }
        false
    }

    fn persist(&self, entries: &HashMap<IpAddr, BlockEntry>) {
        let mut blocks: Vec<BlockEntry> = entries.values().cloned().collect();
        blocks.sort_by_key(|entry| (entry.blocked_at, entry.ip));
        if let Err(e) = self.store.save_blocks(&blocks) {
            self.persistence_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "failed to persist blocks");
        }
    }

    /// Write the current blocks to the store.
    pub fn flush(&self) {
        let entries = self.entries.lock();
        self.persist(&entries);
    }

    /// Wait for block tasks to finish after shutdown has been signalled.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Prepare the firewall for drop rules.
    ///
    /// # Errors
    ///
    /// Returns the firewall's error if preparation fails.
    pub async fn prepare_firewall(&self) -> crate::error::WatchResult<()> {
        self.firewall.prepare().await
    }
}

impl<F> BlockManager<F> {
    /// Whether `ip` is currently blocked.
    #[must_use]
    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        self.entries.lock().contains_key(ip)
    }

    /// Active block for `ip`.
    #[must_use]
    pub fn get(&self, ip: &IpAddr) -> Option<BlockEntry> {
        self.entries.lock().get(ip).cloned()
    }

    /// All active blocks, oldest first.
    #[must_use]
    pub fn active(&self) -> Vec<BlockEntry> {
        let mut blocks: Vec<BlockEntry> = self.entries.lock().values().cloned().collect();
        blocks.sort_by_key(|entry| (entry.blocked_at, entry.ip));
        blocks
    }

    /// Number of active blocks.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Firewall commands that failed after all retries.
    #[must_use]
    pub fn firewall_failures(&self) -> u64 {
        self.firewall_failures.load(Ordering::Relaxed)
    }

    /// Block writes that failed.
    #[must_use]
    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
    }

    /// Configured block duration.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    /// The firewall adapter.
    #[must_use]
    pub fn firewall(&self) -> &Arc<F> {
        &self.firewall
    }
}
