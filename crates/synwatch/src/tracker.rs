//! Handshake outcome tracking.
//!
//! Every pure SYN opens (or refreshes) a pending entry keyed by source
//! address and destination port. The entry resolves exactly once: either a
//! SYN-ACK / bare ACK for the same key arrives and it is `Accepted`, or its
//! timer fires first and it is `Blocked`. Removal from the pending map under
//! the lock is what decides the winner, so the response/timer race cannot
//! produce two classifications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::TrackerConfig;
use crate::event::{ConnectionEvent, ConnectionKey};
use crate::notice::{Notice, Notifier};

/// Classification of a handshake attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// A new attempt was observed (pure SYN).
    New,
    /// The attempt received a response within the window.
    Accepted,
    /// The window elapsed without a response.
    Blocked,
}

impl Outcome {
    /// Whether this outcome ends a pending entry.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Blocked)
    }
}

/// Record of one classification, published for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Source address.
    pub ip: std::net::IpAddr,
    /// Source port of the initiating SYN.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// What happened.
    pub outcome: Outcome,
    /// When the (latest) SYN was observed.
    pub started_at: DateTime<Utc>,
    /// When the entry resolved; `None` for `New`.
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Running totals kept by the tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerTotals {
    /// New attempts observed.
    pub new: u64,
    /// Attempts accepted.
    pub accepted: u64,
    /// Attempts that timed out.
    pub blocked: u64,
    /// Entries currently pending.
    pub pending: usize,
}

#[derive(Debug)]
struct PendingConnection {
    src_port: u16,
    started_at: DateTime<Utc>,
    generation: u64,
    timer: CancellationToken,
}

/// Tracks pending handshakes and classifies them.
#[derive(Debug)]
pub struct ConnectionTracker {
    /// Response window for a SYN.
    timeout: Duration,
    /// Pending handshakes by key (at most one per key).
    pending: Mutex<HashMap<ConnectionKey, PendingConnection>>,
    /// Distinguishes a refreshed entry from the one it replaced.
    next_generation: AtomicU64,
    new_total: AtomicU64,
    accepted_total: AtomicU64,
    blocked_total: AtomicU64,
    notifier: Notifier,
    /// Parent of every per-entry timer token.
    shutdown: CancellationToken,
}

impl ConnectionTracker {
    /// Create a tracker with the given response window.
    #[must_use]
    pub fn new(timeout: Duration, notifier: Notifier, shutdown: CancellationToken) -> Self {
        Self {
            timeout,
            pending: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            new_total: AtomicU64::new(0),
            accepted_total: AtomicU64::new(0),
            blocked_total: AtomicU64::new(0),
            notifier,
            shutdown,
        }
    }

    /// Create from configuration.
    #[must_use]
    pub fn from_config(config: &TrackerConfig, notifier: Notifier, shutdown: CancellationToken) -> Self {
        Self::new(config.handshake_timeout(), notifier, shutdown)
    }

    /// Feed one observed segment through the state machine.
    ///
    /// Returns the outcome emitted synchronously (`New` or `Accepted`);
    /// `Blocked` outcomes are emitted later by the entry's timer. Must be
    /// called from within a Tokio runtime.
    pub fn observe(self: &Arc<Self>, event: &ConnectionEvent) -> Option<Outcome> {
        let key = event.key();

        if event.flags.is_syn_only() {
            self.open(key, event);
            return Some(Outcome::New);
        }

        if event.flags.is_handshake_response() {
            let resolved = self.pending.lock().remove(&key);
            if let Some(entry) = resolved {
                entry.timer.cancel();
                self.accepted_total.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "handshake accepted");
                self.publish(key, &entry, Outcome::Accepted, Some(event.timestamp));
                return Some(Outcome::Accepted);
            }
        }

        None
    }

    fn open(self: &Arc<Self>, key: ConnectionKey, event: &ConnectionEvent) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let timer = self.shutdown.child_token();
        let entry = PendingConnection {
            src_port: event.src_port,
            started_at: event.timestamp,
            generation,
            timer: timer.clone(),
        };
        self.publish(key, &entry, Outcome::New, None);

        let replaced = self.pending.lock().insert(key, entry);
        if let Some(previous) = replaced {
            previous.timer.cancel();
            debug!(key = %key, "pending handshake refreshed");
        } else {
            debug!(key = %key, "handshake pending");
        }

        self.new_total.fetch_add(1, Ordering::Relaxed);
        self.arm_timer(key, generation, timer);
    }

    fn arm_timer(self: &Arc<Self>, key: ConnectionKey, generation: u64, timer: CancellationToken) {
        let tracker: Weak<Self> = Arc::downgrade(self);
        let timeout = self.timeout;

        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = timer.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    if let Some(tracker) = tracker.upgrade() {
                        tracker.expire(key, generation);
                    }
                }
            }
        });
    }

    /// Classify an entry as blocked if it is still the same pending entry.
    ///
    /// Returns `true` if this call produced the `Blocked` outcome.
    fn expire(&self, key: ConnectionKey, generation: u64) -> bool {
        let expired = {
            let mut pending = self.pending.lock();
            match pending.get(&key) {
                Some(entry) if entry.generation == generation => pending.remove(&key),
                _ => None,
            }
        };

        let Some(entry) = expired else {
            return false;
        };

        self.blocked_total.fetch_add(1, Ordering::Relaxed);
        info!(key = %key, timeout_secs = self.timeout.as_secs(), "handshake never completed");
        self.publish(key, &entry, Outcome::Blocked, Some(Utc::now()));
        true
    }

    fn publish(
        &self,
        key: ConnectionKey,
        entry: &PendingConnection,
        outcome: Outcome,
        resolved_at: Option<DateTime<Utc>>,
    ) {
        self.notifier.emit(Notice::Connection(ConnectionRecord {
            ip: key.ip,
            src_port: entry.src_port,
            dst_port: key.dst_port,
            outcome,
            started_at: entry.started_at,
            resolved_at,
        }));
    }

    /// Whether a handshake is pending for `key`.
    #[must_use]
    pub fn is_pending(&self, key: &ConnectionKey) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// Start time of the pending handshake for `key`.
    #[must_use]
    pub fn pending_since(&self, key: &ConnectionKey) -> Option<DateTime<Utc>> {
        self.pending.lock().get(key).map(|entry| entry.started_at)
    }

    /// Number of pending handshakes.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Snapshot of the running totals.
    #[must_use]
    pub fn totals(&self) -> TrackerTotals {
        TrackerTotals {
            new: self.new_total.load(Ordering::Relaxed),
            accepted: self.accepted_total.load(Ordering::Relaxed),
            blocked: self.blocked_total.load(Ordering::Relaxed),
            pending: self.pending_count(),
        }
    }

    /// Get the response window.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Cancel every pending timer without classifying the entries.
    pub fn cancel_all(&self) {
        let pending = self.pending.lock();
        for entry in pending.values() {
            entry.timer.cancel();
        }
        debug!(pending = pending.len(), "pending handshake timers cancelled");
    }
}
