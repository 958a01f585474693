//! Durable state: lists, reputation records, active blocks and the reset clock.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use synwatch_persist::JsonStore;
use tracing::debug;

use crate::blocklist::BlockEntry;
use crate::error::{WatchError, WatchResult};
use crate::reputation::ReputationRecord;

/// Whitelist and blacklist membership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListsState {
    /// Never scored or blocked.
    pub whitelist: BTreeSet<IpAddr>,
    /// Crossed the threshold since the last reset.
    pub blacklist: BTreeSet<IpAddr>,
}

/// Timing of the periodic reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleState {
    /// When reputation and blacklist were last cleared.
    pub last_reset: Option<DateTime<Utc>>,
}

/// Everything loaded at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedState {
    /// Whitelist and blacklist.
    pub lists: ListsState,
    /// Reputation records by source.
    pub reputation: BTreeMap<IpAddr, ReputationRecord>,
    /// Blocks that were active at the last write.
    pub blocks: Vec<BlockEntry>,
    /// Reset clock.
    pub schedule: ScheduleState,
}

/// Key-value persistence for monitor state.
///
/// Each section is written whole on every mutation.
pub trait StateStore: Send + Sync + Debug {
    /// Load every section; missing sections load empty.
    fn load(&self) -> PersistedState;

    /// Write the whitelist and blacklist.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Persistence` if the write fails.
    fn save_lists(&self, lists: &ListsState) -> WatchResult<()>;

    /// Write all reputation records.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Persistence` if the write fails.
    fn save_reputation(&self, records: &BTreeMap<IpAddr, ReputationRecord>) -> WatchResult<()>;

    /// Write the active blocks.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Persistence` if the write fails.
    fn save_blocks(&self, blocks: &[BlockEntry]) -> WatchResult<()>;

    /// Write the reset clock.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Persistence` if the write fails.
    fn save_schedule(&self, schedule: &ScheduleState) -> WatchResult<()>;
}

/// One JSON file per section under a state directory.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    lists: JsonStore,
    reputation: JsonStore,
    blocks: JsonStore,
    schedule: JsonStore,
}

impl JsonStateStore {
    /// Section file names.
    pub const SECTIONS: [&'static str; 4] = ["lists", "reputation", "blocks", "schedule"];

    /// Open (lazily create) the store under `dir`.
    #[must_use]
    pub fn open(dir: &Path) -> Self {
        Self {
            lists: JsonStore::new(dir, "lists"),
            reputation: JsonStore::new(dir, "reputation"),
            blocks: JsonStore::new(dir, "blocks"),
            schedule: JsonStore::new(dir, "schedule"),
        }
    }
}

impl StateStore for JsonStateStore {
    fn load(&self) -> PersistedState {
        let state = PersistedState {
            lists: self.lists.load(),
            reputation: self.reputation.load(),
            blocks: self.blocks.load(),
            schedule: self.schedule.load(),
        };
        debug!(
            whitelist = state.lists.whitelist.len(),
            blacklist = state.lists.blacklist.len(),
            records = state.reputation.len(),
            blocks = state.blocks.len(),
            "state loaded"
        );
        state
    }

    fn save_lists(&self, lists: &ListsState) -> WatchResult<()> {
        self.lists
            .save(lists)
            .map_err(|e| WatchError::persistence("lists", e))
    }

    fn save_reputation(&self, records: &BTreeMap<IpAddr, ReputationRecord>) -> WatchResult<()> {
        self.reputation
            .save(records)
            .map_err(|e| WatchError::persistence("reputation", e))
    }

    fn save_blocks(&self, blocks: &[BlockEntry]) -> WatchResult<()> {
        self.blocks
            .save(blocks)
            .map_err(|e| WatchError::persistence("blocks", e))
    }

    fn save_schedule(&self, schedule: &ScheduleState) -> WatchResult<()> {
        self.schedule
            .save(schedule)
            .map_err(|e| WatchError::persistence("schedule", e))
    }
}

/// In-memory store, optionally failing every write.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<PersistedState>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-loaded with `state`.
    #[must_use]
    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Copy of what has been written.
    #[must_use]
    pub fn state(&self) -> PersistedState {
        self.state.lock().clone()
    }

    /// Number of successful writes.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn write(&self, section: &'static str, apply: impl FnOnce(&mut PersistedState)) -> WatchResult<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(WatchError::persistence(section, "writes disabled"));
        }
        apply(&mut self.state.lock());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> PersistedState {
        self.state()
    }

    fn save_lists(&self, lists: &ListsState) -> WatchResult<()> {
        self.write("lists", |state| state.lists = lists.clone())
    }

    fn save_reputation(&self, records: &BTreeMap<IpAddr, ReputationRecord>) -> WatchResult<()> {
        self.write("reputation", |state| state.reputation = records.clone())
    }

    fn save_blocks(&self, blocks: &[BlockEntry]) -> WatchResult<()> {
        self.write("blocks", |state| state.blocks = blocks.to_vec())
    }

    fn save_schedule(&self, schedule: &ScheduleState) -> WatchResult<()> {
        self.write("schedule", |state| state.schedule = *schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn sample_record() -> ReputationRecord {
        let mut record = ReputationRecord::new(Utc::now());
        record.ports_touched.insert(22);
        record.attempt_count = 1;
        record.score = 20;
        record
    }

    // ==================== JsonStateStore Tests ====================

    #[test]
    fn test_json_store_empty_dir_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::open(dir.path());
        assert_eq!(store.load(), PersistedState::default());
    }

    #[test]
    fn test_json_store_sections_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::open(dir.path());

        let lists = ListsState {
            whitelist: [ip("127.0.0.1")].into_iter().collect(),
            blacklist: [ip("10.0.0.5")].into_iter().collect(),
        };
        let reputation: BTreeMap<IpAddr, ReputationRecord> =
            [(ip("10.0.0.6"), sample_record())].into_iter().collect();
        let blocks = vec![BlockEntry::new(ip("10.0.0.5"), Utc::now(), Duration::from_secs(600))];
        let schedule = ScheduleState {
            last_reset: Some(Utc::now()),
        };

        store.save_lists(&lists).unwrap();
        store.save_reputation(&reputation).unwrap();
        store.save_blocks(&blocks).unwrap();
        store.save_schedule(&schedule).unwrap();

        for section in JsonStateStore::SECTIONS {
            assert!(dir.path().join(format!("{section}.json")).exists());
        }

        let reopened = JsonStateStore::open(dir.path()).load();
        assert_eq!(reopened.lists, lists);
        assert_eq!(reopened.reputation, reputation);
        assert_eq!(reopened.blocks, blocks);
        assert_eq!(reopened.schedule, schedule);
    }

    #[test]
    fn test_json_store_write_failure_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();

        let store = JsonStateStore::open(&blocker);
        let err = store.save_lists(&ListsState::default()).unwrap_err();
        assert!(matches!(err, WatchError::Persistence { section: "lists", .. }));
    }

    // ==================== MemoryStateStore Tests ====================

    #[test]
    fn test_memory_store_records_writes() {
        let store = MemoryStateStore::new();
        store
            .save_lists(&ListsState {
                whitelist: BTreeSet::new(),
                blacklist: [ip("10.0.0.5")].into_iter().collect(),
            })
            .unwrap();

        assert_eq!(store.writes(), 1);
        assert!(store.load().lists.blacklist.contains(&ip("10.0.0.5")));
    }

    #[test]
    fn test_memory_store_failing_writes() {
        let store = MemoryStateStore::new();
        store.set_fail_writes(true);

        assert!(store.save_schedule(&ScheduleState::default()).is_err());
        assert_eq!(store.writes(), 0);

        store.set_fail_writes(false);
        assert!(store.save_schedule(&ScheduleState::default()).is_ok());
    }
}
