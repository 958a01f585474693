//! Offline edits and inspection of the persisted state.
//!
//! These run against the state directory while the watcher is stopped; a
//! running watcher keeps its own in-memory copy and overwrites the files on
//! its next mutation.

use std::net::IpAddr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use synwatch::reputation::top_records;
use synwatch::{ScoredSource, StateStore, WatchConfig};

/// Result of a whitelist edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChange {
    /// The set changed.
    Changed,
    /// Nothing to do.
    Unchanged,
}

/// Whitelist `ip` and forget its reputation and blacklist entry.
pub fn whitelist_add(store: &dyn StateStore, ip: IpAddr) -> Result<ListChange> {
    let mut state = store.load();
    let added = state.lists.whitelist.insert(ip);
    let unlisted = state.lists.blacklist.remove(&ip);
    if added || unlisted {
        store.save_lists(&state.lists)?;
    }
    if state.reputation.remove(&ip).is_some() {
        store.save_reputation(&state.reputation)?;
    }
    Ok(if added { ListChange::Changed } else { ListChange::Unchanged })
}

/// Remove `ip` from the whitelist.
pub fn whitelist_remove(store: &dyn StateStore, ip: IpAddr) -> Result<ListChange> {
    let mut state = store.load();
    if !state.lists.whitelist.remove(&ip) {
        return Ok(ListChange::Unchanged);
    }
    store.save_lists(&state.lists)?;
    Ok(ListChange::Changed)
}

/// Persisted whitelist, sorted.
pub fn whitelist(store: &dyn StateStore) -> Vec<IpAddr> {
    store.load().lists.whitelist.into_iter().collect()
}

/// Active block as shown by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct BlockStatus {
    /// Blocked source.
    pub ip: IpAddr,
    /// When the rule went in.
    pub blocked_at: DateTime<Utc>,
    /// When it comes out.
    pub expires_at: DateTime<Utc>,
    /// Seconds left; zero if overdue.
    pub remaining_secs: u64,
}

/// Output of `synwatchd status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// When the report was built.
    pub generated_at: DateTime<Utc>,
    /// Never scored or blocked.
    pub whitelist: Vec<IpAddr>,
    /// Crossed the threshold this period.
    pub blacklist: Vec<IpAddr>,
    /// Drop rules believed installed.
    pub active_blocks: Vec<BlockStatus>,
    /// Highest current scores.
    pub top_reputation: Vec<ScoredSource>,
    /// Last reputation reset.
    pub last_reset: Option<DateTime<Utc>>,
    /// Next scheduled reset.
    pub next_reset: Option<DateTime<Utc>>,
}

/// Summarize persisted state at `now`.
pub fn status(store: &dyn StateStore, config: &WatchConfig, top_n: usize, now: DateTime<Utc>) -> StatusReport {
    let state = store.load();
    let interval = chrono::Duration::from_std(config.reset.interval()).ok();

    let mut active_blocks: Vec<BlockStatus> = state
        .blocks
        .iter()
        .map(|entry| BlockStatus {
            ip: entry.ip,
            blocked_at: entry.blocked_at,
            expires_at: entry.expires_at,
            remaining_secs: entry.remaining(now).as_secs(),
        })
        .collect();
    active_blocks.sort_by_key(|b| b.expires_at);

    StatusReport {
        generated_at: now,
        whitelist: state.lists.whitelist.into_iter().collect(),
        blacklist: state.lists.blacklist.into_iter().collect(),
        active_blocks,
        top_reputation: top_records(&state.reputation, top_n)
            .into_iter()
            .map(|(ip, record)| ScoredSource { ip, record })
            .collect(),
        last_reset: state.schedule.last_reset,
        next_reset: state
            .schedule
            .last_reset
            .zip(interval)
            .and_then(|(last, interval)| last.checked_add_signed(interval)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use synwatch::store::{ListsState, ScheduleState};
    use synwatch::{BlockEntry, MemoryStateStore, PersistedState, ReputationRecord};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn scored(score: u32, now: DateTime<Utc>) -> ReputationRecord {
        let mut record = ReputationRecord::new(now);
        record.score = score;
        record
    }

    // ==================== Whitelist Tests ====================

    #[test]
    fn test_whitelist_add_forgets_source() {
        let now = Utc::now();
        let store = MemoryStateStore::with_state(PersistedState {
            lists: ListsState {
                blacklist: [ip("10.0.0.5")].into(),
                ..ListsState::default()
            },
            reputation: BTreeMap::from([(ip("10.0.0.5"), scored(40, now))]),
            ..PersistedState::default()
        });

        assert_eq!(whitelist_add(&store, ip("10.0.0.5")).unwrap(), ListChange::Changed);
        let state = store.state();
        assert!(state.lists.whitelist.contains(&ip("10.0.0.5")));
        assert!(state.lists.blacklist.is_empty());
        assert!(state.reputation.is_empty());

        assert_eq!(whitelist_add(&store, ip("10.0.0.5")).unwrap(), ListChange::Unchanged);
    }

    #[test]
    fn test_whitelist_remove() {
        let store = MemoryStateStore::new();
        whitelist_add(&store, ip("192.168.1.1")).unwrap();
        whitelist_add(&store, ip("10.0.0.1")).unwrap();

        assert_eq!(whitelist(&store), vec![ip("10.0.0.1"), ip("192.168.1.1")]);
        assert_eq!(whitelist_remove(&store, ip("10.0.0.1")).unwrap(), ListChange::Changed);
        assert_eq!(whitelist_remove(&store, ip("10.0.0.1")).unwrap(), ListChange::Unchanged);
        assert_eq!(whitelist(&store), vec![ip("192.168.1.1")]);
    }

    #[test]
    fn test_whitelist_write_failure_surfaces() {
        let store = MemoryStateStore::new();
        store.set_fail_writes(true);
        assert!(whitelist_add(&store, ip("10.0.0.1")).is_err());
    }

    // ==================== Status Tests ====================

    #[test]
    fn test_status_summarizes_state() {
        let now = Utc::now();
        let last_reset = now - chrono::Duration::hours(2);
        let store = MemoryStateStore::with_state(PersistedState {
            lists: ListsState {
                whitelist: [ip("127.0.0.1")].into(),
                blacklist: [ip("10.0.0.9")].into(),
            },
            reputation: BTreeMap::from([
                (ip("10.0.0.1"), scored(10, now)),
                (ip("10.0.0.2"), scored(60, now)),
                (ip("10.0.0.3"), scored(35, now)),
            ]),
            blocks: vec![BlockEntry::new(
                ip("10.0.0.9"),
                now - chrono::Duration::minutes(4),
                Duration::from_secs(600),
            )],
            schedule: ScheduleState {
                last_reset: Some(last_reset),
            },
        });

        let report = status(&store, &WatchConfig::default(), 2, now);

        assert_eq!(report.blacklist, vec![ip("10.0.0.9")]);
        assert_eq!(report.active_blocks.len(), 1);
        assert_eq!(report.active_blocks[0].remaining_secs, 360);
        let top: Vec<_> = report.top_reputation.iter().map(|s| s.ip).collect();
        assert_eq!(top, vec![ip("10.0.0.2"), ip("10.0.0.3")]);
        assert_eq!(report.next_reset, Some(last_reset + chrono::Duration::hours(24)));
    }
}
