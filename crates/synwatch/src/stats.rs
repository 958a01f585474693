//! Attempt counters per destination port and per source address.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A counter together with the order in which its key was first seen.
#[derive(Debug, Clone, Copy)]
struct Tally {
    count: u64,
    first_seen: u64,
}

#[derive(Debug)]
struct Counters<K> {
    tallies: HashMap<K, Tally>,
}

impl<K: Copy + Eq + Hash> Counters<K> {
    fn new() -> Self {
        Self {
            tallies: HashMap::new(),
        }
    }

    fn bump(&mut self, key: K, seq: u64) {
        self.tallies
            .entry(key)
            .or_insert(Tally {
                count: 0,
                first_seen: seq,
            })
            .count += 1;
    }

    fn get(&self, key: &K) -> u64 {
        self.tallies.get(key).map_or(0, |t| t.count)
    }

    /// Count descending, ties broken by first-seen order.
    fn top(&self, n: usize) -> Vec<(K, u64)> {
        let mut ranked: Vec<(K, Tally)> = self.tallies.iter().map(|(k, t)| (*k, *t)).collect();
        ranked.sort_by(|a, b| {
            b.1.count
                .cmp(&a.1.count)
                .then(a.1.first_seen.cmp(&b.1.first_seen))
        });
        ranked.into_iter().take(n).map(|(k, t)| (k, t.count)).collect()
    }
}

#[derive(Debug)]
struct StatsState {
    ports: Counters<u16>,
    ips: Counters<IpAddr>,
    next_seq: u64,
    total: u64,
    since: DateTime<Utc>,
}

impl StatsState {
    fn new() -> Self {
        Self {
            ports: Counters::new(),
            ips: Counters::new(),
            next_seq: 0,
            total: 0,
            since: Utc::now(),
        }
    }
}

/// Ranked entry for a destination port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCount {
    /// Destination port.
    pub port: u16,
    /// Attempts against it.
    pub count: u64,
}

/// Ranked entry for a source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpCount {
    /// Source address.
    pub ip: IpAddr,
    /// Attempts from it.
    pub count: u64,
}

/// Point-in-time copy of the aggregator for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Start of the counting period.
    pub since: DateTime<Utc>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Total attempts counted.
    pub total_attempts: u64,
    /// Distinct destination ports.
    pub distinct_ports: usize,
    /// Distinct source addresses.
    pub distinct_ips: usize,
    /// Most targeted ports.
    pub top_ports: Vec<PortCount>,
    /// Most active sources.
    pub top_ips: Vec<IpCount>,
}

/// Increment-only attempt counters.
///
/// Counters only reset through [`StatsAggregator::rotate`].
#[derive(Debug)]
pub struct StatsAggregator {
    state: RwLock<StatsState>,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StatsState::new()),
        }
    }

    /// Count one new attempt from `ip` to `port`.
    pub fn record_attempt(&self, ip: IpAddr, port: u16) {
        let mut state = self.state.write();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.total += 1;
        state.ports.bump(port, seq);
        state.ips.bump(ip, seq);
    }

    /// Attempts counted against `port`.
    #[must_use]
    pub fn port_count(&self, port: u16) -> u64 {
        self.state.read().ports.get(&port)
    }

    /// Attempts counted from `ip`.
    #[must_use]
    pub fn ip_count(&self, ip: &IpAddr) -> u64 {
        self.state.read().ips.get(ip)
    }

    /// Total attempts counted this period.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.state.read().total
    }

    /// The `n` most targeted ports.
    #[must_use]
    pub fn top_ports(&self, n: usize) -> Vec<PortCount> {
        self.state
            .read()
            .ports
            .top(n)
            .into_iter()
            .map(|(port, count)| PortCount { port, count })
            .collect()
    }

    /// The `n` most active sources.
    #[must_use]
    pub fn top_ips(&self, n: usize) -> Vec<IpCount> {
        self.state
            .read()
            .ips
            .top(n)
            .into_iter()
            .map(|(ip, count)| IpCount { ip, count })
            .collect()
    }

    /// Snapshot with the top `n` of each ranking.
    #[must_use]
    pub fn snapshot(&self, n: usize) -> StatsSnapshot {
        let state = self.state.read();
        StatsSnapshot {
            since: state.since,
            taken_at: Utc::now(),
            total_attempts: state.total,
            distinct_ports: state.ports.tallies.len(),
            distinct_ips: state.ips.tallies.len(),
            top_ports: state
                .ports
                .top(n)
                .into_iter()
                .map(|(port, count)| PortCount { port, count })
                .collect(),
            top_ips: state
                .ips
                .top(n)
                .into_iter()
                .map(|(ip, count)| IpCount { ip, count })
                .collect(),
        }
    }

    /// Start a new counting period, returning the final snapshot of the old one.
    pub fn rotate(&self, n: usize) -> StatsSnapshot {
        let snapshot = self.snapshot(n);
        *self.state.write() = StatsState::new();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_counts_increment() {
        let stats = StatsAggregator::new();
        stats.record_attempt(ip("10.0.0.5"), 22);
        stats.record_attempt(ip("10.0.0.5"), 22);
        stats.record_attempt(ip("10.0.0.6"), 80);

        assert_eq!(stats.port_count(22), 2);
        assert_eq!(stats.port_count(80), 1);
        assert_eq!(stats.port_count(443), 0);
        assert_eq!(stats.ip_count(&ip("10.0.0.5")), 2);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn test_top_ports_orders_by_count() {
        let stats = StatsAggregator::new();
        let src = ip("10.0.0.5");
        for port in [80, 22, 22, 443, 22, 80] {
            stats.record_attempt(src, port);
        }

        let top = stats.top_ports(2);
        assert_eq!(
            top,
            vec![
                PortCount { port: 22, count: 3 },
                PortCount { port: 80, count: 2 },
            ]
        );
    }

    #[test]
    fn test_ties_keep_first_seen_order() {
        let stats = StatsAggregator::new();
        stats.record_attempt(ip("10.0.0.9"), 3306);
        stats.record_attempt(ip("10.0.0.1"), 21);
        stats.record_attempt(ip("10.0.0.5"), 8080);

        let ips: Vec<IpAddr> = stats.top_ips(10).into_iter().map(|c| c.ip).collect();
        assert_eq!(ips, vec![ip("10.0.0.9"), ip("10.0.0.1"), ip("10.0.0.5")]);

        let ports: Vec<u16> = stats.top_ports(10).into_iter().map(|c| c.port).collect();
        assert_eq!(ports, vec![3306, 21, 8080]);
    }

    #[test]
    fn test_top_n_larger_than_population() {
        let stats = StatsAggregator::new();
        stats.record_attempt(ip("10.0.0.5"), 22);
        assert_eq!(stats.top_ips(10).len(), 1);
        assert!(StatsAggregator::new().top_ports(10).is_empty());
    }

    #[test]
    fn test_snapshot_and_rotate() {
        let stats = StatsAggregator::new();
        stats.record_attempt(ip("10.0.0.5"), 22);
        stats.record_attempt(ip("10.0.0.6"), 22);

        let snapshot = stats.rotate(10);
        assert_eq!(snapshot.total_attempts, 2);
        assert_eq!(snapshot.distinct_ips, 2);
        assert_eq!(snapshot.distinct_ports, 1);
        assert_eq!(snapshot.top_ports[0], PortCount { port: 22, count: 2 });

        assert_eq!(stats.total(), 0);
        assert_eq!(stats.port_count(22), 0);
        assert!(stats.snapshot(10).top_ips.is_empty());
    }
}
