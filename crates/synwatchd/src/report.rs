//! Reporting sinks: NDJSON journals and the daily snapshot file.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use synwatch::{Monitor, MonitorSnapshot, Notice};
use synwatch_persist::JsonStore;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Every classified handshake.
pub const CONNECTIONS_LOG: &str = "connections.jsonl";
/// One report per block.
pub const BLOCKED_LOG: &str = "blocked.jsonl";
/// Unblocks, resets and firewall failures.
pub const EVENTS_LOG: &str = "events.jsonl";

/// Append-only NDJSON files under one directory.
#[derive(Debug, Clone)]
pub struct Journal {
    dir: PathBuf,
}

impl Journal {
    /// Journal writing under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the journals.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append `value` as one JSON line to `file`.
    pub fn append<T: Serialize>(&self, file: &str, value: &T) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut line = serde_json::to_vec(value).map_err(io::Error::other)?;
        line.push(b'\n');

        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))?;
        out.write_all(&line)
    }

    /// Route a notice to its journal.
    pub fn record(&self, notice: &Notice) -> io::Result<()> {
        match notice {
            Notice::Connection(record) => self.append(CONNECTIONS_LOG, record),
            Notice::Blocked(report) => self.append(BLOCKED_LOG, report),
            Notice::Unblocked { .. } | Notice::FirewallFailure { .. } | Notice::Reset { .. } => {
                self.append(EVENTS_LOG, notice)
            }
        }
    }
}

/// Drain `notices` into `journal` until every publisher is gone.
pub async fn run_sink(mut notices: mpsc::UnboundedReceiver<Notice>, journal: Journal) -> u64 {
    let mut written = 0u64;
    while let Some(notice) = notices.recv().await {
        if let Notice::Blocked(report) = &notice {
            info!(
                ip = %report.ip,
                country = %report.geo.country,
                org = %report.geo.org,
                score = report.score,
                time_to_block_secs = report.time_to_block_secs,
                "block report"
            );
        }
        match journal.record(&notice) {
            Ok(()) => written += 1,
            Err(e) => warn!(error = %e, dir = %journal.dir().display(), "failed to write journal"),
        }
    }
    debug!(written, "notice sink closed");
    written
}

/// Contents of `reports/<date>.json`.
#[derive(Debug, Serialize)]
pub struct DailyReport {
    /// Calendar day (UTC) covered.
    pub date: NaiveDate,
    /// When the file was last rewritten.
    pub last_update: DateTime<Utc>,
    /// Monitor state at that time.
    #[serde(flatten)]
    pub snapshot: MonitorSnapshot,
}

/// Rewrites the day's report file and rotates counters at midnight UTC.
#[derive(Debug)]
pub struct DailyReporter {
    dir: PathBuf,
    top_n: usize,
    current: NaiveDate,
}

impl DailyReporter {
    /// Reporter writing `<dir>/reports/` starting on `today`.
    pub fn new(dir: impl AsRef<Path>, top_n: usize, today: NaiveDate) -> Self {
        Self {
            dir: dir.as_ref().join("reports"),
            top_n,
            current: today,
        }
    }

    fn store_for(&self, date: NaiveDate) -> JsonStore {
        JsonStore::new(&self.dir, &date.format("%Y-%m-%d").to_string())
    }

    /// Write the report for the day containing `now`.
    ///
    /// When the day has changed, the previous day's file gets its final
    /// snapshot and the monitor's counters start over.
    pub fn tick<F, E>(&mut self, monitor: &Monitor<F, E>, now: DateTime<Utc>) -> io::Result<PathBuf> {
        let today = now.date_naive();
        if today != self.current {
            let closing = monitor.rotate_stats(self.top_n);
            self.write(self.current, now, closing)?;
            info!(date = %self.current, "daily counters rotated");
            self.current = today;
        }
        self.write(today, now, monitor.snapshot(self.top_n))
    }

    fn write(
        &self,
        date: NaiveDate,
        now: DateTime<Utc>,
        snapshot: MonitorSnapshot,
    ) -> io::Result<PathBuf> {
        let store = self.store_for(date);
        store.save(&DailyReport {
            date,
            last_update: now,
            snapshot,
        })?;
        debug!(path = %store.path().display(), "daily report written");
        Ok(store.path().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::Arc;

    use synwatch::{
        ConnectionEvent, DryRunFirewall, MemoryStateStore, Notifier, StaticEnricher, WatchConfig,
    };

    type TestMonitor = Monitor<DryRunFirewall, StaticEnricher>;

    fn monitor() -> TestMonitor {
        Monitor::new(
            WatchConfig::default(),
            Arc::new(DryRunFirewall::new()),
            Arc::new(StaticEnricher::new()),
            Arc::new(MemoryStateStore::new()),
            Notifier::disabled(),
        )
        .unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn report_path(dir: &Path, date: NaiveDate) -> PathBuf {
        dir.join("reports").join(format!("{}.json", date.format("%Y-%m-%d")))
    }

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    // ==================== Journal Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_sink_routes_notices() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path());
        let (notifier, rx) = Notifier::channel();
        let monitor = Monitor::new(
            WatchConfig::default(),
            Arc::new(DryRunFirewall::new()),
            Arc::new(StaticEnricher::new()),
            Arc::new(MemoryStateStore::new()),
            notifier,
        )
        .unwrap();
        monitor.start().await;

        for sport in 0..5 {
            monitor.handle_event(&ConnectionEvent::syn(ip("10.0.0.5"), 40000 + sport, 22));
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        monitor.shutdown().await;
        drop(monitor);

        let written = tokio::time::timeout(std::time::Duration::from_secs(5), run_sink(rx, journal))
            .await
            .unwrap();

        let connections = read_lines(&dir.path().join(CONNECTIONS_LOG));
        assert_eq!(connections.len(), 5);
        assert_eq!(connections[0]["outcome"], "new");
        assert_eq!(connections[0]["dst_port"], 22);

        let blocked = read_lines(&dir.path().join(BLOCKED_LOG));
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0]["ip"], "10.0.0.5");
        assert_eq!(blocked[0]["score"], 100);

        assert_eq!(written, 6);
    }

    #[test]
    fn test_append_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("nested"));

        journal.append(EVENTS_LOG, &serde_json::json!({"n": 1})).unwrap();
        journal.append(EVENTS_LOG, &serde_json::json!({"n": 2})).unwrap();

        let lines = read_lines(&dir.path().join("nested").join(EVENTS_LOG));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["n"], 2);
    }

    // ==================== Daily Report Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_daily_report_written() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor();
        let now = Utc::now();
        let mut reporter = DailyReporter::new(dir.path(), 10, now.date_naive());

        monitor.handle_event(&ConnectionEvent::syn(ip("10.0.0.5"), 40000, 443));
        let path = reporter.tick(&monitor, now).unwrap();

        assert_eq!(path, report_path(dir.path(), now.date_naive()));
        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(report["stats"]["total_attempts"], 1);
        assert_eq!(report["stats"]["top_ports"][0]["port"], 443);
        assert_eq!(report["connections"]["pending"], 1);
        assert!(report.get("last_update").is_some());

        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_date_change_rotates_counters() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor();
        let now = Utc::now();
        let yesterday = now.date_naive().pred_opt().unwrap();
        let mut reporter = DailyReporter::new(dir.path(), 10, yesterday);

        monitor.handle_event(&ConnectionEvent::syn(ip("10.0.0.5"), 40000, 22));
        monitor.handle_event(&ConnectionEvent::syn(ip("10.0.0.6"), 40001, 22));
        reporter.tick(&monitor, now).unwrap();

        assert_eq!(reporter.current, now.date_naive());
        let closed: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(report_path(dir.path(), yesterday)).unwrap(),
        )
        .unwrap();
        assert_eq!(closed["stats"]["total_attempts"], 2);

        let fresh: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(report_path(dir.path(), now.date_naive())).unwrap(),
        )
        .unwrap();
        assert_eq!(fresh["stats"]["total_attempts"], 0);
        assert_eq!(monitor.stats().total(), 0);

        monitor.shutdown().await;
    }
}
