//! Line sources feeding the monitor.
//!
//! Live capture runs `tcpdump -lni <iface> tcp` with line-buffered output;
//! replay reads a saved text capture from a file or stdin.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Where capture lines come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    /// Live `tcpdump` on an interface.
    Tcpdump {
        /// Capture program.
        program: String,
        /// Interface name (`any` for all).
        interface: String,
    },
    /// A saved capture file.
    File(PathBuf),
    /// A capture piped on stdin.
    Stdin,
}

impl CaptureSource {
    /// Pick a source from the `--input` flag, falling back to live capture.
    pub fn from_args(input: Option<PathBuf>, program: &str, interface: &str) -> Self {
        match input {
            Some(path) if path.as_os_str() == "-" => Self::Stdin,
            Some(path) => Self::File(path),
            None => Self::Tcpdump {
                program: program.to_string(),
                interface: interface.to_string(),
            },
        }
    }

    /// Whether the source ends on its own.
    pub const fn is_replay(&self) -> bool {
        !matches!(self, Self::Tcpdump { .. })
    }
}

type LineReader = Box<dyn AsyncBufRead + Unpin + Send>;

/// An open line stream.
///
/// Lines are decoded lossily; bytes that are not UTF-8 become U+FFFD and
/// the line is left for the parser to reject.
pub struct Capture {
    reader: LineReader,
    buf: Vec<u8>,
    child: Option<Child>,
}

impl std::fmt::Debug for Capture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capture")
            .field("live", &self.child.is_some())
            .finish_non_exhaustive()
    }
}

impl Capture {
    /// Open `source`.
    pub async fn open(source: &CaptureSource) -> Result<Self> {
        match source {
            CaptureSource::Tcpdump { program, interface } => Self::spawn(program, interface),
            CaptureSource::File(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("failed to open capture file {}", path.display()))?;
                info!(path = %path.display(), "replaying capture file");
                Ok(Self::from_reader(Box::new(BufReader::new(file))))
            }
            CaptureSource::Stdin => {
                info!("replaying capture from stdin");
                Ok(Self::from_reader(Box::new(BufReader::new(tokio::io::stdin()))))
            }
        }
    }

    fn from_reader(reader: LineReader) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(256),
            child: None,
        }
    }

    fn spawn(program: &str, interface: &str) -> Result<Self> {
        let mut child = Command::new(program)
            .args(["-lni", interface, "tcp"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {program} on {interface}"))?;

        let stdout = child
            .stdout
            .take()
            .context("capture process has no stdout")?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(BufReader::new(stderr)));
        }

        info!(program, interface, pid = child.id(), "live capture started");
        let mut capture = Self::from_reader(Box::new(BufReader::new(stdout)));
        capture.child = Some(child);
        Ok(capture)
    }

    /// Next line, or `None` once the source is exhausted.
    ///
    /// Cancel safe: a partially read line stays buffered for the next call.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.reader.read_until(b'\n', &mut self.buf).await?;
        if self.buf.is_empty() {
            return Ok(None);
        }
        let mut line = self.buf.as_slice();
        if let Some(rest) = line.strip_suffix(b"\n") {
            line = rest;
        }
        if let Some(rest) = line.strip_suffix(b"\r") {
            line = rest;
        }
        let line = String::from_utf8_lossy(line).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }

    /// Stop the capture process, if any.
    pub async fn stop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "capture process already gone");
            }
        }
    }
}

/// Relay tcpdump's stderr, dropping its startup banner.
async fn forward_stderr<R: AsyncBufRead + Unpin>(reader: R) {
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_banner(&line) {
            debug!(line = %line, "capture banner");
        } else {
            warn!(line = %line, "capture stderr");
        }
    }
}

fn is_banner(line: &str) -> bool {
    line.contains("listening on") || line.contains("verbose output suppressed")
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Source Tests ====================

    #[test]
    fn test_source_from_args() {
        assert_eq!(
            CaptureSource::from_args(Some(PathBuf::from("-")), "tcpdump", "eth0"),
            CaptureSource::Stdin
        );
        assert_eq!(
            CaptureSource::from_args(Some(PathBuf::from("cap.txt")), "tcpdump", "eth0"),
            CaptureSource::File(PathBuf::from("cap.txt"))
        );

        let live = CaptureSource::from_args(None, "tcpdump", "any");
        assert!(!live.is_replay());
        assert_eq!(
            live,
            CaptureSource::Tcpdump {
                program: "tcpdump".into(),
                interface: "any".into()
            }
        );
    }

    #[test]
    fn test_banner_detection() {
        assert!(is_banner("tcpdump: verbose output suppressed, use -v[v]... for full protocol decode"));
        assert!(is_banner("listening on any, link-type LINUX_SLL2, snapshot length 262144 bytes"));
        assert!(!is_banner("tcpdump: eth9: No such device exists"));
    }

    // ==================== Replay Tests ====================

    #[tokio::test]
    async fn test_file_replay_yields_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.txt");
        std::fs::write(
            &path,
            "10:00:00.1 IP 10.0.0.5.40000 > 10.0.0.1.22: Flags [S], seq 1, length 0\n\
             10:00:00.2 IP 10.0.0.5.40000 > 10.0.0.1.22: Flags [.], ack 1, length 0\n",
        )
        .unwrap();

        let mut capture = Capture::open(&CaptureSource::File(path)).await.unwrap();
        let first = capture.next_line().await.unwrap().unwrap();
        assert!(first.contains("Flags [S]"));
        assert!(capture.next_line().await.unwrap().is_some());
        assert!(capture.next_line().await.unwrap().is_none());
        capture.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_end_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.txt");
        let mut bytes = b"10:00:00.1 IP 10.0.0.5.40000 > 10.0.0.1.22: Flags [S], seq 1, length 0\n".to_vec();
        bytes.extend_from_slice(b"garbage \xff\xfe line\r\n");
        bytes.extend_from_slice(b"10:00:00.3 IP 10.0.0.6.40001 > 10.0.0.1.23: Flags [S], seq 1, length 0");
        std::fs::write(&path, bytes).unwrap();

        let mut capture = Capture::open(&CaptureSource::File(path)).await.unwrap();
        assert!(capture.next_line().await.unwrap().unwrap().contains("10.0.0.5"));

        let garbled = capture.next_line().await.unwrap().unwrap();
        assert_eq!(garbled, "garbage \u{fffd}\u{fffd} line");

        let last = capture.next_line().await.unwrap().unwrap();
        assert!(last.contains("10.0.0.6.40001"));
        assert!(capture.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_counted_malformed() {
        use std::sync::Arc;

        use chrono::Utc;
        use synwatch::{DryRunFirewall, MemoryStateStore, Monitor, Notifier, Outcome, StaticEnricher, WatchConfig};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.txt");
        let mut bytes = b"10:00:00.1 IP 10.0.0.5.40000 > 10.0.0.1.22: Flags [S], seq 1, length 0\n".to_vec();
        bytes.extend_from_slice(b"\xff\xfe\xfd\n");
        bytes.extend_from_slice(b"10:00:00.3 IP 10.0.0.6.40001 > 10.0.0.1.23: Flags [S], seq 1, length 0\n");
        std::fs::write(&path, bytes).unwrap();

        let monitor = Monitor::new(
            WatchConfig::default(),
            Arc::new(DryRunFirewall::new()),
            Arc::new(StaticEnricher::new()),
            Arc::new(MemoryStateStore::new()),
            Notifier::disabled(),
        )
        .unwrap();

        let mut capture = Capture::open(&CaptureSource::File(path)).await.unwrap();
        let mut outcomes = Vec::new();
        while let Some(line) = capture.next_line().await.unwrap() {
            outcomes.push(monitor.handle_line(&line, Utc::now()));
        }

        assert_eq!(outcomes, vec![Some(Outcome::New), None, Some(Outcome::New)]);
        assert_eq!(monitor.snapshot(10).malformed_events, 1);
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let result = Capture::open(&CaptureSource::File(PathBuf::from(
            "/nonexistent/synwatch/capture.txt",
        )))
        .await;
        assert!(result.is_err());
    }
}
