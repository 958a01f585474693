//! Outbound notices for reporting sinks.
//!
//! Components publish what happened (classified handshakes, blocks,
//! unblocks, resets) on an unbounded channel; the consumer decides how to
//! render or store it. Publishing never blocks the event path.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::blocklist::BlockEntry;
use crate::error::FirewallAction;
use crate::reputation::BlockReport;
use crate::tracker::ConnectionRecord;

/// Something a reporting sink may want to record.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum Notice {
    /// A handshake attempt was observed or resolved.
    Connection(ConnectionRecord),
    /// A source crossed the threat threshold and was blocked.
    Blocked(Box<BlockReport>),
    /// A block expired and its drop rule was removed.
    Unblocked {
        /// The released block.
        entry: BlockEntry,
        /// When the rule was removed.
        at: DateTime<Utc>,
    },
    /// A firewall command failed after all retries.
    FirewallFailure {
        /// Target address.
        ip: IpAddr,
        /// Operation that failed.
        action: FirewallAction,
        /// Last error.
        error: String,
    },
    /// Reputation memory and blacklist were cleared.
    Reset {
        /// When the reset ran.
        at: DateTime<Utc>,
        /// Reputation records dropped.
        records_cleared: usize,
        /// Blacklist entries dropped.
        blacklist_cleared: usize,
    },
}

/// Cheap cloneable publisher for [`Notice`]s.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<Notice>>,
}

impl Notifier {
    /// Create a notifier and the receiving end of its channel.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A notifier that drops everything.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { tx: None }
    }

    /// Publish a notice; a closed receiver is ignored.
    pub fn emit(&self, notice: Notice) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(notice);
        }
    }
}
