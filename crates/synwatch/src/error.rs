//! Error types for the watch core.

use std::net::IpAddr;
use thiserror::Error;

/// Errors that can occur while tracking, scoring or blocking.
///
/// None of these are fatal to a running monitor: callers log them and keep
/// going with in-memory state as the source of truth.
#[derive(Debug, Error)]
pub enum WatchError {
    /// An input line could not be parsed into a connection event.
    #[error("malformed event: {reason}")]
    MalformedEvent {
        /// Why the line was rejected.
        reason: String,
    },

    /// The enrichment lookup failed or timed out.
    #[error("enrichment lookup for {ip} failed: {reason}")]
    Enrichment {
        /// The address being looked up.
        ip: IpAddr,
        /// Underlying failure.
        reason: String,
    },

    /// A firewall command could not be spawned or exited non-zero.
    #[error("firewall {action} for {ip} failed: {reason}")]
    FirewallCommand {
        /// The address the rule targets.
        ip: IpAddr,
        /// Which rule operation failed.
        action: FirewallAction,
        /// Exit status or spawn error.
        reason: String,
    },

    /// Writing state to the durable store failed.
    #[error("persistence error in {section}: {reason}")]
    Persistence {
        /// Store section being written.
        section: &'static str,
        /// Underlying failure.
        reason: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// Create a malformed event error.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            reason: reason.into(),
        }
    }

    /// Create a persistence error for a store section.
    #[must_use]
    pub fn persistence(section: &'static str, reason: impl ToString) -> Self {
        Self::Persistence {
            section,
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FirewallCommand { .. } | Self::Persistence { .. } | Self::Io(_)
        )
    }
}

/// Firewall rule operation, used in errors and notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallAction {
    /// Insert a drop rule for a source address.
    Insert,
    /// Remove a previously inserted drop rule.
    Remove,
}

impl std::fmt::Display for FirewallAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// Result type for watch operations.
pub type WatchResult<T> = Result<T, WatchError>;
