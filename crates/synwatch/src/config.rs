//! Monitor configuration.
//!
//! Durations are stored as whole seconds (or milliseconds) so the JSON
//! config file stays readable; accessor methods convert to [`Duration`].

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{WatchError, WatchResult};

/// Configuration for the handshake tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Seconds a SYN may wait for a response before it is classified blocked.
    pub handshake_timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 8,
        }
    }
}

impl TrackerConfig {
    /// Handshake timeout as a [`Duration`].
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Which observations feed the reputation engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    /// Score once per new handshake attempt (pure SYN).
    #[default]
    NewConnections,
    /// Score every parsed segment, whatever its flags.
    AllSegments,
}

/// Configuration for threat scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Score at which a source is blocked.
    pub threshold: u32,
    /// Points added for a non-critical port.
    pub base_weight: u32,
    /// Points added for a critical port.
    pub critical_weight: u32,
    /// Ports considered high value (remote login, databases).
    pub critical_ports: BTreeSet<u16>,
    /// Which observations are scored.
    pub score_source: ScoreSource,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            threshold: 100,
            base_weight: 5,
            critical_weight: 20,
            critical_ports: [21, 22, 23, 3305].into_iter().collect(),
            score_source: ScoreSource::NewConnections,
        }
    }
}

impl ReputationConfig {
    /// Weight applied for an attempt on `port`.
    #[must_use]
    pub fn weight_for(&self, port: u16) -> u32 {
        if self.critical_ports.contains(&port) {
            self.critical_weight
        } else {
            self.base_weight
        }
    }
}

/// Configuration for temporary blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlocklistConfig {
    /// How long a drop rule stays in place, in seconds.
    pub block_duration_secs: u64,
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            block_duration_secs: 600, // 10 minutes
        }
    }
}

impl BlocklistConfig {
    /// Block duration as a [`Duration`].
    #[must_use]
    pub const fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }
}

/// Configuration for the periodic reputation reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetConfig {
    /// Seconds between full resets of reputation and blacklist.
    pub interval_secs: u64,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            interval_secs: 24 * 60 * 60,
        }
    }
}

impl ResetConfig {
    /// Reset interval as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Configuration for the firewall command adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Firewall program to invoke.
    pub program: String,
    /// Chain that receives the drop rules.
    pub chain: String,
    /// Attempts per command before giving up.
    pub max_attempts: u32,
    /// Delay between attempts, doubled after each failure.
    pub retry_backoff_ms: u64,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            program: "iptables".to_string(),
            chain: "TDROP".to_string(),
            max_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl FirewallConfig {
    /// Initial retry backoff as a [`Duration`].
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Configuration for best-effort IP enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Whether to perform network lookups at all.
    pub enabled: bool,
    /// Base URL of an ipinfo-compatible service.
    pub endpoint: String,
    /// Per-lookup timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "https://ipinfo.io".to_string(),
            timeout_secs: 5,
        }
    }
}

impl EnrichmentConfig {
    /// Lookup timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Main monitor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Handshake tracking settings.
    pub tracker: TrackerConfig,
    /// Threat scoring settings.
    pub reputation: ReputationConfig,
    /// Temporary block settings.
    pub blocklist: BlocklistConfig,
    /// Periodic reset settings.
    pub reset: ResetConfig,
    /// Firewall adapter settings.
    pub firewall: FirewallConfig,
    /// Enrichment settings.
    pub enrichment: EnrichmentConfig,
    /// Addresses that are never scored or blocked.
    pub whitelist: BTreeSet<IpAddr>,
    /// Directory holding persisted state and reports.
    pub state_dir: PathBuf,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            reputation: ReputationConfig::default(),
            blocklist: BlocklistConfig::default(),
            reset: ResetConfig::default(),
            firewall: FirewallConfig::default(),
            enrichment: EnrichmentConfig::default(),
            whitelist: [IpAddr::V4(Ipv4Addr::LOCALHOST)].into_iter().collect(),
            state_dir: PathBuf::from("/var/lib/synwatch"),
        }
    }
}

impl WatchConfig {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> WatchConfigBuilder {
        WatchConfigBuilder::default()
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> WatchResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            WatchError::Config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> WatchResult<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| WatchError::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value would disable a core invariant.
    pub fn validate(&self) -> WatchResult<()> {
        if self.tracker.handshake_timeout_secs == 0 {
            return Err(WatchError::Config(
                "tracker.handshake_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.reputation.threshold == 0 {
            return Err(WatchError::Config(
                "reputation.threshold must be greater than zero".to_string(),
            ));
        }
        if self.reputation.base_weight == 0 || self.reputation.critical_weight == 0 {
            return Err(WatchError::Config(
                "reputation weights must be greater than zero".to_string(),
            ));
        }
        if self.blocklist.block_duration_secs == 0 {
            return Err(WatchError::Config(
                "blocklist.block_duration_secs must be greater than zero".to_string(),
            ));
        }
        if self.reset.interval_secs == 0 {
            return Err(WatchError::Config(
                "reset.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.firewall.max_attempts == 0 {
            return Err(WatchError::Config(
                "firewall.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.firewall.chain.is_empty() || self.firewall.program.is_empty() {
            return Err(WatchError::Config(
                "firewall.program and firewall.chain cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Check if an IP is whitelisted by configuration.
    #[must_use]
    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.whitelist.contains(ip)
    }
}

/// Builder for [`WatchConfig`].
#[derive(Debug, Clone, Default)]
pub struct WatchConfigBuilder {
    config: WatchConfig,
}

impl WatchConfigBuilder {
    /// Set tracker configuration.
    #[must_use]
    pub fn tracker(mut self, config: TrackerConfig) -> Self {
        self.config.tracker = config;
        self
    }

    /// Set reputation configuration.
    #[must_use]
    pub fn reputation(mut self, config: ReputationConfig) -> Self {
        self.config.reputation = config;
        self
    }

    /// Set blocklist configuration.
    #[must_use]
    pub fn blocklist(mut self, config: BlocklistConfig) -> Self {
        self.config.blocklist = config;
        self
    }

    /// Set reset configuration.
    #[must_use]
    pub fn reset(mut self, config: ResetConfig) -> Self {
        self.config.reset = config;
        self
    }

    /// Set firewall configuration.
    #[must_use]
    pub fn firewall(mut self, config: FirewallConfig) -> Self {
        self.config.firewall = config;
        self
    }

    /// Set enrichment configuration.
    #[must_use]
    pub fn enrichment(mut self, config: EnrichmentConfig) -> Self {
        self.config.enrichment = config;
        self
    }

    /// Add a whitelisted IP.
    #[must_use]
    pub fn whitelist_ip(mut self, ip: IpAddr) -> Self {
        self.config.whitelist.insert(ip);
        self
    }

    /// Set the state directory.
    #[must_use]
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.state_dir = dir.into();
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> WatchConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WatchConfig::default();

        assert_eq!(config.tracker.handshake_timeout(), Duration::from_secs(8));
        assert_eq!(config.reputation.threshold, 100);
        assert_eq!(config.blocklist.block_duration(), Duration::from_secs(600));
        assert_eq!(config.reset.interval(), Duration::from_secs(86_400));
        assert_eq!(config.firewall.chain, "TDROP");
        assert!(config.is_whitelisted(&"127.0.0.1".parse().unwrap()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_weight_for_critical_ports() {
        let config = ReputationConfig::default();

        assert_eq!(config.weight_for(22), 20);
        assert_eq!(config.weight_for(3305), 20);
        assert_eq!(config.weight_for(80), 5);
        assert_eq!(config.weight_for(443), 5);
    }

    #[test]
    fn test_builder_pattern() {
        let config = WatchConfig::builder()
            .tracker(TrackerConfig {
                handshake_timeout_secs: 3,
            })
            .whitelist_ip("192.168.1.10".parse().unwrap())
            .state_dir("/tmp/synwatch")
            .build();

        assert_eq!(config.tracker.handshake_timeout_secs, 3);
        assert!(config.is_whitelisted(&"192.168.1.10".parse().unwrap()));
        assert!(config.is_whitelisted(&"127.0.0.1".parse().unwrap()));
        assert_eq!(config.state_dir, PathBuf::from("/tmp/synwatch"));
    }

    #[test]
    fn test_from_json_partial_uses_defaults() {
        let config = WatchConfig::from_json(
            r#"{ "reputation": { "threshold": 40, "critical_ports": [2222] } }"#,
        )
        .unwrap();

        assert_eq!(config.reputation.threshold, 40);
        assert_eq!(config.reputation.base_weight, 5);
        assert_eq!(config.reputation.weight_for(2222), 20);
        assert_eq!(config.reputation.weight_for(22), 5);
        assert_eq!(config.tracker.handshake_timeout_secs, 8);
    }

    #[test]
    fn test_from_json_score_source() {
        let config =
            WatchConfig::from_json(r#"{ "reputation": { "score_source": "all_segments" } }"#)
                .unwrap();
        assert_eq!(config.reputation.score_source, ScoreSource::AllSegments);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let result = WatchConfig::from_json("threshold = 100");
        assert!(matches!(result, Err(WatchError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = WatchConfig::default();
        config.tracker.handshake_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = WatchConfig::default();
        config.reputation.threshold = 0;
        assert!(config.validate().is_err());

        let mut config = WatchConfig::default();
        config.reputation.critical_weight = 0;
        assert!(config.validate().is_err());

        let mut config = WatchConfig::default();
        config.blocklist.block_duration_secs = 0;
        assert!(config.validate().is_err());

        let mut config = WatchConfig::default();
        config.firewall.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_missing() {
        let result = WatchConfig::from_file("/nonexistent/synwatch.json");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("failed to read config file"));
    }

    #[test]
    fn test_config_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("synwatch.json");
        let config = WatchConfig::builder().state_dir(dir.path()).build();
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = WatchConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
