//! Best-effort source address enrichment.
//!
//! Lookups never gate a block decision: a failed or slow lookup is replaced
//! by a placeholder record and the block goes ahead regardless.

use std::collections::HashMap;
use std::net::IpAddr;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EnrichmentConfig;
use crate::error::{WatchError, WatchResult};

/// Hosting providers whose address space marks a source as a datacenter.
static DATACENTER_ORG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)digitalocean|amazon|ovh|hetzner|linode|google|microsoft")
        .unwrap_or_else(|_| unreachable!())
});

const UNKNOWN: &str = "-";

/// Location and ownership of a source address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    /// The address looked up.
    pub ip: IpAddr,
    /// Country code.
    pub country: String,
    /// Region or state.
    pub region: String,
    /// City.
    pub city: String,
    /// Owning organisation (usually `"AS#### Name"`).
    pub org: String,
    /// Autonomous system, taken from the first token of `org`.
    pub asn: String,
    /// Whether the owner looks like a hosting provider; `None` if unknown.
    pub is_datacenter: Option<bool>,
}

impl GeoInfo {
    /// Placeholder used when a lookup fails.
    #[must_use]
    pub fn unknown(ip: IpAddr) -> Self {
        Self {
            ip,
            country: UNKNOWN.to_string(),
            region: UNKNOWN.to_string(),
            city: UNKNOWN.to_string(),
            org: UNKNOWN.to_string(),
            asn: UNKNOWN.to_string(),
            is_datacenter: None,
        }
    }

    /// Fixed record for carrier-grade NAT space.
    #[must_use]
    pub fn cgnat(ip: IpAddr) -> Self {
        Self {
            ip,
            country: "CGNAT".to_string(),
            region: "carrier internal address".to_string(),
            city: UNKNOWN.to_string(),
            org: "shared address space".to_string(),
            asn: UNKNOWN.to_string(),
            is_datacenter: Some(false),
        }
    }

    /// Build a record from the raw fields of a lookup response.
    #[must_use]
    pub fn from_fields(
        ip: IpAddr,
        country: Option<String>,
        region: Option<String>,
        city: Option<String>,
        org: Option<String>,
    ) -> Self {
        let or_unknown = |value: Option<String>| value.filter(|v| !v.is_empty()).unwrap_or_else(|| UNKNOWN.to_string());
        let org = org.unwrap_or_default();
        let asn = org
            .split_whitespace()
            .next()
            .map_or_else(|| UNKNOWN.to_string(), str::to_string);
        let is_datacenter = Some(DATACENTER_ORG.is_match(&org));

        Self {
            ip,
            country: or_unknown(country),
            region: or_unknown(region),
            city: or_unknown(city),
            org: if org.is_empty() { UNKNOWN.to_string() } else { org },
            asn,
            is_datacenter,
        }
    }

    /// Whether this is a failure placeholder.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.is_datacenter.is_none() && self.country == UNKNOWN
    }
}

/// Whether `ip` lies in the shared address space `100.64.0.0/10`.
#[must_use]
pub fn is_cgnat(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            a == 100 && (b & 0xC0) == 64
        }
        IpAddr::V6(_) => false,
    }
}

/// Source of enrichment data.
#[allow(async_fn_in_trait)]
pub trait Enricher: Send + Sync + 'static {
    /// Look up `ip`.
    fn lookup(&self, ip: IpAddr) -> impl std::future::Future<Output = WatchResult<GeoInfo>> + Send;
}

/// Look up `ip`, substituting the placeholder on failure.
pub async fn lookup_or_placeholder<E: Enricher>(enricher: &E, ip: IpAddr) -> GeoInfo {
    match enricher.lookup(ip).await {
        Ok(info) => info,
        Err(e) => {
            warn!(ip = %ip, error = %e, "enrichment failed, using placeholder");
            GeoInfo::unknown(ip)
        }
    }
}

#[derive(Debug, Deserialize)]
struct IpInfoResponse {
    country: Option<String>,
    region: Option<String>,
    city: Option<String>,
    org: Option<String>,
}

/// Enricher backed by an ipinfo-compatible HTTP service.
#[derive(Debug, Clone)]
pub struct IpInfoEnricher {
    client: reqwest::Client,
    endpoint: String,
    enabled: bool,
}

impl IpInfoEnricher {
    /// Create from configuration.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Config` if the HTTP client cannot be built.
    pub fn from_config(config: &EnrichmentConfig) -> WatchResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| WatchError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            enabled: config.enabled,
        })
    }

    fn url_for(&self, ip: IpAddr) -> String {
        format!("{}/{ip}/json", self.endpoint)
    }
}

impl Enricher for IpInfoEnricher {
    async fn lookup(&self, ip: IpAddr) -> WatchResult<GeoInfo> {
        if is_cgnat(&ip) {
            return Ok(GeoInfo::cgnat(ip));
        }
        if !self.enabled {
            return Ok(GeoInfo::unknown(ip));
        }

        let failed = |reason: String| WatchError::Enrichment { ip, reason };
        let response = self
            .client
            .get(self.url_for(ip))
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?
            .error_for_status()
            .map_err(|e| failed(e.to_string()))?;
        let body: IpInfoResponse = response.json().await.map_err(|e| failed(e.to_string()))?;

        debug!(ip = %ip, country = ?body.country, org = ?body.org, "enrichment lookup complete");
        Ok(GeoInfo::from_fields(ip, body.country, body.region, body.city, body.org))
    }
}

/// In-memory enricher; addresses without an entry fail.
#[derive(Debug, Default)]
pub struct StaticEnricher {
    entries: RwLock<HashMap<IpAddr, GeoInfo>>,
}

impl StaticEnricher {
    /// Create an empty enricher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry.
    #[must_use]
    pub fn with(self, info: GeoInfo) -> Self {
        self.entries.write().insert(info.ip, info);
        self
    }
}

impl Enricher for StaticEnricher {
    async fn lookup(&self, ip: IpAddr) -> WatchResult<GeoInfo> {
        if is_cgnat(&ip) {
            return Ok(GeoInfo::cgnat(ip));
        }
        self.entries
            .read()
            .get(&ip)
            .cloned()
            .ok_or_else(|| WatchError::Enrichment {
                ip,
                reason: "no entry".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test_case("100.64.0.1", true ; "start of range")]
    #[test_case("100.127.255.254", true ; "end of range")]
    #[test_case("100.63.0.1", false ; "below range")]
    #[test_case("100.128.0.1", false ; "above range")]
    #[test_case("10.0.0.1", false ; "private")]
    #[test_case("::1", false ; "ipv6")]
    fn test_cgnat_range(addr: &str, expected: bool) {
        assert_eq!(is_cgnat(&ip(addr)), expected);
    }

    #[test_case("AS14061 DigitalOcean, LLC", Some(true), "AS14061" ; "digitalocean")]
    #[test_case("AS16509 Amazon.com, Inc.", Some(true), "AS16509" ; "amazon")]
    #[test_case("AS24940 Hetzner Online GmbH", Some(true), "AS24940" ; "hetzner")]
    #[test_case("AS7922 Comcast Cable", Some(false), "AS7922" ; "residential")]
    fn test_from_fields_org_heuristics(org: &str, datacenter: Option<bool>, asn: &str) {
        let info = GeoInfo::from_fields(
            ip("203.0.113.9"),
            Some("US".into()),
            None,
            Some(String::new()),
            Some(org.into()),
        );
        assert_eq!(info.is_datacenter, datacenter);
        assert_eq!(info.asn, asn);
        assert_eq!(info.region, "-");
        assert_eq!(info.city, "-");
        assert!(!info.is_unknown());
    }

    #[test]
    fn test_from_fields_without_org() {
        let info = GeoInfo::from_fields(ip("203.0.113.9"), None, None, None, None);
        assert_eq!(info.org, "-");
        assert_eq!(info.asn, "-");
        assert_eq!(info.is_datacenter, Some(false));
    }

    #[test]
    fn test_placeholder_is_complete() {
        let info = GeoInfo::unknown(ip("203.0.113.9"));
        assert!(info.is_unknown());
        assert_eq!(info.country, "-");
        assert_eq!(info.asn, "-");
    }

    #[tokio::test]
    async fn test_cgnat_skips_network() {
        let enricher = IpInfoEnricher::from_config(&EnrichmentConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            ..EnrichmentConfig::default()
        })
        .unwrap();

        let info = enricher.lookup(ip("100.70.1.2")).await.unwrap();
        assert_eq!(info.country, "CGNAT");
        assert_eq!(info.is_datacenter, Some(false));
    }

    #[tokio::test]
    async fn test_disabled_returns_placeholder() {
        let enricher = IpInfoEnricher::from_config(&EnrichmentConfig {
            enabled: false,
            ..EnrichmentConfig::default()
        })
        .unwrap();

        let info = enricher.lookup(ip("203.0.113.9")).await.unwrap();
        assert!(info.is_unknown());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_falls_back() {
        let enricher = IpInfoEnricher::from_config(&EnrichmentConfig {
            endpoint: "http://127.0.0.1:1/".to_string(),
            timeout_secs: 1,
            ..EnrichmentConfig::default()
        })
        .unwrap();
        assert_eq!(enricher.url_for(ip("203.0.113.9")), "http://127.0.0.1:1/203.0.113.9/json");

        assert!(matches!(
            enricher.lookup(ip("203.0.113.9")).await,
            Err(WatchError::Enrichment { .. })
        ));
        let info = lookup_or_placeholder(&enricher, ip("203.0.113.9")).await;
        assert!(info.is_unknown());
    }

    #[tokio::test]
    async fn test_static_enricher() {
        let known = GeoInfo::from_fields(ip("198.51.100.4"), Some("DE".into()), None, None, Some("AS24940 Hetzner".into()));
        let enricher = StaticEnricher::new().with(known.clone());

        assert_eq!(enricher.lookup(ip("198.51.100.4")).await.unwrap(), known);
        assert!(enricher.lookup(ip("198.51.100.5")).await.is_err());
    }
}
