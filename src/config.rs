//! Typed configuration.
//!
//! Every recognized option is a field here with a serde default. The core
//! never reads files; the binary deserializes this from JSON and calls
//! [`Config::validate`] before building a [`crate::Service`].

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::filter::Category;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

/// Blocklist line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceFormat {
    /// `0.0.0.0 domain` host mappings.
    Hosts,
    /// `||domain^` block rules and `@@||domain^` exceptions.
    FilterList,
    /// One domain per line.
    PlainDomains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// `http(s)://` URL, `file://` URL, or filesystem path.
    pub origin: String,
    pub format: SourceFormat,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub category: Category,
    /// Treat plain and hosts entries as covering every subdomain too.
    #[serde(default)]
    pub subdomains: bool,
}

/// Encrypted transport used to reach an upstream resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// DNS over TLS (RFC 7858).
    Tls,
    /// DNS over HTTPS (RFC 8484).
    Https,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tls => "tls",
            Protocol::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Tls => 853,
            Protocol::Https => 443,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    /// IP address or host name to connect to.
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub protocol: Protocol,
    /// Higher is preferred.
    #[serde(default)]
    pub priority: i32,
    /// Name presented for SNI and certificate validation. Defaults to `address`.
    #[serde(default)]
    pub tls_name: Option<String>,
    /// Request path for DNS over HTTPS.
    #[serde(default = "default_doh_path")]
    pub path: String,
}

impl ServerConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    pub fn tls_name(&self) -> &str {
        self.tls_name.as_deref().unwrap_or(&self.address)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    #[serde(default = "default_false_positive_rate")]
    pub false_positive_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,
    #[serde(default = "default_fetch_backoff_ms")]
    pub fetch_backoff_ms: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Periodic refresh; `0` disables it.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

impl LoaderConfig {
    pub fn fetch_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Total entries across all shards. Eviction is least recently used
    /// within a shard, so it only approximates global LRU order.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Lock shards; clamped to `capacity`.
    #[serde(default = "default_cache_shards")]
    pub shards: usize,
    #[serde(default)]
    pub min_ttl_secs: u64,
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,
    /// TTL for responses that carry no records.
    #[serde(default = "default_negative_ttl_secs")]
    pub negative_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl CacheConfig {
    pub fn min_ttl(&self) -> Duration {
        Duration::from_secs(self.min_ttl_secs)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Upper bound for the cool-down after repeated failed trials.
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Budget for one upstream attempt before failing over.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Deadline used when the caller does not pass one.
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

impl ResolverConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }
}

fn default_true() -> bool {
    true
}
fn default_doh_path() -> String {
    "/dns-query".to_string()
}
fn default_false_positive_rate() -> f64 {
    0.001
}
fn default_fetch_concurrency() -> usize {
    4
}
fn default_fetch_retries() -> u32 {
    3
}
fn default_fetch_backoff_ms() -> u64 {
    500
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_refresh_interval_secs() -> u64 {
    86_400
}
fn default_cache_capacity() -> usize {
    10_000
}
fn default_cache_shards() -> usize {
    16
}
fn default_max_ttl_secs() -> u64 {
    3_600
}
fn default_negative_ttl_secs() -> u64 {
    60
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_max_connections() -> usize {
    4
}
fn default_idle_timeout_secs() -> u64 {
    30
}
fn default_connect_timeout_ms() -> u64 {
    2_000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_ms() -> u64 {
    10_000
}
fn default_max_cooldown_ms() -> u64 {
    300_000
}
fn default_attempt_timeout_ms() -> u64 {
    1_500
}
fn default_deadline_ms() -> u64 {
    4_000
}
fn default_stats_interval_secs() -> u64 {
    60
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            false_positive_rate: default_false_positive_rate(),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: default_fetch_concurrency(),
            fetch_retries: default_fetch_retries(),
            fetch_backoff_ms: default_fetch_backoff_ms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            shards: default_cache_shards(),
            min_ttl_secs: 0,
            max_ttl_secs: default_max_ttl_secs(),
            negative_ttl_secs: default_negative_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            max_cooldown_ms: default_max_cooldown_ms(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: default_attempt_timeout_ms(),
            default_deadline_ms: default_deadline_ms(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl Config {
    /// Reject configurations the core cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }

        let mut names = HashSet::new();
        for server in &self.servers {
            if !names.insert(server.name.as_str()) {
                return Err(ConfigError::DuplicateServer(server.name.clone()));
            }
            if server.address.trim().is_empty() || server.port() == 0 {
                return Err(ConfigError::InvalidServer(server.name.clone()));
            }
        }

        validate_sources(&self.sources)?;

        let fpr = self.matcher.false_positive_rate;
        if !(fpr > 0.0 && fpr < 1.0) {
            return Err(ConfigError::FalsePositiveRate);
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::Zero("cache.capacity"));
        }
        if self.cache.shards == 0 {
            return Err(ConfigError::Zero("cache.shards"));
        }
        if self.cache.min_ttl_secs > self.cache.max_ttl_secs {
            return Err(ConfigError::TtlRange);
        }
        if self.pool.max_connections == 0 {
            return Err(ConfigError::Zero("pool.max_connections"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Zero("breaker.failure_threshold"));
        }
        if self.loader.fetch_concurrency == 0 {
            return Err(ConfigError::Zero("loader.fetch_concurrency"));
        }

        Ok(())
    }
}

/// Source list checks shared by startup and reconfiguration.
pub fn validate_sources(sources: &[SourceConfig]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for (idx, source) in sources.iter().enumerate() {
        if source.name.trim().is_empty() || source.origin.trim().is_empty() {
            return Err(ConfigError::IncompleteSource(idx));
        }
        if !names.insert(source.name.as_str()) {
            return Err(ConfigError::DuplicateSource(source.name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            address: "1.1.1.1".to_string(),
            port: None,
            protocol: Protocol::Tls,
            priority: 0,
            tls_name: Some("one.one.one.one".to_string()),
            path: default_doh_path(),
        }
    }

    #[test]
    fn parses_json_with_defaults() {
        let json = r#"{
            "sources": [
                {"name": "ads", "origin": "https://example.org/hosts", "format": "hosts", "priority": 2},
                {"name": "rules", "origin": "/etc/hush/rules.txt", "format": "filter-list", "category": "tracking"}
            ],
            "servers": [
                {"name": "quad9", "address": "9.9.9.9", "protocol": "tls", "tls_name": "dns.quad9.net"},
                {"name": "cf", "address": "cloudflare-dns.com", "protocol": "https", "priority": 5}
            ],
            "cache": {"capacity": 500}
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.sources[0].format, SourceFormat::Hosts);
        assert!(config.sources[0].enabled);
        assert_eq!(config.sources[1].category, Category::Tracking);
        assert_eq!(config.servers[0].port(), 853);
        assert_eq!(config.servers[1].port(), 443);
        assert_eq!(config.servers[1].tls_name(), "cloudflare-dns.com");
        assert_eq!(config.servers[1].path, "/dns-query");
        assert_eq!(config.cache.capacity, 500);
        assert_eq!(config.cache.shards, 16);
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn no_servers_is_fatal() {
        assert_eq!(Config::default().validate(), Err(ConfigError::NoServers));
    }

    #[test]
    fn duplicate_names_rejected() {
        let config = Config {
            servers: vec![server("a"), server("a")],
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::DuplicateServer("a".into())));

        let source = SourceConfig {
            name: "list".into(),
            origin: "/tmp/list".into(),
            format: SourceFormat::PlainDomains,
            priority: 0,
            enabled: true,
            category: Category::Ads,
            subdomains: false,
        };
        let config = Config {
            servers: vec![server("a")],
            sources: vec![source.clone(), source],
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::DuplicateSource("list".into())));
    }

    #[test]
    fn incomplete_source_rejected() {
        let config = Config {
            servers: vec![server("a")],
            sources: vec![SourceConfig {
                name: "".into(),
                origin: "/tmp/list".into(),
                format: SourceFormat::Hosts,
                priority: 0,
                enabled: true,
                category: Category::Ads,
                subdomains: false,
            }],
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::IncompleteSource(0)));
    }

    #[test]
    fn zero_capacities_and_bad_ranges_rejected() {
        let mut config = Config {
            servers: vec![server("a")],
            ..Default::default()
        };
        config.cache.shards = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero("cache.shards")));

        config.cache.shards = 4;
        config.cache.min_ttl_secs = 7_200;
        assert_eq!(config.validate(), Err(ConfigError::TtlRange));

        config.cache.min_ttl_secs = 0;
        config.matcher.false_positive_rate = 1.5;
        assert_eq!(config.validate(), Err(ConfigError::FalsePositiveRate));
    }
}
