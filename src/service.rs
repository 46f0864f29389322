//! The context object tying every component together.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::ResponseCache;
use crate::config::{Config, SourceConfig, validate_sources};
use crate::dns::QueryType;
use crate::error::{ConfigError, StartupError};
use crate::filter::{CheckResult, MatchEngine};
use crate::pool::{Connect, ConnectionPool, ServerHealth, UpstreamConnector};
use crate::resolver::{Resolution, Resolver};
use crate::source::{Fetch, HttpFetcher, Loader, ReloadReport, Source};
use crate::stats::{Stage, Stats, StatsEvent, StatsSnapshot};

/// Everything [`Service::stats`] reports.
#[derive(Debug, Clone)]
pub struct ServiceStats {
    pub counters: StatsSnapshot,
    pub servers: Vec<ServerHealth>,
    pub ready: bool,
    pub blocklist_entries: usize,
    pub snapshot_built_at: Option<SystemTime>,
    pub cache_entries: usize,
}

pub struct Service {
    config: Config,
    sources: Mutex<Vec<SourceConfig>>,
    engine: Arc<MatchEngine>,
    loader: Loader,
    cache: Arc<ResponseCache>,
    pool: Arc<ConnectionPool>,
    resolver: Resolver,
    stats: Arc<Stats>,
}

impl Service {
    /// Build a service with the HTTP fetcher and encrypted upstream connectors.
    pub fn new(config: Config) -> Result<Self, StartupError> {
        let fetcher = Arc::new(HttpFetcher::new(config.loader.fetch_timeout())?);
        let connector = Arc::new(UpstreamConnector::new(config.pool.connect_timeout())?);
        Ok(Self::with_parts(config, fetcher, connector)?)
    }

    /// Build a service around caller-supplied fetch and connect implementations.
    pub fn with_parts(
        config: Config,
        fetcher: Arc<dyn Fetch>,
        connector: Arc<dyn Connect>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let stats = Arc::new(Stats::new());
        let engine = Arc::new(MatchEngine::new());
        let loader = Loader::new(
            fetcher,
            config.loader.clone(),
            config.matcher.false_positive_rate,
        );
        let cache = Arc::new(ResponseCache::new(&config.cache, stats.clone()));
        let pool = Arc::new(ConnectionPool::new(
            &config.servers,
            &config.pool,
            &config.breaker,
            connector,
            stats.clone(),
        ));
        let resolver = Resolver::new(
            engine.clone(),
            cache.clone(),
            pool.clone(),
            stats.clone(),
            &config.resolver,
        );

        Ok(Self {
            sources: Mutex::new(config.sources.clone()),
            config,
            engine,
            loader,
            cache,
            pool,
            resolver,
            stats,
        })
    }

    /// Whether `domain` is blocked. The query type does not affect the verdict.
    pub fn check(&self, domain: &str, _qtype: QueryType) -> CheckResult {
        let started = tokio::time::Instant::now();
        self.stats.record(StatsEvent::Lookup);
        let result = self.engine.check(domain);
        self.stats
            .record(StatsEvent::Latency(Stage::Check, started.elapsed()));
        if let (true, Some(category)) = (result.blocked, result.category) {
            self.stats.record(StatsEvent::Blocked(category));
        }
        result
    }

    /// Resolve `domain`, bounded by `deadline_millis` or the configured default.
    pub async fn resolve(&self, domain: &str, qtype: QueryType, deadline_millis: Option<u64>) -> Resolution {
        let deadline = deadline_millis
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.resolver.default_deadline());
        self.resolver.resolve(domain, qtype, deadline).await
    }

    /// Replace the source set and reload it.
    pub async fn reload(&self, sources: Vec<SourceConfig>) -> Result<Vec<ReloadReport>, ConfigError> {
        validate_sources(&sources)?;
        if let Ok(mut current) = self.sources.lock() {
            *current = sources;
        }
        Ok(self.refresh().await)
    }

    /// Reload the current source set.
    pub async fn refresh(&self) -> Vec<ReloadReport> {
        let sources = self
            .sources
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        let reports = self.loader.reload(&sources, &self.engine).await;

        for report in &reports {
            match &report.error {
                Some(error) => warn!(
                    source = %report.source,
                    entries = report.entries,
                    error = %error,
                    "source reload failed"
                ),
                None => info!(
                    source = %report.source,
                    added = report.added,
                    removed = report.removed,
                    updated = report.updated,
                    rejected = report.rejected,
                    entries = report.entries,
                    "source reloaded"
                ),
            }
        }

        let loaded = self.loader.sources().await;
        self.stats
            .retain_sources(|name| loaded.iter().any(|s| s.name == name));
        for source in &loaded {
            self.stats.record(StatsEvent::SourceEntries {
                source: source.name.clone(),
                entries: source.entry_count,
            });
        }

        reports
    }

    pub async fn sources(&self) -> Vec<Source> {
        self.loader.sources().await
    }

    pub fn stats(&self) -> ServiceStats {
        let snapshot = self.engine.snapshot();
        ServiceStats {
            counters: self.stats.snapshot(),
            servers: self.pool.health(),
            ready: snapshot.is_some(),
            blocklist_entries: snapshot.as_ref().map(|s| s.len()).unwrap_or(0),
            snapshot_built_at: snapshot.as_ref().map(|s| s.built_at()),
            cache_entries: self.cache.len(),
        }
    }

    /// Counters since the last call, for interval logging.
    pub fn take_stats(&self) -> StatsSnapshot {
        self.stats.snapshot_and_reset()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start periodic source refresh and cache sweeping.
    ///
    /// The tasks stop when the returned handle is dropped.
    pub fn spawn_background(self: &Arc<Self>) -> Background {
        let mut handles = Vec::new();

        if let Some(interval) = self.config.loader.refresh_interval() {
            handles.push(self.clone().spawn_refresh(interval));
        }
        let sweep = self.config.cache.sweep_interval();
        if !sweep.is_zero() {
            handles.push(self.cache.clone().spawn_sweeper(sweep));
        }

        Background { handles }
    }

    fn spawn_refresh(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reports = self.refresh().await;
                let failed = reports.iter().filter(|r| !r.is_ok()).count();
                info!(sources = reports.len(), failed, "periodic refresh finished");
            }
        })
    }
}

/// Handles to the service's background tasks.
pub struct Background {
    handles: Vec<JoinHandle<()>>,
}

impl Drop for Background {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
