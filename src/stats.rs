//! Aggregate counters.
//!
//! Events are plain counts, durations, source names and breaker states.
//! There is no event that can carry a queried domain, a client or a payload.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::filter::Category;
use crate::pool::BreakerState;

/// Pipeline stage whose latency is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Check,
    Cache,
    Upstream,
}

#[derive(Debug, Clone)]
pub enum StatsEvent {
    Lookup,
    Blocked(Category),
    CacheHit,
    CacheMiss,
    CacheEviction,
    UpstreamError,
    Latency(Stage, Duration),
    /// Entries currently held for a source, after a reload.
    SourceEntries { source: String, entries: usize },
    /// A breaker moved into the given state.
    BreakerTransition(BreakerState),
}

#[derive(Default)]
struct StageTimer {
    count: AtomicU64,
    total_us: AtomicU64,
}

impl StageTimer {
    fn record(&self, elapsed: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn read(&self, reset: bool) -> StageLatency {
        let (count, total_us) = if reset {
            (
                self.count.swap(0, Ordering::Relaxed),
                self.total_us.swap(0, Ordering::Relaxed),
            )
        } else {
            (
                self.count.load(Ordering::Relaxed),
                self.total_us.load(Ordering::Relaxed),
            )
        };
        StageLatency { count, total_us }
    }
}

/// Atomic statistics shared by every component.
#[derive(Default)]
pub struct Stats {
    lookups: AtomicU64,
    blocked: AtomicU64,
    blocked_by_category: [AtomicU64; 4],
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
    upstream_errors: AtomicU64,
    check: StageTimer,
    cache: StageTimer,
    upstream: StageTimer,
    opened: AtomicU64,
    half_opened: AtomicU64,
    closed: AtomicU64,
    sources: Mutex<FxHashMap<String, usize>>,
}

fn category_index(category: Category) -> usize {
    match category {
        Category::Ads => 0,
        Category::Tracking => 1,
        Category::Malware => 2,
        Category::Custom => 3,
    }
}

const CATEGORIES: [Category; 4] = [
    Category::Ads,
    Category::Tracking,
    Category::Malware,
    Category::Custom,
];

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: StatsEvent) {
        match event {
            StatsEvent::Lookup => {
                self.lookups.fetch_add(1, Ordering::Relaxed);
            }
            StatsEvent::Blocked(category) => {
                self.blocked.fetch_add(1, Ordering::Relaxed);
                self.blocked_by_category[category_index(category)].fetch_add(1, Ordering::Relaxed);
            }
            StatsEvent::CacheHit => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
            }
            StatsEvent::CacheMiss => {
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
            }
            StatsEvent::CacheEviction => {
                self.cache_evictions.fetch_add(1, Ordering::Relaxed);
            }
            StatsEvent::UpstreamError => {
                self.upstream_errors.fetch_add(1, Ordering::Relaxed);
            }
            StatsEvent::Latency(stage, elapsed) => match stage {
                Stage::Check => self.check.record(elapsed),
                Stage::Cache => self.cache.record(elapsed),
                Stage::Upstream => self.upstream.record(elapsed),
            },
            StatsEvent::SourceEntries { source, entries } => {
                let Ok(mut sources) = self.sources.lock() else {
                    return;
                };
                sources.insert(source, entries);
            }
            StatsEvent::BreakerTransition(state) => {
                let counter = match state {
                    BreakerState::Open => &self.opened,
                    BreakerState::HalfOpen => &self.half_opened,
                    BreakerState::Closed => &self.closed,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Forget sources that are no longer loaded.
    pub fn retain_sources(&self, keep: impl Fn(&str) -> bool) {
        if let Ok(mut sources) = self.sources.lock() {
            sources.retain(|name, _| keep(name));
        }
    }

    /// Current totals.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.read(false)
    }

    /// Totals since the previous reset. Source entry counts are gauges and
    /// are not reset.
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        self.read(true)
    }

    fn read(&self, reset: bool) -> StatsSnapshot {
        let take = |counter: &AtomicU64| {
            if reset {
                counter.swap(0, Ordering::Relaxed)
            } else {
                counter.load(Ordering::Relaxed)
            }
        };

        let mut sources: Vec<(String, usize)> = self
            .sources
            .lock()
            .map(|s| s.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        sources.sort();

        StatsSnapshot {
            lookups: take(&self.lookups),
            blocked: take(&self.blocked),
            blocked_by_category: CATEGORIES
                .iter()
                .map(|&c| (c, take(&self.blocked_by_category[category_index(c)])))
                .collect(),
            cache_hits: take(&self.cache_hits),
            cache_misses: take(&self.cache_misses),
            cache_evictions: take(&self.cache_evictions),
            upstream_errors: take(&self.upstream_errors),
            check: self.check.read(reset),
            cache: self.cache.read(reset),
            upstream: self.upstream.read(reset),
            breaker_opened: take(&self.opened),
            breaker_half_opened: take(&self.half_opened),
            breaker_closed: take(&self.closed),
            sources,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageLatency {
    pub count: u64,
    pub total_us: u64,
}

impl StageLatency {
    pub fn avg_ms(&self) -> f64 {
        if self.count > 0 {
            (self.total_us as f64 / self.count as f64) / 1000.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub lookups: u64,
    pub blocked: u64,
    pub blocked_by_category: Vec<(Category, u64)>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub upstream_errors: u64,
    pub check: StageLatency,
    pub cache: StageLatency,
    pub upstream: StageLatency,
    pub breaker_opened: u64,
    pub breaker_half_opened: u64,
    pub breaker_closed: u64,
    /// Entry count per loaded source, sorted by name.
    pub sources: Vec<(String, usize)>,
}

impl StatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total > 0 {
            self.cache_hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_events() {
        let stats = Stats::new();
        stats.record(StatsEvent::Lookup);
        stats.record(StatsEvent::Lookup);
        stats.record(StatsEvent::Blocked(Category::Malware));
        stats.record(StatsEvent::CacheHit);
        stats.record(StatsEvent::CacheMiss);
        stats.record(StatsEvent::CacheMiss);
        stats.record(StatsEvent::Latency(Stage::Check, Duration::from_micros(40)));
        stats.record(StatsEvent::Latency(Stage::Check, Duration::from_micros(60)));
        stats.record(StatsEvent::BreakerTransition(BreakerState::Open));

        let snap = stats.snapshot();
        assert_eq!(snap.lookups, 2);
        assert_eq!(snap.blocked, 1);
        assert!(snap.blocked_by_category.contains(&(Category::Malware, 1)));
        assert!(snap.blocked_by_category.contains(&(Category::Ads, 0)));
        assert_eq!(snap.check, StageLatency { count: 2, total_us: 100 });
        assert!((snap.check.avg_ms() - 0.05).abs() < 1e-9);
        assert!((snap.hit_rate() - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(snap.breaker_opened, 1);
    }

    #[test]
    fn reset_clears_counters_but_keeps_sources() {
        let stats = Stats::new();
        stats.record(StatsEvent::Lookup);
        stats.record(StatsEvent::SourceEntries {
            source: "ads".into(),
            entries: 42,
        });

        let first = stats.snapshot_and_reset();
        assert_eq!(first.lookups, 1);

        let second = stats.snapshot();
        assert_eq!(second.lookups, 0);
        assert_eq!(second.sources, vec![("ads".to_string(), 42)]);
    }

    #[test]
    fn retain_sources_drops_removed() {
        let stats = Stats::new();
        for name in ["a", "b"] {
            stats.record(StatsEvent::SourceEntries {
                source: name.into(),
                entries: 1,
            });
        }

        stats.retain_sources(|name| name == "b");

        assert_eq!(stats.snapshot().sources, vec![("b".to_string(), 1)]);
    }
}
