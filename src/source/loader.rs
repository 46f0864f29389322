//! Source reload and merge.
//!
//! A reload fetches every enabled source concurrently, parses each one into
//! its own entry map, merges all maps by domain and match type (highest
//! priority wins, then the most recently updated source, then the source
//! name), builds a new snapshot off the async workers and publishes it with
//! one swap.
//!
//! Exact and suffix rules for one domain survive the merge side by side. The
//! one exception: a suffix exemption that outranks an exact block rule for
//! the same domain drops that block rule.
//!
//! Reloads hold the loader mutex for their whole duration, so only one runs
//! at a time. Readers never touch that mutex.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use futures::{StreamExt, stream};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::fetch::{Fetch, fetch_with_retry};
use super::parse::{EntryMap, parse};
use super::{ReloadReport, Source};
use crate::config::{LoaderConfig, SourceConfig};
use crate::error::SourceError;
use crate::filter::{Action, BlocklistEntry, MatchEngine, MatchType, Snapshot};

/// What the loader remembers about a source between reloads.
struct SourceState {
    config: SourceConfig,
    entries: EntryMap,
    digest: Option<[u8; 32]>,
    last_updated: Option<SystemTime>,
}

pub struct Loader {
    fetcher: Arc<dyn Fetch>,
    config: LoaderConfig,
    false_positive_rate: f64,
    state: Mutex<FxHashMap<String, SourceState>>,
}

impl Loader {
    pub fn new(fetcher: Arc<dyn Fetch>, config: LoaderConfig, false_positive_rate: f64) -> Self {
        Self {
            fetcher,
            config,
            false_positive_rate,
            state: Mutex::new(FxHashMap::default()),
        }
    }

    /// Reload `sources` and publish the merged snapshot to `engine`.
    ///
    /// A source that fails to fetch keeps the entries from its last good
    /// load and reports the error; other sources are unaffected.
    pub async fn reload(&self, sources: &[SourceConfig], engine: &MatchEngine) -> Vec<ReloadReport> {
        let mut state = self.state.lock().await;
        let started = Instant::now();

        let enabled: Vec<&SourceConfig> = sources.iter().filter(|s| s.enabled).collect();
        let fetched = self.fetch_all(&enabled).await;

        let mut reports = Vec::with_capacity(sources.len());
        let mut next: FxHashMap<String, SourceState> = FxHashMap::default();

        for (config, result) in enabled.into_iter().zip(fetched) {
            let previous = state.remove(&config.name);
            let (source_state, report) = refresh_source(config, previous, result);
            reports.push(report);
            next.insert(config.name.clone(), source_state);
        }

        // Disabled or removed sources drop all their entries.
        for (name, old) in state.drain() {
            reports.push(ReloadReport {
                removed: old.entries.len(),
                ..ReloadReport::new(&name)
            });
        }
        *state = next;

        let merged: Vec<BlocklistEntry> = merge(&state).into_iter().cloned().collect();
        let total = merged.len();
        let fpr = self.false_positive_rate;
        let snapshot = match tokio::task::spawn_blocking(move || Snapshot::build(&merged, fpr)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "snapshot build task failed, keeping current snapshot");
                return reports;
            }
        };

        info!(
            sources = state.len(),
            entries = total,
            exact = snapshot.exact_len(),
            suffix = snapshot.suffix_len(),
            bloom_bits = snapshot.bloom().size_bits(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "published blocklist snapshot"
        );
        engine.publish(snapshot);

        reports
    }

    /// Current view of every loaded source.
    pub async fn sources(&self) -> Vec<Source> {
        let state = self.state.lock().await;
        let mut sources: Vec<Source> = state
            .values()
            .map(|s| Source {
                name: s.config.name.clone(),
                origin: s.config.origin.clone(),
                format: s.config.format,
                enabled: s.config.enabled,
                priority: s.config.priority,
                category: s.config.category,
                subdomains: s.config.subdomains,
                last_updated: s.last_updated,
                entry_count: s.entries.len(),
            })
            .collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        sources
    }

    async fn fetch_all(&self, sources: &[&SourceConfig]) -> Vec<Result<String, SourceError>> {
        let retries = self.config.fetch_retries;
        let backoff = self.config.fetch_backoff();
        let jobs: Vec<(usize, String, String)> = sources
            .iter()
            .enumerate()
            .map(|(idx, s)| (idx, s.name.clone(), s.origin.clone()))
            .collect();

        let fetcher = self.fetcher.clone();
        let mut results: Vec<(usize, Result<String, SourceError>)> = stream::iter(jobs)
            .map(move |(idx, name, origin)| {
                let fetcher = fetcher.clone();
                async move {
                    let result =
                        fetch_with_retry(fetcher.as_ref(), &name, &origin, retries, backoff).await;
                    (idx, result)
                }
            })
            .buffer_unordered(self.config.fetch_concurrency.max(1))
            .collect()
            .await;

        results.sort_by_key(|(idx, _)| *idx);
        results.into_iter().map(|(_, result)| result).collect()
    }
}

/// Apply one fetch result to a source's previous state.
fn refresh_source(
    config: &SourceConfig,
    previous: Option<SourceState>,
    fetched: Result<String, SourceError>,
) -> (SourceState, ReloadReport) {
    let mut report = ReloadReport::new(&config.name);

    let content = match fetched {
        Ok(content) => content,
        Err(e) => {
            warn!(source = %config.name, error = %e, "source fetch failed, keeping previous entries");
            report.error = Some(e.to_string());
            let state = previous.unwrap_or_else(|| SourceState {
                config: config.clone(),
                entries: EntryMap::default(),
                digest: None,
                last_updated: None,
            });
            report.entries = state.entries.len();
            return (SourceState { config: config.clone(), ..state }, report);
        }
    };

    let digest: [u8; 32] = Sha256::digest(content.as_bytes()).into();

    let previous = match previous {
        Some(unchanged) if unchanged.digest == Some(digest) && unchanged.config == *config => {
            report.entries = unchanged.entries.len();
            return (unchanged, report);
        }
        other => other,
    };

    let now = SystemTime::now();
    let parsed = parse(&content, config, now);
    report.rejected = parsed.rejected;
    if parsed.rejected > 0 {
        warn!(source = %config.name, rejected = parsed.rejected, "dropped invalid entries");
    }

    let (old_entries, old_digest, old_updated) = match previous {
        Some(p) => (p.entries, p.digest, p.last_updated),
        None => (EntryMap::default(), None, None),
    };

    let mut entries = parsed.entries;
    for (key, entry) in entries.iter_mut() {
        match old_entries.get(key) {
            // Keep the original creation time for unchanged rules.
            Some(old) if old.same_rule(entry) => *entry = old.clone(),
            Some(_) => report.updated += 1,
            None => report.added += 1,
        }
    }
    report.removed = old_entries
        .keys()
        .filter(|key| !entries.contains_key(*key))
        .count();
    report.entries = entries.len();

    let last_updated = if old_digest == Some(digest) {
        old_updated
    } else {
        Some(now)
    };

    (
        SourceState {
            config: config.clone(),
            entries,
            digest: Some(digest),
            last_updated,
        },
        report,
    )
}

/// Pick one entry per domain and match type across all sources.
fn merge(sources: &FxHashMap<String, SourceState>) -> Vec<&BlocklistEntry> {
    let mut winners: FxHashMap<(&str, MatchType), (&BlocklistEntry, &SourceState)> =
        FxHashMap::default();

    for source in sources.values() {
        for entry in source.entries.values() {
            let key = (&*entry.domain, entry.match_type);
            let replace = winners
                .get(&key)
                .is_none_or(|(current, holder)| rank(entry, source) > rank(current, holder));
            if replace {
                winners.insert(key, (entry, source));
            }
        }
    }

    let shadowed = |entry: &BlocklistEntry, source: &SourceState| {
        entry.match_type == MatchType::Exact
            && entry.action == Action::Block
            && winners
                .get(&(&*entry.domain, MatchType::Suffix))
                .is_some_and(|(allow, holder)| {
                    allow.action == Action::Allow && rank(allow, holder) > rank(entry, source)
                })
    };

    winners
        .values()
        .filter(|(entry, source)| !shadowed(*entry, *source))
        .map(|(entry, _)| *entry)
        .collect()
}

/// Higher ranks win: priority, then recency, then the lexicographically smaller name.
fn rank<'a>(
    entry: &BlocklistEntry,
    source: &'a SourceState,
) -> (i32, Option<SystemTime>, Reverse<&'a str>) {
    (
        entry.priority,
        source.last_updated,
        Reverse(source.config.name.as_str()),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::SourceFormat;
    use crate::filter::{Category, MatchedBy};

    /// In-memory origins; a missing origin fails like an unreachable server.
    #[derive(Default)]
    struct MemoryFetcher {
        content: StdMutex<HashMap<String, String>>,
    }

    impl MemoryFetcher {
        fn set(&self, origin: &str, content: &str) {
            self.content
                .lock()
                .unwrap()
                .insert(origin.to_string(), content.to_string());
        }

        fn remove(&self, origin: &str) {
            self.content.lock().unwrap().remove(origin);
        }
    }

    #[async_trait]
    impl Fetch for MemoryFetcher {
        async fn fetch(&self, origin: &str) -> Result<String, SourceError> {
            self.content
                .lock()
                .unwrap()
                .get(origin)
                .cloned()
                .ok_or(SourceError::Status(404))
        }
    }

    fn source(name: &str, format: SourceFormat, priority: i32) -> SourceConfig {
        SourceConfig {
            name: name.to_string(),
            origin: format!("mem://{name}"),
            format,
            priority,
            enabled: true,
            category: Category::Ads,
            subdomains: false,
        }
    }

    fn loader(fetcher: Arc<MemoryFetcher>) -> Loader {
        let config = LoaderConfig {
            fetch_retries: 0,
            ..LoaderConfig::default()
        };
        Loader::new(fetcher, config, 0.001)
    }

    fn report<'a>(reports: &'a [ReloadReport], name: &str) -> &'a ReloadReport {
        reports.iter().find(|r| r.source == name).unwrap()
    }

    #[tokio::test]
    async fn higher_priority_exemption_wins() {
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.set("mem://a", "0.0.0.0 ads.example.com\n0.0.0.0 other.example.com\n");
        fetcher.set("mem://b", "@@||ads.example.com^\n");
        let sources = [
            source("a", SourceFormat::Hosts, 1),
            source("b", SourceFormat::FilterList, 2),
        ];
        let engine = MatchEngine::new();

        loader(fetcher).reload(&sources, &engine).await;

        assert!(!engine.check("ads.example.com").blocked);
        assert!(engine.check("other.example.com").blocked);
    }

    #[tokio::test]
    async fn lower_priority_cannot_override() {
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.set("mem://a", "0.0.0.0 ads.example.com\n");
        fetcher.set("mem://b", "@@||ads.example.com^\n");
        let sources = [
            source("a", SourceFormat::Hosts, 5),
            source("b", SourceFormat::FilterList, 2),
        ];
        let engine = MatchEngine::new();

        loader(fetcher).reload(&sources, &engine).await;

        let result = engine.check("ads.example.com");
        assert!(result.blocked);
        assert_eq!(result.matched_by, MatchedBy::Exact);
    }

    #[tokio::test]
    async fn equal_priority_prefers_recently_updated() {
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.set("mem://a", "ads.example.com\n");
        fetcher.set("mem://b", "tracker.example.com\n");
        let sources = [
            source("a", SourceFormat::PlainDomains, 1),
            source("b", SourceFormat::FilterList, 1),
        ];
        let engine = MatchEngine::new();
        let loader = loader(fetcher.clone());
        loader.reload(&sources, &engine).await;

        // Only b changes, so b becomes the most recently updated source.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        fetcher.set("mem://b", "@@||ads.example.com^\n");
        loader.reload(&sources, &engine).await;

        assert!(!engine.check("ads.example.com").blocked);
    }

    #[tokio::test]
    async fn exact_and_suffix_blocks_both_apply() {
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.set("mem://hosts", "0.0.0.0 ads.example.com\n");
        fetcher.set("mem://rules", "||ads.example.com^\n");
        fetcher.set("mem://plain", "ads.example.org\n*.ads.example.org\n");
        let sources = [
            source("hosts", SourceFormat::Hosts, 2),
            source("rules", SourceFormat::FilterList, 1),
            source("plain", SourceFormat::PlainDomains, 0),
        ];
        let engine = MatchEngine::new();

        let reports = loader(fetcher).reload(&sources, &engine).await;

        assert_eq!(report(&reports, "plain").entries, 2);
        let exact = engine.check("ads.example.com");
        assert!(exact.blocked);
        assert_eq!(exact.matched_by, MatchedBy::Exact);
        let sub = engine.check("x.ads.example.com");
        assert!(sub.blocked);
        assert_eq!(sub.matched_by, MatchedBy::Trie);
        assert!(engine.check("ads.example.org").blocked);
        assert!(engine.check("x.ads.example.org").blocked);
    }

    #[tokio::test]
    async fn suffix_rule_blocks_subdomains() {
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.set("mem://rules", "||example.com^\n");
        let engine = MatchEngine::new();

        loader(fetcher)
            .reload(&[source("rules", SourceFormat::FilterList, 0)], &engine)
            .await;

        let result = engine.check("sub.example.com");
        assert!(result.blocked);
        assert_eq!(result.matched_by, MatchedBy::Trie);
    }

    #[tokio::test]
    async fn reload_unchanged_is_idempotent() {
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.set("mem://a", "0.0.0.0 ads.example.com\n0.0.0.0 t.example.net\n");
        fetcher.set("mem://b", "||metrics.example.io^\n@@||ok.example.io^\n");
        let sources = [
            source("a", SourceFormat::Hosts, 1),
            source("b", SourceFormat::FilterList, 2),
        ];
        let engine = MatchEngine::new();
        let loader = loader(fetcher);

        let first = loader.reload(&sources, &engine).await;
        let before = engine.snapshot().unwrap();
        let second = loader.reload(&sources, &engine).await;
        let after = engine.snapshot().unwrap();

        assert_eq!(report(&first, "a").added, 2);
        assert_eq!(report(&first, "b").added, 2);
        for r in &second {
            assert_eq!((r.added, r.removed, r.updated), (0, 0, 0), "churn in {}", r.source);
            assert!(r.error.is_none());
        }
        assert_eq!(before.fingerprint(), after.fingerprint());
        assert_eq!(before.len(), after.len());
    }

    #[tokio::test]
    async fn reports_churn() {
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.set("mem://a", "||keep.com^\n||drop.com^\n||flip.com^\n");
        let sources = [source("a", SourceFormat::FilterList, 0)];
        let engine = MatchEngine::new();
        let loader = loader(fetcher.clone());
        loader.reload(&sources, &engine).await;

        fetcher.set("mem://a", "||keep.com^\n@@||flip.com^\n||new.com^\n||new2.com^\n");
        let reports = loader.reload(&sources, &engine).await;

        let r = report(&reports, "a");
        assert_eq!((r.added, r.removed, r.updated), (2, 1, 1));
        assert_eq!(r.entries, 4);
        assert!(!engine.check("drop.com").blocked);
        assert!(engine.check("new.com").blocked);
    }

    #[tokio::test]
    async fn failed_source_is_isolated() {
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.set("mem://a", "0.0.0.0 ads.example.com\n");
        fetcher.set("mem://b", "||tracker.example.net^\n");
        let sources = [
            source("a", SourceFormat::Hosts, 1),
            source("b", SourceFormat::FilterList, 1),
        ];
        let engine = MatchEngine::new();
        let loader = loader(fetcher.clone());
        loader.reload(&sources, &engine).await;

        fetcher.remove("mem://b");
        fetcher.set("mem://a", "0.0.0.0 ads.example.com\n0.0.0.0 more.example.com\n");
        let reports = loader.reload(&sources, &engine).await;

        assert!(report(&reports, "b").error.is_some());
        assert_eq!(report(&reports, "b").entries, 1);
        assert!(report(&reports, "a").error.is_none());
        assert_eq!(report(&reports, "a").added, 1);
        // b's last good entries are still served.
        assert!(engine.check("x.tracker.example.net").blocked);
        assert!(engine.check("more.example.com").blocked);
    }

    #[tokio::test]
    async fn first_load_failure_still_publishes_others() {
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.set("mem://a", "0.0.0.0 ads.example.com\n");
        let sources = [
            source("a", SourceFormat::Hosts, 1),
            source("missing", SourceFormat::Hosts, 1),
        ];
        let engine = MatchEngine::new();

        let reports = loader(fetcher).reload(&sources, &engine).await;

        assert!(engine.is_ready());
        assert!(engine.check("ads.example.com").blocked);
        assert!(report(&reports, "missing").error.is_some());
    }

    #[tokio::test]
    async fn disabling_source_removes_entries() {
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.set("mem://a", "0.0.0.0 ads.example.com\n0.0.0.0 b.example.com\n");
        let mut sources = [source("a", SourceFormat::Hosts, 1)];
        let engine = MatchEngine::new();
        let loader = loader(fetcher);
        loader.reload(&sources, &engine).await;

        sources[0].enabled = false;
        let reports = loader.reload(&sources, &engine).await;

        assert_eq!(report(&reports, "a").removed, 2);
        assert!(!engine.check("ads.example.com").blocked);
        assert!(loader.sources().await.is_empty());
    }

    #[tokio::test]
    async fn rejected_entries_are_counted_per_source() {
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.set("mem://a", "ok.example.com\nbad..example.com\n");
        fetcher.set("mem://b", "fine.example.com\n");
        let sources = [
            source("a", SourceFormat::PlainDomains, 1),
            source("b", SourceFormat::PlainDomains, 1),
        ];
        let engine = MatchEngine::new();

        let reports = loader(fetcher).reload(&sources, &engine).await;

        assert_eq!(report(&reports, "a").rejected, 1);
        assert_eq!(report(&reports, "a").entries, 1);
        assert_eq!(report(&reports, "b").rejected, 0);
    }

    #[tokio::test]
    async fn merged_result_matches_linear_scan() {
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.set(
            "mem://hosts",
            "0.0.0.0 ads.example.com\n0.0.0.0 cdn.example.org\n0.0.0.0 pixel.shop.net\n",
        );
        fetcher.set(
            "mem://rules",
            "||example.org^\n@@||cdn.example.org^\n||shop.net^\n@@||safe.shop.net^\n",
        );
        fetcher.set(
            "mem://plain",
            "*.tracking.io\nexample.com\nsafe.shop.net\n*.ads.example.com\n",
        );
        let sources = [
            source("hosts", SourceFormat::Hosts, 1),
            source("rules", SourceFormat::FilterList, 2),
            source("plain", SourceFormat::PlainDomains, 0),
        ];
        let engine = MatchEngine::new();
        let loader = loader(fetcher);
        loader.reload(&sources, &engine).await;

        let state = loader.state.lock().await;
        let merged = merge(&state);
        let naive = |domain: &str| -> bool {
            if let Some(e) = merged
                .iter()
                .find(|e| e.match_type == crate::filter::MatchType::Exact && &*e.domain == domain)
            {
                return e.action == crate::filter::Action::Block;
            }
            merged
                .iter()
                .filter(|e| e.match_type == crate::filter::MatchType::Suffix)
                .filter(|e| domain == &*e.domain || domain.ends_with(&format!(".{}", e.domain)))
                .max_by_key(|e| e.domain.len())
                .is_some_and(|e| e.action == crate::filter::Action::Block)
        };

        for domain in [
            "ads.example.com",
            "x.ads.example.com",
            "deep.x.ads.example.com",
            "example.com",
            "www.example.com",
            "example.org",
            "cdn.example.org",
            "img.cdn.example.org",
            "pixel.shop.net",
            "safe.shop.net",
            "a.safe.shop.net",
            "shop.net",
            "tracking.io",
            "a.tracking.io",
            "unrelated.dev",
        ] {
            assert_eq!(engine.check(domain).blocked, naive(domain), "mismatch for {domain}");
        }
    }
}
