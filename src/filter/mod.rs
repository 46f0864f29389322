//! Domain matching.
//!
//! The engine holds the current [`Snapshot`] behind an atomic pointer.
//! Readers load it without locking; the loader publishes a fully built
//! replacement with a single swap, so a reader sees either the old or the
//! new snapshot and never a partial one. Old snapshots are freed when the
//! last in-flight reader drops its `Arc`.

mod blocklist;
pub mod bloom;
mod exact;
pub mod rule;
pub mod trie;

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::dns::normalize_name;

pub use blocklist::{CheckResult, MatchedBy, Snapshot};
pub use rule::{Action, BlocklistEntry, Category, MatchType, Rule};

#[derive(Default)]
pub struct MatchEngine {
    current: ArcSwapOption<Snapshot>,
}

impl MatchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `domain` is blocked.
    ///
    /// Never fails. Before the first publish the result is not blocked and
    /// `ready` is false. The query type does not influence blocking.
    pub fn check(&self, domain: &str) -> CheckResult {
        let guard = self.current.load();
        let Some(snapshot) = guard.as_deref() else {
            return CheckResult::NOT_READY;
        };

        match normalize_name(domain) {
            Ok(domain) => snapshot.check(&domain),
            Err(_) => CheckResult {
                ready: true,
                ..CheckResult::NOT_READY
            },
        }
    }

    /// Publish `snapshot` for all future reads, returning the previous one.
    pub fn publish(&self, snapshot: Snapshot) -> Option<Arc<Snapshot>> {
        self.current.swap(Some(Arc::new(snapshot)))
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.current.load_full()
    }

    pub fn is_ready(&self) -> bool {
        self.current.load().is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    fn entry(domain: &str, match_type: MatchType, action: Action, priority: i32) -> BlocklistEntry {
        BlocklistEntry {
            domain: domain.into(),
            match_type,
            action,
            category: Category::Tracking,
            source: Arc::from("unit"),
            priority,
            created_at: SystemTime::now(),
        }
    }

    /// Linear scan: exact entry first, then the longest suffix entry.
    fn naive_check(entries: &[BlocklistEntry], domain: &str) -> (bool, MatchedBy) {
        if let Some(e) = entries
            .iter()
            .find(|e| e.match_type == MatchType::Exact && &*e.domain == domain)
        {
            return (e.action == Action::Block, MatchedBy::Exact);
        }

        entries
            .iter()
            .filter(|e| e.match_type == MatchType::Suffix)
            .filter(|e| {
                domain == &*e.domain || domain.ends_with(&format!(".{}", e.domain))
            })
            .max_by_key(|e| e.domain.len())
            .map(|e| (e.action == Action::Block, MatchedBy::Trie))
            .unwrap_or((false, MatchedBy::None))
    }

    #[test]
    fn not_ready_before_publish() {
        let engine = MatchEngine::new();

        let result = engine.check("ads.example.com");
        assert!(!result.ready);
        assert!(!result.blocked);
        assert!(!engine.is_ready());
    }

    #[test]
    fn check_normalizes_input() {
        let engine = MatchEngine::new();
        engine.publish(Snapshot::build(
            &[entry("doubleclick.com", MatchType::Suffix, Action::Block, 0)],
            0.01,
        ));

        assert!(engine.check("DOUBLECLICK.COM.").blocked);
        assert!(engine.check("ADS.doubleclick.com").blocked);

        let malformed = engine.check("bad..doubleclick.com");
        assert!(malformed.ready);
        assert!(!malformed.blocked);
    }

    #[test]
    fn publish_replaces_snapshot_atomically() {
        let engine = MatchEngine::new();
        engine.publish(Snapshot::build(
            &[entry("old.com", MatchType::Exact, Action::Block, 0)],
            0.01,
        ));
        let held = engine.snapshot().unwrap();

        let previous = engine.publish(Snapshot::build(
            &[entry("new.com", MatchType::Exact, Action::Block, 0)],
            0.01,
        ));

        assert!(previous.is_some());
        assert!(held.is_blocked("old.com"));
        assert!(!engine.check("old.com").blocked);
        assert!(engine.check("new.com").blocked);
    }

    #[test]
    fn matches_naive_scan() {
        let entries = vec![
            entry("example.com", MatchType::Suffix, Action::Block, 1),
            entry("ads.example.com", MatchType::Exact, Action::Allow, 1),
            entry("cdn.example.com", MatchType::Suffix, Action::Allow, 1),
            entry("bad.cdn.example.com", MatchType::Suffix, Action::Block, 1),
            entry("tracker.net", MatchType::Exact, Action::Block, 1),
            entry("metrics.io", MatchType::Suffix, Action::Block, 1),
            entry("a.metrics.io", MatchType::Exact, Action::Allow, 1),
            entry("org", MatchType::Suffix, Action::Block, 1),
        ];
        let engine = MatchEngine::new();
        engine.publish(Snapshot::build(&entries, 0.01));

        let corpus = [
            "example.com",
            "www.example.com",
            "ads.example.com",
            "x.ads.example.com",
            "cdn.example.com",
            "img.cdn.example.com",
            "bad.cdn.example.com",
            "x.bad.cdn.example.com",
            "tracker.net",
            "sub.tracker.net",
            "metrics.io",
            "a.metrics.io",
            "b.a.metrics.io",
            "wikipedia.org",
            "example.net",
            "com",
            "notexample.com",
        ];

        for domain in corpus {
            let result = engine.check(domain);
            assert_eq!(
                (result.blocked, result.matched_by),
                naive_check(&entries, domain),
                "mismatch for {domain}"
            );
        }
    }
}
