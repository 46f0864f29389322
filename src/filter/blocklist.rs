//! Immutable blocklist snapshot.
//!
//! A snapshot bundles the Bloom filter, the exact-match table and the suffix
//! trie built from one merged entry set. It is never mutated after `build`;
//! reloads build a new one and swap it in.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::SystemTime;

use super::bloom::BloomFilter;
use super::exact::ExactTable;
use super::rule::{BlocklistEntry, Category, MatchType, Rule};
use super::trie::SuffixTrie;

/// Which structure produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    Exact,
    Trie,
    None,
}

/// Verdict for one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub blocked: bool,
    pub category: Option<Category>,
    pub matched_by: MatchedBy,
    /// `false` until the first snapshot has been published.
    pub ready: bool,
}

impl CheckResult {
    pub const NOT_READY: CheckResult = CheckResult {
        blocked: false,
        category: None,
        matched_by: MatchedBy::None,
        ready: false,
    };

    const NO_MATCH: CheckResult = CheckResult {
        blocked: false,
        category: None,
        matched_by: MatchedBy::None,
        ready: true,
    };

    fn from_rule(rule: &Rule, matched_by: MatchedBy) -> Self {
        Self {
            blocked: rule.blocks(),
            category: Some(rule.category),
            matched_by,
            ready: true,
        }
    }
}

pub struct Snapshot {
    bloom: BloomFilter,
    exact: ExactTable,
    trie: SuffixTrie,
    built_at: SystemTime,
    total_entries: usize,
    fingerprint: u64,
}

impl Snapshot {
    /// Build a snapshot from merged entries (at most one per domain).
    pub fn build<'a, I>(entries: I, false_positive_rate: f64) -> Self
    where
        I: IntoIterator<Item = &'a BlocklistEntry>,
        I::IntoIter: ExactSizeIterator,
    {
        let entries = entries.into_iter();
        let total_entries = entries.len();

        let mut bloom = BloomFilter::with_rate(total_entries, false_positive_rate);
        let mut exact = ExactTable::with_capacity(total_entries);
        let mut trie = SuffixTrie::new();
        let mut fingerprint = 0u64;

        for entry in entries {
            bloom.insert(&entry.domain);
            let rule = entry.rule();
            fingerprint = fingerprint.wrapping_add(entry_hash(entry, &rule));
            match entry.match_type {
                MatchType::Exact => exact.insert(&entry.domain, rule),
                MatchType::Suffix => trie.insert(entry.reversed_labels(), rule),
            }
        }

        Self {
            bloom,
            exact,
            trie,
            built_at: SystemTime::now(),
            total_entries,
            fingerprint,
        }
    }

    /// Check a normalized domain.
    ///
    /// Bloom fast path over the domain and its parents, then the exact
    /// table, then the deepest terminal in the trie.
    pub fn check(&self, domain: &str) -> CheckResult {
        if !suffixes(domain).any(|s| self.bloom.contains(s)) {
            return CheckResult::NO_MATCH;
        }

        if let Some(rule) = self.exact.get(domain) {
            return CheckResult::from_rule(rule, MatchedBy::Exact);
        }

        match self.trie.longest_match(domain) {
            Some(rule) => CheckResult::from_rule(rule, MatchedBy::Trie),
            None => CheckResult::NO_MATCH,
        }
    }

    /// Whether the domain is blocked.
    pub fn is_blocked(&self, domain: &str) -> bool {
        self.check(domain).blocked
    }

    pub fn len(&self) -> usize {
        self.total_entries
    }

    pub fn is_empty(&self) -> bool {
        self.total_entries == 0
    }

    pub fn exact_len(&self) -> usize {
        self.exact.len()
    }

    pub fn suffix_len(&self) -> usize {
        self.trie.len()
    }

    pub fn built_at(&self) -> SystemTime {
        self.built_at
    }

    pub fn bloom(&self) -> &BloomFilter {
        &self.bloom
    }

    /// Order-independent digest of the rule content, for comparing snapshots
    /// built from the same entries.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

fn entry_hash(entry: &BlocklistEntry, rule: &Rule) -> u64 {
    let mut hasher = DefaultHasher::new();
    entry.domain.hash(&mut hasher);
    entry.match_type.hash(&mut hasher);
    rule.hash(&mut hasher);
    hasher.finish()
}

/// `a.b.com`, `b.com`, `com`.
fn suffixes(domain: &str) -> impl Iterator<Item = &str> {
    std::iter::once(domain).chain(
        domain
            .match_indices('.')
            .map(move |(pos, _)| &domain[pos + 1..]),
    )
}
