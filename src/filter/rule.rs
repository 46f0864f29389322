//! Blocklist rule types shared by the loader and the matcher.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// What a blocked domain is blocked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Ads,
    Tracking,
    Malware,
    Custom,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Ads => "ads",
            Category::Tracking => "tracking",
            Category::Malware => "malware",
            Category::Custom => "custom",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a rule covers only the domain itself or the domain and everything below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    Exact,
    Suffix,
}

/// Whether a matching rule blocks the domain or exempts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Block,
    Allow,
}

/// The verdict-carrying part of an entry, stored in the snapshot structures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub action: Action,
    pub category: Category,
    pub priority: i32,
    pub source: Arc<str>,
}

impl Rule {
    pub fn blocks(&self) -> bool {
        self.action == Action::Block
    }
}

/// One parsed and normalized blocklist line.
///
/// `domain` is lowercase without a trailing dot. Unique per (source, domain).
#[derive(Debug, Clone)]
pub struct BlocklistEntry {
    pub domain: Box<str>,
    pub match_type: MatchType,
    pub action: Action,
    pub category: Category,
    pub source: Arc<str>,
    pub priority: i32,
    pub created_at: SystemTime,
}

impl BlocklistEntry {
    pub fn rule(&self) -> Rule {
        Rule {
            action: self.action,
            category: self.category,
            priority: self.priority,
            source: self.source.clone(),
        }
    }

    /// Same rule content, ignoring when it was created.
    pub fn same_rule(&self, other: &BlocklistEntry) -> bool {
        self.domain == other.domain
            && self.match_type == other.match_type
            && self.action == other.action
            && self.category == other.category
            && self.priority == other.priority
            && self.source == other.source
    }

    /// Labels from the top-level label inward: `a.b.com` yields `com`, `b`, `a`.
    pub fn reversed_labels(&self) -> impl Iterator<Item = &str> {
        self.domain.rsplit('.')
    }
}
