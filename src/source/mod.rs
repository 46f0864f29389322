//! Blocklist sources: fetching, parsing and merging into snapshots.

mod fetch;
mod loader;
pub mod parse;

use std::time::SystemTime;

use crate::config::SourceFormat;
use crate::filter::Category;

pub use fetch::{Fetch, HttpFetcher, fetch_with_retry};
pub use loader::Loader;

/// A configured source as last loaded.
#[derive(Debug, Clone)]
pub struct Source {
    pub name: String,
    pub origin: String,
    pub format: SourceFormat,
    pub enabled: bool,
    pub priority: i32,
    pub category: Category,
    pub subdomains: bool,
    /// When the fetched content last changed.
    pub last_updated: Option<SystemTime>,
    pub entry_count: usize,
}

/// Outcome of reloading one source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub source: String,
    pub added: usize,
    pub removed: usize,
    /// Domains whose rule changed.
    pub updated: usize,
    /// Lines dropped by validation.
    pub rejected: usize,
    /// Entries held for this source after the reload.
    pub entries: usize,
    pub error: Option<String>,
}

impl ReloadReport {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
