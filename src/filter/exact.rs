//! Exact-match table.

use rustc_hash::FxHashMap;

use super::rule::Rule;

#[derive(Default)]
pub struct ExactTable {
    rules: FxHashMap<Box<str>, Rule>,
}

impl ExactTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rules: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
        }
    }

    pub fn insert(&mut self, domain: &str, rule: Rule) {
        self.rules.insert(domain.into(), rule);
    }

    #[inline]
    pub fn get(&self, domain: &str) -> Option<&Rule> {
        self.rules.get(domain)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
