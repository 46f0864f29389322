//! Suffix trie keyed on reversed domain labels.
//!
//! `a.b.com` is stored along the path `com -> b -> a`. A lookup walks the
//! query's labels from the top-level label inward and remembers the deepest
//! terminal node it passes, so `x.a.b.com` resolves to the rule on `a.b.com`
//! even when `b.com` carries a rule as well.

use rustc_hash::FxHashMap;

use super::rule::Rule;

const ROOT: usize = 0;

#[derive(Default)]
struct Node {
    children: FxHashMap<Box<str>, u32>,
    terminal: Option<Rule>,
}

pub struct SuffixTrie {
    nodes: Vec<Node>,
    terminals: usize,
}

impl SuffixTrie {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
            terminals: 0,
        }
    }

    /// Mark `labels` (top-level label first) as terminal with `rule`.
    ///
    /// Re-inserting the same path replaces the rule.
    pub fn insert<'a>(&mut self, labels: impl IntoIterator<Item = &'a str>, rule: Rule) {
        let mut node = ROOT;
        for label in labels {
            node = match self.nodes[node].children.get(label) {
                Some(&child) => child as usize,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(Node::default());
                    self.nodes[node].children.insert(label.into(), child as u32);
                    child
                }
            };
        }

        if self.nodes[node].terminal.replace(rule).is_none() {
            self.terminals += 1;
        }
    }

    /// Deepest terminal rule on the path of `domain`, if any.
    pub fn longest_match(&self, domain: &str) -> Option<&Rule> {
        let mut node = ROOT;
        let mut found = None;

        for label in domain.rsplit('.') {
            match self.nodes[node].children.get(label) {
                Some(&child) => node = child as usize,
                None => break,
            }
            if let Some(rule) = &self.nodes[node].terminal {
                found = Some(rule);
            }
        }

        found
    }

    /// Number of terminal rules.
    pub fn len(&self) -> usize {
        self.terminals
    }

    pub fn is_empty(&self) -> bool {
        self.terminals == 0
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for SuffixTrie {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::filter::rule::{Action, Category};

    fn rule(action: Action, category: Category) -> Rule {
        Rule {
            action,
            category,
            priority: 0,
            source: Arc::from("test"),
        }
    }

    fn trie(entries: &[(&str, Action, Category)]) -> SuffixTrie {
        let mut trie = SuffixTrie::new();
        for (domain, action, category) in entries {
            trie.insert(domain.rsplit('.'), rule(*action, *category));
        }
        trie
    }

    #[test]
    fn matches_domain_and_descendants() {
        let trie = trie(&[("example.com", Action::Block, Category::Ads)]);

        assert!(trie.longest_match("example.com").is_some());
        assert!(trie.longest_match("sub.example.com").is_some());
        assert!(trie.longest_match("a.b.example.com").is_some());
    }

    #[test]
    fn does_not_match_siblings_or_partial_labels() {
        let trie = trie(&[("example.com", Action::Block, Category::Ads)]);

        assert!(trie.longest_match("com").is_none());
        assert!(trie.longest_match("badexample.com").is_none());
        assert!(trie.longest_match("example.org").is_none());
        assert!(trie.longest_match("").is_none());
    }

    #[test]
    fn deepest_terminal_wins() {
        let trie = trie(&[
            ("example.com", Action::Block, Category::Ads),
            ("cdn.example.com", Action::Allow, Category::Custom),
            ("evil.cdn.example.com", Action::Block, Category::Malware),
        ]);

        let hit = trie.longest_match("x.example.com").unwrap();
        assert_eq!(hit.category, Category::Ads);

        let hit = trie.longest_match("img.cdn.example.com").unwrap();
        assert_eq!(hit.action, Action::Allow);

        let hit = trie.longest_match("a.evil.cdn.example.com").unwrap();
        assert_eq!(hit.category, Category::Malware);
    }

    #[test]
    fn reinsert_replaces_rule() {
        let mut trie = trie(&[("ads.net", Action::Block, Category::Ads)]);
        trie.insert("ads.net".rsplit('.'), rule(Action::Block, Category::Tracking));

        assert_eq!(trie.len(), 1);
        assert_eq!(trie.longest_match("ads.net").unwrap().category, Category::Tracking);
    }
}
