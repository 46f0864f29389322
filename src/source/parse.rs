//! Blocklist parsers.
//!
//! Handles the three supported formats:
//!
//! ```text
//! # hosts
//! 0.0.0.0 ads.example.com tracker.example.com
//! 127.0.0.1 doubleclick.net  # inline comment
//!
//! ! filter list
//! ||ads.example.com^
//! @@||cdn.example.com^
//! ||metrics.example.net^$important
//!
//! # plain domains
//! ads.example.com
//! *.tracker.example.net
//! ```
//!
//! Comment lines and blank lines are ignored in every format. Lines that are
//! not domain rules at all (cosmetic filters, URL patterns) are skipped;
//! lines that look like domain rules but fail validation are counted as
//! rejected.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use rustc_hash::FxHashMap;

use crate::config::{SourceConfig, SourceFormat};
use crate::dns::normalize_name;
use crate::filter::{Action, BlocklistEntry, MatchType};

/// Host names that appear in every hosts file and are never rules.
const LOCAL_NAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "local",
    "broadcasthost",
    "ip6-localhost",
    "ip6-loopback",
    "ip6-localnet",
    "ip6-mcastprefix",
    "ip6-allnodes",
    "ip6-allrouters",
    "ip6-allhosts",
    "0.0.0.0",
];

/// An exact rule and a suffix rule for the same domain are separate entries.
pub type EntryKey = (Box<str>, MatchType);

/// Entries of one source.
pub type EntryMap = FxHashMap<EntryKey, BlocklistEntry>;

#[derive(Debug, Default)]
pub struct Parsed {
    pub entries: EntryMap,
    /// Lines dropped because the domain failed validation.
    pub rejected: usize,
}

/// One rule candidate before normalization.
struct Candidate<'a> {
    domain: &'a str,
    match_type: MatchType,
    action: Action,
}

/// Parse `content` according to the source's declared format.
pub fn parse(content: &str, source: &SourceConfig, now: SystemTime) -> Parsed {
    let name: Arc<str> = Arc::from(source.name.as_str());
    let default_match = if source.subdomains {
        MatchType::Suffix
    } else {
        MatchType::Exact
    };

    let mut parsed = Parsed::default();
    let mut candidates = Vec::new();

    for line in content.lines() {
        candidates.clear();
        match source.format {
            SourceFormat::Hosts => hosts_line(line, default_match, &mut candidates),
            SourceFormat::FilterList => filter_line(line, &mut candidates),
            SourceFormat::PlainDomains => plain_line(line, default_match, &mut candidates),
        }

        for candidate in &candidates {
            let domain = match normalize_name(candidate.domain) {
                Ok(domain) => domain,
                Err(_) => {
                    parsed.rejected += 1;
                    continue;
                }
            };

            let entry = BlocklistEntry {
                domain: domain.into_boxed_str(),
                match_type: candidate.match_type,
                action: candidate.action,
                category: source.category,
                source: name.clone(),
                priority: source.priority,
                created_at: now,
            };
            insert(&mut parsed.entries, entry);
        }
    }

    parsed
}

/// Keep one entry per domain and match type; an exception overrides a block rule.
fn insert(entries: &mut EntryMap, entry: BlocklistEntry) {
    let key = (entry.domain.clone(), entry.match_type);
    match entries.get(&key) {
        Some(existing) if existing.action == Action::Allow || entry.action == Action::Block => {}
        _ => {
            entries.insert(key, entry);
        }
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => line[..pos].trim(),
        None => line.trim(),
    }
}

fn hosts_line<'a>(line: &'a str, match_type: MatchType, out: &mut Vec<Candidate<'a>>) {
    let line = strip_comment(line);
    if line.is_empty() {
        return;
    }

    let mut fields = line.split_whitespace();
    let Some(first) = fields.next() else {
        return;
    };

    if first.parse::<IpAddr>().is_err() {
        // A bare domain without an address column.
        if fields.next().is_none() && first.contains('.') {
            out.push(Candidate {
                domain: first,
                match_type,
                action: Action::Block,
            });
        }
        return;
    }

    for domain in fields {
        if LOCAL_NAMES.contains(&domain) {
            continue;
        }
        out.push(Candidate {
            domain,
            match_type,
            action: Action::Block,
        });
    }
}

fn filter_line<'a>(line: &'a str, out: &mut Vec<Candidate<'a>>) {
    let line = line.trim();
    if line.is_empty() || line.starts_with('!') || line.starts_with('[') || line.starts_with('#') {
        return;
    }

    let (action, rule) = match line.strip_prefix("@@") {
        Some(rest) => (Action::Allow, rest),
        None => (Action::Block, line),
    };

    let Some(rule) = rule.strip_prefix("||") else {
        return;
    };

    let (pattern, options) = match rule.split_once('$') {
        Some((pattern, options)) => (pattern, options),
        None => (rule, ""),
    };
    if !options.is_empty() && !options.split(',').all(|o| o.trim() == "important") {
        return;
    }

    let Some(domain) = pattern.strip_suffix('^') else {
        return;
    };
    if domain.contains(['/', '*', '^', '|', ':']) {
        return;
    }

    out.push(Candidate {
        domain,
        match_type: MatchType::Suffix,
        action,
    });
}

fn plain_line<'a>(line: &'a str, match_type: MatchType, out: &mut Vec<Candidate<'a>>) {
    let line = strip_comment(line);
    if line.is_empty() || line.starts_with('!') {
        return;
    }

    let candidate = match line.strip_prefix("*.").or_else(|| line.strip_prefix('.')) {
        Some(domain) => Candidate {
            domain,
            match_type: MatchType::Suffix,
            action: Action::Block,
        },
        None => Candidate {
            domain: line,
            match_type,
            action: Action::Block,
        },
    };
    out.push(candidate);
}
