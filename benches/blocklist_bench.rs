//! Benchmarks for blocklist domain lookup and snapshot builds.
//!
//! Measures how quickly we can check if a domain is blocked against a
//! realistically sized snapshot.

use std::hint::black_box;
use std::sync::Arc;
use std::time::SystemTime;

use criterion::{BenchmarkId, Criterion, Throughput};

use hush::filter::{Action, BlocklistEntry, Category, MatchEngine, MatchType, Snapshot};

const ENTRIES: usize = 100_000;

fn entries() -> Vec<BlocklistEntry> {
    let source: Arc<str> = Arc::from("bench");
    (0..ENTRIES)
        .map(|i| BlocklistEntry {
            domain: format!("host{i}.tracker{}.example", i % 997).into(),
            match_type: if i % 10 == 0 {
                MatchType::Suffix
            } else {
                MatchType::Exact
            },
            action: Action::Block,
            category: Category::Ads,
            source: source.clone(),
            priority: 0,
            created_at: SystemTime::now(),
        })
        .chain(std::iter::once(BlocklistEntry {
            domain: "doubleclick.com".into(),
            match_type: MatchType::Suffix,
            action: Action::Block,
            category: Category::Ads,
            source: source.clone(),
            priority: 0,
            created_at: SystemTime::now(),
        }))
        .collect()
}

fn bench_check(c: &mut Criterion) {
    let engine = MatchEngine::new();
    engine.publish(Snapshot::build(&entries(), 0.001));

    let mut group = c.benchmark_group("check");
    group.throughput(Throughput::Elements(1));

    // Exact match (blocked domain)
    group.bench_function(BenchmarkId::new("check", "exact_match"), |b| {
        b.iter(|| engine.check(black_box("host12345.tracker381.example")))
    });

    // Subdomain match (blocked via parent)
    group.bench_function(BenchmarkId::new("check", "subdomain_match"), |b| {
        b.iter(|| engine.check(black_box("ads.tracking.doubleclick.com")))
    });

    // Miss (not blocked)
    group.bench_function(BenchmarkId::new("check", "miss"), |b| {
        b.iter(|| engine.check(black_box("www.google.com")))
    });

    // Deep subdomain miss
    group.bench_function(BenchmarkId::new("check", "deep_miss"), |b| {
        b.iter(|| engine.check(black_box("a.b.c.d.e.f.example.org")))
    });

    group.finish();
}

fn bench_build(c: &mut Criterion) {
    let entries = entries();

    let mut group = c.benchmark_group("snapshot");
    group.sample_size(10);
    group.throughput(Throughput::Elements(entries.len() as u64));
    group.bench_function("build", |b| {
        b.iter(|| Snapshot::build(black_box(&entries), 0.001))
    });
    group.finish();
}

fn main() {
    let mut criterion = Criterion::default().configure_from_args();
    bench_check(&mut criterion);
    bench_build(&mut criterion);
    criterion.final_summary();
}
