//! Benchmarks for the hot paths of the `settlement` package: container acquisition with and
//! without pooling, reference counting and deferred settlement.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use settlement::{CancelationSource, Context, PoolingPolicy, SettlementKind};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const TEST_VALUE: u64 = 1024;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("st_acquire");

    for (name, policy) in [("pooled", PoolingPolicy::All), ("unpooled", PoolingPolicy::None)] {
        let context = Context::builder().pooling(policy).build();

        group.bench_function(name, |b| {
            b.iter(|| {
                drop(black_box(context.acquire(SettlementKind::Resolved, TEST_VALUE)));
            });
        });
    }

    group.finish();

    let mut group = c.benchmark_group("st_ref_count");

    let context = Context::new();
    let container = context.acquire(SettlementKind::Resolved, TEST_VALUE);

    group.bench_function("retain_release", |b| {
        b.iter(|| {
            drop(black_box(container.retain()));
        });
    });

    group.finish();

    let mut group = c.benchmark_group("st_deferred");

    group.bench_function("resolve", |b| {
        b.iter(|| {
            let deferred = context.deferred::<u64>();
            deferred.resolve(black_box(TEST_VALUE)).unwrap();
        });
    });

    let source = CancelationSource::new();
    let token = source.token();

    group.bench_function("resolve_registered", |b| {
        b.iter(|| {
            let deferred = context.deferred::<u64>();
            deferred.register_for_cancelation(&token);
            deferred.resolve(black_box(TEST_VALUE)).unwrap();
        });
    });

    group.finish();
}
