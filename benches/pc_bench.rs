//! `criterion` benchmarks for the RCPC and STPC proxy collectors.

use criterion::{criterion_group, criterion_main, Criterion};
use reclaim::default_backoff;
use reclaim::pc::{RcpcConfig, StpcConfig};

fn rcpc_acquire_drop(c: &mut Criterion) {
    let proxy = RcpcConfig::new().with_latency(4).build().unwrap();
    c.bench_function("rcpc_acquire_drop", |b| {
        b.iter(|| {
            let r = proxy.acquire_reference();
            proxy.drop_reference(r);
        });
    });
}

fn rcpc_defer_delete(c: &mut Criterion) {
    let proxy = RcpcConfig::new().with_latency(4).build().unwrap();
    c.bench_function("rcpc_defer_delete", |b| {
        b.iter(|| {
            proxy.defer_delete(Box::new(|| {}), default_backoff);
        });
    });
}

fn stpc_acquire_drop(c: &mut Criterion) {
    let proxy = StpcConfig::new().build().unwrap();
    c.bench_function("stpc_acquire_drop", |b| {
        b.iter(|| {
            let r = proxy.acquire_reference();
            proxy.drop_reference(r);
        });
    });
}

fn stpc_defer_delete(c: &mut Criterion) {
    let proxy = StpcConfig::new().build().unwrap();
    c.bench_function("stpc_defer_delete", |b| {
        b.iter(|| {
            proxy.defer_delete(Box::new(|| {}), default_backoff);
        });
    });
}

criterion_group!(benches, rcpc_acquire_drop, rcpc_defer_delete, stpc_acquire_drop, stpc_defer_delete);
criterion_main!(benches);
