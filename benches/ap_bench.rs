//! `criterion` benchmarks for the atomic refcounted pointer, replacing the
//! nightly-only, inline-`asm!`-based rdtsc harness this repository used to
//! ship with a stable-Rust `criterion_group!` harness.

use criterion::{criterion_group, criterion_main, Criterion};
use reclaim::ap::{AtomicSlot, LocalHandle};
use std::sync::Arc;

fn load_uncontended(c: &mut Criterion) {
    let slot = AtomicSlot::new(1u64);
    c.bench_function("ap_load_uncontended", |b| {
        b.iter(|| {
            let h = slot.load().unwrap();
            criterion::black_box(*h);
        });
    });
}

fn store_uncontended(c: &mut Criterion) {
    let slot = AtomicSlot::new(0u64);
    let mut n = 0u64;
    c.bench_function("ap_store_uncontended", |b| {
        b.iter(|| {
            n += 1;
            slot.store(Some(LocalHandle::new(n)));
        });
    });
}

fn load_under_contention(c: &mut Criterion) {
    let slot = Arc::new(AtomicSlot::new(0u64));
    let writer_slot = slot.clone();
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let writer_stop = stop.clone();
    let writer = std::thread::spawn(move || {
        let mut n = 0u64;
        while !writer_stop.load(std::sync::atomic::Ordering::Relaxed) {
            n += 1;
            writer_slot.store(Some(LocalHandle::new(n)));
        }
    });

    c.bench_function("ap_load_under_contention", |b| {
        b.iter(|| {
            let h = slot.load().unwrap();
            criterion::black_box(*h);
        });
    });

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    writer.join().unwrap();
}

criterion_group!(benches, load_uncontended, store_uncontended, load_under_contention);
criterion_main!(benches);
