//! Benchmarks for the telemetry store
//!
//! Tests how appending and reading scale with the number of stored snapshots:
//! - Appending with and without GC events to pair
//! - Reading the latest window the way a chart refresh does
//!
//! Platform: Cross-platform (synthetic samples, CI-safe)

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use jfluid::telemetry::{TelemetrySample, TelemetryStore};
use jfluid::test_utils::sample;
use std::hint::black_box;

/// One hour of one-second samples, with a GC spanning two polls every 20 seconds.
fn hour_of_samples() -> Vec<TelemetrySample> {
    (0..3_600i64)
        .map(|second| {
            let ts = second * 1_000;
            match second % 20 {
                0 => sample(ts, &[ts - 300], &[]),
                1 => sample(ts, &[], &[ts - 900]),
                _ => sample(ts, &[], &[]),
            }
        })
        .collect()
}

fn bench_append(c: &mut Criterion) {
    let samples = hour_of_samples();
    let quiet: Vec<TelemetrySample> =
        samples.iter().map(|s| TelemetrySample { gc_starts: vec![], gc_finishes: vec![], ..s.clone() }).collect();

    let mut group = c.benchmark_group("telemetry_append");
    group.throughput(Throughput::Elements(samples.len() as u64));

    for (name, input) in [("with_gc", &samples), ("no_gc", &quiet)] {
        group.bench_with_input(BenchmarkId::new("hour", name), input, |b, input| {
            b.iter(|| {
                let store = TelemetryStore::new();
                for s in input {
                    black_box(store.add_snapshot(s.clone()));
                }
                black_box(store.gc_intervals().len())
            })
        });
    }

    group.finish();
}

fn bench_reads(c: &mut Criterion) {
    let store = TelemetryStore::new();
    for s in hour_of_samples() {
        store.add_snapshot(s);
    }

    let mut group = c.benchmark_group("telemetry_read");

    for window in [60usize, 600] {
        group.throughput(Throughput::Elements(window as u64));
        group.bench_with_input(BenchmarkId::new("window", window), &window, |b, &window| {
            b.iter(|| black_box(store.window(black_box(window))))
        });
    }

    group.bench_function("latest", |b| b.iter(|| black_box(store.latest())));
    group.bench_function("gc_intervals", |b| b.iter(|| black_box(store.gc_intervals())));

    group.finish();
}

criterion_group!(benches, bench_append, bench_reads);
criterion_main!(benches);
