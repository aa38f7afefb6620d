use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

use stampede::metrics::{Aggregator, LatencyDigest, Outcome, RequestSample};

fn sample(user: usize, latency_us: u64) -> RequestSample {
    RequestSample::new(
        user,
        Utc::now(),
        Duration::from_micros(latency_us),
        Outcome::Success,
    )
}

fn digest_benchmark(c: &mut Criterion) {
    let mut digest = LatencyDigest::new();
    let mut latency = 1_000;
    c.bench_function("record one latency", |b| {
        b.iter(|| {
            latency = (latency * 7 + 13) % 2_000_000 + 1;
            digest.record(Duration::from_micros(latency))
        })
    });

    let mut full = LatencyDigest::new();
    for latency in 1..100_000 {
        full.record(Duration::from_micros(latency * 10));
    }
    c.bench_function("p99 of 100k latencies", |b| b.iter(|| full.percentile(99.0)));
}

fn aggregator_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("record 10k samples from 8 threads");
    group.throughput(Throughput::Elements(10_000));
    for shards in [1, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(shards), &shards, |b, &shards| {
            b.iter(|| {
                let aggregator = Arc::new(Aggregator::new(shards));
                let threads: Vec<_> = (0..8)
                    .map(|thread| {
                        let aggregator = aggregator.clone();
                        std::thread::spawn(move || {
                            for i in 0..1_250 {
                                aggregator.record(sample(thread, 100 + i));
                            }
                        })
                    })
                    .collect();
                for thread in threads {
                    thread.join().unwrap();
                }
                aggregator.snapshot().count
            })
        });
    }
    group.finish();
}

criterion_group!(benches, digest_benchmark, aggregator_benchmark);
criterion_main!(benches);
