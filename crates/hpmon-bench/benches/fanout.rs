//! Fan-out benchmarks for the hub.
//!
//! Measures how publishing cost grows with the number of subscribers and
//! with the size of a broadcast reading map.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hpmon_bench::{hub_with_subscribers, readings};
use hpmon_hub::{Hub, RoomKey};
use hpmon_protocol::Subscription;
use serde_json::json;

fn bench_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("join");

    group.bench_function("three_metrics_and_dashboard", |b| {
        let hub = Hub::new();
        let request = Subscription::new(["temp_outside", "temp_flow", "cop"], Some("main"));
        let mut i = 0u64;
        b.iter(|| {
            let conn = format!("conn-{i}");
            i += 1;
            black_box(hub.join(&conn, &request))
        });
    });

    group.finish();
}

fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for size in [1, 10, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (hub, _receivers) = hub_with_subscribers("temp_outside", size);
            b.iter(|| hub.broadcast_metric("temp_outside", black_box(json!(4.5)), Some(1)));
        });
    }

    group.finish();
}

fn bench_broadcast_metrics(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast_metrics");

    for count in [10, 100] {
        let values = readings(count);
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::new("unwatched", count), &values, |b, values| {
            let hub = Hub::new();
            b.iter(|| hub.broadcast_metrics_at(black_box(values), 1));
        });

        group.bench_with_input(BenchmarkId::new("one_watched", count), &values, |b, values| {
            let (hub, _receivers) = hub_with_subscribers("metric_0", 10);
            b.iter(|| hub.broadcast_metrics_at(black_box(values), 1));
        });
    }

    group.finish();
}

fn bench_stats(c: &mut Criterion) {
    c.bench_function("stats_100_rooms", |b| {
        let hub = Hub::new();
        for i in 0..100 {
            let conn = format!("conn-{i}");
            let _ = hub.subscribe(&conn, RoomKey::metric(format!("metric_{i}")));
        }
        b.iter(|| black_box(hub.stats()));
    });
}

criterion_group!(benches, bench_join, bench_fanout, bench_broadcast_metrics, bench_stats);
criterion_main!(benches);
