//! Codec benchmarks for hpmon-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use hpmon_protocol::{Encoding, FrameCodec, ServerFrame};
use serde_json::{json, Map, Value};

fn sample_frame() -> ServerFrame {
    ServerFrame::metric_sample("temp_outside", json!(4.5), Some(1_700_000_000))
}

fn batch_frame(metrics: usize) -> ServerFrame {
    let map: Map<String, Value> = (0..metrics)
        .map(|i| (format!("metric_{i}"), json!(i as f64 * 0.5)))
        .collect();
    ServerFrame::metric_batch(map)
}

fn bench_encode(c: &mut Criterion) {
    let frame = sample_frame();

    let mut group = c.benchmark_group("encode");
    for encoding in [Encoding::Json, Encoding::MessagePack] {
        let codec = FrameCodec::new(encoding);
        group.bench_function(format!("sample_{encoding}"), |b| {
            b.iter(|| codec.encode(black_box(&frame)))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let frame = batch_frame(64);

    let mut group = c.benchmark_group("decode");
    for encoding in [Encoding::Json, Encoding::MessagePack] {
        let codec = FrameCodec::new(encoding);
        let wire = codec.encode(&frame).unwrap();
        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_function(format!("batch64_{encoding}"), |b| {
            b.iter(|| codec.decode::<ServerFrame>(black_box(&wire)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
