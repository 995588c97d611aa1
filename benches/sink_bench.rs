//! Benchmarks for logduck
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use logduck::buffer::RowBuffer;
use logduck::{Chunk, DuckSink, EventTime, RecordEncoder, SinkConfig, TimeFormat};
use serde_json::json;
use std::time::Duration;

fn sample_chunk(rows: usize) -> Chunk {
    let mut chunk = Chunk::new("bench");
    for i in 0..rows {
        let time = EventTime::new(1_735_689_600 + i as i64, 123_456_789).unwrap();
        chunk.push(
            time,
            json!({"user": {"id": i, "name": "bench"}, "level": "info", "latency_ms": 12.5}),
        );
    }
    chunk
}

fn benchmark_encoding(c: &mut Criterion) {
    let chunk = sample_chunk(1000);
    let mut group = c.benchmark_group("encode_chunk");
    group.throughput(Throughput::Elements(1000));

    for dedupe in [false, true] {
        let encoder = RecordEncoder::new(TimeFormat::Utc, dedupe);
        group.bench_with_input(BenchmarkId::from_parameter(dedupe), &encoder, |b, encoder| {
            b.iter(|| black_box(encoder.encode_chunk(&chunk).unwrap()))
        });
    }
    group.finish();
}

fn benchmark_buffer(c: &mut Criterion) {
    let rows = RecordEncoder::default().encode_chunk(&sample_chunk(1000)).unwrap();

    c.bench_function("buffer_append_drain_1000", |b| {
        let buffer = RowBuffer::with_capacity(1000);
        b.iter(|| {
            buffer.append_all(rows.clone());
            black_box(buffer.drain());
        })
    });
}

fn benchmark_load(c: &mut Criterion) {
    let chunk = sample_chunk(1000);
    let mut group = c.benchmark_group("sink_write_flush");
    group.throughput(Throughput::Elements(1000));
    group.sample_size(20);

    group.bench_function("transactional_no_dedupe", |b| {
        let config = SinkConfig::in_memory()
            .dedupe(false)
            .flush_size(100_000)
            .flush_interval(Duration::from_secs(3600));
        let sink = DuckSink::start(config).unwrap();
        let handle = sink.handle();
        b.iter(|| {
            handle.write(&chunk).unwrap();
            black_box(handle.flush().unwrap());
        });
        sink.finish().unwrap();
    });

    group.finish();
}

criterion_group!(benches, benchmark_encoding, benchmark_buffer, benchmark_load);
criterion_main!(benches);
