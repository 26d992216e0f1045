//! Hot-path benchmarks for nus-pacer.
//!
//! - ByteQueue push / peek / consume at chunk-sized granularity
//! - Overwriting RX pushes
//! - A full tick + completion cycle through PacedLink
//!
//! Run with: cargo bench --package nus-pacer

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use nus_pacer::queue::ByteQueue;
use nus_pacer::status::nimble;
use nus_pacer::{PacedLink, PacerConfig, TickOutcome, Transport, TransportParameters};

// ─── ByteQueue ──────────────────────────────────────────────────────────────

fn bench_queue_chunk_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_chunk_cycle");

    for chunk in [20usize, 180, 244, 495] {
        group.throughput(Throughput::Bytes(chunk as u64));
        group.bench_function(format!("{chunk}B"), |b| {
            let mut q = ByteQueue::new(4096);
            let data = vec![0x5Au8; chunk];
            let mut out = vec![0u8; chunk];
            b.iter(|| {
                q.push(black_box(&data), false);
                let n = q.peek(&mut out);
                q.consume(black_box(n));
            });
        });
    }

    group.finish();
}

fn bench_queue_peek_bytes(c: &mut Criterion) {
    let mut q = ByteQueue::new(4096);
    // Leave the stored run straddling the wrap point
    q.push(&[1u8; 4000], false);
    q.consume(3900);
    q.push(&[2u8; 3000], false);

    c.bench_function("queue_peek_bytes_wrapped_244", |b| {
        b.iter(|| black_box(q.peek_bytes(black_box(244))));
    });
}

fn bench_rx_overwrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("rx_overwrite");
    group.throughput(Throughput::Bytes(244));
    group.bench_function("full_queue_244B", |b| {
        let mut q = ByteQueue::new(4096);
        q.push(&[0u8; 4096], false);
        let data = [0xA5u8; 244];
        b.iter(|| q.push(black_box(&data), true));
    });
    group.finish();
}

// ─── PacedLink ──────────────────────────────────────────────────────────────

struct NullTransport;

impl Transport for NullTransport {
    fn send(&self, chunk: &[u8]) -> bool {
        black_box(chunk);
        true
    }

    fn request_disconnect(&self) {}
}

fn bench_link_cycle(c: &mut Criterion) {
    let (clock, mock) = quanta::Clock::mock();
    let link = PacedLink::with_clock(NullTransport, &PacerConfig::default(), clock);
    link.on_link_up(TransportParameters::default().with_mtu(247));
    let data = [0x33u8; 244];

    c.bench_function("link_write_tick_complete", |b| {
        b.iter(|| {
            link.write(&data);
            // Step past the pacing interval every iteration
            mock.increment(std::time::Duration::from_millis(5));
            if let TickOutcome::Sent { .. } = link.tick() {
                link.on_completion(black_box(nimble::OK));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_queue_chunk_cycle,
    bench_queue_peek_bytes,
    bench_rx_overwrite,
    bench_link_cycle,
);
criterion_main!(benches);
