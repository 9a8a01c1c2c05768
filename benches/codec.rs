//! Benchmark for the packet codec and reliability bookkeeping.
//!
//! Run with: cargo bench --bench codec

use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use lanplay::network::packet::{decode, encode};
use lanplay::network::reliability::ReliabilityTracker;
use lanplay::{ChannelConfig, PacketType};

fn benchmark_encode(c: &mut Criterion) {
    let payload = vec![0x5Au8; 256];

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(payload.len() as u64 + 12));
    group.bench_function("state_256b", |b| {
        let mut seq = 0u16;
        b.iter(|| {
            seq = seq.wrapping_add(1);
            black_box(encode(PacketType::State, black_box(seq), 7, black_box(&payload)))
        });
    });
    group.finish();
}

fn benchmark_decode(c: &mut Criterion) {
    let heartbeat = encode(PacketType::Heartbeat, 1, 0, &[]).unwrap();
    let state = encode(PacketType::State, 42, 41, &[0x5A; 1024]).unwrap();

    c.bench_function("decode_heartbeat", |b| {
        b.iter(|| black_box(decode(black_box(&heartbeat))))
    });

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(state.len() as u64));
    group.bench_function("state_1k", |b| b.iter(|| black_box(decode(black_box(&state)))));
    group.finish();
}

fn benchmark_retransmit_scan(c: &mut Criterion) {
    let config = ChannelConfig::default();

    c.bench_function("collect_due_64_pending", |b| {
        b.iter(|| {
            let mut tracker = ReliabilityTracker::new(&config);
            let start = Instant::now();
            for _ in 0..64 {
                let seq = tracker.allocate_seq();
                tracker.track(seq, vec![0u8; 32], start);
            }
            black_box(tracker.collect_due(start + Duration::from_millis(501)))
        });
    });
}

criterion_group!(benches, benchmark_encode, benchmark_decode, benchmark_retransmit_scan);
criterion_main!(benches);
