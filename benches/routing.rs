//! Flow key extraction and lane selection throughput

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use etherparse::PacketBuilder;
use flowsplit::core::classify;
use flowsplit::{FlowRouter, SplitBy};
use pcap_file::DataLink;

fn build_frames(count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            let host = [10, 0, (i >> 8) as u8, i as u8];
            let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
                .ipv4(host, [192, 168, 0, 1], 64);
            let mut out = Vec::new();
            if i % 2 == 0 {
                builder
                    .tcp(1024 + i as u16, 443, 1, 4096)
                    .write(&mut out, &[0u8; 64])
                    .unwrap();
            } else {
                builder
                    .udp(1024 + i as u16, 53)
                    .write(&mut out, &[0u8; 32])
                    .unwrap();
            }
            out
        })
        .collect()
}

fn bench_routing(c: &mut Criterion) {
    let frames = build_frames(1024);
    let router = FlowRouter::new(8).unwrap();

    let mut group = c.benchmark_group("classify_and_route");
    group.throughput(Throughput::Elements(frames.len() as u64));

    for split in [SplitBy::Ip, SplitBy::Port] {
        group.bench_function(split.name(), |b| {
            b.iter(|| {
                let mut per_lane = [0u64; 8];
                for frame in &frames {
                    if let Some(key) = classify(DataLink::ETHERNET, black_box(frame), split) {
                        per_lane[router.route(key)] += 1;
                    }
                }
                black_box(per_lane)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_routing);
criterion_main!(benches);
