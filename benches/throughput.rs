//! Throughput Benchmark for Shardlink
//!
//! This benchmark measures the hot paths of the connection engine:
//! serializing packet groups, merging them in the join buffer, decoding
//! frames and the end-to-end receive path over an in-memory transport.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use shardlink::chat::{ChatProtocol, ChatWorld, Message, SeededXor};
use shardlink::connection::{handle_connection, Connection};
use shardlink::engine::{ConnectionEngine, EngineConfig};
use shardlink::protocol::{Encryption, PacketReader};
use shardlink::{BufferPool, GroupKind, PacketGroup};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn message(text: &str) -> Message {
    Message {
        from: "bench".to_string(),
        text: text.to_string(),
    }
}

/// Benchmark serializing a fresh group per send
fn bench_serialize(c: &mut Criterion) {
    let pool = BufferPool::new();

    let mut group = c.benchmark_group("serialize");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_packet", |b| {
        b.iter(|| {
            let g = PacketGroup::with_pool(GroupKind::SingleUse, Arc::clone(&pool));
            g.add_packet(message("hello"));
            black_box(g.with_final_bytes(None, |bytes| bytes.len()).ok());
            g.dispose();
        });
    });

    group.bench_function("sixteen_packets", |b| {
        b.iter(|| {
            let g = PacketGroup::with_pool(GroupKind::SingleUse, Arc::clone(&pool));
            for _ in 0..16 {
                g.add_packet(message("a somewhat longer chat line"));
            }
            black_box(g.with_final_bytes(None, |bytes| bytes.len()).ok());
            g.dispose();
        });
    });

    group.bench_function("free_group_reuse", |b| {
        let g = PacketGroup::with_pool(GroupKind::Free, Arc::clone(&pool));
        g.add_packet(message("broadcast"));
        b.iter(|| {
            black_box(g.with_final_bytes(None, |bytes| bytes.len()).ok());
        });
    });

    group.finish();
}

/// Benchmark join buffer merging
fn bench_join(c: &mut Criterion) {
    let pool = BufferPool::new();

    let mut group = c.benchmark_group("join");
    group.throughput(Throughput::Elements(32));

    group.bench_function("merge_32_groups", |b| {
        b.iter(|| {
            let pending = PacketGroup::with_pool(GroupKind::SingleUse, Arc::clone(&pool));
            pending.add_packet(message("first"));
            for _ in 0..32 {
                let next = PacketGroup::with_pool(GroupKind::SingleUse, Arc::clone(&pool));
                next.add_packet(message("next"));
                black_box(pending.safe_add_group(&next));
                next.dispose();
            }
            pending.dispose();
        });
    });

    group.finish();
}

/// Benchmark decoding primitives
fn bench_reader(c: &mut Criterion) {
    let mut frame = Vec::new();
    for i in 0..1024u32 {
        frame.extend(i.to_be_bytes());
        frame.extend(5i32.to_be_bytes());
        frame.extend(b"hello");
    }

    let mut group = c.benchmark_group("reader");
    group.throughput(Throughput::Bytes(frame.len() as u64));

    group.bench_function("u32_and_utf8", |b| {
        b.iter(|| {
            let mut reader = PacketReader::new(&frame);
            while reader.remaining() > 0 {
                black_box(reader.read_u32().ok());
                black_box(reader.read_utf8_prefixed().ok());
            }
        });
    });

    group.bench_function("seeded_xor", |b| {
        let mut cipher = SeededXor::client(0x1234_5678);
        let mut out = vec![0u8; frame.len()];
        b.iter(|| {
            black_box(cipher.encrypt(&frame, &mut out).ok());
        });
    });

    group.finish();
}

/// Benchmark the full receive path: transport, framing, dispatch, reply
fn bench_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("round_trip");
    group.throughput(Throughput::Elements(100));

    group.bench_function("ping_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let world = Arc::new(Mutex::new(ChatWorld::default()));
                let engine =
                    ConnectionEngine::start(ChatProtocol::default(), world, EngineConfig::default());
                let (mut client, server) = tokio::io::duplex(64 * 1024);
                let (reader, writer) = tokio::io::split(server);
                let conn = Connection::open(&engine, writer, None);
                tokio::spawn(handle_connection(conn, reader));

                let mut pings = Vec::with_capacity(500);
                for token in 0..100u32 {
                    pings.push(0x03);
                    pings.extend(token.to_be_bytes());
                }
                client.write_all(&pings).await.unwrap();

                let mut pongs = vec![0u8; 500];
                client.read_exact(&mut pongs).await.unwrap();
                black_box(pongs);
            });
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_serialize,
    bench_join,
    bench_reader,
    bench_round_trip,
);

criterion_main!(benches);
