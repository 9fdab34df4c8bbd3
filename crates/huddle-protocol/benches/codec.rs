//! Codec benchmarks for huddle-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use huddle_protocol::{codec, Presence, Proximity, ServerMessage};

fn proximity(presences: usize) -> ServerMessage {
    ServerMessage::Proximity(Proximity {
        identity: "1".into(),
        location: [0.5, 0.5],
        orientation: 180.0,
        presences: (0..presences)
            .map(|i| Presence {
                identity: (i + 2).to_string(),
                location: [0.1 * i as f64, 0.2],
                orientation: 45.0,
            })
            .collect(),
    })
}

fn bench_encode_proximity(c: &mut Criterion) {
    let message = proximity(4);

    c.bench_function("encode_proximity_4", |b| {
        b.iter(|| codec::encode(black_box(&message)))
    });
}

fn bench_decode_handshake(c: &mut Criterion) {
    let text = r#"{"Type":"Handshake","Data":{"Name":"Tablet","GlyphId":"12","DeviceType":"Tablet"}}"#;

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("handshake", |b| b.iter(|| codec::decode(black_box(text))));
    group.finish();
}

fn bench_decode_message(c: &mut Criterion) {
    let payload = "x".repeat(256);
    let text = format!(r#"{{"Type":"Message","Data":{{"Text":"{}"}}}}"#, payload);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("message_256B", |b| {
        b.iter(|| codec::decode(black_box(&text)))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_encode_proximity,
    bench_decode_handshake,
    bench_decode_message
);
criterion_main!(benches);
