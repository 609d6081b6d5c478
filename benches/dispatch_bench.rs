use criterion::{criterion_group, criterion_main, Criterion};
use serde::{Deserialize, Serialize};
use session_net::config::NetworkConfig;
use session_net::protocol::dispatcher::decode_envelope;
use session_net::protocol::message::{
    encode_client_tick, encode_delta, encode_ping, encode_static, DeltaKind,
};
use session_net::protocol::registry::{PackedMessage, TypeRegistry};
use session_net::service::{MemoryGameplay, NetworkSystem};
use session_net::transport::memory::MemoryTransport;
use session_net::transport::Transport;

#[derive(Serialize, Deserialize)]
struct Position {
    entity: u32,
    xyz: [f32; 3],
}

impl PackedMessage for Position {
    const TYPE_ID: u32 = 1;
}

fn bench_decode_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_envelope");
    let frames = vec![
        ("ping", encode_ping(1.0, 2.0)),
        ("delta", encode_delta(DeltaKind::Snapshot, &[0u8; 512])),
        ("client_tick", encode_client_tick(&[[1.0, 2.0, 3.0]; 8], &[0u8; 64])),
        ("static", encode_static(1000, &[0u8; 128])),
    ];
    for (name, frame) in &frames {
        group.bench_function(*name, |b| b.iter(|| decode_envelope(frame).unwrap()));
    }
    group.finish();
}

fn bench_host_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("host_tick");

    let mut host = NetworkSystem::host(NetworkConfig::default(), Box::new(MemoryGameplay::default()));
    host.registry_mut()
        .register::<Position, _>(|_, _| Ok(None))
        .unwrap();
    let (host_end, mut raw) = MemoryTransport::pair();
    host.add_connection(Box::new(host_end)).unwrap();

    let frame = TypeRegistry::encode(&Position {
        entity: 7,
        xyz: [1.0, 2.0, 3.0],
    })
    .unwrap();

    let mut now = 0.0;
    group.bench_function("packed_x100", |b| {
        b.iter(|| {
            for _ in 0..100 {
                raw.send_raw(&frame).unwrap();
            }
            now += 0.001;
            host.tick_at(now);
            raw.poll_incoming(&mut |_| {});
        })
    });

    group.finish();
}

criterion_group!(benches, bench_decode_envelope, bench_host_tick);
criterion_main!(benches);
