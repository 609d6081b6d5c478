use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use session_net::protocol::chunking::{split_message, ChunkReassembler};
use session_net::protocol::dispatcher::{decode_envelope, Envelope};

fn bench_chunking(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunking");
    let message: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    group.throughput(Throughput::Bytes(message.len() as u64));

    for &max in &[1024usize, 16 * 1024, 64 * 1024] {
        group.bench_function(format!("split_{max}"), |b| {
            b.iter(|| split_message(&message, max).unwrap())
        });

        let frames = split_message(&message, max).unwrap();
        group.bench_function(format!("reassemble_{max}"), |b| {
            b.iter_batched(
                ChunkReassembler::new,
                |mut reassembler| {
                    let mut done = None;
                    for frame in &frames {
                        if let Ok(Envelope::Chunk { index, total, data }) = decode_envelope(frame) {
                            done = reassembler.push(index, total, data).unwrap();
                        }
                    }
                    done
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_chunking);
criterion_main!(benches);
