use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dnsproxy::frame::MAX_FRAME_PAYLOAD;
use dnsproxy::key_exchange::{session_key_for, KeyExchange};
use dnsproxy::{CipherReader, CipherWriter, FrameCipher, SessionKey, TunnelEnvelope};
use std::io::Cursor;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Runtime;

fn bench_cipher() -> FrameCipher {
    FrameCipher::new(SessionKey::from_bytes([0x5A; 16]))
}

/// Single-frame seal and open at typical DNS and maximum sizes
fn bench_frame_encode_decode(c: &mut Criterion) {
    let cipher = bench_cipher();
    let mut group = c.benchmark_group("frame");

    for size in [64usize, 512, 4096, MAX_FRAME_PAYLOAD] {
        let payload = vec![0xA5u8; size];
        let frame = cipher.encode_frame(&payload).unwrap();
        let cipher_len = frame.len() - 4;
        let crc = u16::from_be_bytes([frame[frame.len() - 2], frame[frame.len() - 1]]);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &payload, |b, payload| {
            b.iter(|| cipher.encode_frame(black_box(payload)).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("decode", size), &frame, |b, frame| {
            b.iter(|| cipher.open_frame(black_box(&frame[2..2 + cipher_len]), crc).unwrap());
        });
    }

    group.finish();
}

/// A batch of DNS-sized envelopes through the buffered writer and reader
fn bench_envelope_stream(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("envelope_stream");
    let query = vec![0x42u8; 128];
    let batch = 256usize;
    group.throughput(Throughput::Bytes((query.len() * batch) as u64));

    group.bench_function("batch_256x128", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut writer = CipherWriter::new(Vec::new(), bench_cipher());
                for i in 0..batch {
                    let envelope = TunnelEnvelope::new(i as u16, query.clone()).unwrap();
                    envelope.write_to(&mut writer).await.unwrap();
                }
                writer.flush().await.unwrap();

                let mut reader = CipherReader::new(Cursor::new(writer.into_inner()), bench_cipher());
                let mut count = 0;
                while let Some(envelope) = TunnelEnvelope::read_from(&mut reader).await.unwrap() {
                    count += black_box(envelope.data().len());
                }
                count
            })
        });
    });

    group.bench_function("raw_read_64k", |b| {
        let payload = vec![7u8; 64 * 1024];
        b.iter(|| {
            rt.block_on(async {
                let mut writer = CipherWriter::new(Vec::new(), bench_cipher());
                writer.write_all(&payload).await.unwrap();
                writer.flush().await.unwrap();
                let mut reader = CipherReader::new(Cursor::new(writer.into_inner()), bench_cipher());
                let mut out = Vec::with_capacity(payload.len());
                reader.read_to_end(&mut out).await.unwrap();
                out.len()
            })
        });
    });

    group.finish();
}

/// Ephemeral key generation plus HKDF, as paid once per tunnel
fn bench_key_agreement(c: &mut Criterion) {
    let exchange = KeyExchange::default();
    c.bench_function("key_agreement", |b| {
        b.iter(|| {
            let ours = exchange.generate();
            let theirs = exchange.generate();
            let peer = theirs.public_value().clone();
            session_key_for(ours, black_box(&peer)).unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_frame_encode_decode,
    bench_envelope_stream,
    bench_key_agreement
);
criterion_main!(benches);
