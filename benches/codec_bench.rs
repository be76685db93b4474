//! Criterion benchmark for record encode/decode and framing
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use zmqprx::protocol::{
    decode_message, encode_frame, FrameDecoder, Integer, Record, RecordEncoder, Value, WireFormat,
    DEFAULT_MAX_PAYLOAD,
};

fn sample() -> Record {
    Record::new()
        .with("Opaque", Integer::parse("5425423523544523524523525245").unwrap())
        .with("minus1", -1i64)
        .with("Naan", Value::Null)
        .with("_opaque", vec![0xA5u8; 256])
        .with("_real", 452354.5)
        .with("_string", "yo")
}

fn bench_records(c: &mut Criterion) {
    let record = sample();

    for format in [WireFormat::Prefixed, WireFormat::Tagged] {
        let mut group = c.benchmark_group(format!("record_{format:?}").to_lowercase());
        group.throughput(Throughput::Elements(1));

        let mut encoder = RecordEncoder::new(format);
        group.bench_function("encode", |b| {
            b.iter(|| {
                let bytes = encoder.encode(black_box(&record)).unwrap();
                black_box(bytes.len());
            });
        });

        let payload = RecordEncoder::new(format).encode(&record).unwrap().to_vec();
        group.bench_function("decode", |b| {
            b.iter(|| black_box(decode_message(black_box(&payload), format).unwrap()));
        });

        let mut rendered = Vec::with_capacity(1024);
        group.bench_function("decode_render", |b| {
            b.iter(|| {
                rendered.clear();
                decode_message(&payload, format).unwrap().render(&mut rendered).unwrap();
                black_box(rendered.len());
            });
        });

        group.finish();
    }
}

fn bench_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("frames");

    for batch in [1usize, 64, 1024] {
        let mut stream = Vec::new();
        for seq in 0..batch {
            encode_frame(seq as u64, &[0x42; 128], &mut stream);
        }

        group.throughput(Throughput::Elements(batch as u64));
        group.bench_function(format!("decode_batch_{batch}"), |b| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new(black_box(&stream), DEFAULT_MAX_PAYLOAD);
                let mut count = 0;
                while let Some((_, payload)) = decoder.next().unwrap() {
                    count += payload.len();
                }
                black_box(count);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_records, bench_frames);
criterion_main!(benches);
