use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use hzbrick::backend::ComputeContext;
use hzbrick::curve::{curve_bytes, curve_layer, decode_truncated, encode_hz, last_bit_mask};
use hzbrick::partition::partition_volume;
use hzbrick::types::Dims3;

fn bench_encode_hz_level_6(c: &mut Criterion) {
    c.bench_function("encode_hz_64_cube", |b| {
        b.iter(|| {
            let mut acc = 0u64;
            for z in 0..64 {
                for y in 0..64 {
                    for x in 0..64 {
                        acc ^= encode_hz(black_box(x), y, z, 6);
                    }
                }
            }
            acc
        });
    });
}

fn bench_decode_truncated_level_6(c: &mut Criterion) {
    let mask = last_bit_mask(6);
    c.bench_function("decode_truncated_64_cube", |b| {
        b.iter(|| {
            let mut acc = 0u32;
            for code in 0..(64u64 * 64 * 64) {
                let (x, y, z) = decode_truncated(black_box(code), mask);
                acc ^= x ^ y ^ z;
            }
            acc
        });
    });
}

fn bench_curve_brick_64(c: &mut Criterion) {
    let raw: Vec<u8> = (0..64 * 64 * 64).map(|i| (i % 256) as u8).collect();
    let mut curved = vec![0u8; raw.len()];

    c.bench_function("curve_bytes_64", |b| {
        b.iter(|| curve_bytes(64, black_box(&raw), &mut curved));
    });
}

fn bench_curve_layer(c: &mut Criterion) {
    let ctx = ComputeContext::new(0).unwrap();
    let partition = partition_volume(&ctx, Dims3::new(1024, 1024, 256), 64, 256).unwrap();

    c.bench_function("curve_layer_1024x1024", |b| {
        b.iter(|| ctx.install(|| curve_layer(&partition, black_box(100))));
    });
}

fn bench_partition(c: &mut Criterion) {
    let ctx = ComputeContext::new(0).unwrap();

    c.bench_function("partition_2000x1500x700", |b| {
        b.iter(|| partition_volume(&ctx, black_box(Dims3::new(2000, 1500, 700)), 16, 512));
    });
}

criterion_group!(
    benches,
    bench_encode_hz_level_6,
    bench_decode_truncated_level_6,
    bench_curve_brick_64,
    bench_curve_layer,
    bench_partition,
);
criterion_main!(benches);
