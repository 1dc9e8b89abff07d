//! Benchmark for core-mix metadata encoding
//!
//! The generator encodes one record per fused kernel; the launcher decodes it on every load.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use superfuse_core::{CoreMixMetadata, KernelType, PackedBlockCount};

fn benchmark_metadata(c: &mut Criterion) {
    let meta = CoreMixMetadata::for_kernel("te_superkernel", KernelType::MixAic1_2);

    c.bench_function("metadata_to_binary", |b| {
        b.iter(|| {
            let binary = meta.to_binary();
            black_box(binary);
        })
    });

    let binary = meta.to_binary();
    c.bench_function("metadata_from_binary", |b| {
        b.iter(|| {
            let restored = CoreMixMetadata::from_binary("te_superkernel", black_box(&binary)).unwrap();
            black_box(restored);
        })
    });

    let json = meta.to_json().unwrap();
    c.bench_function("metadata_from_json", |b| {
        b.iter(|| {
            let restored = CoreMixMetadata::from_json(black_box(&json)).unwrap();
            black_box(restored);
        })
    });
}

fn benchmark_packed_block_count(c: &mut Criterion) {
    let words: Vec<u64> = KernelType::ALL
        .iter()
        .map(|kt| PackedBlockCount::new(*kt, 48).pack())
        .collect();

    c.bench_function("packed_block_count_unpack", |b| {
        b.iter(|| {
            for word in &words {
                black_box(PackedBlockCount::unpack(black_box(*word)).unwrap());
            }
        })
    });
}

criterion_group!(benches, benchmark_metadata, benchmark_packed_block_count);
criterion_main!(benches);
