//! Criterion benchmarks for the mixing kernels
//!
//! Run with: cargo bench -p conflux-core

use conflux_core::{CpuFeatures, CpuFlags, MixOps, SampleFormat};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const QUANTA: &[usize] = &[64, 256, 1024];
const SOURCES: &[usize] = &[2, 4, 16];

fn f32_sources(n_src: usize, samples: usize) -> Vec<Vec<u8>> {
    (0..n_src)
        .map(|s| {
            (0..samples)
                .flat_map(|i| ((i + s) as f32 * 1e-3).to_ne_bytes())
                .collect()
        })
        .collect()
}

fn bench_f32(c: &mut Criterion) {
    let mut group = c.benchmark_group("mix_f32");
    let detected = MixOps::select(SampleFormat::F32, 2, CpuFeatures::detect().flags()).unwrap();
    let scalar = MixOps::select(SampleFormat::F32, 2, CpuFlags::empty()).unwrap();

    for &frames in QUANTA {
        for &n_src in SOURCES {
            let srcs = f32_sources(n_src, frames * 2);
            let views: Vec<&[u8]> = srcs.iter().map(Vec::as_slice).collect();
            let mut dst = vec![0u8; frames * 8];

            for ops in [detected, scalar] {
                group.bench_with_input(
                    BenchmarkId::new(format!("{}/{}src", ops.name(), n_src), frames),
                    &frames,
                    |b, _| {
                        b.iter(|| ops.mix_into(black_box(&mut dst), black_box(&views)));
                    },
                );
            }
        }
    }
    group.finish();
}

fn bench_s16(c: &mut Criterion) {
    let mut group = c.benchmark_group("mix_s16");
    let ops = MixOps::select(SampleFormat::S16, 2, CpuFlags::empty()).unwrap();

    for &frames in QUANTA {
        let srcs: Vec<Vec<u8>> = (0..4)
            .map(|s| {
                (0..frames * 2)
                    .flat_map(|i| (((i * 37 + s * 11) % 20000) as i16).to_ne_bytes())
                    .collect()
            })
            .collect();
        let views: Vec<&[u8]> = srcs.iter().map(Vec::as_slice).collect();
        let mut dst = vec![0u8; frames * 4];

        group.bench_with_input(BenchmarkId::new("4src", frames), &frames, |b, _| {
            b.iter(|| ops.mix_into(black_box(&mut dst), black_box(&views)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_f32, bench_s16);
criterion_main!(benches);
