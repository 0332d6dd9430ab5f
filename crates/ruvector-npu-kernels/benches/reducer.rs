//! Benchmarks for the binary-tree reducer and the partial-result cache.
//!
//! Compares the scheduled tree reduction against naive left-to-right
//! summation across lengths, and measures binary-counter merging against a
//! flat running sum.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ruvector_npu_kernels::accumulator::PartialResultCache;
use ruvector_npu_kernels::reducer::BinaryTreeReducer;
use ruvector_npu_kernels::traits::{Max, Sum};

/// Random vector with deterministic seed.
fn random_vector(n: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

// ---------------------------------------------------------------------------
// Benchmark: tree vs naive reduction
// ---------------------------------------------------------------------------

fn reduce_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduce_scaling");
    group.warm_up_time(Duration::from_secs(2));
    let reducer = BinaryTreeReducer::for_element::<f32>(256).unwrap();

    for &n in &[63, 1_000, 65_536, 1_000_003] {
        let data = random_vector(n, 42);
        let mut scratch = Vec::new();
        group.throughput(Throughput::Elements(n as u64));

        group.bench_with_input(BenchmarkId::new("tree_sum", n), &n, |b, _| {
            b.iter(|| {
                reducer
                    .reduce_with(&Sum, criterion::black_box(&data), &mut scratch)
                    .unwrap()
            });
        });
        group.bench_with_input(BenchmarkId::new("naive_sum", n), &n, |b, _| {
            b.iter(|| criterion::black_box(&data).iter().sum::<f32>());
        });
        group.bench_with_input(BenchmarkId::new("tree_max", n), &n, |b, _| {
            b.iter(|| reducer.reduce(&Max, criterion::black_box(&data)).unwrap());
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: grouped reduction
// ---------------------------------------------------------------------------

fn reduce_groups(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduce_groups");
    group.warm_up_time(Duration::from_secs(2));
    let reducer = BinaryTreeReducer::for_element::<f32>(256).unwrap();

    for &(groups, len) in &[(16usize, 1_024usize), (256, 64), (4, 16_384)] {
        let data = random_vector(groups * len, 7);
        let mut out = vec![0.0f32; groups];
        group.throughput(Throughput::Elements((groups * len) as u64));
        group.bench_with_input(
            BenchmarkId::new("groups_x_len", format!("{groups}x{len}")),
            &len,
            |b, _| {
                b.iter(|| {
                    reducer
                        .reduce_groups(&Sum, criterion::black_box(&data), len, len, groups, &mut out)
                        .unwrap()
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: binary-counter cache merging
// ---------------------------------------------------------------------------

fn cache_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_merge");
    group.sample_size(50);

    for &tiles in &[16u64, 1_024, 65_536] {
        let partials = random_vector(tiles as usize * 8, 3);
        group.throughput(Throughput::Elements(tiles));
        group.bench_with_input(BenchmarkId::new("tiles", tiles), &tiles, |b, &tiles| {
            b.iter(|| {
                let mut cache = PartialResultCache::<f32>::new(8, tiles);
                for (i, p) in partials.chunks_exact(8).enumerate() {
                    cache.merge(&Sum, i as u64, p);
                }
                cache.finalize(&Sum)
            });
        });
    }
    group.finish();
}

criterion_group!(reducer, reduce_scaling, reduce_groups, cache_merge);
criterion_main!(reducer);
