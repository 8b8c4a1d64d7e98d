// benches/benchmarks.rs -- Host-side benchmarks.
//
//   cargo bench --bench benchmarks
//
// Kernel derivation, the CPU reference filter, and the full pipeline on the
// host backend (transfer + passes + fetch), at image and volume sizes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use ndarray::{Array2, Array3, ArrayD};

use sepconv::convolution::{gaussian_filter, gaussian_kernel_1d, DEFAULT_TRUNCATE};
use sepconv::grid::round_up;
use sepconv::{BlockShape, HostArray, HostBackend, SeparableConvolution};

// ============================================================
// Helpers
// ============================================================

fn make_image(h: usize, w: usize) -> ArrayD<f32> {
    Array2::from_shape_fn((h, w), |(y, x)| ((x * 200 / w) + (y * 55 / h) + (x ^ y) % 7) as f32)
        .into_dyn()
}

fn make_volume(d: usize, h: usize, w: usize) -> ArrayD<f32> {
    Array3::from_shape_fn((d, h, w), |(z, y, x)| ((x * 3 + y * 5 + z * 7) % 251) as f32).into_dyn()
}

// ============================================================
// Benchmarks
// ============================================================

fn bench_kernel(c: &mut Criterion) {
    let mut group = c.benchmark_group("gaussian_kernel_1d");
    for sigma in [1.0, 4.0, 16.0] {
        group.bench_with_input(BenchmarkId::from_parameter(sigma), &sigma, |b, &s| {
            b.iter(|| gaussian_kernel_1d(s, DEFAULT_TRUNCATE))
        });
    }
    group.finish();
}

fn bench_grid(c: &mut Criterion) {
    let block = BlockShape::from([4, 4, 4]);
    c.bench_function("round_up_3d", |b| b.iter(|| round_up(&[751, 479, 33], &block)));
}

fn bench_cpu_reference(c: &mut Criterion) {
    let img = make_image(480, 752);
    let vol = make_volume(32, 64, 64);

    let mut group = c.benchmark_group("cpu_reference");
    group.sample_size(20);
    group.bench_function("2d_752x480_s1.5", |b| {
        b.iter(|| gaussian_filter(&img, 1.5, DEFAULT_TRUNCATE))
    });
    group.bench_function("3d_64x64x32_s1.0", |b| {
        b.iter(|| gaussian_filter(&vol, 1.0, DEFAULT_TRUNCATE))
    });
    group.finish();
}

fn bench_host_pipeline(c: &mut Criterion) {
    let img = HostArray::F32(make_image(480, 752));
    let vol = HostArray::F32(make_volume(32, 64, 64));
    let backend = Arc::new(HostBackend::new());
    let mut p2 = SeparableConvolution::new(Arc::clone(&backend), &[480, 752]).expect("2-D pipeline");
    let mut p3 = SeparableConvolution::new(Arc::clone(&backend), &[32, 64, 64]).expect("3-D pipeline");

    let mut group = c.benchmark_group("host_pipeline");
    group.sample_size(20);
    group.bench_function("2d_752x480_s1.5", |b| {
        b.iter(|| {
            p2.filter(&img, 1.5).expect("filter");
            p2.fetch_result().expect("fetch")
        })
    });
    group.bench_function("3d_64x64x32_s1.0", |b| {
        b.iter(|| {
            p3.filter(&vol, 1.0).expect("filter");
            p3.fetch_result().expect("fetch")
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_kernel,
    bench_grid,
    bench_cpu_reference,
    bench_host_pipeline,
);
criterion_main!(benches);
