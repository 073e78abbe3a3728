use std::hint::black_box;
use std::time::Instant;

use glam::{Mat4, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use terrastream_common::{Aabb, ClipSpace, Frustum};
use terrastream_spatial::{BuildConfig, CullMetrics, SpatialIndex};

fn make_boxes(count: usize, extent: f32) -> Vec<Aabb> {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    (0..count)
        .map(|_| {
            let center = Vec3::new(
                rng.random_range(0.0..extent),
                rng.random_range(0.0..extent * 0.05),
                rng.random_range(0.0..extent),
            );
            Aabb::from_center_extents(center, Vec3::splat(rng.random_range(0.5..4.0)))
        })
        .collect()
}

fn camera(step: usize, extent: f32) -> Frustum {
    let t = step as f32 * 0.07;
    let eye = Vec3::new(extent * 0.5 + t.cos() * extent * 0.4, 30.0, extent * 0.5 + t.sin() * extent * 0.4);
    let proj = Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 0.5, extent * 0.5);
    let view = Mat4::look_at_rh(eye, Vec3::new(extent * 0.5, 0.0, extent * 0.5), Vec3::Y);
    Frustum::from_matrix(&(proj * view), ClipSpace::ZeroToOne)
}

fn bench_build(count: usize, iterations: usize) {
    let boxes = make_boxes(count, 1000.0);
    let config = BuildConfig::default();

    let start = Instant::now();
    for _ in 0..iterations {
        black_box(SpatialIndex::build(black_box(&boxes), &config));
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!("  build ({count} boxes, {iterations} iters): {per_iter:?}/iter, total {elapsed:?}");
}

fn bench_query(count: usize, iterations: usize) {
    let boxes = make_boxes(count, 1000.0);
    let index = SpatialIndex::build(&boxes, &BuildConfig::default());
    let mut out = vec![0u32; index.max_results() as usize];
    let mut metrics = CullMetrics::default();
    let mut visible_total = 0usize;

    let start = Instant::now();
    for i in 0..iterations {
        let frustum = camera(i, 1000.0);
        visible_total += index
            .query(black_box(&frustum), Some(&boxes), &mut out, Some(&mut metrics))
            .unwrap_or(0);
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!(
        "  query ({count} boxes, {iterations} iters): {per_iter:?}/iter, avg visible {}, last node tests {}",
        visible_total / iterations,
        metrics.node_tests
    );
}

fn bench_brute_force(count: usize, iterations: usize) {
    let boxes = make_boxes(count, 1000.0);

    let start = Instant::now();
    for i in 0..iterations {
        let frustum = camera(i, 1000.0);
        black_box(boxes.iter().filter(|b| !frustum.is_culled(b)).count());
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!("  brute force ({count} boxes, {iterations} iters): {per_iter:?}/iter");
}

fn main() {
    println!("=== Spatial Index Benchmarks ===\n");

    println!("Build:");
    bench_build(1_000, 100);
    bench_build(10_000, 10);
    bench_build(100_000, 2);

    println!("\nFrustum query:");
    bench_query(1_000, 10_000);
    bench_query(10_000, 1_000);
    bench_query(100_000, 100);

    println!("\nBrute force baseline:");
    bench_brute_force(10_000, 1_000);
    bench_brute_force(100_000, 100);

    println!("\n=== Done ===");
}
