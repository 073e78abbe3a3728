use std::hint::black_box;
use std::time::Instant;

use glam::{Mat4, Vec3};
use terrastream_common::{CellCoord, ClipSpace, LayerId, UberRegion};
use terrastream_lod::{Camera, CellPlacement, FrameSeeder, LodConfig};
use terrastream_stream::{
    CellScaffold, InMemoryScaffolds, ResourceViewId, SimulatedUploads, TileCache, TileCacheConfig,
};

const CELL_SIZE: f32 = 512.0;
const ELEMENTS_PER_CELL: u32 = 1024;

fn make_world(side: i32, field_count: u32) -> (FrameSeeder, InMemoryScaffolds) {
    let mut seeder = FrameSeeder::new(CELL_SIZE, LodConfig::default());
    let mut scaffolds = InMemoryScaffolds::new();
    let layers = [LayerId::Heights, LayerId::Coverage(0)];
    for z in 0..side {
        for x in 0..side {
            let coord = CellCoord::new(x, z);
            seeder.register_cell(CellPlacement::new(coord, [0.0, 120.0], field_count));
            scaffolds.insert(CellScaffold::synthetic(coord, field_count, &layers, ELEMENTS_PER_CELL));
        }
    }
    (seeder, scaffolds)
}

fn camera_at(step: usize, extent: f32) -> Camera {
    let t = step as f32 * 0.01;
    let eye = Vec3::new(extent * 0.5 + t.cos() * extent * 0.3, 300.0, extent * 0.5 + t.sin() * extent * 0.3);
    let proj = Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 1.0, 50_000.0);
    Camera {
        view_projection: proj * Mat4::look_at_rh(eye, Vec3::new(extent * 0.5, 0.0, extent * 0.5), Vec3::Y),
        position: eye,
        clip_space: ClipSpace::ZeroToOne,
    }
}

fn bench_frames(side: i32, frames: usize, edits_per_frame: u32) {
    let (seeder, scaffolds) = make_world(side, 5);
    let mut cache = TileCache::new(TileCacheConfig::default(), scaffolds, SimulatedUploads::new(1))
        .expect("default config is valid");
    let queue = cache.short_circuit_queue();
    let extent = side as f32 * CELL_SIZE;

    let mut drawn = 0usize;
    let start = Instant::now();
    for frame in 0..frames {
        for e in 0..edits_per_frame {
            let x = (frame as u32 * 37 + e * 101) % (side as u32 * ELEMENTS_PER_CELL);
            let region = UberRegion::new([x, x], [x + 16, x + 16]);
            queue.queue_short_circuit(LayerId::Heights, region, ResourceViewId(frame as u64));
        }
        let active = seeder.seed(&camera_at(frame, extent)).resolve();
        let drawables = cache.update(black_box(&active));
        drawn += drawables.iter().filter(|d| d.is_ready()).count();
    }
    let elapsed = start.elapsed();
    let per_frame = elapsed / frames as u32;
    let stats = cache.stats();
    println!(
        "  {side}x{side} cells, {edits_per_frame} edits/frame, {frames} frames: {per_frame:?}/frame, \
         {} uploads, {} patches, {} evictions, {drawn} drawn",
        stats.uploads_issued, stats.patches_issued, stats.evictions
    );
}

fn main() {
    println!("=== Tile Cache Benchmarks ===\n");

    println!("Seed + resolve + cache update:");
    bench_frames(4, 200, 0);
    bench_frames(8, 200, 0);
    bench_frames(16, 100, 0);

    println!("\nWith short-circuit traffic:");
    bench_frames(8, 200, 4);
    bench_frames(8, 200, 32);

    println!("\n=== Done ===");
}
