use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use glam::{Mat4, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;
use terrastream_common::{Aabb, CellCoord, ClipSpace, Frustum, LayerId, UberRegion};
use terrastream_lod::{Camera, CellPlacement, FrameSeeder, LodConfig};
use terrastream_spatial::{BuildConfig, Orientation, SpatialIndex};
use terrastream_stream::{
    CellScaffold, InMemoryScaffolds, ResourceViewId, SimulatedUploads, TileCache, TileCacheConfig,
};

#[derive(Parser)]
#[command(name = "terrastream-cli", about = "CLI tool for terrastream operations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Up {
    Y,
    Z,
}

impl From<Up> for Orientation {
    fn from(up: Up) -> Self {
        match up {
            Up::Y => Orientation::YUp,
            Up::Z => Orientation::ZUp,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and crate info
    Info,
    /// Build a spatial index over random boxes and write it as a block file
    BuildIndex {
        /// Output block file
        #[arg(short, long)]
        out: PathBuf,
        /// Number of boxes to scatter
        #[arg(short = 'n', long, default_value = "10000")]
        objects: usize,
        /// RNG seed for the scene
        #[arg(short, long, default_value = "42")]
        seed: u64,
        /// Largest payload a leaf may carry
        #[arg(long, default_value = "12")]
        leaf_threshold: u32,
        /// World up axis
        #[arg(long, value_enum, default_value = "y")]
        up: Up,
    },
    /// Cull random frustums against an index and check the result by brute force
    Cull {
        /// Block file written by build-index; built in memory when omitted
        #[arg(short, long)]
        index: Option<PathBuf>,
        /// Number of boxes in the scene (must match the index)
        #[arg(short = 'n', long, default_value = "10000")]
        objects: usize,
        /// RNG seed for the scene (must match the index)
        #[arg(short, long, default_value = "42")]
        seed: u64,
        /// Number of frustums to test
        #[arg(short, long, default_value = "100")]
        frustums: usize,
    },
    /// Run detail selection and the tile cache over a synthetic world
    Simulate {
        /// Cells per side of the square world
        #[arg(long, default_value = "8")]
        cells: i32,
        /// Node fields per cell
        #[arg(long, default_value = "5")]
        fields: u32,
        /// Frames to run
        #[arg(long, default_value = "300")]
        frames: usize,
        /// Polls before an upload completes
        #[arg(long, default_value = "2")]
        latency: u32,
        /// Short-circuit edits queued per frame
        #[arg(long, default_value = "0")]
        edits: u32,
        /// Tile cache config (JSON)
        #[arg(long)]
        cache_config: Option<PathBuf>,
        /// Detail selection config (JSON)
        #[arg(long)]
        lod_config: Option<PathBuf>,
    },
}

const SCENE_EXTENT: f32 = 4096.0;
const CELL_SIZE: f32 = 512.0;
const ELEMENTS_PER_CELL: u32 = 1024;

fn scene(objects: usize, seed: u64) -> Vec<Aabb> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..objects)
        .map(|_| {
            let center = Vec3::new(
                rng.random_range(0.0..SCENE_EXTENT),
                rng.random_range(0.0..64.0),
                rng.random_range(0.0..SCENE_EXTENT),
            );
            let half = Vec3::new(
                rng.random_range(0.5..16.0),
                rng.random_range(0.5..16.0),
                rng.random_range(0.5..16.0),
            );
            Aabb::from_center_extents(center, half)
        })
        .collect()
}

fn random_frustum(rng: &mut StdRng) -> Frustum {
    let eye = Vec3::new(
        rng.random_range(0.0..SCENE_EXTENT),
        rng.random_range(10.0..400.0),
        rng.random_range(0.0..SCENE_EXTENT),
    );
    let target = Vec3::new(rng.random_range(0.0..SCENE_EXTENT), 0.0, rng.random_range(0.0..SCENE_EXTENT));
    let proj = Mat4::perspective_rh(rng.random_range(30.0f32..90.0).to_radians(), 16.0 / 9.0, 1.0, 2000.0);
    Frustum::from_matrix(&(proj * Mat4::look_at_rh(eye, target, Vec3::Y)), ClipSpace::ZeroToOne)
}

fn orbit_camera(frame: usize, extent: f32) -> Camera {
    let t = frame as f32 * 0.02;
    let center = Vec3::new(extent * 0.5, 0.0, extent * 0.5);
    let eye = center + Vec3::new(t.cos() * extent * 0.35, 250.0, t.sin() * extent * 0.35);
    let proj = Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 1.0, 50_000.0);
    Camera {
        view_projection: proj * Mat4::look_at_rh(eye, center, Vec3::Y),
        position: eye,
        clip_space: ClipSpace::ZeroToOne,
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("terrastream-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("spatial: {}", terrastream_spatial::crate_info());
            println!("lod: {}", terrastream_lod::crate_info());
            println!("stream: {}", terrastream_stream::crate_info());
        }
        Commands::BuildIndex {
            out,
            objects,
            seed,
            leaf_threshold,
            up,
        } => {
            let boxes = scene(objects, seed);
            let config = BuildConfig {
                leaf_threshold,
                orientation: up.into(),
            };
            let start = Instant::now();
            let index = SpatialIndex::build(&boxes, &config);
            let elapsed = start.elapsed();
            index
                .write_to(&out)
                .with_context(|| format!("writing index to {}", out.display()))?;
            println!(
                "Built index: objects={objects}, nodes={}, payloads={}, max_results={}, took {elapsed:?}",
                index.nodes().len(),
                index.payload_count(),
                index.max_results()
            );
            println!("Wrote {}", out.display());
        }
        Commands::Cull {
            index,
            objects,
            seed,
            frustums,
        } => {
            let boxes = scene(objects, seed);
            let index = match index {
                Some(path) => SpatialIndex::read_from(&path)
                    .with_context(|| format!("reading index from {}", path.display()))?,
                None => SpatialIndex::build(&boxes, &BuildConfig::default()),
            };

            let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
            let mut visible_total = 0usize;
            for i in 0..frustums {
                let frustum = random_frustum(&mut rng);
                let mut visible = index
                    .visible_objects(&frustum, Some(boxes.as_slice()))
                    .with_context(|| format!("culling frustum {i}"))?;
                visible.sort_unstable();
                let expected: Vec<u32> = boxes
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| !frustum.is_culled(b))
                    .map(|(id, _)| id as u32)
                    .collect();
                if visible != expected {
                    bail!(
                        "frustum {i}: index returned {} objects, brute force {}",
                        visible.len(),
                        expected.len()
                    );
                }
                visible_total += visible.len();
            }
            println!(
                "Culled {frustums} frustums over {objects} objects: avg visible={:.1}, Match: OK",
                visible_total as f64 / frustums.max(1) as f64
            );
        }
        Commands::Simulate {
            cells,
            fields,
            frames,
            latency,
            edits,
            cache_config,
            lod_config,
        } => {
            let cache_config = match cache_config {
                Some(path) => TileCacheConfig::load(&path)
                    .with_context(|| format!("loading cache config {}", path.display()))?,
                None => TileCacheConfig::default(),
            };
            let lod_config = match lod_config {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading lod config {}", path.display()))?;
                    serde_json::from_str::<LodConfig>(&text)
                        .with_context(|| format!("parsing lod config {}", path.display()))?
                }
                None => LodConfig::default(),
            };
            lod_config.validate()?;

            let layers = cache_config.layer_ids();
            let mut seeder = FrameSeeder::new(CELL_SIZE, lod_config);
            let mut scaffolds = InMemoryScaffolds::new();
            for z in 0..cells {
                for x in 0..cells {
                    let coord = CellCoord::new(x, z);
                    let scaffold = CellScaffold::synthetic(coord, fields, &layers, ELEMENTS_PER_CELL);
                    let mut placement = CellPlacement::new(coord, [0.0, 150.0], fields);
                    placement.holes.extend(scaffold.holes());
                    seeder.register_cell(placement);
                    scaffolds.insert(scaffold);
                }
            }

            let mut cache = TileCache::new(cache_config, scaffolds, SimulatedUploads::new(latency))?;
            let queue = cache.short_circuit_queue();
            let extent = cells as f32 * CELL_SIZE;
            let uber_extent = cells.max(0) as u32 * ELEMENTS_PER_CELL;
            let mut rng = StdRng::seed_from_u64(7);

            let (mut active_total, mut ready_total) = (0usize, 0usize);
            let start = Instant::now();
            for frame in 0..frames {
                for _ in 0..edits {
                    let x = rng.random_range(0..uber_extent.max(1));
                    let z = rng.random_range(0..uber_extent.max(1));
                    let region = UberRegion::new([x, z], [x + 32, z + 32]);
                    queue.queue_short_circuit(LayerId::Heights, region, ResourceViewId(frame as u64));
                }
                let active = seeder.seed(&orbit_camera(frame, extent)).resolve();
                let drawables = cache.update(&active);
                let ready = drawables.iter().filter(|d| d.is_ready()).count();
                tracing::debug!(frame, active = active.len(), ready, "frame");
                active_total += active.len();
                ready_total += ready;
            }
            let elapsed = start.elapsed();

            let frames = frames.max(1);
            println!(
                "Simulated {frames} frames over {cells}x{cells} cells in {elapsed:?}: avg active={:.1}, avg ready={:.1}",
                active_total as f64 / frames as f64,
                ready_total as f64 / frames as f64
            );
            println!("{}", serde_json::to_string_pretty(cache.stats())?);
        }
    }

    Ok(())
}
