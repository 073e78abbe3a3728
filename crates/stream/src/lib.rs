//! Terrain tile streaming: keeps the tiles of the active nodes resident in
//! fixed GPU pools and merges editor short-circuits into them.
//!
//! # Invariants
//! - A committed tile is only replaced once its successor is fully populated.
//! - Edits queued before a disk load completes are applied on top of it.
//! - Tiles referenced by the current frame are never evicted.
//! - Completions for evicted or released tiles are discarded.

mod bridge;
mod cache;
mod config;
mod scaffold;
mod tile_set;
mod upload;

pub use bridge::{DrainedEdits, ShortCircuitAbandon, ShortCircuitBridge, ShortCircuitQueue, ShortCircuitUpdate};
pub use cache::{CacheStats, CellRenderInfo, DeferredEdit, Drawable, NodeCoverageInfo, TileCache};
pub use config::{ConfigError, LayerConfig, TileCacheConfig};
pub use scaffold::{
    CellScaffold, Compression, InMemoryScaffolds, LayerScaffold, NodeSource, ScaffoldError, ScaffoldSource,
};
pub use tile_set::{Allocation, TileHandle, TileSet};
pub use upload::{
    HeightRemap, ResourceViewId, SimulatedUploads, UploadId, UploadRequest, UploadService, UploadSource,
    UploadStatus,
};

pub fn crate_info() -> &'static str {
    "terrastream-stream v0.1.0"
}
