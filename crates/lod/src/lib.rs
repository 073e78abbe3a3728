//! Terrain detail selection: seeds one frame's visible cell nodes and decides
//! which of them may render one field coarser.
//!
//! # Invariants
//! - Frames are stateless: every frame seeds a fresh [`CollapseContext`].
//! - A node is promoted at most once per frame.
//! - After [`CollapseContext::resolve`], no two neighbour-linked nodes render
//!   more than one level apart, provided the seeded levels already were.
//! - A neighbour that cannot be resolved blocks promotion; it is never an error.

mod collapse;
mod config;
pub mod field;
mod seeder;

pub use collapse::{ActiveNode, CollapseContext, CollapseNode, NeighbourSlot, NodeId, NodeState};
pub use config::{LodConfig, LodConfigError};
pub use seeder::{Camera, CellPlacement, FrameSeeder, screen_space_edge_length};

pub fn crate_info() -> &'static str {
    "terrastream-lod v0.1.0"
}
