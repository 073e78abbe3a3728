//! Shared types for the terrain streaming core.
//!
//! # Invariants
//! - Boxes are inclusive on both ends (`min <= max` on every axis for a valid box).
//! - Uber-surface regions are half-open (`mins` inclusive, `maxs` exclusive).

mod bounds;
mod frustum;
mod types;

pub use bounds::Aabb;
pub use frustum::{ClipSpace, Containment, Frustum};
pub use types::{CellCoord, LayerId, UberRegion};

/// Sentinel used by every flat, index-linked structure in the workspace.
pub const INVALID_INDEX: u32 = u32::MAX;
