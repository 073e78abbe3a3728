//! Spatial index: a balanced 4-ary partition over static bounding boxes.
//!
//! # Invariants
//! - Every object id appears in exactly one payload.
//! - A node's box is the union of the boxes of every object in its subtree.
//! - Nodes are stored parent-before-child; all links are indices into flat arrays.
//! - The built tree is immutable and can be shared across threads without locking.

mod block;
mod builder;
mod tree;

pub use block::IndexError;
pub use builder::{BuildConfig, Orientation};
pub use tree::{CullError, CullMetrics, PayloadRange, QuadNode, SpatialIndex};

pub fn crate_info() -> &'static str {
    "terrastream-spatial v0.1.0"
}
