use serde::{Deserialize, Serialize};

/// A 2D cell coordinate in the terrain grid (the XZ plane for Y-up worlds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellCoord {
    pub x: i32,
    pub z: i32,
}

impl CellCoord {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub fn offset(self, dx: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.z + dz)
    }
}

/// Identifies one streamed data layer of a terrain cell.
///
/// The height layer is always present; coverage layers (materials, shadows,
/// decoration masks) are configured per renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LayerId {
    Heights,
    Coverage(u32),
}

/// Rectangle in the uber-surface's unbounded element space. `maxs` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UberRegion {
    pub mins: [u32; 2],
    pub maxs: [u32; 2],
}

impl UberRegion {
    pub fn new(mins: [u32; 2], maxs: [u32; 2]) -> Self {
        Self { mins, maxs }
    }

    pub fn is_empty(&self) -> bool {
        self.maxs[0] <= self.mins[0] || self.maxs[1] <= self.mins[1]
    }

    pub fn intersects(&self, other: &UberRegion) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.mins[0] < other.maxs[0]
            && other.mins[0] < self.maxs[0]
            && self.mins[1] < other.maxs[1]
            && other.mins[1] < self.maxs[1]
    }

    /// Overlapping rectangle, or `None` when the regions are disjoint.
    pub fn intersection(&self, other: &UberRegion) -> Option<UberRegion> {
        if !self.intersects(other) {
            return None;
        }
        Some(UberRegion {
            mins: [
                self.mins[0].max(other.mins[0]),
                self.mins[1].max(other.mins[1]),
            ],
            maxs: [
                self.maxs[0].min(other.maxs[0]),
                self.maxs[1].min(other.maxs[1]),
            ],
        })
    }

    pub fn contains(&self, other: &UberRegion) -> bool {
        other.mins[0] >= self.mins[0]
            && other.mins[1] >= self.mins[1]
            && other.maxs[0] <= self.maxs[0]
            && other.maxs[1] <= self.maxs[1]
    }
}
