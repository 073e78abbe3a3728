use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use terrastream_common::{CellCoord, LayerId, UberRegion};
use terrastream_lod::field;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScaffoldError {
    #[error("no scaffold for cell ({}, {})", .0.x, .0.z)]
    Missing(CellCoord),
    #[error("scaffold for cell ({}, {}) is corrupt: {reason}", .coord.x, .coord.z)]
    Corrupt { coord: CellCoord, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How a node's payload is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    /// 16-bit samples; `value = min + sample * scale`.
    Quantized { min: f32, scale: f32 },
}

/// Where one node's tile lives inside the cell's source file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeSource {
    pub file_offset: u64,
    pub data_size: u32,
    pub dimensions_in_elements: u32,
    pub compression: Compression,
}

/// Per-layer scaffold: the cell's footprint in the layer's uber surface and
/// the source of every node, indexed by absolute node index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerScaffold {
    pub layer: LayerId,
    pub uber_region: UberRegion,
    pub field_count: u32,
    pub nodes: Vec<Option<NodeSource>>,
}

impl LayerScaffold {
    pub fn node_source(&self, node_index: u32) -> Option<&NodeSource> {
        self.nodes.get(node_index as usize)?.as_ref()
    }

    /// Footprint of `node_index` in uber-surface elements.
    pub fn node_region(&self, node_index: u32) -> Option<UberRegion> {
        if node_index >= field::total_nodes(self.field_count) {
            return None;
        }
        let (f, x, y) = field::locate(node_index);
        let width = u64::from(field::field_width(f));
        let span = |axis: usize, i: u32| {
            let lo = u64::from(self.uber_region.mins[axis]);
            let extent = u64::from(self.uber_region.maxs[axis]).saturating_sub(lo);
            let a = lo + extent * u64::from(i) / width;
            let b = lo + extent * u64::from(i + 1) / width;
            (a as u32, b as u32)
        };
        let (x0, x1) = span(0, x);
        let (y0, y1) = span(1, y);
        Some(UberRegion::new([x0, y0], [x1, y1]))
    }
}

/// Everything the cache needs to stream one cell's tiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellScaffold {
    pub coord: CellCoord,
    pub layers: Vec<LayerScaffold>,
}

impl CellScaffold {
    pub fn layer(&self, layer: LayerId) -> Option<&LayerScaffold> {
        self.layers.iter().find(|l| l.layer == layer)
    }

    pub fn field_count(&self) -> u32 {
        self.layer(LayerId::Heights).map_or(0, |l| l.field_count)
    }

    /// Reject layers whose footprint is inverted or whose node numbering
    /// would not fit the field layout.
    pub fn validate(&self) -> Result<(), ScaffoldError> {
        let corrupt = |reason: String| ScaffoldError::Corrupt {
            coord: self.coord,
            reason,
        };
        for layer in &self.layers {
            let region = layer.uber_region;
            if region.maxs[0] < region.mins[0] || region.maxs[1] < region.mins[1] {
                return Err(corrupt(format!("{:?} uber region {region:?} is inverted", layer.layer)));
            }
            if layer.field_count > field::MAX_FIELDS {
                return Err(corrupt(format!(
                    "{:?} carries {} fields, at most {} supported",
                    layer.layer,
                    layer.field_count,
                    field::MAX_FIELDS
                )));
            }
        }
        Ok(())
    }

    /// Height nodes with no source data. These are holes in the terrain.
    pub fn holes(&self) -> Vec<u32> {
        let Some(heights) = self.layer(LayerId::Heights) else {
            return Vec::new();
        };
        heights
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// A fully populated scaffold with contiguous node payloads. Layer `i`
    /// occupies the `i`-th uber surface at `cell * elements_per_cell`.
    pub fn synthetic(coord: CellCoord, field_count: u32, layers: &[LayerId], elements_per_cell: u32) -> Self {
        let total = field::total_nodes(field_count);
        let origin = |c: i32| (c.max(0) as u32).saturating_mul(elements_per_cell);
        let mins = [origin(coord.x), origin(coord.z)];
        let region = UberRegion::new(
            mins,
            [mins[0].saturating_add(elements_per_cell), mins[1].saturating_add(elements_per_cell)],
        );
        let layers = layers
            .iter()
            .map(|&layer| {
                let compression = match layer {
                    LayerId::Heights => Compression::Quantized { min: 0.0, scale: 1.0 / 64.0 },
                    LayerId::Coverage(_) => Compression::None,
                };
                let mut offset = 0u64;
                let nodes = (0..total)
                    .map(|_| {
                        let source = NodeSource {
                            file_offset: offset,
                            data_size: 33 * 33 * 2,
                            dimensions_in_elements: 33,
                            compression,
                        };
                        offset += u64::from(source.data_size);
                        Some(source)
                    })
                    .collect();
                LayerScaffold {
                    layer,
                    uber_region: region,
                    field_count,
                    nodes,
                }
            })
            .collect();
        Self { coord, layers }
    }
}

/// Produces cell scaffolds on demand. Implementations usually read the
/// cell's scaffold file; loading failures are reported, never fatal.
pub trait ScaffoldSource {
    fn load_scaffold(&self, coord: CellCoord) -> Result<Arc<CellScaffold>, ScaffoldError>;
}

/// Scaffolds kept in memory, keyed by cell.
#[derive(Debug, Default, Clone)]
pub struct InMemoryScaffolds {
    cells: HashMap<CellCoord, Arc<CellScaffold>>,
}

impl InMemoryScaffolds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scaffold: CellScaffold) {
        self.cells.insert(scaffold.coord, Arc::new(scaffold));
    }

    pub fn remove(&mut self, coord: CellCoord) -> Option<Arc<CellScaffold>> {
        self.cells.remove(&coord)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CellScaffold> {
        self.cells.values().map(|c| c.as_ref())
    }
}

impl ScaffoldSource for InMemoryScaffolds {
    fn load_scaffold(&self, coord: CellCoord) -> Result<Arc<CellScaffold>, ScaffoldError> {
        let scaffold = self.cells.get(&coord).ok_or(ScaffoldError::Missing(coord))?;
        scaffold.validate()?;
        Ok(Arc::clone(scaffold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_regions_tile_the_cell() {
        let scaffold = CellScaffold::synthetic(CellCoord::new(1, 2), 3, &[LayerId::Heights], 256);
        let heights = scaffold.layer(LayerId::Heights).unwrap();
        assert_eq!(heights.uber_region, UberRegion::new([256, 512], [512, 768]));

        assert_eq!(heights.node_region(0), Some(heights.uber_region));
        // Field 1 splits the cell into four quadrants.
        let q: Vec<_> = (1..5).map(|i| heights.node_region(i).unwrap()).collect();
        assert_eq!(q[0], UberRegion::new([256, 512], [384, 640]));
        assert_eq!(q[3], UberRegion::new([384, 640], [512, 768]));
        for a in 0..4 {
            for b in (a + 1)..4 {
                assert!(!q[a].intersects(&q[b]));
            }
        }
        assert!(heights.node_region(field::total_nodes(3)).is_none());
    }

    #[test]
    fn missing_nodes_are_holes() {
        let mut scaffold = CellScaffold::synthetic(CellCoord::new(0, 0), 2, &[LayerId::Heights, LayerId::Coverage(0)], 64);
        scaffold.layers[0].nodes[3] = None;
        assert_eq!(scaffold.holes(), vec![3]);
        assert!(scaffold.layer(LayerId::Coverage(0)).unwrap().node_source(3).is_some());
        assert_eq!(scaffold.field_count(), 2);
    }

    #[test]
    fn in_memory_source_reports_missing_cells() {
        let mut source = InMemoryScaffolds::new();
        source.insert(CellScaffold::synthetic(CellCoord::new(0, 0), 1, &[LayerId::Heights], 32));
        assert!(source.load_scaffold(CellCoord::new(0, 0)).is_ok());
        assert!(matches!(
            source.load_scaffold(CellCoord::new(4, 4)),
            Err(ScaffoldError::Missing(_))
        ));
    }

    #[test]
    fn inverted_region_is_corrupt() {
        let mut scaffold = CellScaffold::synthetic(CellCoord::new(1, 0), 2, &[LayerId::Heights], 64);
        scaffold.layers[0].uber_region = UberRegion::new([128, 0], [64, 64]);
        assert!(scaffold.layers[0].node_region(1).is_some_and(|r| r.is_empty()));

        let mut source = InMemoryScaffolds::new();
        source.insert(scaffold);
        assert!(matches!(
            source.load_scaffold(CellCoord::new(1, 0)),
            Err(ScaffoldError::Corrupt { .. })
        ));
    }

    #[test]
    fn scaffold_serializes() {
        let scaffold = CellScaffold::synthetic(CellCoord::new(2, 0), 1, &[LayerId::Coverage(1)], 16);
        let json = serde_json::to_string(&scaffold).unwrap();
        let back: CellScaffold = serde_json::from_str(&json).unwrap();
        assert_eq!(back, scaffold);
    }
}
