use std::collections::{HashMap, HashSet};

use glam::{Mat4, Vec3, Vec4};
use terrastream_common::{Aabb, CellCoord, ClipSpace, Containment, Frustum};

use crate::collapse::{CollapseContext, CollapseNode, NeighbourSlot, NodeId};
use crate::config::LodConfig;
use crate::field::{self, MAX_FIELDS};

/// A terrain cell available for rendering this frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CellPlacement {
    pub coord: CellCoord,
    /// World-space height span of the whole cell.
    pub height_range: [f32; 2],
    pub field_count: u32,
    /// Absolute indices of nodes without data.
    pub holes: HashSet<u32>,
}

impl CellPlacement {
    pub fn new(coord: CellCoord, height_range: [f32; 2], field_count: u32) -> Self {
        Self {
            coord,
            height_range,
            field_count,
            holes: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub view_projection: Mat4,
    pub position: Vec3,
    pub clip_space: ClipSpace,
}

/// Node edge sample grid: a cell is `2^(MAX_FIELDS + 1)` units wide, so a
/// quarter of any node edge is at least one unit.
const CELL_UNITS: i64 = 1 << (MAX_FIELDS + 1);

/// Seeds a [`CollapseContext`] from the cells registered for a frame.
///
/// Each cell seeds every visible node of one field picked from its distance
/// to the camera. Adjacent cells are kept within one field of each other so
/// that the seeded levels already satisfy the neighbour bound.
#[derive(Debug, Clone)]
pub struct FrameSeeder {
    cell_size: f32,
    config: LodConfig,
    cells: Vec<CellPlacement>,
}

struct Seeded {
    cell: u32,
    field: u32,
    x: u32,
    y: u32,
    node: CollapseNode,
}

impl FrameSeeder {
    pub fn new(cell_size: f32, config: LodConfig) -> Self {
        Self {
            cell_size,
            config,
            cells: Vec::new(),
        }
    }

    pub fn config(&self) -> &LodConfig {
        &self.config
    }

    pub fn register_cell(&mut self, placement: CellPlacement) {
        if placement.field_count == 0 {
            tracing::debug!(coord = ?placement.coord, "cell has no node fields, skipped");
            return;
        }
        self.cells.push(placement);
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    pub fn cell_bounds(&self, placement: &CellPlacement) -> Aabb {
        let origin = self.cell_origin(placement.coord);
        Aabb::new(
            Vec3::new(origin.x, placement.height_range[0], origin.y),
            Vec3::new(
                origin.x + self.cell_size,
                placement.height_range[1],
                origin.y + self.cell_size,
            ),
        )
    }

    /// Cull, measure and link every candidate node for this camera.
    pub fn seed(&self, camera: &Camera) -> CollapseContext {
        let _span = tracing::info_span!("lod_seed", cells = self.cells.len()).entered();
        let frustum = Frustum::from_matrix(&camera.view_projection, camera.clip_space);
        let mut ctx = CollapseContext::new(self.config.screen_space_edge_threshold);

        // Slot numbers double as indices into `placements`.
        let mut slots: HashMap<CellCoord, u32> = HashMap::with_capacity(self.cells.len());
        let mut placements: Vec<&CellPlacement> = Vec::with_capacity(self.cells.len());
        for placement in &self.cells {
            if slots.contains_key(&placement.coord) {
                tracing::warn!(coord = ?placement.coord, "cell registered twice, keeping the first");
                continue;
            }
            let slot = ctx.register_cell(placement.coord, placement.field_count);
            slots.insert(placement.coord, slot);
            placements.push(placement);
        }
        let fields = self.restricted_fields(&placements, &slots, camera.position);

        let mut seeded: Vec<Seeded> = Vec::new();
        let mut present: HashSet<(u32, u32)> = HashSet::new();
        for (slot, placement) in placements.iter().enumerate() {
            self.seed_cell(slot as u32, placement, fields[slot], camera, &frustum, &mut seeded);
        }
        for s in &seeded {
            present.insert((s.cell, s.node.id.node_index));
        }

        let lookup = NeighbourLookup {
            slots: &slots,
            placements: &placements,
            fields: &fields,
            present: &present,
        };
        let seeded_count = seeded.len();
        for mut s in seeded {
            let base = placements[s.cell as usize].coord;
            s.node.neighbours = lookup.neighbours(base, s.field, s.x, s.y);
            ctx.add_node(s.node);
        }

        tracing::debug!(nodes = seeded_count, "frame seeded");
        ctx
    }

    fn cell_origin(&self, coord: CellCoord) -> glam::Vec2 {
        glam::Vec2::new(coord.x as f32 * self.cell_size, coord.z as f32 * self.cell_size)
    }

    /// Field per cell from camera distance, then lowered until every pair of
    /// edge-adjacent cells is within one field.
    fn restricted_fields(
        &self,
        placements: &[&CellPlacement],
        slots: &HashMap<CellCoord, u32>,
        eye: Vec3,
    ) -> Vec<u32> {
        let mut fields: Vec<u32> = placements
            .iter()
            .map(|p| {
                let finest = p.field_count.min(self.config.max_fields.clamp(1, MAX_FIELDS)) - 1;
                let bounds = self.cell_bounds(p);
                let distance = eye.distance(eye.clamp(bounds.min, bounds.max));
                let steps = (distance / self.config.detail_distance).max(1.0).log2().floor();
                finest.saturating_sub(steps as u32)
            })
            .collect();

        let mut changed = true;
        while changed {
            changed = false;
            for (i, placement) in placements.iter().enumerate() {
                for (dx, dz) in [(0, -1), (1, 0), (0, 1), (-1, 0)] {
                    let Some(&j) = slots.get(&placement.coord.offset(dx, dz)) else {
                        continue;
                    };
                    let limit = fields[j as usize] + 1;
                    if fields[i] > limit {
                        fields[i] = limit;
                        changed = true;
                    }
                }
            }
        }
        fields
    }

    /// Walk the cell's quad-tree from the root down to `lod`, dropping culled
    /// subtrees. Nodes come out in row-major order of their field.
    fn seed_cell(
        &self,
        slot: u32,
        placement: &CellPlacement,
        lod: u32,
        camera: &Camera,
        frustum: &Frustum,
        out: &mut Vec<Seeded>,
    ) {
        let origin = self.cell_origin(placement.coord);
        let [low, high] = placement.height_range;
        let viewport = self.config.viewport;
        let start = out.len();

        let mut stack = vec![(0u32, 0u32, 0u32, false)];
        while let Some((level, x, y, inside)) = stack.pop() {
            let span = self.cell_size / field::field_width(level) as f32;
            let min = Vec3::new(origin.x + x as f32 * span, low, origin.y + y as f32 * span);
            let max = Vec3::new(min.x + span, high, min.z + span);
            let containment = if inside {
                Containment::Within
            } else {
                frustum.classify(&Aabb::new(min, max))
            };
            if containment == Containment::Culled {
                continue;
            }
            let inside = containment == Containment::Within;

            if level < lod {
                for (cx, cy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    stack.push((level + 1, 2 * x + cx, 2 * y + cy, inside));
                }
                continue;
            }

            let index = field::node_index(lod, x, y);
            if placement.holes.contains(&index) {
                continue;
            }
            let mut node = CollapseNode::new(NodeId::new(lod, index, slot));
            node.entirely_within = inside;
            let mid = 0.5 * (low + high);
            node.screen_space_edge_length = screen_space_edge_length(
                &camera.view_projection,
                [
                    Vec3::new(min.x, mid, min.z),
                    Vec3::new(max.x, mid, min.z),
                    Vec3::new(max.x, mid, max.z),
                    Vec3::new(min.x, mid, max.z),
                ],
                viewport,
            );
            out.push(Seeded {
                cell: slot,
                field: lod,
                x,
                y,
                node,
            });
        }
        out[start..].sort_unstable_by_key(|s| s.node.id.node_index);
    }
}

struct NeighbourLookup<'a> {
    slots: &'a HashMap<CellCoord, u32>,
    placements: &'a [&'a CellPlacement],
    fields: &'a [u32],
    present: &'a HashSet<(u32, u32)>,
}

impl NeighbourLookup<'_> {
    fn neighbours(&self, cell: CellCoord, lod: u32, x: u32, y: u32) -> [Option<NodeId>; 8] {
        let span = CELL_UNITS >> lod;
        let q = span / 4;
        let left = cell.x as i64 * CELL_UNITS + x as i64 * span;
        let top = cell.z as i64 * CELL_UNITS + y as i64 * span;
        let right = left + span;
        let bottom = top + span;

        let mut out = [None; 8];
        for slot in NeighbourSlot::ALL {
            let (px, pz) = match slot {
                NeighbourSlot::TopEdgeLeft => (left + q, top - 1),
                NeighbourSlot::TopEdgeRight => (left + 3 * q, top - 1),
                NeighbourSlot::RightEdgeTop => (right, top + q),
                NeighbourSlot::RightEdgeBottom => (right, top + 3 * q),
                NeighbourSlot::BottomEdgeRight => (left + 3 * q, bottom),
                NeighbourSlot::BottomEdgeLeft => (left + q, bottom),
                NeighbourSlot::LeftEdgeBottom => (left - 1, top + 3 * q),
                NeighbourSlot::LeftEdgeTop => (left - 1, top + q),
            };
            out[slot as usize] = self.node_at(px, pz);
        }
        out
    }

    fn node_at(&self, px: i64, pz: i64) -> Option<NodeId> {
        let coord = CellCoord::new(px.div_euclid(CELL_UNITS) as i32, pz.div_euclid(CELL_UNITS) as i32);
        let Some(&slot) = self.slots.get(&coord) else {
            return Some(NodeId::UNLOADED);
        };
        debug_assert_eq!(self.placements[slot as usize].coord, coord);
        let lod = self.fields[slot as usize];
        let shift = MAX_FIELDS + 1 - lod;
        let x = (px.rem_euclid(CELL_UNITS) >> shift) as u32;
        let y = (pz.rem_euclid(CELL_UNITS) >> shift) as u32;
        let index = field::node_index(lod, x, y);
        self.present
            .contains(&(slot, index))
            .then(|| NodeId::new(lod, index, slot))
    }
}

/// Longest projected edge of a node quad, in pixels. Quads reaching behind
/// the eye count as infinitely large.
pub fn screen_space_edge_length(view_projection: &Mat4, corners: [Vec3; 4], viewport: [u32; 2]) -> f32 {
    let half = glam::Vec2::new(viewport[0] as f32, viewport[1] as f32) * 0.5;
    let mut projected = [glam::Vec2::ZERO; 4];
    for (out, corner) in projected.iter_mut().zip(corners) {
        let clip: Vec4 = *view_projection * corner.extend(1.0);
        if clip.w <= f32::EPSILON {
            return f32::MAX;
        }
        *out = glam::Vec2::new(clip.x / clip.w, clip.y / clip.w) * half;
    }
    (0..4)
        .map(|i| projected[i].distance(projected[(i + 1) % 4]))
        .fold(0.0, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collapse::NodeState;

    fn overhead_camera(center: Vec3, height: f32) -> Camera {
        let eye = center + Vec3::new(0.0, height, 0.0);
        let proj = Mat4::perspective_rh(70f32.to_radians(), 16.0 / 9.0, 1.0, 50_000.0);
        let view = Mat4::look_at_rh(eye, center, Vec3::NEG_Z);
        Camera {
            view_projection: proj * view,
            position: eye,
            clip_space: ClipSpace::ZeroToOne,
        }
    }

    fn config(threshold: f32) -> LodConfig {
        LodConfig {
            screen_space_edge_threshold: threshold,
            detail_distance: 100_000.0,
            ..LodConfig::default()
        }
    }

    #[test]
    fn single_cell_links_interior_and_marks_border_unloaded() {
        let mut seeder = FrameSeeder::new(256.0, config(1.0));
        seeder.register_cell(CellPlacement::new(CellCoord::new(0, 0), [0.0, 10.0], 3));
        let ctx = seeder.seed(&overhead_camera(Vec3::new(128.0, 0.0, 128.0), 600.0));

        // Close camera and huge detail distance: finest field, all 16 nodes.
        assert_eq!(ctx.field_nodes(2).len(), 16);
        let corner = &ctx.field_nodes(2)[0];
        assert_eq!(corner.neighbour(NeighbourSlot::TopEdgeLeft), Some(NodeId::UNLOADED));
        assert_eq!(corner.neighbour(NeighbourSlot::LeftEdgeTop), Some(NodeId::UNLOADED));
        let right = corner.neighbour(NeighbourSlot::RightEdgeTop).unwrap();
        assert_eq!(right.node_index, field::node_index(2, 1, 0));
        let below = corner.neighbour(NeighbourSlot::BottomEdgeLeft).unwrap();
        assert_eq!(below.node_index, field::node_index(2, 0, 1));
    }

    #[test]
    fn border_nodes_keep_their_level() {
        let mut seeder = FrameSeeder::new(256.0, config(10_000.0));
        seeder.register_cell(CellPlacement::new(CellCoord::new(0, 0), [0.0, 10.0], 3));
        let mut ctx = seeder.seed(&overhead_camera(Vec3::new(128.0, 0.0, 128.0), 600.0));
        let active = ctx.resolve();

        let promoted: Vec<_> = active.iter().filter(|n| n.state == NodeState::Promoted).collect();
        // Only the 2x2 interior has all neighbours loaded.
        assert_eq!(promoted.len(), 4);
        for n in promoted {
            let (_, x, y) = field::locate(n.id.node_index);
            assert!((1..=2).contains(&x) && (1..=2).contains(&y));
        }
    }

    #[test]
    fn holes_are_skipped_and_leave_open_slots() {
        let mut seeder = FrameSeeder::new(256.0, config(1.0));
        let mut placement = CellPlacement::new(CellCoord::new(0, 0), [0.0, 10.0], 2);
        placement.holes.insert(field::node_index(1, 1, 0));
        seeder.register_cell(placement);
        let ctx = seeder.seed(&overhead_camera(Vec3::new(128.0, 0.0, 128.0), 600.0));

        assert_eq!(ctx.field_nodes(1).len(), 3);
        let first = &ctx.field_nodes(1)[0];
        assert_eq!(first.neighbour(NeighbourSlot::RightEdgeTop), None);
    }

    #[test]
    fn adjacent_cells_stay_within_one_field() {
        let mut seeder = FrameSeeder::new(
            100.0,
            LodConfig {
                detail_distance: 50.0,
                ..LodConfig::default()
            },
        );
        for x in 0..8 {
            seeder.register_cell(CellPlacement::new(CellCoord::new(x, 0), [0.0, 5.0], 6));
        }
        let eye = Vec3::new(10.0, 20.0, 50.0);
        let proj = Mat4::perspective_rh(80f32.to_radians(), 2.0, 1.0, 10_000.0);
        let view = Mat4::look_at_rh(eye, Vec3::new(800.0, 0.0, 50.0), Vec3::Y);
        let camera = Camera {
            view_projection: proj * view,
            position: eye,
            clip_space: ClipSpace::ZeroToOne,
        };
        let ctx = seeder.seed(&camera);

        let mut per_cell = vec![None; 8];
        for node in ctx.nodes() {
            let coord = ctx.cell_coord(node.id.cell).unwrap();
            per_cell[coord.x as usize] = Some(node.id.lod_field);
        }
        let fields: Vec<u32> = per_cell.into_iter().flatten().collect();
        assert!(fields.len() >= 2);
        assert!(fields.windows(2).all(|w| w[0].abs_diff(w[1]) <= 1));
        assert!(fields[0] > *fields.last().unwrap());
    }

    #[test]
    fn camera_facing_away_seeds_nothing() {
        let mut seeder = FrameSeeder::new(256.0, LodConfig::default());
        seeder.register_cell(CellPlacement::new(CellCoord::new(0, 0), [0.0, 10.0], 4));
        let eye = Vec3::new(-100.0, 5.0, 128.0);
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 1.0, 1000.0);
        let view = Mat4::look_at_rh(eye, Vec3::new(-500.0, 5.0, 128.0), Vec3::Y);
        let ctx = seeder.seed(&Camera {
            view_projection: proj * view,
            position: eye,
            clip_space: ClipSpace::ZeroToOne,
        });
        assert_eq!(ctx.nodes().count(), 0);
    }

    fn oblique_camera() -> Camera {
        let eye = Vec3::new(-40.0, 60.0, 90.0);
        let proj = Mat4::perspective_rh(45f32.to_radians(), 16.0 / 9.0, 1.0, 5000.0);
        let view = Mat4::look_at_rh(eye, Vec3::new(200.0, 0.0, 60.0), Vec3::Y);
        Camera {
            view_projection: proj * view,
            position: eye,
            clip_space: ClipSpace::ZeroToOne,
        }
    }

    #[test]
    fn descent_matches_flat_scan() {
        let mut seeder = FrameSeeder::new(256.0, config(1.0));
        seeder.register_cell(CellPlacement::new(CellCoord::new(0, 0), [0.0, 10.0], 6));
        let camera = oblique_camera();
        let ctx = seeder.seed(&camera);

        let frustum = Frustum::from_matrix(&camera.view_projection, camera.clip_space);
        let width = field::field_width(5);
        let span = 256.0 / width as f32;
        let mut expected = Vec::new();
        for y in 0..width {
            for x in 0..width {
                let min = Vec3::new(x as f32 * span, 0.0, y as f32 * span);
                let bounds = Aabb::new(min, min + Vec3::new(span, 10.0, span));
                if !frustum.is_culled(&bounds) {
                    expected.push(field::node_index(5, x, y));
                }
            }
        }
        let seeded: Vec<u32> = ctx.field_nodes(5).iter().map(|n| n.id.node_index).collect();
        assert!(!expected.is_empty() && expected.len() < (width * width) as usize);
        assert_eq!(seeded, expected);
    }

    #[test]
    fn deep_cells_seed_at_most_max_fields() {
        let mut seeder = FrameSeeder::new(256.0, config(1.0));
        seeder.register_cell(CellPlacement::new(CellCoord::new(0, 0), [0.0, 10.0], MAX_FIELDS));
        let ctx = seeder.seed(&overhead_camera(Vec3::new(128.0, 0.0, 128.0), 600.0));

        let deepest = LodConfig::default().max_fields - 1;
        assert!(ctx.nodes().all(|n| n.id.lod_field == deepest));
        assert_eq!(ctx.field_nodes(deepest).len(), (field::field_width(deepest) as usize).pow(2));
    }

    #[test]
    fn edge_length_grows_when_closer() {
        let corners = [
            Vec3::new(-1.0, 0.0, -1.0),
            Vec3::new(1.0, 0.0, -1.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(-1.0, 0.0, 1.0),
        ];
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 1000.0);
        let near = proj * Mat4::look_at_rh(Vec3::new(0.0, 10.0, 0.0), Vec3::ZERO, Vec3::NEG_Z);
        let far = proj * Mat4::look_at_rh(Vec3::new(0.0, 100.0, 0.0), Vec3::ZERO, Vec3::NEG_Z);
        let a = screen_space_edge_length(&near, corners, [1000, 1000]);
        let b = screen_space_edge_length(&far, corners, [1000, 1000]);
        assert!(a > b * 5.0);
    }
}
