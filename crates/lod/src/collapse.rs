use std::collections::HashMap;

use terrastream_common::{CellCoord, INVALID_INDEX};

use crate::field;

/// Identifies one node of one cell registered in the current frame.
///
/// `cell` is the cell's slot in the frame's [`CollapseContext`], not a world
/// coordinate. A reference whose cell slot was never registered can never be
/// resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub lod_field: u32,
    pub node_index: u32,
    pub cell: u32,
}

impl NodeId {
    /// Reference into a cell that is not loaded this frame. Never resolves.
    pub const UNLOADED: NodeId = NodeId {
        lod_field: INVALID_INDEX,
        node_index: INVALID_INDEX,
        cell: INVALID_INDEX,
    };

    pub fn new(lod_field: u32, node_index: u32, cell: u32) -> Self {
        Self {
            lod_field,
            node_index,
            cell,
        }
    }

    /// Same cell and node, whatever field the reference was recorded at.
    pub fn equivalent(&self, other: &NodeId) -> bool {
        self.cell == other.cell && self.node_index == other.node_index
    }
}

/// The eight neighbour slots, two per edge. Top is towards -Z.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighbourSlot {
    TopEdgeLeft,
    TopEdgeRight,
    RightEdgeTop,
    RightEdgeBottom,
    BottomEdgeRight,
    BottomEdgeLeft,
    LeftEdgeBottom,
    LeftEdgeTop,
}

impl NeighbourSlot {
    pub const ALL: [NeighbourSlot; 8] = [
        NeighbourSlot::TopEdgeLeft,
        NeighbourSlot::TopEdgeRight,
        NeighbourSlot::RightEdgeTop,
        NeighbourSlot::RightEdgeBottom,
        NeighbourSlot::BottomEdgeRight,
        NeighbourSlot::BottomEdgeLeft,
        NeighbourSlot::LeftEdgeBottom,
        NeighbourSlot::LeftEdgeTop,
    ];
}

/// Per-frame collapse record for one seeded node.
#[derive(Debug, Clone, PartialEq)]
pub struct CollapseNode {
    pub id: NodeId,
    /// Indexed by [`NeighbourSlot`]. `None` means nothing borders that edge
    /// this frame (culled or a hole).
    pub neighbours: [Option<NodeId>; 8],
    pub entirely_within: bool,
    pub promoted: bool,
    pub screen_space_edge_length: f32,
}

impl CollapseNode {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            neighbours: [None; 8],
            entirely_within: false,
            promoted: false,
            screen_space_edge_length: f32::MAX,
        }
    }

    pub fn neighbour(&self, slot: NeighbourSlot) -> Option<NodeId> {
        self.neighbours[slot as usize]
    }

    /// Level this node renders at: its field, or one coarser once promoted.
    pub fn effective_level(&self) -> u32 {
        self.id.lod_field - self.promoted as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Active,
    Promoted,
}

/// One node the renderer should draw this frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveNode {
    pub id: NodeId,
    pub cell: CellCoord,
    pub state: NodeState,
    pub render_lod: u32,
    /// Absolute index of the node whose tiles are drawn: the node itself, or
    /// its parent when promoted.
    pub tile_node: u32,
    /// Level difference to the neighbours across `[top, right, bottom, left]`,
    /// neighbour minus self. Positive means the neighbour is finer.
    pub neighbour_lod_diffs: [i8; 4],
    pub entirely_within: bool,
    /// Larger values are more urgent to stream.
    pub priority: f32,
}

#[derive(Debug, Clone)]
struct RegisteredCell {
    coord: CellCoord,
    field_count: u32,
}

/// Collects one frame's candidates and resolves their render levels.
#[derive(Debug, Clone)]
pub struct CollapseContext {
    screen_space_edge_threshold: f32,
    cells: Vec<RegisteredCell>,
    fields: Vec<Vec<CollapseNode>>,
    lookup: HashMap<(u32, u32), (u32, usize)>,
}

impl CollapseContext {
    pub fn new(screen_space_edge_threshold: f32) -> Self {
        Self {
            screen_space_edge_threshold,
            cells: Vec::new(),
            fields: Vec::new(),
            lookup: HashMap::new(),
        }
    }

    /// Register a cell for this frame and return its slot.
    pub fn register_cell(&mut self, coord: CellCoord, field_count: u32) -> u32 {
        self.cells.push(RegisteredCell {
            coord,
            field_count: field_count.min(field::MAX_FIELDS),
        });
        (self.cells.len() - 1) as u32
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn cell_coord(&self, cell: u32) -> Option<CellCoord> {
        self.cells.get(cell as usize).map(|c| c.coord)
    }

    /// Seed a candidate. Nodes of unregistered cells, of fields the cell does
    /// not carry, or already seeded are ignored.
    pub fn add_node(&mut self, node: CollapseNode) -> bool {
        let id = node.id;
        let Some(cell) = self.cells.get(id.cell as usize) else {
            return false;
        };
        if id.lod_field >= cell.field_count || self.lookup.contains_key(&(id.cell, id.node_index)) {
            return false;
        }
        let field = id.lod_field as usize;
        if self.fields.len() <= field {
            self.fields.resize_with(field + 1, Vec::new);
        }
        self.lookup
            .insert((id.cell, id.node_index), (id.lod_field, self.fields[field].len()));
        self.fields[field].push(node);
        true
    }

    pub fn node(&self, id: &NodeId) -> Option<&CollapseNode> {
        let &(field, index) = self.lookup.get(&(id.cell, id.node_index))?;
        self.fields.get(field as usize)?.get(index)
    }

    /// Seeded nodes of one field, in insertion order.
    pub fn field_nodes(&self, lod: u32) -> &[CollapseNode] {
        self.fields.get(lod as usize).map_or(&[], Vec::as_slice)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &CollapseNode> {
        self.fields.iter().flatten()
    }

    /// Try to render every small-enough node of field `lod` one field coarser.
    ///
    /// Nodes are visited in insertion order and a promotion is visible to the
    /// checks of every later node. A node is refused when any neighbour slot
    /// cannot be resolved, or when a resolved neighbour would end up more
    /// than one level away. Returns the number of promotions.
    pub fn attempt_lod_promote(&mut self, lod: u32) -> usize {
        if lod == 0 {
            return 0;
        }
        let target = lod - 1;
        let count = self.field_nodes(lod).len();
        let mut promoted = 0;

        for i in 0..count {
            let node = &self.fields[lod as usize][i];
            let small = node.screen_space_edge_length < self.screen_space_edge_threshold;
            if node.promoted || !small {
                continue;
            }
            let neighbours = node.neighbours;
            let id = node.id;

            let blocked = neighbours.iter().flatten().find(|n| {
                match self.node(n) {
                    None => true,
                    Some(other) => other.effective_level().abs_diff(target) > 1,
                }
            });
            if let Some(blocker) = blocked {
                tracing::trace!(?id, ?blocker, "promotion refused");
                continue;
            }

            self.fields[lod as usize][i].promoted = true;
            promoted += 1;
        }
        promoted
    }

    /// Resolve every field, coarsest first, and list what to draw.
    pub fn resolve(&mut self) -> Vec<ActiveNode> {
        let _span = tracing::info_span!("lod_resolve", cells = self.cells.len()).entered();

        let mut promoted = 0;
        for lod in 0..self.fields.len() as u32 {
            promoted += self.attempt_lod_promote(lod);
        }

        let active: Vec<ActiveNode> = self.nodes().filter_map(|n| self.active_node(n)).collect();
        tracing::debug!(active = active.len(), promoted, "lod resolve complete");
        active
    }

    fn active_node(&self, node: &CollapseNode) -> Option<ActiveNode> {
        let cell = self.cells.get(node.id.cell as usize)?;
        let (state, tile_node) = if node.promoted {
            (NodeState::Promoted, field::parent(node.id.node_index)?)
        } else {
            (NodeState::Active, node.id.node_index)
        };
        Some(ActiveNode {
            id: node.id,
            cell: cell.coord,
            state,
            render_lod: node.effective_level(),
            tile_node,
            neighbour_lod_diffs: self.neighbour_lod_diffs(node),
            entirely_within: node.entirely_within,
            priority: node.screen_space_edge_length,
        })
    }

    fn neighbour_lod_diffs(&self, node: &CollapseNode) -> [i8; 4] {
        let own = node.effective_level() as i32;
        let mut diffs = [0i8; 4];
        for (edge, diff) in diffs.iter_mut().enumerate() {
            let level = |slot: usize| {
                node.neighbours[slot]
                    .and_then(|n| self.node(&n))
                    .map(|n| n.effective_level() as i32 - own)
            };
            let widest = match (level(edge * 2), level(edge * 2 + 1)) {
                (Some(a), Some(b)) if b.abs() > a.abs() => b,
                (Some(a), _) => a,
                (None, Some(b)) => b,
                (None, None) => 0,
            };
            *diff = widest as i8;
        }
        diffs
    }
}
