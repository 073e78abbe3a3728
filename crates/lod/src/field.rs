//! Node numbering inside one terrain cell.
//!
//! Field `f` is a `2^f x 2^f` grid of nodes. Fields are stored one after the
//! other, coarsest first, so field `f` starts at absolute index `(4^f - 1) / 3`.

/// Deepest field a cell may carry.
pub const MAX_FIELDS: u32 = 16;

pub fn field_width(field: u32) -> u32 {
    1 << field
}

/// Absolute index of the first node of `field`.
pub fn field_begin(field: u32) -> u32 {
    (((1u64 << (2 * field)) - 1) / 3) as u32
}

/// Total node count of a cell carrying `field_count` fields.
pub fn total_nodes(field_count: u32) -> u32 {
    field_begin(field_count)
}

pub fn node_index(field: u32, x: u32, y: u32) -> u32 {
    field_begin(field) + y * field_width(field) + x
}

/// `(field, x, y)` of an absolute node index.
pub fn locate(index: u32) -> (u32, u32, u32) {
    let mut field = 0;
    while field + 1 < MAX_FIELDS && field_begin(field + 1) <= index {
        field += 1;
    }
    let local = index - field_begin(field);
    let width = field_width(field);
    (field, local % width, local / width)
}

/// Node one field coarser covering the same ground.
pub fn parent(index: u32) -> Option<u32> {
    let (field, x, y) = locate(index);
    if field == 0 {
        return None;
    }
    Some(node_index(field - 1, x / 2, y / 2))
}
