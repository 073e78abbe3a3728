use serde::{Deserialize, Serialize};
use terrastream_common::{Aabb, INVALID_INDEX};

use crate::tree::{PayloadRange, QuadNode, SpatialIndex};

/// Which world axis is "up". The tree partitions the two remaining axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    ZUp,
    #[default]
    YUp,
}

impl Orientation {
    fn axes(self) -> (usize, usize) {
        match self {
            Orientation::ZUp => (0, 1),
            Orientation::YUp => (0, 2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Nodes holding at most this many objects become leaves.
    pub leaf_threshold: u32,
    pub orientation: Orientation,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            leaf_threshold: 12,
            orientation: Orientation::YUp,
        }
    }
}

/// Index of the bucket for objects kept on the node itself.
const OVERFLOW: usize = 4;

struct PendingNode {
    parent: u32,
    child_slot: usize,
    depth: u32,
    objects: Vec<u32>,
}

struct Builder<'a> {
    boxes: &'a [Aabb],
    threshold: usize,
    axes: (usize, usize),
    index: SpatialIndex,
}

impl SpatialIndex {
    /// Build a tree over `boxes`. Object ids are indices into `boxes`.
    ///
    /// Nodes come out in parent-before-child pre-order, children visited in
    /// slot order. An empty input yields a single root leaf without a payload.
    pub fn build(boxes: &[Aabb], config: &BuildConfig) -> Self {
        let _span = tracing::info_span!("spatial_build", objects = boxes.len()).entered();

        let mut builder = Builder {
            boxes,
            threshold: config.leaf_threshold.max(1) as usize,
            axes: config.orientation.axes(),
            index: SpatialIndex {
                nodes: Vec::new(),
                payloads: Vec::new(),
                objects: Vec::with_capacity(boxes.len()),
                max_cull_results: 0,
            },
        };

        if boxes.is_empty() {
            builder.index.nodes.push(QuadNode::new(&Aabb::EMPTY, 0));
            return builder.index;
        }

        let mut stack = vec![PendingNode {
            parent: INVALID_INDEX,
            child_slot: 0,
            depth: 0,
            objects: (0..boxes.len() as u32).collect(),
        }];
        while let Some(pending) = stack.pop() {
            builder.push_node(pending, &mut stack);
        }

        let mut index = builder.index;
        index.max_cull_results = index.payloads.iter().map(|p| p.count).sum();
        tracing::debug!(
            nodes = index.nodes.len(),
            payloads = index.payloads.len(),
            max_results = index.max_cull_results,
            "spatial index built"
        );
        index
    }
}

impl Builder<'_> {
    fn push_node(&mut self, pending: PendingNode, stack: &mut Vec<PendingNode>) {
        let bounds = self.bounds_of(&pending.objects);
        let node_index = self.index.nodes.len() as u32;
        self.index.nodes.push(QuadNode::new(&bounds, pending.depth));
        if pending.parent != INVALID_INDEX {
            self.index.nodes[pending.parent as usize].children[pending.child_slot] = node_index;
        }

        if pending.objects.len() <= self.threshold {
            self.attach_payload(node_index, &pending.objects);
            return;
        }

        let (axis0, axis1) = self.axes;
        let line0 = self.dividing_line(&pending.objects, &bounds, axis0);
        let line1 = self.dividing_line(&pending.objects, &bounds, axis1);
        let mut buckets = self.divide(&pending.objects, &bounds, line0, line1);
        self.merge_buckets(&mut buckets);

        let empty = buckets.iter().filter(|b| b.is_empty()).count();
        if empty == 4 && buckets[OVERFLOW].is_empty() {
            // Every object lands in one child; recursing would never terminate.
            if let Some(slot) = buckets[..OVERFLOW].iter().position(|b| !b.is_empty()) {
                buckets.swap(slot, OVERFLOW);
            }
        }

        if !buckets[OVERFLOW].is_empty() {
            self.attach_payload(node_index, &buckets[OVERFLOW]);
        }

        // Reverse push so slot 0 is popped, and therefore numbered, first.
        for slot in (0..OVERFLOW).rev() {
            let objects = std::mem::take(&mut buckets[slot]);
            if !objects.is_empty() {
                stack.push(PendingNode {
                    parent: node_index,
                    child_slot: slot,
                    depth: pending.depth + 1,
                    objects,
                });
            }
        }
    }

    fn bounds_of(&self, objects: &[u32]) -> Aabb {
        objects.iter().map(|&id| &self.boxes[id as usize]).collect()
    }

    fn attach_payload(&mut self, node_index: u32, objects: &[u32]) {
        let index = &mut self.index;
        index.nodes[node_index as usize].payload = index.payloads.len() as u32;
        index.payloads.push(PayloadRange {
            offset: index.objects.len() as u32,
            count: objects.len() as u32,
        });
        index.objects.extend_from_slice(objects);
    }

    /// Median centre line, then nudged onto nearby box edges that cut fewer objects.
    fn dividing_line(&self, objects: &[u32], bounds: &Aabb, axis: usize) -> f32 {
        let lo = |id: u32| self.boxes[id as usize].min[axis];
        let hi = |id: u32| self.boxes[id as usize].max[axis];

        let mut sorted = objects.to_vec();
        sorted.sort_by(|&a, &b| (lo(a) + hi(a)).total_cmp(&(lo(b) + hi(b))));

        let count = sorted.len();
        let median = sorted[count / 2];
        let mut best = 0.5 * (lo(median) + hi(median));
        let mut min_straddling = self.line_metrics(&sorted, best, axis).straddling;

        let min_line = bounds.min[axis] + 0.25 * (bounds.max[axis] - bounds.min[axis]);
        let max_line = bounds.min[axis] + 0.75 * (bounds.max[axis] - bounds.min[axis]);
        let tests = (count / 4).max(1);

        for c in 0..tests {
            if min_straddling == 0 {
                break;
            }
            let step = (c + 1) >> 1;
            let o = if c & 1 == 1 {
                count / 2 - step
            } else {
                count / 2 + step
            };
            let Some(&candidate) = sorted.get(o) else {
                continue;
            };
            for line in [lo(candidate), hi(candidate)] {
                if line < min_line || line > max_line {
                    continue;
                }
                let metrics = self.line_metrics(&sorted, line, axis);
                if metrics.straddling < min_straddling && metrics.below > 0 && metrics.above > 0 {
                    best = line;
                    min_straddling = metrics.straddling;
                }
            }
        }
        best
    }

    fn line_metrics(&self, objects: &[u32], line: f32, axis: usize) -> LineMetrics {
        let mut metrics = LineMetrics::default();
        for &id in objects {
            let b = &self.boxes[id as usize];
            metrics.below += (b.max[axis] <= line) as usize;
            metrics.straddling += (b.min[axis] < line && b.max[axis] > line) as usize;
            metrics.above += (b.min[axis] >= line) as usize;
        }
        metrics
    }

    /// Split into the four quadrant buckets plus the overflow bucket.
    fn divide(&self, objects: &[u32], bounds: &Aabb, line0: f32, line1: f32) -> [Vec<u32>; 5] {
        let (axis0, axis1) = self.axes;
        let node_size = bounds.size();
        let mut buckets: [Vec<u32>; 5] = Default::default();

        for &id in objects {
            let b = &self.boxes[id as usize];
            let (high0, straddles0) = side_of(b, line0, axis0);
            let (high1, straddles1) = side_of(b, line1, axis1);

            let size = b.size();
            let oversized = size[axis0] > 0.5 * node_size[axis0] && size[axis1] > 0.5 * node_size[axis1];
            let slot = if straddles0 && straddles1 && oversized {
                OVERFLOW
            } else {
                (high0 as usize) | ((high1 as usize) << 1)
            };
            buckets[slot].push(id);
        }
        buckets
    }

    /// Fold sparse quadrants together: 2+0 (or 1+0), 3+1, 1+0, 3+2.
    fn merge_buckets(&self, buckets: &mut [Vec<u32>; 5]) {
        let t = self.threshold;
        if buckets[2].len() + buckets[0].len() <= t {
            if buckets[1].len() + buckets[0].len() <= t {
                let merge20 = concat(&buckets[0], &buckets[2]);
                let merge10 = concat(&buckets[0], &buckets[1]);
                if self.bounds_of(&merge20).volume() < self.bounds_of(&merge10).volume() {
                    buckets[0] = merge20;
                    buckets[2].clear();
                } else {
                    buckets[0] = merge10;
                    buckets[1].clear();
                }
            } else {
                absorb(buckets, 2, 0);
            }
        }
        if buckets[3].len() + buckets[1].len() <= t {
            absorb(buckets, 3, 1);
        }
        if buckets[1].len() + buckets[0].len() <= t {
            absorb(buckets, 1, 0);
        }
        if buckets[3].len() + buckets[2].len() <= t {
            absorb(buckets, 3, 2);
        }
    }
}

#[derive(Debug, Default)]
struct LineMetrics {
    below: usize,
    straddling: usize,
    above: usize,
}

/// Returns (goes high, straddles the line).
fn side_of(b: &Aabb, line: f32, axis: usize) -> (bool, bool) {
    if b.min[axis] > line {
        (true, false)
    } else if b.max[axis] < line {
        (false, false)
    } else {
        // Favour the side holding more of the box.
        ((line - b.min[axis]) <= (b.max[axis] - line), true)
    }
}

fn concat(first: &[u32], second: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(first.len() + second.len());
    out.extend_from_slice(first);
    out.extend_from_slice(second);
    out
}

/// Move `from` into `into`, placing the absorbed objects first.
fn absorb(buckets: &mut [Vec<u32>; 5], from: usize, into: usize) {
    let moved = std::mem::take(&mut buckets[from]);
    let kept = std::mem::take(&mut buckets[into]);
    buckets[into] = concat(&moved, &kept);
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn unit_box(x: f32, z: f32) -> Aabb {
        Aabb::from_center_extents(Vec3::new(x, 0.0, z), Vec3::splat(0.5))
    }

    fn grid(n: usize, spacing: f32) -> Vec<Aabb> {
        let mut out = Vec::with_capacity(n * n);
        for z in 0..n {
            for x in 0..n {
                out.push(unit_box(x as f32 * spacing, z as f32 * spacing));
            }
        }
        out
    }

    #[test]
    fn small_input_is_a_single_leaf() {
        let boxes = grid(3, 2.0);
        let index = SpatialIndex::build(&boxes, &BuildConfig::default());
        assert_eq!(index.nodes().len(), 1);
        assert!(index.nodes()[0].is_leaf());
        assert_eq!(index.payload(0).len(), 9);
        assert_eq!(index.max_results(), 9);
    }

    #[test]
    fn empty_input_has_root_without_payload() {
        let index = SpatialIndex::build(&[], &BuildConfig::default());
        assert_eq!(index.nodes().len(), 1);
        assert_eq!(index.nodes()[0].payload, INVALID_INDEX);
        assert_eq!(index.max_results(), 0);
    }

    #[test]
    fn grid_splits_into_children() {
        let boxes = grid(8, 3.0);
        let index = SpatialIndex::build(&boxes, &BuildConfig::default());
        let root = &index.nodes()[0];
        assert!(!root.is_leaf());
        assert_eq!(index.max_results() as usize, boxes.len());
        for node in index.nodes() {
            if node.is_leaf() && node.payload != INVALID_INDEX {
                assert!(index.payload(node.payload).len() <= 12);
            }
        }
    }

    #[test]
    fn pre_order_numbering() {
        let boxes = grid(12, 2.0);
        let index = SpatialIndex::build(&boxes, &BuildConfig::default());
        for (i, node) in index.nodes().iter().enumerate() {
            let mut previous = i as u32;
            for &child in node.children.iter().filter(|&&c| c != INVALID_INDEX) {
                assert!(child > previous);
                assert_eq!(index.nodes()[child as usize].depth, node.depth + 1);
                previous = child;
            }
        }
    }

    #[test]
    fn identical_boxes_become_forced_leaf() {
        let boxes = vec![unit_box(5.0, 5.0); 40];
        let config = BuildConfig::default();
        let index = SpatialIndex::build(&boxes, &config);
        assert_eq!(index.nodes().len(), 1);
        let root = &index.nodes()[0];
        assert!(root.is_leaf());
        assert_eq!(root.payload, 0);
        assert_eq!(index.payload_count(), 1);

        let mut ids = index.payload(0).to_vec();
        assert!(ids.len() > config.leaf_threshold as usize);
        ids.sort_unstable();
        assert_eq!(ids, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn large_straddler_stays_on_parent() {
        let mut boxes = grid(6, 4.0);
        let big = Aabb::new(Vec3::new(-1.0, 0.0, -1.0), Vec3::new(21.0, 1.0, 21.0));
        boxes.push(big);
        let big_id = boxes.len() as u32 - 1;
        let index = SpatialIndex::build(&boxes, &BuildConfig::default());
        let root = &index.nodes()[0];
        assert_ne!(root.payload, INVALID_INDEX);
        assert!(index.payload(root.payload).contains(&big_id));
    }

    #[test]
    fn zup_partitions_xy() {
        let boxes: Vec<Aabb> = (0..64)
            .map(|i| {
                let (x, y) = ((i % 8) as f32 * 3.0, (i / 8) as f32 * 3.0);
                Aabb::from_center_extents(Vec3::new(x, y, 0.0), Vec3::splat(0.5))
            })
            .collect();
        let config = BuildConfig {
            leaf_threshold: 4,
            orientation: Orientation::ZUp,
        };
        let index = SpatialIndex::build(&boxes, &config);
        assert!(index.nodes().len() > 4);
        assert_eq!(index.max_results(), 64);
    }
}
