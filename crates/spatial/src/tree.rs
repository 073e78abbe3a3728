use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use terrastream_common::{Aabb, Containment, Frustum, INVALID_INDEX};

/// Fixed-layout node record. This is exactly what goes into the serialized block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct QuadNode {
    pub min: [f32; 3],
    pub max: [f32; 3],
    /// Index into the payload table, or [`INVALID_INDEX`].
    pub payload: u32,
    pub depth: u32,
    /// Child node indices, [`INVALID_INDEX`] for an absent child.
    pub children: [u32; 4],
}

impl QuadNode {
    pub(crate) fn new(bounds: &Aabb, depth: u32) -> Self {
        Self {
            min: bounds.min.to_array(),
            max: bounds.max.to_array(),
            payload: INVALID_INDEX,
            depth,
            children: [INVALID_INDEX; 4],
        }
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::new(Vec3::from_array(self.min), Vec3::from_array(self.max))
    }

    pub fn is_leaf(&self) -> bool {
        self.children.iter().all(|&c| c == INVALID_INDEX)
    }
}

/// Range of object indices owned by one node.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PayloadRange {
    pub offset: u32,
    pub count: u32,
}

/// Counters filled by [`SpatialIndex::query`] for profiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CullMetrics {
    pub node_tests: u32,
    pub payload_tests: u32,
}

/// Errors from visibility queries.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CullError {
    /// The output buffer was too small. Partial output must be discarded.
    #[error("visible object buffer overflow (capacity {capacity})")]
    Overflow { capacity: usize },
    #[error("no bounding box supplied for object {id}")]
    MissingBox { id: u32 },
}

/// Immutable quad-tree over a caller-owned array of object boxes.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialIndex {
    pub(crate) nodes: Vec<QuadNode>,
    pub(crate) payloads: Vec<PayloadRange>,
    pub(crate) objects: Vec<u32>,
    pub(crate) max_cull_results: u32,
}

impl SpatialIndex {
    pub fn nodes(&self) -> &[QuadNode] {
        &self.nodes
    }

    pub fn payload_count(&self) -> usize {
        self.payloads.len()
    }

    /// Object ids stored in a payload.
    pub fn payload(&self, payload: u32) -> &[u32] {
        match self.payloads.get(payload as usize) {
            Some(range) => {
                let start = range.offset as usize;
                &self.objects[start..start + range.count as usize]
            }
            None => &[],
        }
    }

    /// Upper bound on the number of ids any query can return.
    pub fn max_results(&self) -> u32 {
        self.max_cull_results
    }

    /// Boxes of every node, for debug overlays.
    pub fn node_bounding_boxes(&self) -> Vec<Aabb> {
        self.nodes.iter().map(QuadNode::bounds).collect()
    }

    /// Write the ids of every object intersecting `frustum` into `visible`.
    ///
    /// Nodes entirely inside the frustum contribute their whole subtree without
    /// further tests. When `boxes` is `None`, payloads of partially visible
    /// nodes are emitted untested. Returns the number of ids written, or
    /// [`CullError::Overflow`] as soon as `visible` would overflow.
    pub fn query(
        &self,
        frustum: &Frustum,
        boxes: Option<&[Aabb]>,
        visible: &mut [u32],
        metrics: Option<&mut CullMetrics>,
    ) -> Result<usize, CullError> {
        let mut count = 0usize;
        let mut counters = CullMetrics::default();
        if self.nodes.is_empty() {
            return Ok(0);
        }

        let mut working: Vec<u32> = Vec::with_capacity(64);
        let mut entirely_visible: Vec<u32> = Vec::with_capacity(64);
        working.push(0);

        while let Some(index) = working.pop() {
            let node = &self.nodes[index as usize];
            counters.node_tests += 1;
            match frustum.classify(&node.bounds()) {
                Containment::Culled => continue,
                Containment::Within => entirely_visible.push(index),
                Containment::Intersecting => {
                    working.extend(node.children.iter().copied().filter(|&c| c != INVALID_INDEX));
                    let payload = self.payload(node.payload);
                    match boxes {
                        Some(boxes) => {
                            for &id in payload {
                                let bounds =
                                    boxes.get(id as usize).ok_or(CullError::MissingBox { id })?;
                                counters.payload_tests += 1;
                                if !frustum.is_culled(bounds) {
                                    push_visible(visible, &mut count, &[id])?;
                                }
                            }
                        }
                        None => push_visible(visible, &mut count, payload)?,
                    }
                }
            }
        }

        while let Some(index) = entirely_visible.pop() {
            let node = &self.nodes[index as usize];
            entirely_visible.extend(node.children.iter().copied().filter(|&c| c != INVALID_INDEX));
            push_visible(visible, &mut count, self.payload(node.payload))?;
        }

        if let Some(metrics) = metrics {
            *metrics = counters;
        }
        tracing::trace!(
            visible = count,
            node_tests = counters.node_tests,
            payload_tests = counters.payload_tests,
            "spatial query complete"
        );
        Ok(count)
    }

    /// Convenience wrapper sized by [`SpatialIndex::max_results`]; cannot overflow.
    pub fn visible_objects(
        &self,
        frustum: &Frustum,
        boxes: Option<&[Aabb]>,
    ) -> Result<Vec<u32>, CullError> {
        let mut out = vec![0u32; self.max_cull_results as usize];
        let count = self.query(frustum, boxes, &mut out, None)?;
        out.truncate(count);
        Ok(out)
    }
}

fn push_visible(visible: &mut [u32], count: &mut usize, ids: &[u32]) -> Result<(), CullError> {
    let end = *count + ids.len();
    if end > visible.len() {
        return Err(CullError::Overflow {
            capacity: visible.len(),
        });
    }
    visible[*count..end].copy_from_slice(ids);
    *count = end;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BuildConfig;
    use glam::Mat4;
    use terrastream_common::ClipSpace;

    fn row_of_boxes(count: usize) -> Vec<Aabb> {
        (0..count)
            .map(|i| Aabb::from_center_extents(Vec3::new(i as f32 * 4.0, 0.0, 0.0), Vec3::ONE))
            .collect()
    }

    fn ortho_window(min_x: f32, max_x: f32) -> Frustum {
        // Looks down -Z from z = 100 with an orthographic window over [min_x, max_x].
        let proj = Mat4::orthographic_rh(min_x, max_x, -10.0, 10.0, 0.0, 200.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 100.0), Vec3::ZERO, Vec3::Y);
        Frustum::from_matrix(&(proj * view), ClipSpace::ZeroToOne)
    }

    #[test]
    fn query_finds_boxes_in_window() {
        let boxes = row_of_boxes(40);
        let index = SpatialIndex::build(&boxes, &BuildConfig::default());
        let mut visible = index
            .visible_objects(&ortho_window(-2.0, 10.0), Some(&boxes))
            .unwrap();
        visible.sort_unstable();
        // centers at 0, 4, 8 are within reach; 12 - 1 = 11 is outside
        assert_eq!(visible, vec![0, 1, 2]);
    }

    #[test]
    fn overflow_is_reported() {
        let boxes = row_of_boxes(40);
        let index = SpatialIndex::build(&boxes, &BuildConfig::default());
        let mut small = [0u32; 2];
        let err = index
            .query(&ortho_window(-2.0, 200.0), Some(&boxes), &mut small, None)
            .unwrap_err();
        assert_eq!(err, CullError::Overflow { capacity: 2 });
    }

    #[test]
    fn metrics_count_tests() {
        let boxes = row_of_boxes(100);
        let index = SpatialIndex::build(&boxes, &BuildConfig::default());
        let mut metrics = CullMetrics::default();
        let mut out = vec![0u32; index.max_results() as usize];
        index
            .query(&ortho_window(-2.0, 30.0), Some(&boxes), &mut out, Some(&mut metrics))
            .unwrap();
        assert!(metrics.node_tests >= 1);
        assert!(metrics.node_tests as usize <= index.nodes().len());
    }

    #[test]
    fn missing_box_is_an_error() {
        // Ten boxes fit one leaf, so the root payload is tested box by box.
        let boxes = row_of_boxes(10);
        let index = SpatialIndex::build(&boxes, &BuildConfig::default());
        let truncated = &boxes[..1];
        let result = index.visible_objects(&ortho_window(-2.0, 10.0), Some(truncated));
        assert!(matches!(result, Err(CullError::MissingBox { .. })));
    }
}
