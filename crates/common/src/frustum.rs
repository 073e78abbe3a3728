use glam::{Mat4, Vec3, Vec4};

use crate::Aabb;

/// Depth convention of the clip space the view-projection matrix maps into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClipSpace {
    /// Depth in `[0, 1]` (wgpu, Direct3D, Vulkan, Metal).
    #[default]
    ZeroToOne,
    /// Depth in `[-1, 1]` (OpenGL).
    MinusOneToOne,
}

/// Result of testing a box against a frustum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    Culled,
    Intersecting,
    Within,
}

/// Six clip planes extracted from a view-projection matrix.
///
/// A point is inside a plane when `dot(plane.xyz, p) + plane.w >= 0`.
/// Planes are left unnormalized so classification is exact in the matrix's
/// own scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    pub fn from_matrix(view_projection: &Mat4, clip_space: ClipSpace) -> Self {
        let r0 = view_projection.row(0);
        let r1 = view_projection.row(1);
        let r2 = view_projection.row(2);
        let r3 = view_projection.row(3);
        let near = match clip_space {
            ClipSpace::ZeroToOne => r2,
            ClipSpace::MinusOneToOne => r3 + r2,
        };
        Self {
            planes: [r3 + r0, r3 - r0, r3 + r1, r3 - r1, near, r3 - r2],
        }
    }

    pub fn from_planes(planes: [Vec4; 6]) -> Self {
        Self { planes }
    }

    pub fn planes(&self) -> &[Vec4; 6] {
        &self.planes
    }

    pub fn classify(&self, aabb: &Aabb) -> Containment {
        let mut result = Containment::Within;
        for plane in &self.planes {
            let normal = plane.truncate();
            let positive = Vec3::select(normal.cmpge(Vec3::ZERO), aabb.max, aabb.min);
            if normal.dot(positive) + plane.w < 0.0 {
                return Containment::Culled;
            }
            let negative = Vec3::select(normal.cmpge(Vec3::ZERO), aabb.min, aabb.max);
            if normal.dot(negative) + plane.w < 0.0 {
                result = Containment::Intersecting;
            }
        }
        result
    }

    pub fn is_culled(&self, aabb: &Aabb) -> bool {
        self.classify(aabb) == Containment::Culled
    }
}
