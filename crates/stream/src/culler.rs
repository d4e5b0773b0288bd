//! Visibility oracles: which elements does a camera show?

use std::collections::HashSet;

use glam::{Mat4, UVec2, Vec3, Vec4};

use bimtiles_common::{BoundingBox, ElementId};
use bimtiles_index::TileIndex;

/// Camera snapshot taken when the camera comes to rest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraState {
    pub position: Vec3,
    pub view_proj: Mat4,
    /// Viewport size in pixels.
    pub viewport: UVec2,
}

impl CameraState {
    /// Right-handed perspective camera looking from `eye` at `target`.
    pub fn look_at(eye: Vec3, target: Vec3, fov_y: f32, viewport: UVec2, near: f32, far: f32) -> Self {
        let aspect = viewport.x.max(1) as f32 / viewport.y.max(1) as f32;
        let proj = Mat4::perspective_rh(fov_y, aspect, near, far);
        let view = Mat4::look_at_rh(eye, target, Vec3::Y);
        Self {
            position: eye,
            view_proj: proj * view,
            viewport,
        }
    }
}

/// Produces the visible element set for a camera.
pub trait VisibilityOracle: Send + Sync {
    fn query(&self, camera: &CameraState, index: &TileIndex) -> HashSet<ElementId>;
}

#[derive(Debug, Clone, Copy)]
struct Plane {
    normal: Vec3,
    distance: f32,
}

impl Plane {
    fn from_row(row: Vec4) -> Self {
        let normal = row.truncate();
        let len = normal.length();
        if len > 0.0 {
            Self {
                normal: normal / len,
                distance: row.w / len,
            }
        } else {
            Self {
                normal: Vec3::ZERO,
                distance: row.w,
            }
        }
    }

    fn distance_to_point(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }
}

/// Six clip planes extracted from a view-projection matrix (depth in `[0, 1]`).
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    planes: [Plane; 6],
}

impl Frustum {
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let (r0, r1, r2, r3) = (vp.row(0), vp.row(1), vp.row(2), vp.row(3));
        Self {
            planes: [
                Plane::from_row(r3 + r0),
                Plane::from_row(r3 - r0),
                Plane::from_row(r3 + r1),
                Plane::from_row(r3 - r1),
                Plane::from_row(r2),
                Plane::from_row(r3 - r2),
            ],
        }
    }

    /// Conservative box test: false only when the box is fully outside one plane.
    pub fn intersects(&self, bounds: &BoundingBox) -> bool {
        self.planes.iter().all(|plane| {
            let p = Vec3::new(
                if plane.normal.x >= 0.0 { bounds.max.x } else { bounds.min.x },
                if plane.normal.y >= 0.0 { bounds.max.y } else { bounds.min.y },
                if plane.normal.z >= 0.0 { bounds.max.z } else { bounds.min.z },
            );
            plane.distance_to_point(p) >= 0.0
        })
    }
}

/// Largest on-screen extent of a box in pixels.
///
/// Boxes crossing the camera plane are treated as covering the whole viewport.
pub fn projected_extent(bounds: &BoundingBox, view_proj: &Mat4, viewport: UVec2) -> f32 {
    let mut min = glam::Vec2::splat(f32::INFINITY);
    let mut max = glam::Vec2::splat(f32::NEG_INFINITY);
    for corner in bounds.corners() {
        let clip = *view_proj * corner.extend(1.0);
        if clip.w <= f32::EPSILON {
            return viewport.x.max(viewport.y) as f32;
        }
        let ndc = clip.truncate().truncate() / clip.w;
        min = min.min(ndc);
        max = max.max(ndc);
    }
    let size = (max - min) * 0.5 * viewport.as_vec2();
    size.x.max(size.y)
}

/// Frustum test plus a minimum projected size in pixels.
#[derive(Debug, Clone, Copy)]
pub struct ScreenCoverageCuller {
    pub threshold_px: f32,
}

impl ScreenCoverageCuller {
    pub fn new(threshold_px: f32) -> Self {
        Self { threshold_px }
    }
}

impl VisibilityOracle for ScreenCoverageCuller {
    fn query(&self, camera: &CameraState, index: &TileIndex) -> HashSet<ElementId> {
        let _span = tracing::info_span!("cull", elements = index.element_count()).entered();
        let frustum = Frustum::from_view_projection(&camera.view_proj);
        let visible: HashSet<ElementId> = index
            .bounds()
            .filter(|(_, bounds)| frustum.intersects(bounds))
            .filter(|(_, bounds)| {
                projected_extent(bounds, &camera.view_proj, camera.viewport) >= self.threshold_px
            })
            .map(|(id, _)| id)
            .collect();
        tracing::trace!(visible = visible.len(), "cull complete");
        visible
    }
}
