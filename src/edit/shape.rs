//! Edit shapes with SDF evaluation

use std::sync::Arc;

use glam::{UVec3, Vec3};

use crate::math::Aabb;

/// Axis for oriented primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    /// Get unit vector for this axis
    pub fn to_vec3(self) -> Vec3 {
        match self {
            Axis::X => Vec3::X,
            Axis::Y => Vec3::Y,
            Axis::Z => Vec3::Z,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Axis::X),
            1 => Some(Axis::Y),
            2 => Some(Axis::Z),
            _ => None,
        }
    }
}

/// Signed distance samples baked from a mesh by the host.
///
/// `distances` holds `dims.x * dims.y * dims.z` values (x fastest), spaced
/// `spacing` voxels apart starting at `origin`. Negative is inside.
#[derive(Debug, Clone, PartialEq)]
pub struct SdfStamp {
    pub origin: Vec3,
    pub dims: UVec3,
    pub spacing: f32,
    pub distances: Arc<Vec<f32>>,
}

impl SdfStamp {
    fn extent(&self) -> Vec3 {
        (self.dims.as_vec3() - Vec3::ONE).max(Vec3::ZERO) * self.spacing
    }

    fn at(&self, x: u32, y: u32, z: u32) -> f32 {
        let i = (x + self.dims.x * (y + self.dims.y * z)) as usize;
        self.distances.get(i).copied().unwrap_or(f32::MAX)
    }

    /// Trilinear lookup; outside the grid the clamped value is pushed out by
    /// the distance to the grid box.
    fn sdf(&self, p: Vec3) -> f32 {
        if self.dims.min_element() == 0 || self.spacing <= 0.0 {
            return f32::MAX;
        }
        let bounds = Aabb::new(self.origin, self.origin + self.extent());
        let outside = bounds.distance_to_point(p);
        let local = ((p.clamp(bounds.min, bounds.max) - self.origin) / self.spacing)
            .clamp(Vec3::ZERO, (self.dims - UVec3::ONE).as_vec3());
        let max_base = UVec3::new(
            self.dims.x.saturating_sub(2),
            self.dims.y.saturating_sub(2),
            self.dims.z.saturating_sub(2),
        );
        let base = local.floor().as_uvec3().min(max_base);
        let t = local - base.as_vec3();
        let hi = (base + UVec3::ONE).min(self.dims - UVec3::ONE);
        let c = |x: u32, y: u32, z: u32| self.at(x, y, z);
        let x00 = lerp(c(base.x, base.y, base.z), c(hi.x, base.y, base.z), t.x);
        let x10 = lerp(c(base.x, hi.y, base.z), c(hi.x, hi.y, base.z), t.x);
        let x01 = lerp(c(base.x, base.y, hi.z), c(hi.x, base.y, hi.z), t.x);
        let x11 = lerp(c(base.x, hi.y, hi.z), c(hi.x, hi.y, hi.z), t.x);
        lerp(lerp(x00, x10, t.y), lerp(x01, x11, t.y), t.z) + outside
    }
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Shape of an edit, positioned in world voxel coordinates
#[derive(Debug, Clone, PartialEq)]
pub enum EditShape {
    Sphere { center: Vec3, radius: f32 },
    Box { center: Vec3, half_extents: Vec3 },
    Capsule { center: Vec3, radius: f32, half_height: f32, axis: Axis },
    Cylinder { center: Vec3, radius: f32, half_height: f32, axis: Axis },
    Stamp(SdfStamp),
}

impl EditShape {
    pub fn sphere(center: Vec3, radius: f32) -> Self {
        EditShape::Sphere { center, radius }
    }

    pub fn cuboid(center: Vec3, half_extents: Vec3) -> Self {
        EditShape::Box { center, half_extents }
    }

    /// Signed distance from world point to surface (negative = inside)
    pub fn sdf(&self, p: Vec3) -> f32 {
        match self {
            EditShape::Sphere { center, radius } => (p - *center).length() - radius,
            EditShape::Box { center, half_extents } => {
                let q = (p - *center).abs() - *half_extents;
                q.max(Vec3::ZERO).length() + q.x.max(q.y.max(q.z)).min(0.0)
            }
            EditShape::Capsule { center, radius, half_height, axis } => {
                let local = p - *center;
                let axis_vec = axis.to_vec3();
                let t = local.dot(axis_vec).clamp(-*half_height, *half_height);
                (local - axis_vec * t).length() - radius
            }
            EditShape::Cylinder { center, radius, half_height, axis } => {
                let local = p - *center;
                let axis_vec = axis.to_vec3();
                let h = local.dot(axis_vec);
                let d_radial = (local - axis_vec * h).length() - radius;
                let d_height = h.abs() - half_height;
                let outside = Vec3::new(d_radial.max(0.0), d_height.max(0.0), 0.0).length();
                outside + d_radial.max(d_height).min(0.0)
            }
            EditShape::Stamp(stamp) => stamp.sdf(p),
        }
    }

    /// World-space bounds of the zero set
    pub fn bounds(&self) -> Aabb {
        match self {
            EditShape::Sphere { center, radius } => {
                Aabb::from_center_half_extent(*center, Vec3::splat(*radius))
            }
            EditShape::Box { center, half_extents } => {
                Aabb::from_center_half_extent(*center, *half_extents)
            }
            EditShape::Capsule { center, radius, half_height, axis } => {
                let half = axis.to_vec3() * *half_height + Vec3::splat(*radius);
                Aabb::from_center_half_extent(*center, half)
            }
            EditShape::Cylinder { center, radius, half_height, axis } => {
                let axis_vec = axis.to_vec3();
                let half = axis_vec * *half_height + (Vec3::ONE - axis_vec) * *radius;
                Aabb::from_center_half_extent(*center, half)
            }
            EditShape::Stamp(stamp) => Aabb::new(stamp.origin, stamp.origin + stamp.extent()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sphere_sdf() {
        let s = EditShape::sphere(Vec3::new(1.0, 0.0, 0.0), 2.0);
        assert_eq!(s.sdf(Vec3::new(1.0, 0.0, 0.0)), -2.0);
        assert_eq!(s.sdf(Vec3::new(4.0, 0.0, 0.0)), 1.0);
    }

    #[test]
    fn test_box_sdf() {
        let b = EditShape::cuboid(Vec3::ZERO, Vec3::splat(1.0));
        assert_eq!(b.sdf(Vec3::ZERO), -1.0);
        assert_eq!(b.sdf(Vec3::new(3.0, 0.0, 0.0)), 2.0);
    }

    #[test]
    fn test_capsule_bounds_cover_caps() {
        let c = EditShape::Capsule { center: Vec3::ZERO, radius: 1.0, half_height: 2.0, axis: Axis::Y };
        let bounds = c.bounds();
        assert_eq!(bounds.max.y, 3.0);
        assert_eq!(bounds.max.x, 1.0);
        assert!(c.sdf(Vec3::new(0.0, 2.9, 0.0)) < 0.0);
    }

    #[test]
    fn test_cylinder_flat_caps() {
        let c = EditShape::Cylinder { center: Vec3::ZERO, radius: 2.0, half_height: 1.0, axis: Axis::Z };
        assert!(c.sdf(Vec3::new(0.0, 0.0, 0.5)) < 0.0);
        assert!((c.sdf(Vec3::new(0.0, 0.0, 3.0)) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_stamp_matches_sphere_at_grid_points() {
        let dims = UVec3::splat(5);
        let mut distances = Vec::new();
        for z in 0..5 {
            for y in 0..5 {
                for x in 0..5 {
                    let p = Vec3::new(x as f32, y as f32, z as f32);
                    distances.push((p - Vec3::splat(2.0)).length() - 1.5);
                }
            }
        }
        let stamp = EditShape::Stamp(SdfStamp {
            origin: Vec3::ZERO,
            dims,
            spacing: 1.0,
            distances: Arc::new(distances),
        });
        assert!((stamp.sdf(Vec3::splat(2.0)) + 1.5).abs() < 1e-6);
        assert!(stamp.sdf(Vec3::new(20.0, 2.0, 2.0)) > 10.0);
    }
}
