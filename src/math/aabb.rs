//! World-space boxes for edit influence, chunk bounds and view queries.

use glam::IVec3;

use crate::core::types::Vec3;

/// Axis-aligned box in voxel units. Both faces are inclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_center_half_extent(center: Vec3, half_extent: Vec3) -> Self {
        Self::new(center - half_extent, center + half_extent)
    }

    /// Boxes that share only a face still intersect.
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    /// Grow the box by `amount` on every side.
    pub fn inflated(&self, amount: f32) -> Aabb {
        Self::new(self.min - Vec3::splat(amount), self.max + Vec3::splat(amount))
    }

    /// Distance from `p` to the closest point of the box (0 inside).
    pub fn distance_to_point(&self, p: Vec3) -> f32 {
        p.clamp(self.min, self.max).distance(p)
    }

    /// Inclusive range of grid cells of size `cell` the box touches.
    pub fn cell_range(&self, cell: f32) -> (IVec3, IVec3) {
        (
            (self.min / cell).floor().as_ivec3(),
            (self.max / cell).floor().as_ivec3(),
        )
    }

    /// Every grid cell of size `cell` the box touches, z-major.
    pub fn cells(&self, cell: f32) -> impl Iterator<Item = IVec3> {
        let (lo, hi) = self.cell_range(cell);
        (lo.z..=hi.z).flat_map(move |z| {
            (lo.y..=hi.y).flat_map(move |y| (lo.x..=hi.x).map(move |x| IVec3::new(x, y, z)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touching_boxes_intersect() {
        let a = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let b = Aabb::new(Vec3::ONE, Vec3::splat(2.0));
        let c = Aabb::new(Vec3::splat(2.5), Vec3::splat(3.0));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert!(a.inflated(1.5).intersects(&c));
    }

    #[test]
    fn test_distance_to_point() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::splat(2.0));
        assert_eq!(aabb.distance_to_point(Vec3::ONE), 0.0);
        assert_eq!(aabb.distance_to_point(Vec3::new(5.0, 1.0, 1.0)), 3.0);
    }

    #[test]
    fn test_cells_cover_negative_space() {
        let aabb = Aabb::new(Vec3::new(-1.0, 0.0, 0.0), Vec3::new(16.0, 15.0, 15.0));
        let cells: Vec<IVec3> = aabb.cells(16.0).collect();
        assert_eq!(cells, vec![IVec3::new(-1, 0, 0), IVec3::new(0, 0, 0), IVec3::new(1, 0, 0)]);
        assert_eq!(aabb.cell_range(16.0), (IVec3::new(-1, 0, 0), IVec3::new(1, 0, 0)));
    }
}
