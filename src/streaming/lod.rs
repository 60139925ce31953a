//! Level of detail planning around the viewers.
//!
//! Each octree level doubles the sample spacing. A node of level `l` is
//! split into its eight level `l - 1` children while some viewer is closer
//! to it than `lod_distances[l - 1]`. The resulting leaf set is then
//! balanced so that touching leaves differ by at most one level.

use std::collections::BTreeSet;

use glam::{IVec3, Vec3};

use crate::core::config::EngineConfig;
use crate::math::Aabb;
use crate::mesh::ActiveLayout;
use crate::voxel::chunk::ChunkKey;

/// Plans the displayed chunk set.
#[derive(Clone, Debug)]
pub struct LodPlanner {
    chunk_size: u32,
    max_depth: u8,
    lod_distances: Vec<f32>,
    view_distance: f32,
}

impl LodPlanner {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_depth: config.max_depth,
            lod_distances: config.lod_distances.clone(),
            view_distance: config.view_distance,
        }
    }

    /// LOD a viewer at `distance` would see (0 up close, `max_depth` far away).
    pub fn lod_for_distance(&self, distance: f32) -> u8 {
        for (level, &max_dist) in self.lod_distances.iter().enumerate() {
            if distance < max_dist {
                return level as u8;
            }
        }
        self.max_depth
    }

    /// Edge length of an octree root in voxels
    pub fn root_extent(&self) -> i32 {
        self.chunk_size as i32 * (1 << self.max_depth)
    }

    /// Root coordinates within view distance of any viewer, in order.
    pub fn roots_in_view(&self, viewers: &[Vec3]) -> Vec<IVec3> {
        let extent = self.root_extent() as f32;
        let mut roots = BTreeSet::new();
        for &viewer in viewers {
            let reach = Aabb::from_center_half_extent(viewer, Vec3::splat(self.view_distance));
            for coord in reach.cells(extent) {
                let root = ChunkKey::new(coord, self.max_depth);
                if root.bounds(self.chunk_size).distance_to_point(viewer) <= self.view_distance {
                    roots.insert((coord.x, coord.y, coord.z));
                }
            }
        }
        roots.into_iter().map(|(x, y, z)| IVec3::new(x, y, z)).collect()
    }

    fn nearest(&self, key: ChunkKey, viewers: &[Vec3]) -> f32 {
        let bounds = key.bounds(self.chunk_size);
        viewers
            .iter()
            .map(|v| bounds.distance_to_point(*v))
            .fold(f32::INFINITY, f32::min)
    }

    fn should_split(&self, key: ChunkKey, viewers: &[Vec3]) -> bool {
        key.lod > 0
            && self
                .lod_distances
                .get(key.lod as usize - 1)
                .is_some_and(|&threshold| self.nearest(key, viewers) < threshold)
    }

    /// Leaf chunks to display for `viewers`.
    pub fn plan(&self, viewers: &[Vec3]) -> ActiveLayout {
        let mut leaves = BTreeSet::new();
        let mut stack: Vec<ChunkKey> = self
            .roots_in_view(viewers)
            .into_iter()
            .map(|root| ChunkKey::new(root, self.max_depth))
            .collect();
        while let Some(key) = stack.pop() {
            if self.should_split(key, viewers) {
                stack.extend((0..8).map(|i| key.child(i)));
            } else {
                leaves.insert(key);
            }
        }
        self.balance(&mut leaves);
        ActiveLayout::from_keys(leaves)
    }

    /// Split leaves until touching leaves differ by at most one level.
    fn balance(&self, leaves: &mut BTreeSet<ChunkKey>) {
        loop {
            let mut split = BTreeSet::new();
            for leaf in leaves.iter() {
                for dz in -1..=1 {
                    for dy in -1..=1 {
                        for dx in -1..=1 {
                            if (dx, dy, dz) == (0, 0, 0) {
                                continue;
                            }
                            let neighbor = leaf.offset(IVec3::new(dx, dy, dz));
                            for lod in leaf.lod.saturating_add(2)..=self.max_depth {
                                let coarse = neighbor.ancestor(lod);
                                if leaves.contains(&coarse) {
                                    split.insert(coarse);
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            if split.is_empty() {
                return;
            }
            for key in split {
                leaves.remove(&key);
                leaves.extend((0..8).map(|i| key.child(i)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> LodPlanner {
        let config = EngineConfig {
            chunk_size: 16,
            max_depth: 3,
            lod_distances: vec![20.0, 60.0, 140.0],
            view_distance: 100.0,
            ..Default::default()
        };
        LodPlanner::new(&config)
    }

    fn level_of(layout: &ActiveLayout, p: IVec3, size: u32) -> Option<u8> {
        layout
            .iter()
            .find(|k| {
                let min = k.origin(size);
                let max = min + IVec3::splat(k.extent(size));
                p.cmpge(min).all() && p.cmplt(max).all()
            })
            .map(|k| k.lod)
    }

    #[test]
    fn test_lod_for_distance() {
        let p = planner();
        assert_eq!(p.lod_for_distance(0.0), 0);
        assert_eq!(p.lod_for_distance(19.9), 0);
        assert_eq!(p.lod_for_distance(20.0), 1);
        assert_eq!(p.lod_for_distance(100.0), 2);
        assert_eq!(p.lod_for_distance(10_000.0), 3);
    }

    #[test]
    fn test_finest_near_viewer() {
        let p = planner();
        let viewer = Vec3::new(64.0, 64.0, 64.0);
        let layout = p.plan(&[viewer]);
        assert_eq!(level_of(&layout, IVec3::splat(64), 16), Some(0));
        assert_eq!(level_of(&layout, IVec3::splat(127), 16), Some(1));
    }

    #[test]
    fn test_leaves_partition_the_roots() {
        let p = planner();
        let layout = p.plan(&[Vec3::new(10.0, 5.0, 70.0)]);
        let roots = p.roots_in_view(&[Vec3::new(10.0, 5.0, 70.0)]);
        let volume: i64 = layout.iter().map(|k| (k.extent(16) as i64).pow(3)).sum();
        assert_eq!(volume, roots.len() as i64 * (p.root_extent() as i64).pow(3));
    }

    #[test]
    fn test_touching_leaves_are_balanced() {
        let p = planner();
        let layout = p.plan(&[Vec3::new(1.0, 1.0, 1.0)]);
        for key in layout.iter() {
            for other in layout.touching(key, 16) {
                assert!(key.lod.abs_diff(other.lod) <= 1, "{} touches {}", key, other);
            }
        }
    }

    #[test]
    fn test_roots_in_view() {
        let p = planner();
        // Root extent is 128: faces are 64 away, edges ~91, corners ~111.
        let roots = p.roots_in_view(&[Vec3::splat(64.0)]);
        assert!(roots.contains(&IVec3::ZERO));
        assert!(roots.contains(&IVec3::new(-1, 0, 0)));
        assert!(roots.contains(&IVec3::new(1, 1, 0)));
        assert!(!roots.contains(&IVec3::new(1, 1, 1)));
        assert_eq!(roots.len(), 19);
        assert!(p.roots_in_view(&[]).is_empty());
    }
}
