//! Chunk keys and chunk field storage

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use glam::{IVec3, Vec3};
use serde::{Deserialize, Serialize};

use crate::edit::log::ChunkEditLog;
use crate::math::Aabb;
use crate::voxel::voxel::Voxel;

/// Identifies a chunk: its grid coordinate at a given LOD.
///
/// Samples of a chunk at `lod` are `2^lod` voxels apart, so a chunk of `N`
/// samples per edge spans `N * 2^lod` voxels and its origin is
/// `coord * N * 2^lod`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    pub coord: IVec3,
    pub lod: u8,
}

impl ChunkKey {
    pub const fn new(coord: IVec3, lod: u8) -> Self {
        Self { coord, lod }
    }

    /// Shorthand for tests and tools
    pub const fn at(x: i32, y: i32, z: i32, lod: u8) -> Self {
        Self { coord: IVec3::new(x, y, z), lod }
    }

    /// Distance in voxels between adjacent samples
    #[inline]
    pub fn spacing(&self) -> i32 {
        1 << self.lod
    }

    /// Edge length of the chunk in voxels
    #[inline]
    pub fn extent(&self, size: u32) -> i32 {
        size as i32 * self.spacing()
    }

    /// Minimum corner in voxel coordinates
    #[inline]
    pub fn origin(&self, size: u32) -> IVec3 {
        self.coord * self.extent(size)
    }

    /// World-space bounds (voxel units)
    pub fn bounds(&self, size: u32) -> Aabb {
        let min = self.origin(size).as_vec3();
        Aabb::new(min, min + Vec3::splat(self.extent(size) as f32))
    }

    /// Key of the chunk at `lod` whose half-open box contains voxel `pos`
    pub fn containing(pos: IVec3, lod: u8, size: u32) -> Self {
        let extent = size as i32 * (1 << lod);
        Self {
            coord: pos.div_euclid(IVec3::splat(extent)),
            lod,
        }
    }

    /// Chunk one level coarser that covers this one
    pub fn parent(&self) -> Self {
        Self {
            coord: self.coord.div_euclid(IVec3::splat(2)),
            lod: self.lod + 1,
        }
    }

    /// Ancestor at `lod` (self when `lod == self.lod`)
    pub fn ancestor(&self, lod: u8) -> Self {
        debug_assert!(lod >= self.lod);
        let shift = (lod - self.lod) as i32;
        Self {
            coord: self.coord.div_euclid(IVec3::splat(1 << shift)),
            lod,
        }
    }

    /// Octant of this key inside its parent (bit 0 = x, bit 1 = y, bit 2 = z)
    pub fn child_index(&self) -> usize {
        ((self.coord.x & 1) | ((self.coord.y & 1) << 1) | ((self.coord.z & 1) << 2)) as usize
    }

    /// One of the eight children one level finer
    pub fn child(&self, index: usize) -> Self {
        debug_assert!(self.lod > 0 && index < 8);
        let offset = IVec3::new(
            (index & 1) as i32,
            ((index >> 1) & 1) as i32,
            ((index >> 2) & 1) as i32,
        );
        Self {
            coord: self.coord * 2 + offset,
            lod: self.lod - 1,
        }
    }

    /// Same-LOD neighbour offset by `delta` chunks
    pub fn offset(&self, delta: IVec3) -> Self {
        Self {
            coord: self.coord + delta,
            lod: self.lod,
        }
    }
}

impl Ord for ChunkKey {
    /// Finer first, then by coordinate. Used for deterministic tie breaks.
    fn cmp(&self, other: &Self) -> Ordering {
        self.lod
            .cmp(&other.lod)
            .then(self.coord.x.cmp(&other.coord.x))
            .then(self.coord.y.cmp(&other.coord.y))
            .then(self.coord.z.cmp(&other.coord.z))
    }
}

impl PartialOrd for ChunkKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk({}, {}, {})@lod{}",
            self.coord.x, self.coord.y, self.coord.z, self.lod
        )
    }
}

/// Linear index of sample `(x, y, z)` in a chunk of `size` (x fastest)
#[inline]
pub fn sample_index(size: u32, x: u32, y: u32, z: u32) -> usize {
    (x + size * (y + size * z)) as usize
}

/// Read-only view of a chunk's field shared with jobs.
#[derive(Clone, Debug)]
pub struct ChunkSnapshot {
    pub key: ChunkKey,
    pub size: u32,
    pub generation: u64,
    pub samples: Arc<Vec<Voxel>>,
}

impl ChunkSnapshot {
    #[inline]
    pub fn get(&self, x: u32, y: u32, z: u32) -> Voxel {
        self.samples[sample_index(self.size, x, y, z)]
    }

    pub fn origin(&self) -> IVec3 {
        self.key.origin(self.size)
    }
}

/// A cubic block of `size³` samples plus its metadata and edit log.
#[derive(Clone, Debug)]
pub struct Chunk {
    key: ChunkKey,
    size: u32,
    /// Copy-on-write so snapshots stay cheap while edits are rare
    samples: Arc<Vec<Voxel>>,
    log: ChunkEditLog,
    generation: u64,
    dirty: bool,
}

impl Chunk {
    /// Wrap generated or loaded samples. `samples.len()` must be `size³`.
    pub fn new(key: ChunkKey, size: u32, samples: Vec<Voxel>) -> Self {
        debug_assert_eq!(samples.len(), (size * size * size) as usize);
        Self {
            key,
            size,
            samples: Arc::new(samples),
            log: ChunkEditLog::new(),
            generation: 0,
            dirty: true,
        }
    }

    /// Rebuild a chunk with persisted metadata
    pub fn from_parts(
        key: ChunkKey,
        size: u32,
        samples: Vec<Voxel>,
        log: ChunkEditLog,
        generation: u64,
    ) -> Self {
        Self {
            key,
            size,
            samples: Arc::new(samples),
            log,
            generation,
            dirty: true,
        }
    }

    pub fn key(&self) -> ChunkKey {
        self.key
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn lod(&self) -> u8 {
        self.key.lod
    }

    pub fn origin(&self) -> IVec3 {
        self.key.origin(self.size)
    }

    pub fn bounds(&self) -> Aabb {
        self.key.bounds(self.size)
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32, z: u32) -> Voxel {
        self.samples[sample_index(self.size, x, y, z)]
    }

    pub fn samples(&self) -> &[Voxel] {
        &self.samples
    }

    /// Mutable samples; clones the buffer if a snapshot still shares it
    pub fn samples_mut(&mut self) -> &mut Vec<Voxel> {
        Arc::make_mut(&mut self.samples)
    }

    /// Replace the whole field (used by undo and resync)
    pub fn replace_samples(&mut self, samples: Vec<Voxel>) {
        debug_assert_eq!(samples.len(), self.samples.len());
        self.samples = Arc::new(samples);
    }

    /// Field bytes, for exact comparisons
    pub fn field_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.samples.as_slice())
    }

    pub fn snapshot(&self) -> ChunkSnapshot {
        ChunkSnapshot {
            key: self.key,
            size: self.size,
            generation: self.generation,
            samples: Arc::clone(&self.samples),
        }
    }

    pub fn log(&self) -> &ChunkEditLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut ChunkEditLog {
        &mut self.log
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Increment the generation counter and return the new value
    pub fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// World position (voxel units) of sample `(x, y, z)`
    pub fn sample_position(&self, x: u32, y: u32, z: u32) -> IVec3 {
        self.origin() + IVec3::new(x as i32, y as i32, z as i32) * self.key.spacing()
    }
}
