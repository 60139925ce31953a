//! Snapshots of the chunks around a chunk being meshed.
//!
//! Field values are defined by coordinate lookups: the active chunk whose
//! half-open box contains a point owns it (finest first if several do).
//! Points off that chunk's sample lattice are interpolated from it.

use std::collections::{BTreeMap, BTreeSet};

use glam::IVec3;

use crate::core::types::Result;
use crate::voxel::chunk::{ChunkKey, ChunkSnapshot};
use crate::voxel::store::VoxelStore;
use crate::voxel::voxel::Voxel;

/// Interpolation may chain into neighbours; this bounds the chain.
const MAX_LOOKUP_DEPTH: u32 = 3;

/// Set of chunks currently displayed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActiveLayout {
    keys: BTreeSet<ChunkKey>,
    /// Number of keys per LOD
    lods: BTreeMap<u8, usize>,
}

impl ActiveLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keys(keys: impl IntoIterator<Item = ChunkKey>) -> Self {
        let mut layout = Self::new();
        for key in keys {
            layout.insert(key);
        }
        layout
    }

    pub fn insert(&mut self, key: ChunkKey) -> bool {
        let added = self.keys.insert(key);
        if added {
            *self.lods.entry(key.lod).or_default() += 1;
        }
        added
    }

    pub fn remove(&mut self, key: ChunkKey) -> bool {
        let removed = self.keys.remove(&key);
        if removed {
            if let Some(count) = self.lods.get_mut(&key.lod) {
                *count -= 1;
                if *count == 0 {
                    self.lods.remove(&key.lod);
                }
            }
        }
        removed
    }

    pub fn contains(&self, key: ChunkKey) -> bool {
        self.keys.contains(&key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys in order (finer first)
    pub fn iter(&self) -> impl Iterator<Item = ChunkKey> + '_ {
        self.keys.iter().copied()
    }

    /// Active keys whose closed box touches the closed box of `key`
    /// (faces, edges and corners), `key` itself included if active.
    pub fn touching(&self, key: ChunkKey, chunk_size: u32) -> Vec<ChunkKey> {
        let min = key.origin(chunk_size);
        let max = min + IVec3::splat(key.extent(chunk_size));
        let mut out = Vec::new();
        for &lod in self.lods.keys() {
            let extent = IVec3::splat(chunk_size as i32 * (1 << lod));
            let lo = (min - IVec3::ONE).div_euclid(extent);
            let hi = max.div_euclid(extent);
            for x in lo.x..=hi.x {
                let from = ChunkKey::at(x, lo.y, lo.z, lod);
                let to = ChunkKey::at(x, hi.y, hi.z, lod);
                out.extend(
                    self.keys
                        .range(from..=to)
                        .filter(|k| (lo.z..=hi.z).contains(&k.coord.z))
                        .copied(),
                );
            }
        }
        out
    }
}

/// Read-only field around one target chunk.
#[derive(Clone, Debug)]
pub struct Neighborhood {
    target: ChunkKey,
    size: u32,
    chunks: BTreeMap<ChunkKey, ChunkSnapshot>,
    /// LODs present, finest first
    lods: Vec<u8>,
}

impl Neighborhood {
    /// Snapshot `key` and every active chunk touching it.
    ///
    /// The target must materialize; neighbours that fail are left out and
    /// treated as missing.
    pub fn gather(store: &VoxelStore, layout: &ActiveLayout, key: ChunkKey) -> Result<Self> {
        let target = store.get_chunk(key)?;
        let mut snapshots = vec![target];
        for neighbor in layout.touching(key, store.chunk_size()) {
            if neighbor == key {
                continue;
            }
            match store.get_chunk(neighbor) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => log::warn!("Meshing {} without neighbour {}: {}", key, neighbor, e),
            }
        }
        Ok(Self::from_snapshots(key, snapshots))
    }

    /// Build from explicit snapshots; the one keyed `target` is meshed.
    pub fn from_snapshots(target: ChunkKey, snapshots: impl IntoIterator<Item = ChunkSnapshot>) -> Self {
        let mut chunks = BTreeMap::new();
        let mut size = 0;
        for snapshot in snapshots {
            size = snapshot.size;
            chunks.insert(snapshot.key, snapshot);
        }
        if let Some(t) = chunks.get(&target) {
            size = t.size;
        }
        let lods: BTreeSet<u8> = chunks.keys().map(|k| k.lod).collect();
        Self { target, size, chunks, lods: lods.into_iter().collect() }
    }

    pub fn target(&self) -> ChunkKey {
        self.target
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn get(&self, key: ChunkKey) -> Option<&ChunkSnapshot> {
        self.chunks.get(&key)
    }

    pub fn target_chunk(&self) -> Option<&ChunkSnapshot> {
        self.chunks.get(&self.target)
    }

    /// Generation of the target snapshot
    pub fn generation(&self) -> u64 {
        self.target_chunk().map(|c| c.generation).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunk containing the point `p2 / 2` (doubled voxel coordinates).
    pub fn chunk_at_doubled(&self, p2: IVec3) -> Option<&ChunkSnapshot> {
        for &lod in &self.lods {
            let extent2 = IVec3::splat(2 * self.size as i32 * (1 << lod));
            let key = ChunkKey::new(p2.div_euclid(extent2), lod);
            if let Some(chunk) = self.chunks.get(&key) {
                return Some(chunk);
            }
        }
        None
    }

    /// Chunk containing voxel point `p`.
    pub fn chunk_at(&self, p: IVec3) -> Option<&ChunkSnapshot> {
        self.chunk_at_doubled(p * 2)
    }

    /// Field value at voxel point `p`, `None` where no chunk is present.
    pub fn value_at(&self, p: IVec3) -> Option<Voxel> {
        self.value_at_depth(p, 0)
    }

    fn value_at_depth(&self, p: IVec3, depth: u32) -> Option<Voxel> {
        let chunk = self.chunk_at(p)?;
        let spacing = chunk.key.spacing();
        let local = p - chunk.origin();
        let base = local.div_euclid(IVec3::splat(spacing));
        let rem = local - base * spacing;
        if rem == IVec3::ZERO {
            return Some(chunk.get(base.x as u32, base.y as u32, base.z as u32));
        }
        if depth >= MAX_LOOKUP_DEPTH {
            return None;
        }

        // Trilinear over the corners with non-zero weight.
        let t = rem.as_vec3() / spacing as f32;
        let n = self.size as i32;
        let mut density = 0.0f32;
        let mut best: Option<Voxel> = None;
        for corner in 0..8 {
            let off = IVec3::new(corner & 1, (corner >> 1) & 1, (corner >> 2) & 1);
            let mut weight = 1.0f32;
            let mut skip = false;
            for axis in 0..3 {
                let w = if off[axis] == 1 { t[axis] } else { 1.0 - t[axis] };
                if off[axis] == 1 && rem[axis] == 0 {
                    skip = true;
                }
                weight *= w;
            }
            if skip {
                continue;
            }
            let idx = base + off;
            let sample = if idx.cmplt(IVec3::splat(n)).all() {
                chunk.get(idx.x as u32, idx.y as u32, idx.z as u32)
            } else {
                let world = chunk.origin() + idx * spacing;
                match self.value_at_depth(world, depth + 1) {
                    Some(v) => v,
                    None => {
                        let c = idx.min(IVec3::splat(n - 1));
                        chunk.get(c.x as u32, c.y as u32, c.z as u32)
                    }
                }
            };
            density += sample.density * weight;
            if best.is_none_or(|b| sample.density > b.density) {
                best = Some(sample);
            }
        }
        let material = best.map(|b| b.material).unwrap_or_default();
        Some(Voxel::new(density, material))
    }
}
