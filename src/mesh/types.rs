//! Mesh output types

use bytemuck::{Pod, Zeroable};

use crate::voxel::chunk::ChunkKey;

/// Neighbor face bits of [`Mesh::transition_mask`]
pub mod face {
    pub const NEG_X: u8 = 1 << 0;
    pub const POS_X: u8 = 1 << 1;
    pub const NEG_Y: u8 = 1 << 2;
    pub const POS_Y: u8 = 1 << 3;
    pub const NEG_Z: u8 = 1 << 4;
    pub const POS_Z: u8 = 1 << 5;

    /// (bit, axis, direction) for every face
    pub const ALL: [(u8, usize, i32); 6] = [
        (NEG_X, 0, -1),
        (POS_X, 0, 1),
        (NEG_Y, 1, -1),
        (POS_Y, 1, 1),
        (NEG_Z, 2, -1),
        (POS_Z, 2, 1),
    ];
}

/// Vertex layout handed to the renderer (28 bytes)
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    /// Relative to the chunk origin, in voxels
    pub position: [f32; 3],
    pub normal: [f32; 3],
    /// Packed [`Material`](crate::voxel::voxel::Material) bytes
    pub material: u32,
}

/// Immutable triangle mesh of one chunk at one LOD.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mesh {
    pub key: ChunkKey,
    /// Chunk generation the mesh was built from
    pub generation: u64,
    pub vertices: Vec<MeshVertex>,
    /// Triangle list, counter-clockwise seen from outside
    pub indices: Vec<u32>,
    /// Faces whose neighbor is displayed at a coarser LOD
    pub transition_mask: u8,
}

impl Mesh {
    pub fn empty(key: ChunkKey, generation: u64) -> Self {
        Self { key, generation, ..Default::default() }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn lod(&self) -> u8 {
        self.key.lod
    }
}
