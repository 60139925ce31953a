//! Voxel data structures and the chunk store

pub mod voxel;
pub mod chunk;
pub mod chunk_handle;
pub mod octree;
pub mod store;

pub use chunk::{Chunk, ChunkKey, ChunkSnapshot};
pub use chunk_handle::{ChunkHandle, ChunkState};
pub use octree::ChunkOctree;
pub use store::VoxelStore;
pub use voxel::{Material, Voxel};
