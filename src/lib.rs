//! voxterra - sparse, editable, streamed voxel terrain

pub mod core;
pub mod math;
pub mod voxel;
pub mod generation;
pub mod edit;
pub mod mesh;
pub mod persist;
pub mod replication;
pub mod streaming;
pub mod world;

pub use crate::core::{EngineConfig, Error, Result};
pub use world::{ChunkEvent, Viewer, VoxelWorld};
