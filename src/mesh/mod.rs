//! Chunk meshing
//!
//! Meshes are pure functions of a [`Neighborhood`] snapshot, so they can be
//! built on any worker thread.

pub mod neighborhood;
pub mod surface_nets;
pub mod types;

pub use neighborhood::{ActiveLayout, Neighborhood};
pub use surface_nets::{mesh_chunk, mesh_isolated};
pub use types::{face, Mesh, MeshVertex};
