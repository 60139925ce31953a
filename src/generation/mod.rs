//! World generator plugin boundary and the default strategies.
//!
//! A generator is a pure function from chunk key to field samples. It must be
//! deterministic for a given configuration and safe to call from several
//! worker threads at once for different chunks.

pub mod basic;
pub mod composed;
pub mod config;
pub mod heightmap;
pub mod noise_surface;

use glam::{IVec3, Vec3};
use thiserror::Error;

use crate::voxel::chunk::ChunkKey;
use crate::voxel::voxel::Voxel;

pub use basic::{EmptyGenerator, FlatGenerator, SphereGenerator};
pub use composed::ComposedGenerator;
pub use config::GeneratorConfig;
pub use heightmap::HeightmapGenerator;
pub use noise_surface::{NoiseSurfaceGenerator, NoiseSurfaceParams};

/// A generator could not produce a chunk. Retryable.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("generator fault: {0}")]
pub struct GeneratorFault(pub String);

/// Pluggable world content.
pub trait WorldGenerator: Send + Sync {
    /// Produce the `size³` samples of chunk `key` (x fastest, then y, then z).
    fn generate(&self, key: ChunkKey, size: u32) -> Result<Vec<Voxel>, GeneratorFault>;
}

/// Run `sample` at every sample position of a chunk, in storage order.
pub fn fill_field(key: ChunkKey, size: u32, mut sample: impl FnMut(Vec3) -> Voxel) -> Vec<Voxel> {
    let origin = key.origin(size);
    let spacing = key.spacing();
    let mut samples = Vec::with_capacity((size * size * size) as usize);
    for z in 0..size as i32 {
        for y in 0..size as i32 {
            for x in 0..size as i32 {
                let p = origin + IVec3::new(x, y, z) * spacing;
                samples.push(sample(p.as_vec3()));
            }
        }
    }
    samples
}

/// Density of a height field at altitude `y`, in sample units of `spacing`.
#[inline]
pub fn height_density(height: f32, y: f32, spacing: f32) -> f32 {
    ((height - y) / spacing).clamp(-1.0, 1.0)
}
