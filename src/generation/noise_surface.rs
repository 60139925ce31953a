//! Noise-based height-field terrain

use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use serde::{Deserialize, Serialize};

use super::{height_density, GeneratorFault, WorldGenerator};
use crate::voxel::chunk::ChunkKey;
use crate::voxel::voxel::{Material, Voxel};

/// Parameters controlling terrain generation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseSurfaceParams {
    pub seed: u32,
    pub scale: f32,        // Horizontal scale (larger = smoother)
    pub height_scale: f32, // Vertical amplitude
    pub base_height: f32,  // Altitude of the noise midline
    pub octaves: u32,      // FBM octaves (detail levels)
    pub persistence: f32,  // FBM persistence (0.5 typical)
    pub lacunarity: f32,   // FBM lacunarity (2.0 typical)
    /// Material of the top layer
    pub surface_material: u8,
    /// Material between the top layer and `rock_depth`
    pub soil_material: u8,
    pub rock_material: u8,
    /// Depth (voxels) of the soil band below the surface
    pub rock_depth: f32,
}

impl Default for NoiseSurfaceParams {
    fn default() -> Self {
        Self {
            seed: 12345,
            scale: 100.0,
            height_scale: 64.0,
            base_height: 0.0,
            octaves: 4,
            persistence: 0.5,
            lacunarity: 2.0,
            surface_material: 1,
            soil_material: 2,
            rock_material: 3,
            rock_depth: 6.0,
        }
    }
}

/// Procedural terrain using fractal Brownian motion (FBM)
pub struct NoiseSurfaceGenerator {
    params: NoiseSurfaceParams,
    noise: Fbm<Perlin>,
}

impl NoiseSurfaceGenerator {
    pub fn new(params: NoiseSurfaceParams) -> Self {
        let noise = Fbm::<Perlin>::new(params.seed)
            .set_octaves(params.octaves as usize)
            .set_persistence(params.persistence as f64)
            .set_lacunarity(params.lacunarity as f64);

        Self { params, noise }
    }

    pub fn params(&self) -> &NoiseSurfaceParams {
        &self.params
    }

    /// Terrain height at world column (x, z)
    pub fn height_at(&self, x: f32, z: f32) -> f32 {
        let nx = (x / self.params.scale) as f64;
        let nz = (z / self.params.scale) as f64;
        let noise_value = self.noise.get([nx, nz]) as f32;
        self.params.base_height + noise_value * self.params.height_scale * 0.5
    }

    fn material_at_depth(&self, depth: f32) -> Material {
        if depth < 1.0 {
            Material::solid(self.params.surface_material)
        } else if depth < self.params.rock_depth {
            Material::solid(self.params.soil_material)
        } else {
            Material::solid(self.params.rock_material)
        }
    }
}

impl WorldGenerator for NoiseSurfaceGenerator {
    fn generate(&self, key: ChunkKey, size: u32) -> Result<Vec<Voxel>, GeneratorFault> {
        let origin = key.origin(size);
        let spacing = key.spacing();
        let n = size as usize;

        // One noise evaluation per column.
        let mut heights = Vec::with_capacity(n * n);
        for z in 0..size as i32 {
            for x in 0..size as i32 {
                let wx = (origin.x + x * spacing) as f32;
                let wz = (origin.z + z * spacing) as f32;
                let h = self.height_at(wx, wz);
                if !h.is_finite() {
                    return Err(GeneratorFault(format!("non-finite height at ({}, {})", wx, wz)));
                }
                heights.push(h);
            }
        }

        let mut samples = Vec::with_capacity(n * n * n);
        for z in 0..n {
            for y in 0..size as i32 {
                let wy = (origin.y + y * spacing) as f32;
                for x in 0..n {
                    let h = heights[z * n + x];
                    let density = height_density(h, wy, spacing as f32);
                    let material = if density > -1.0 {
                        self.material_at_depth(h - wy)
                    } else {
                        Material::AIR
                    };
                    samples.push(Voxel::new(density, material));
                }
            }
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let a = NoiseSurfaceGenerator::new(NoiseSurfaceParams::default());
        let b = NoiseSurfaceGenerator::new(NoiseSurfaceParams::default());
        let key = ChunkKey::at(2, -1, 5, 0);
        let fa = a.generate(key, 16).unwrap();
        let fb = b.generate(key, 16).unwrap();
        let fa2 = a.generate(key, 16).unwrap();
        assert_eq!(bytemuck::cast_slice::<Voxel, u8>(&fa), bytemuck::cast_slice::<Voxel, u8>(&fb));
        assert_eq!(fa, fa2);
    }

    #[test]
    fn test_seed_changes_terrain() {
        let a = NoiseSurfaceGenerator::new(NoiseSurfaceParams::default());
        let b = NoiseSurfaceGenerator::new(NoiseSurfaceParams { seed: 7, ..Default::default() });
        let differs = (0..32).any(|i| a.height_at(i as f32 * 13.7, 5.3) != b.height_at(i as f32 * 13.7, 5.3));
        assert!(differs);
    }

    #[test]
    fn test_height_within_amplitude() {
        let params = NoiseSurfaceParams { base_height: 10.0, height_scale: 20.0, ..Default::default() };
        let generator = NoiseSurfaceGenerator::new(params);
        for i in 0..64 {
            let h = generator.height_at(i as f32 * 7.1, i as f32 * -3.3);
            assert!((-2.0..=22.0).contains(&h), "height {} out of range", h);
        }
    }

    #[test]
    fn test_deep_chunk_is_solid_rock() {
        let generator = NoiseSurfaceGenerator::new(NoiseSurfaceParams::default());
        let field = generator.generate(ChunkKey::at(0, -10, 0, 0), 8).unwrap();
        assert!(field.iter().all(|v| v.density == 1.0 && v.material.primary == 3));
    }

    #[test]
    fn test_sky_chunk_is_air() {
        let generator = NoiseSurfaceGenerator::new(NoiseSurfaceParams::default());
        let field = generator.generate(ChunkKey::at(0, 10, 0, 0), 8).unwrap();
        assert!(field.iter().all(|v| *v == Voxel::EMPTY));
    }
}
