//! Height-field generator backed by a host-supplied grid.

use super::{height_density, GeneratorFault, WorldGenerator};
use crate::voxel::chunk::ChunkKey;
use crate::voxel::voxel::{Material, Voxel};

/// Bilinearly sampled height grid, clamped at its edges.
#[derive(Debug, Clone)]
pub struct HeightmapGenerator {
    width: u32,
    depth: u32,
    heights: Vec<f32>,
    /// Voxels between grid posts
    cell_size: f32,
    /// World (x, z) of grid post (0, 0)
    origin: [f32; 2],
    material: u8,
}

impl HeightmapGenerator {
    /// `heights` is row-major in z (`heights[z * width + x]`).
    pub fn new(
        width: u32,
        depth: u32,
        heights: Vec<f32>,
        cell_size: f32,
        origin: [f32; 2],
        material: u8,
    ) -> Result<Self, GeneratorFault> {
        if width == 0 || depth == 0 || heights.len() != (width * depth) as usize {
            return Err(GeneratorFault(format!(
                "heightmap {}x{} needs {} heights, got {}",
                width,
                depth,
                width * depth,
                heights.len()
            )));
        }
        if !(cell_size > 0.0) {
            return Err(GeneratorFault("heightmap cell_size must be positive".into()));
        }
        Ok(Self { width, depth, heights, cell_size, origin, material })
    }

    fn post(&self, x: i64, z: i64) -> f32 {
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let z = z.clamp(0, self.depth as i64 - 1) as usize;
        self.heights[z * self.width as usize + x]
    }

    /// Interpolated height at world column (x, z)
    pub fn height_at(&self, x: f32, z: f32) -> f32 {
        let gx = (x - self.origin[0]) / self.cell_size;
        let gz = (z - self.origin[1]) / self.cell_size;
        let x0 = gx.floor();
        let z0 = gz.floor();
        let tx = gx - x0;
        let tz = gz - z0;
        let (x0, z0) = (x0 as i64, z0 as i64);
        let h00 = self.post(x0, z0);
        let h10 = self.post(x0 + 1, z0);
        let h01 = self.post(x0, z0 + 1);
        let h11 = self.post(x0 + 1, z0 + 1);
        let a = h00 + (h10 - h00) * tx;
        let b = h01 + (h11 - h01) * tx;
        a + (b - a) * tz
    }
}

impl WorldGenerator for HeightmapGenerator {
    fn generate(&self, key: ChunkKey, size: u32) -> Result<Vec<Voxel>, GeneratorFault> {
        let spacing = key.spacing() as f32;
        let material = Material::solid(self.material);
        let field = super::fill_field(key, size, |p| {
            Voxel::new(height_density(self.height_at(p.x, p.z), p.y, spacing), material)
        });
        if field.iter().any(|v| !v.is_valid()) {
            return Err(GeneratorFault(format!("heightmap produced NaN in {}", key)));
        }
        Ok(field)
    }
}
