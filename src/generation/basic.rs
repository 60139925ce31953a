//! Trivial generators: empty space, a flat plane and a single sphere.

use glam::Vec3;

use super::{fill_field, height_density, GeneratorFault, WorldGenerator};
use crate::voxel::chunk::ChunkKey;
use crate::voxel::voxel::{Material, Voxel};

/// All air.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyGenerator;

impl WorldGenerator for EmptyGenerator {
    fn generate(&self, _key: ChunkKey, size: u32) -> Result<Vec<Voxel>, GeneratorFault> {
        Ok(vec![Voxel::EMPTY; (size * size * size) as usize])
    }
}

/// Solid below `height`, air above.
#[derive(Debug, Clone, Copy)]
pub struct FlatGenerator {
    pub height: f32,
    pub material: u8,
}

impl WorldGenerator for FlatGenerator {
    fn generate(&self, key: ChunkKey, size: u32) -> Result<Vec<Voxel>, GeneratorFault> {
        let spacing = key.spacing() as f32;
        let material = Material::solid(self.material);
        Ok(fill_field(key, size, |p| {
            Voxel::new(height_density(self.height, p.y, spacing), material)
        }))
    }
}

/// One solid ball.
#[derive(Debug, Clone, Copy)]
pub struct SphereGenerator {
    pub center: Vec3,
    pub radius: f32,
    pub material: u8,
}

impl WorldGenerator for SphereGenerator {
    fn generate(&self, key: ChunkKey, size: u32) -> Result<Vec<Voxel>, GeneratorFault> {
        let spacing = key.spacing() as f32;
        let material = Material::solid(self.material);
        Ok(fill_field(key, size, |p| {
            let d = (self.radius - p.distance(self.center)) / spacing;
            Voxel::new(d, material)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let field = EmptyGenerator.generate(ChunkKey::at(3, -1, 2, 1), 8).unwrap();
        assert_eq!(field.len(), 512);
        assert!(field.iter().all(|v| *v == Voxel::EMPTY));
    }

    #[test]
    fn test_flat_density_sign() {
        let flat = FlatGenerator { height: 4.5, material: 2 };
        let field = flat.generate(ChunkKey::at(0, 0, 0, 0), 8).unwrap();
        // y = 4 is below the plane, y = 5 above.
        assert!(field[crate::voxel::chunk::sample_index(8, 0, 4, 0)].density > 0.0);
        assert!(field[crate::voxel::chunk::sample_index(8, 0, 5, 0)].density < 0.0);
        assert_eq!(field[0].material.primary, 2);
    }

    #[test]
    fn test_flat_scales_with_lod() {
        let flat = FlatGenerator { height: 3.0, material: 1 };
        let field = flat.generate(ChunkKey::at(0, 0, 0, 1), 4).unwrap();
        // Sample y index 1 sits at world y = 2: one voxel below, half a sample.
        assert_eq!(field[crate::voxel::chunk::sample_index(4, 0, 1, 0)].density, 0.5);
    }

    #[test]
    fn test_sphere_inside_outside() {
        let sphere = SphereGenerator { center: Vec3::splat(4.0), radius: 2.0, material: 1 };
        let field = sphere.generate(ChunkKey::at(0, 0, 0, 0), 8).unwrap();
        assert_eq!(field[crate::voxel::chunk::sample_index(8, 4, 4, 4)].density, 1.0);
        assert_eq!(field[0].density, -1.0);
    }
}
