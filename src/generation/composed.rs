//! Union of several generators.

use std::sync::Arc;

use super::{GeneratorFault, WorldGenerator};
use crate::voxel::chunk::ChunkKey;
use crate::voxel::voxel::Voxel;

/// Max-combines child densities; the densest child supplies the material.
pub struct ComposedGenerator {
    layers: Vec<Arc<dyn WorldGenerator>>,
}

impl ComposedGenerator {
    pub fn new(layers: Vec<Arc<dyn WorldGenerator>>) -> Self {
        Self { layers }
    }
}

impl WorldGenerator for ComposedGenerator {
    fn generate(&self, key: ChunkKey, size: u32) -> Result<Vec<Voxel>, GeneratorFault> {
        let mut layers = self.layers.iter();
        let Some(first) = layers.next() else {
            return Ok(vec![Voxel::EMPTY; (size * size * size) as usize]);
        };
        let mut field = first.generate(key, size)?;
        for layer in layers {
            let other = layer.generate(key, size)?;
            if other.len() != field.len() {
                return Err(GeneratorFault(format!(
                    "layer returned {} samples, expected {}",
                    other.len(),
                    field.len()
                )));
            }
            for (dst, src) in field.iter_mut().zip(other) {
                if src.density > dst.density {
                    *dst = src;
                }
            }
        }
        Ok(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{FlatGenerator, SphereGenerator};
    use crate::voxel::chunk::sample_index;
    use glam::Vec3;

    #[test]
    fn test_union_of_plane_and_ball() {
        let composed = ComposedGenerator::new(vec![
            Arc::new(FlatGenerator { height: 2.0, material: 1 }),
            Arc::new(SphereGenerator { center: Vec3::new(8.0, 8.0, 8.0), radius: 3.0, material: 9 }),
        ]);
        let field = composed.generate(ChunkKey::at(0, 0, 0, 0), 16).unwrap();
        assert_eq!(field[sample_index(16, 0, 0, 0)].material.primary, 1);
        assert_eq!(field[sample_index(16, 8, 8, 8)].material.primary, 9);
        assert!(field[sample_index(16, 0, 8, 0)].density < 0.0);
    }

    #[test]
    fn test_empty_composition_is_air() {
        let composed = ComposedGenerator::new(Vec::new());
        let field = composed.generate(ChunkKey::at(0, 0, 0, 0), 4).unwrap();
        assert!(field.iter().all(|v| *v == Voxel::EMPTY));
    }
}
