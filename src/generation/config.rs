//! Serializable generator selection.

use std::sync::Arc;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::{
    ComposedGenerator, EmptyGenerator, FlatGenerator, HeightmapGenerator, NoiseSurfaceGenerator,
    NoiseSurfaceParams, SphereGenerator, WorldGenerator,
};
use crate::core::error::Error;
use crate::core::types::Result;

/// Generator strategy and its parameters, tagged by `kind` in JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeneratorConfig {
    Empty,
    Flat {
        height: f32,
        #[serde(default = "default_material")]
        material: u8,
    },
    NoiseSurface(NoiseSurfaceParams),
    Heightmap {
        width: u32,
        depth: u32,
        heights: Vec<f32>,
        #[serde(default = "default_cell_size")]
        cell_size: f32,
        #[serde(default)]
        origin: [f32; 2],
        #[serde(default = "default_material")]
        material: u8,
    },
    Sphere {
        center: [f32; 3],
        radius: f32,
        #[serde(default = "default_material")]
        material: u8,
    },
    Composed { layers: Vec<GeneratorConfig> },
}

fn default_material() -> u8 {
    1
}

fn default_cell_size() -> f32 {
    1.0
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig::NoiseSurface(NoiseSurfaceParams::default())
    }
}

impl GeneratorConfig {
    /// Reject parameters the generator cannot honor.
    pub fn validate(&self) -> Result<()> {
        match self {
            GeneratorConfig::Empty => Ok(()),
            GeneratorConfig::Flat { height, .. } => {
                if height.is_finite() {
                    Ok(())
                } else {
                    Err(Error::Config("flat generator height must be finite".into()))
                }
            }
            GeneratorConfig::NoiseSurface(params) => {
                if !(params.scale > 0.0) || !params.height_scale.is_finite() {
                    return Err(Error::Config(
                        "noise_surface needs a positive scale and finite height_scale".into(),
                    ));
                }
                if params.octaves == 0 || params.octaves > 32 {
                    return Err(Error::Config("noise_surface octaves must be in 1..=32".into()));
                }
                Ok(())
            }
            GeneratorConfig::Heightmap { .. } => self.build_heightmap().map(|_| ()),
            GeneratorConfig::Sphere { radius, .. } => {
                if *radius > 0.0 {
                    Ok(())
                } else {
                    Err(Error::Config("sphere radius must be positive".into()))
                }
            }
            GeneratorConfig::Composed { layers } => layers.iter().try_for_each(|l| l.validate()),
        }
    }

    fn build_heightmap(&self) -> Result<HeightmapGenerator> {
        match self {
            GeneratorConfig::Heightmap { width, depth, heights, cell_size, origin, material } => {
                HeightmapGenerator::new(*width, *depth, heights.clone(), *cell_size, *origin, *material)
                    .map_err(|e| Error::Config(e.0))
            }
            _ => Err(Error::Config("not a heightmap".into())),
        }
    }

    /// Instantiate the configured generator.
    pub fn build(&self) -> Result<Arc<dyn WorldGenerator>> {
        self.validate()?;
        let generator: Arc<dyn WorldGenerator> = match self {
            GeneratorConfig::Empty => Arc::new(EmptyGenerator),
            GeneratorConfig::Flat { height, material } => {
                Arc::new(FlatGenerator { height: *height, material: *material })
            }
            GeneratorConfig::NoiseSurface(params) => {
                Arc::new(NoiseSurfaceGenerator::new(params.clone()))
            }
            GeneratorConfig::Heightmap { .. } => Arc::new(self.build_heightmap()?),
            GeneratorConfig::Sphere { center, radius, material } => Arc::new(SphereGenerator {
                center: Vec3::from_array(*center),
                radius: *radius,
                material: *material,
            }),
            GeneratorConfig::Composed { layers } => Arc::new(ComposedGenerator::new(
                layers.iter().map(|l| l.build()).collect::<Result<Vec<_>>>()?,
            )),
        };
        Ok(generator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxel::chunk::ChunkKey;

    #[test]
    fn test_default_is_noise_surface() {
        assert!(matches!(GeneratorConfig::default(), GeneratorConfig::NoiseSurface(_)));
        GeneratorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_parse_tagged_json() {
        let config: GeneratorConfig = serde_json::from_str(
            r#"{ "kind": "composed", "layers": [
                { "kind": "flat", "height": 2.0 },
                { "kind": "sphere", "center": [8, 8, 8], "radius": 3, "material": 4 }
            ] }"#,
        )
        .unwrap();
        let generator = config.build().unwrap();
        let field = generator.generate(ChunkKey::at(0, 0, 0, 0), 16).unwrap();
        assert_eq!(field.len(), 16 * 16 * 16);
    }

    #[test]
    fn test_noise_params_partial() {
        let config: GeneratorConfig =
            serde_json::from_str(r#"{ "kind": "noise_surface", "seed": 7 }"#).unwrap();
        match config {
            GeneratorConfig::NoiseSurface(params) => {
                assert_eq!(params.seed, 7);
                assert_eq!(params.octaves, NoiseSurfaceParams::default().octaves);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_invalid_heightmap_rejected() {
        let config = GeneratorConfig::Heightmap {
            width: 2,
            depth: 2,
            heights: vec![0.0; 3],
            cell_size: 1.0,
            origin: [0.0, 0.0],
            material: 1,
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(config.build().is_err());
    }

    #[test]
    fn test_nested_validation() {
        let config = GeneratorConfig::Composed {
            layers: vec![GeneratorConfig::Sphere { center: [0.0; 3], radius: -1.0, material: 1 }],
        };
        assert!(config.validate().is_err());
    }
}
