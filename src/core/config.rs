//! Static engine configuration.
//!
//! Loaded once (usually from JSON) and validated before any component is
//! constructed. An invalid combination fails startup with [`Error::Config`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::generation::GeneratorConfig;

/// Largest supported octree depth (LOD levels are `0..=max_depth`).
pub const MAX_OCTREE_DEPTH: u8 = 12;

/// Top-level engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Samples per chunk edge (N). Power of two in `4..=128`.
    pub chunk_size: u32,
    /// Octree depth; chunks exist at LOD `0..=max_depth`.
    pub max_depth: u8,
    /// Viewer distance (voxels) under which a node of level `i + 1` is split
    /// into level `i` children. One entry per level, strictly increasing.
    pub lod_distances: Vec<f32>,
    /// Octree roots farther than this from every viewer are not planned.
    pub view_distance: f32,
    /// World generator strategy and parameters.
    pub generator: GeneratorConfig,
    /// Bounded retry count for generator faults before a chunk is marked `Error`.
    pub generation_retries: u32,
    pub compression: CompressionConfig,
    pub scheduler: SchedulerConfig,
    pub eviction: EvictionConfig,
    pub replication: ReplicationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 32,
            max_depth: 4,
            lod_distances: vec![96.0, 192.0, 384.0, 768.0],
            view_distance: 1024.0,
            generator: GeneratorConfig::default(),
            generation_retries: 3,
            compression: CompressionConfig::default(),
            scheduler: SchedulerConfig::default(),
            eviction: EvictionConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

/// How mesh geometry is stored by the persistence adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshCompression {
    /// Raw f32 attributes, exact round trip.
    Lossless,
    /// Grid-quantized positions and octahedral normals.
    Quantized,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// 0 stores field payloads uncompressed, anything above uses lz4.
    pub level: u8,
    pub mesh: MeshCompression,
    /// Bits per position component in quantized mode.
    pub position_bits: u8,
    /// Bits per octahedral normal component in quantized mode.
    pub normal_bits: u8,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            level: 7,
            mesh: MeshCompression::Quantized,
            position_bits: 14,
            normal_bits: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub worker_threads: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { worker_threads: 4 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Chunks farther than this from every viewer are evicted.
    pub distance: f32,
    /// Upper bound on resident chunks; the least recently used go first.
    pub max_resident: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            distance: 1536.0,
            max_resident: 4096,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Participant id; the high 16 bits of every edit id this peer allocates.
    pub peer: u16,
    /// How long a sequence gap may stay open before a resync is requested.
    pub resync_timeout_ms: u64,
    /// Deltas buffered per chunk before the session gives up and resyncs.
    pub max_buffered: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            peer: 0,
            resync_timeout_ms: 2000,
            max_buffered: 256,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&text)?;
        log::info!("Loaded engine config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Check every cross-field constraint.
    pub fn validate(&self) -> Result<()> {
        if !self.chunk_size.is_power_of_two() || !(4..=128).contains(&self.chunk_size) {
            return Err(Error::Config(format!(
                "chunk_size must be a power of two in 4..=128, got {}",
                self.chunk_size
            )));
        }
        if self.max_depth > MAX_OCTREE_DEPTH {
            return Err(Error::Config(format!(
                "max_depth {} exceeds {}",
                self.max_depth, MAX_OCTREE_DEPTH
            )));
        }
        if self.lod_distances.len() != self.max_depth as usize {
            return Err(Error::Config(format!(
                "expected {} lod_distances (one per level), got {}",
                self.max_depth,
                self.lod_distances.len()
            )));
        }
        let mut previous = 0.0f32;
        for (i, &d) in self.lod_distances.iter().enumerate() {
            if !d.is_finite() || d <= previous {
                return Err(Error::Config(format!(
                    "lod_distances must be positive and strictly increasing (entry {} = {})",
                    i, d
                )));
            }
            previous = d;
        }
        if !(self.view_distance.is_finite() && self.view_distance > 0.0) {
            return Err(Error::Config("view_distance must be positive".into()));
        }
        if self.generation_retries == 0 {
            return Err(Error::Config("generation_retries must be at least 1".into()));
        }
        if !(1..=24).contains(&self.compression.position_bits) {
            return Err(Error::Config("position_bits must be in 1..=24".into()));
        }
        if !(2..=16).contains(&self.compression.normal_bits) {
            return Err(Error::Config("normal_bits must be in 2..=16".into()));
        }
        if self.scheduler.worker_threads == 0 {
            return Err(Error::Config("worker_threads must be at least 1".into()));
        }
        if self.eviction.max_resident == 0 || !(self.eviction.distance > 0.0) {
            return Err(Error::Config(
                "eviction needs a positive distance and max_resident".into(),
            ));
        }
        if self.replication.max_buffered == 0 {
            return Err(Error::Config("replication.max_buffered must be at least 1".into()));
        }
        self.generator.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_non_monotonic_lod_fails() {
        let config = EngineConfig {
            lod_distances: vec![96.0, 80.0, 384.0, 768.0],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_lod_count_must_match_depth() {
        let config = EngineConfig {
            max_depth: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_chunk_size_power_of_two() {
        let config = EngineConfig {
            chunk_size: 24,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "chunk_size": 16, "max_depth": 2, "lod_distances": [40.0, 90.0] }"#,
        )
        .unwrap();
        assert_eq!(config.chunk_size, 16);
        assert_eq!(config.generation_retries, 3);
        assert_eq!(config.compression.position_bits, 14);
    }

    #[test]
    fn test_json_rejects_bad_thresholds() {
        let result = EngineConfig::from_json_str(
            r#"{ "max_depth": 2, "lod_distances": [90.0, 40.0] }"#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
