//! Voxel sample type

use bytemuck::{Pod, Zeroable};
use rkyv::{Archive, Deserialize, Serialize};

/// Material flags
pub mod flags {
    /// Set on samples produced by an edit rather than the generator.
    pub const EDITED: u8 = 1 << 0;
}

/// Blended material: `blend` is the weight (0..=255) of `secondary` over `primary`.
#[repr(C)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable, Archive, Deserialize, Serialize,
    serde::Serialize, serde::Deserialize,
)]
pub struct Material {
    pub primary: u8,
    pub secondary: u8,
    pub blend: u8,
    pub flags: u8,
}

impl Material {
    pub const AIR: Material = Material { primary: 0, secondary: 0, blend: 0, flags: 0 };

    /// Single unblended material
    pub const fn solid(id: u8) -> Self {
        Self { primary: id, secondary: id, blend: 0, flags: 0 }
    }

    /// Id that dominates the blend
    pub fn dominant(&self) -> u8 {
        if self.blend > 127 { self.secondary } else { self.primary }
    }

    /// Move toward `target` by `weight` (0..=255) in 8-bit fixed point.
    ///
    /// Integer arithmetic keeps replays bit-exact.
    pub fn blend_toward(&self, target: u8, weight: u8) -> Material {
        if weight == 0 {
            return *self;
        }
        let mut out = *self;
        if self.primary == target && self.blend == 0 {
            return out;
        }
        if self.secondary != target {
            // Retire the weaker side so the blend stays two-way.
            if self.blend > 127 {
                out.primary = self.secondary;
                out.blend = 255 - self.blend;
            }
            out.secondary = target;
            out.blend = 0;
        }
        let current = out.blend as u32;
        let step = ((255 - current) * weight as u32 + 127) / 255;
        out.blend = (current + step).min(255) as u8;
        if out.blend == 255 {
            out.primary = target;
            out.blend = 0;
        }
        out.flags |= flags::EDITED;
        out
    }
}

/// Single field sample - exactly 8 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable, Archive, Deserialize, Serialize)]
pub struct Voxel {
    /// Signed density in [-1, 1]; positive is solid
    pub density: f32,
    pub material: Material,
}

impl Default for Voxel {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Voxel {
    /// Air sample
    pub const EMPTY: Voxel = Voxel {
        density: -1.0,
        material: Material::AIR,
    };

    /// Create a sample, clamping density into [-1, 1]
    pub fn new(density: f32, material: Material) -> Self {
        Self {
            density: density.clamp(-1.0, 1.0),
            material,
        }
    }

    /// Check if the sample is inside the surface
    #[inline]
    pub fn is_solid(&self) -> bool {
        self.density > 0.0
    }

    /// NaN densities never enter the store
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.density.is_nan()
    }
}
