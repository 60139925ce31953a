//! Combination rules that blend an edit shape into a chunk field.
//!
//! Everything here is a pure function of (samples, key, record): replaying the
//! same records over the same base reproduces the field bit for bit.

use glam::{IVec3, Vec3};

use crate::edit::record::{EditOp, EditRecord};
use crate::voxel::chunk::{sample_index, ChunkKey};
use crate::voxel::voxel::{flags, Material, Voxel};

/// Blend `record` into `samples` (a `size³` field of chunk `key`).
///
/// Returns the number of samples that changed.
pub fn blend_record(samples: &mut [Voxel], key: ChunkKey, size: u32, record: &EditRecord) -> usize {
    let spacing = key.spacing();
    let origin = key.origin(size);
    let region = record.influence();

    // Sample index range covered by the influence box.
    let lo = ((region.min - origin.as_vec3()) / spacing as f32).ceil().as_ivec3();
    let hi = ((region.max - origin.as_vec3()) / spacing as f32).floor().as_ivec3();
    let lo = lo.max(IVec3::ZERO);
    let hi = hi.min(IVec3::splat(size as i32 - 1));
    if lo.cmpgt(hi).any() {
        return 0;
    }

    // Ramp width in sample units so every LOD keeps the same density scale.
    let ramp = record.effective_falloff() * spacing as f32;
    let weight = record.strength.clamp(0.0, 1.0);

    let mut changed = 0;
    for z in lo.z..=hi.z {
        for y in lo.y..=hi.y {
            for x in lo.x..=hi.x {
                let p = (origin + IVec3::new(x, y, z) * spacing).as_vec3();
                let i = sample_index(size, x as u32, y as u32, z as u32);
                let before = samples[i];
                let after = blend_sample(before, p, ramp, weight, record);
                if after != before {
                    samples[i] = after;
                    changed += 1;
                }
            }
        }
    }
    changed
}

fn blend_sample(v: Voxel, p: Vec3, ramp: f32, weight: f32, record: &EditRecord) -> Voxel {
    let sdf = record.shape.sdf(p);
    let shape_density = (-sdf / ramp).clamp(-1.0, 1.0);
    let d = v.density;

    match record.op {
        EditOp::Add => {
            if shape_density <= d {
                return v;
            }
            let material = if d <= 0.0 {
                edited(Material::solid(record.material))
            } else {
                v.material
            };
            Voxel::new(d + (shape_density - d) * weight, material)
        }
        EditOp::Subtract => {
            let target = -shape_density;
            if target >= d {
                return v;
            }
            Voxel::new(d + (target - d) * weight, v.material)
        }
        EditOp::Paint => {
            if shape_density <= 0.0 {
                return v;
            }
            let amount = (shape_density * weight * 255.0).round() as u8;
            Voxel {
                density: d,
                material: v.material.blend_toward(record.material, amount),
            }
        }
        EditOp::SetValue => {
            if sdf > 0.0 {
                return v;
            }
            Voxel::new(record.strength, edited(Material::solid(record.material)))
        }
    }
}

fn edited(mut material: Material) -> Material {
    material.flags |= flags::EDITED;
    material
}
