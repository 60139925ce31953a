//! Edit record representation.

use crate::edit::shape::EditShape;
use crate::math::Aabb;
use crate::voxel::chunk::ChunkKey;

/// CSG combination rule of an edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EditOp {
    /// Max-combine density toward solid
    Add,
    /// Min-combine density toward empty
    Subtract,
    /// Blend material, leave density alone
    Paint,
    /// Overwrite density and material inside the shape
    SetValue,
}

impl EditOp {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            EditOp::Add => 0,
            EditOp::Subtract => 1,
            EditOp::Paint => 2,
            EditOp::SetValue => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(EditOp::Add),
            1 => Some(EditOp::Subtract),
            2 => Some(EditOp::Paint),
            3 => Some(EditOp::SetValue),
            _ => None,
        }
    }
}

/// A single edit with its metadata.
///
/// Built by the host without ids; the pipeline assigns `edit_id` when the
/// edit is submitted and `sequence` when it is appended to a chunk log.
#[derive(Clone, Debug, PartialEq)]
pub struct EditRecord {
    pub op: EditOp,
    pub shape: EditShape,
    /// Blend weight for Add/Subtract/Paint (clamped to [0, 1]); target
    /// density for SetValue (clamped to [-1, 1])
    pub strength: f32,
    /// Width (voxels) of the density ramp around the shape surface
    pub falloff: f32,
    pub material: u8,
    /// World-level edit this record was split from (0 = unassigned)
    pub edit_id: u64,
    /// Position in the owning chunk's log (0 = not yet appended)
    pub sequence: u64,
}

impl EditRecord {
    /// Create a full-strength edit with a one voxel falloff.
    pub fn new(op: EditOp, shape: EditShape) -> Self {
        Self {
            op,
            shape,
            strength: 1.0,
            falloff: 1.0,
            material: 0,
            edit_id: 0,
            sequence: 0,
        }
    }

    pub fn with_strength(mut self, strength: f32) -> Self {
        self.strength = strength;
        self
    }

    pub fn with_falloff(mut self, falloff: f32) -> Self {
        self.falloff = falloff;
        self
    }

    pub fn with_material(mut self, material: u8) -> Self {
        self.material = material;
        self
    }

    /// Falloff actually used by the blend (never below a hundredth of a voxel)
    pub fn effective_falloff(&self) -> f32 {
        if self.falloff.is_finite() {
            self.falloff.max(0.01)
        } else {
            1.0
        }
    }

    /// Region whose samples this edit can change.
    pub fn influence(&self) -> Aabb {
        self.shape.bounds().inflated(self.effective_falloff())
    }

    /// Chunks at `lod` whose samples overlap the influence region.
    pub fn affected_chunks(&self, lod: u8, chunk_size: u32) -> Vec<ChunkKey> {
        let extent = (chunk_size as i32 * (1 << lod)) as f32;
        self.influence()
            .cells(extent)
            .map(|coord| ChunkKey::new(coord, lod))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_builder_defaults() {
        let record = EditRecord::new(EditOp::Add, EditShape::sphere(Vec3::ZERO, 2.0))
            .with_material(4)
            .with_strength(0.5);
        assert_eq!(record.material, 4);
        assert_eq!(record.strength, 0.5);
        assert_eq!(record.sequence, 0);
        assert_eq!(record.edit_id, 0);
    }

    #[test]
    fn test_affected_chunks_single() {
        let record = EditRecord::new(EditOp::Add, EditShape::sphere(Vec3::splat(16.0), 3.0));
        let chunks = record.affected_chunks(0, 32);
        assert_eq!(chunks, vec![ChunkKey::at(0, 0, 0, 0)]);
    }

    #[test]
    fn test_affected_chunks_straddles_boundary() {
        let record = EditRecord::new(EditOp::Subtract, EditShape::sphere(Vec3::new(32.0, 16.0, 16.0), 4.0));
        let chunks = record.affected_chunks(0, 32);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.contains(&ChunkKey::at(0, 0, 0, 0)));
        assert!(chunks.contains(&ChunkKey::at(1, 0, 0, 0)));
        // One chunk covers both at LOD 1.
        assert_eq!(record.affected_chunks(1, 32), vec![ChunkKey::at(0, 0, 0, 1)]);
    }

    #[test]
    fn test_op_codes() {
        for op in [EditOp::Add, EditOp::Subtract, EditOp::Paint, EditOp::SetValue] {
            assert_eq!(EditOp::from_u8(op.to_u8()), Some(op));
        }
        assert_eq!(EditOp::from_u8(9), None);
    }
}
