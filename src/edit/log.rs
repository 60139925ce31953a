//! Append-only per-chunk edit log and its binary codec.
//!
//! Records carry dense sequence numbers starting at 1. The codec is shared
//! with the persistence record and the replication wire format.

use std::io::{self, Read, Write};
use std::sync::Arc;

use glam::{UVec3, Vec3};

use crate::edit::record::{EditOp, EditRecord};
use crate::edit::shape::{Axis, EditShape, SdfStamp};

const MAGIC: &[u8; 4] = b"VXED";
const VERSION: u32 = 1;

/// Ordered edit records of one chunk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChunkEditLog {
    records: Vec<EditRecord>,
}

impl ChunkEditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, stamping the next sequence number. Returns it.
    pub fn append(&mut self, mut record: EditRecord) -> u64 {
        let sequence = self.next_sequence();
        record.sequence = sequence;
        self.records.push(record);
        sequence
    }

    /// Sequence the next appended record will get
    pub fn next_sequence(&self) -> u64 {
        self.records.len() as u64 + 1
    }

    /// Remove and return the newest record.
    pub fn pop(&mut self) -> Option<EditRecord> {
        self.records.pop()
    }

    pub fn last(&self) -> Option<&EditRecord> {
        self.records.last()
    }

    /// Record stamped with `sequence`
    pub fn get(&self, sequence: u64) -> Option<&EditRecord> {
        let index = usize::try_from(sequence.checked_sub(1)?).ok()?;
        self.records.get(index)
    }

    pub fn records(&self) -> &[EditRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Check if a record from world edit `edit_id` was already applied
    pub fn contains_edit(&self, edit_id: u64) -> bool {
        self.records.iter().rev().any(|r| r.edit_id == edit_id)
    }

    /// Encode the whole log.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.records.len() * 64);
        // Writing into a Vec cannot fail.
        let _ = self.write_to(&mut out);
        out
    }

    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&(self.records.len() as u32).to_le_bytes())?;
        for record in &self.records {
            write_record(writer, record)?;
        }
        Ok(())
    }

    /// Decode a log written by [`ChunkEditLog::to_bytes`]. Sequence numbers
    /// must be dense.
    pub fn from_bytes(mut bytes: &[u8]) -> io::Result<Self> {
        let reader = &mut bytes;
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(invalid("Invalid magic bytes"));
        }
        let version = read_u32(reader)?;
        if version != VERSION {
            return Err(invalid(format!("Unsupported version: {}", version)));
        }
        let count = read_u32(reader)? as usize;
        let mut records = Vec::with_capacity(count.min(4096));
        for i in 0..count {
            let record = read_record(reader)?;
            if record.sequence != i as u64 + 1 {
                return Err(invalid(format!(
                    "sequence gap: record {} has sequence {}",
                    i, record.sequence
                )));
            }
            records.push(record);
        }
        Ok(Self { records })
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Write a single record.
pub(crate) fn write_record(writer: &mut impl Write, record: &EditRecord) -> io::Result<()> {
    writer.write_all(&record.edit_id.to_le_bytes())?;
    writer.write_all(&record.sequence.to_le_bytes())?;
    writer.write_all(&[record.op.to_u8(), record.material])?;
    writer.write_all(&record.strength.to_le_bytes())?;
    writer.write_all(&record.falloff.to_le_bytes())?;
    write_shape(writer, &record.shape)
}

/// Read a single record.
pub(crate) fn read_record(reader: &mut impl Read) -> io::Result<EditRecord> {
    let edit_id = read_u64(reader)?;
    let sequence = read_u64(reader)?;
    let mut buf2 = [0u8; 2];
    reader.read_exact(&mut buf2)?;
    let op = EditOp::from_u8(buf2[0])
        .ok_or_else(|| invalid(format!("Unknown op type: {}", buf2[0])))?;
    let strength = read_f32(reader)?;
    let falloff = read_f32(reader)?;
    let shape = read_shape(reader)?;
    Ok(EditRecord {
        op,
        shape,
        strength,
        falloff,
        material: buf2[1],
        edit_id,
        sequence,
    })
}

fn write_shape(writer: &mut impl Write, shape: &EditShape) -> io::Result<()> {
    match shape {
        EditShape::Sphere { center, radius } => {
            writer.write_all(&[0u8])?;
            write_vec3(writer, *center)?;
            writer.write_all(&radius.to_le_bytes())?;
        }
        EditShape::Box { center, half_extents } => {
            writer.write_all(&[1u8])?;
            write_vec3(writer, *center)?;
            write_vec3(writer, *half_extents)?;
        }
        EditShape::Capsule { center, radius, half_height, axis } => {
            writer.write_all(&[2u8, axis.to_u8()])?;
            write_vec3(writer, *center)?;
            writer.write_all(&radius.to_le_bytes())?;
            writer.write_all(&half_height.to_le_bytes())?;
        }
        EditShape::Cylinder { center, radius, half_height, axis } => {
            writer.write_all(&[3u8, axis.to_u8()])?;
            write_vec3(writer, *center)?;
            writer.write_all(&radius.to_le_bytes())?;
            writer.write_all(&half_height.to_le_bytes())?;
        }
        EditShape::Stamp(stamp) => {
            writer.write_all(&[4u8])?;
            write_vec3(writer, stamp.origin)?;
            for d in stamp.dims.to_array() {
                writer.write_all(&d.to_le_bytes())?;
            }
            writer.write_all(&stamp.spacing.to_le_bytes())?;
            writer.write_all(&(stamp.distances.len() as u32).to_le_bytes())?;
            for d in stamp.distances.iter() {
                writer.write_all(&d.to_le_bytes())?;
            }
        }
    }
    Ok(())
}

fn read_shape(reader: &mut impl Read) -> io::Result<EditShape> {
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag)?;
    let shape = match tag[0] {
        0 => EditShape::Sphere {
            center: read_vec3(reader)?,
            radius: read_f32(reader)?,
        },
        1 => EditShape::Box {
            center: read_vec3(reader)?,
            half_extents: read_vec3(reader)?,
        },
        2 | 3 => {
            let mut axis = [0u8; 1];
            reader.read_exact(&mut axis)?;
            let axis = Axis::from_u8(axis[0])
                .ok_or_else(|| invalid(format!("Unknown axis: {}", axis[0])))?;
            let center = read_vec3(reader)?;
            let radius = read_f32(reader)?;
            let half_height = read_f32(reader)?;
            if tag[0] == 2 {
                EditShape::Capsule { center, radius, half_height, axis }
            } else {
                EditShape::Cylinder { center, radius, half_height, axis }
            }
        }
        4 => {
            let origin = read_vec3(reader)?;
            let dims = UVec3::new(read_u32(reader)?, read_u32(reader)?, read_u32(reader)?);
            let spacing = read_f32(reader)?;
            let count = read_u32(reader)? as usize;
            let expected = dims.x as u64 * dims.y as u64 * dims.z as u64;
            if count as u64 != expected {
                return Err(invalid(format!(
                    "stamp has {} samples, dims need {}",
                    count, expected
                )));
            }
            let mut distances = Vec::with_capacity(count.min(1 << 20));
            for _ in 0..count {
                distances.push(read_f32(reader)?);
            }
            EditShape::Stamp(SdfStamp {
                origin,
                dims,
                spacing,
                distances: Arc::new(distances),
            })
        }
        other => return Err(invalid(format!("Unknown shape type: {}", other))),
    };
    Ok(shape)
}

pub(crate) fn read_u32(reader: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64(reader: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f32(reader: &mut impl Read) -> io::Result<f32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_vec3(reader: &mut impl Read) -> io::Result<Vec3> {
    Ok(Vec3::new(read_f32(reader)?, read_f32(reader)?, read_f32(reader)?))
}

fn write_vec3(writer: &mut impl Write, v: Vec3) -> io::Result<()> {
    writer.write_all(&v.x.to_le_bytes())?;
    writer.write_all(&v.y.to_le_bytes())?;
    writer.write_all(&v.z.to_le_bytes())?;
    Ok(())
}
