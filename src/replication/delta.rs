//! Replication wire format.
//!
//! Frame layout: magic `VXRD`, one kind byte, then the kind's body. Every
//! body starts with the chunk key (three i32 coords and the LOD byte).

use std::io::{self, Read, Write};

use glam::IVec3;

use crate::core::error::Error;
use crate::core::types::Result;
use crate::edit::log::{read_record, read_u32, read_u64, write_record};
use crate::edit::record::EditRecord;
use crate::voxel::chunk::ChunkKey;

const MAGIC: &[u8; 4] = b"VXRD";

const KIND_EDIT: u8 = 1;
const KIND_UNDO: u8 = 2;
const KIND_FULL_CHUNK: u8 = 3;
const KIND_RESYNC: u8 = 4;
const KIND_MESH: u8 = 5;

/// Largest byte payload a frame may announce.
const MAX_PAYLOAD: u32 = 64 << 20;

/// One replicated change.
#[derive(Clone, Debug, PartialEq)]
pub enum Delta {
    /// A record appended to a chunk log; `record.sequence` is its slot.
    Edit { key: ChunkKey, record: EditRecord },
    /// The newest record, with this sequence, was popped.
    Undo { key: ChunkKey, sequence: u64 },
    /// Authoritative chunk state (a persistence record).
    FullChunk { key: ChunkKey, bytes: Vec<u8> },
    /// Ask the peer for a `FullChunk`.
    ResyncRequest { key: ChunkKey },
    /// A compressed mesh.
    Mesh { key: ChunkKey, generation: u64, bytes: Vec<u8> },
}

impl Delta {
    pub fn key(&self) -> ChunkKey {
        match self {
            Delta::Edit { key, .. }
            | Delta::Undo { key, .. }
            | Delta::FullChunk { key, .. }
            | Delta::ResyncRequest { key }
            | Delta::Mesh { key, .. } => *key,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Delta::Edit { .. } => KIND_EDIT,
            Delta::Undo { .. } => KIND_UNDO,
            Delta::FullChunk { .. } => KIND_FULL_CHUNK,
            Delta::ResyncRequest { .. } => KIND_RESYNC,
            Delta::Mesh { .. } => KIND_MESH,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        // Writing into a Vec cannot fail.
        let _ = self.write_to(&mut out);
        out
    }

    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_all(&[self.kind()])?;
        write_key(writer, self.key())?;
        match self {
            Delta::Edit { record, .. } => write_record(writer, record)?,
            Delta::Undo { sequence, .. } => writer.write_all(&sequence.to_le_bytes())?,
            Delta::FullChunk { bytes, .. } => write_bytes(writer, bytes)?,
            Delta::ResyncRequest { .. } => {}
            Delta::Mesh { generation, bytes, .. } => {
                writer.write_all(&generation.to_le_bytes())?;
                write_bytes(writer, bytes)?;
            }
        }
        Ok(())
    }

    /// Decode one frame. Malformed input is `CorruptRecord`.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        let reader = &mut bytes;
        let delta = Self::read_from(reader).map_err(|e| Error::CorruptRecord(format!("delta: {}", e)))?;
        if !reader.is_empty() {
            return Err(Error::CorruptRecord(format!("delta: {} trailing bytes", reader.len())));
        }
        Ok(delta)
    }

    fn read_from(reader: &mut &[u8]) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Invalid magic bytes"));
        }
        let mut kind = [0u8; 1];
        reader.read_exact(&mut kind)?;
        let key = read_key(reader)?;
        let delta = match kind[0] {
            KIND_EDIT => Delta::Edit { key, record: read_record(reader)? },
            KIND_UNDO => Delta::Undo { key, sequence: read_u64(reader)? },
            KIND_FULL_CHUNK => Delta::FullChunk { key, bytes: read_bytes(reader)? },
            KIND_RESYNC => Delta::ResyncRequest { key },
            KIND_MESH => {
                let generation = read_u64(reader)?;
                Delta::Mesh { key, generation, bytes: read_bytes(reader)? }
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Unknown delta kind: {}", other),
                ));
            }
        };
        Ok(delta)
    }
}

fn write_key(writer: &mut impl Write, key: ChunkKey) -> io::Result<()> {
    for v in key.coord.to_array() {
        writer.write_all(&v.to_le_bytes())?;
    }
    writer.write_all(&[key.lod])
}

fn read_key(reader: &mut impl Read) -> io::Result<ChunkKey> {
    let coord = IVec3::new(
        read_u32(reader)? as i32,
        read_u32(reader)? as i32,
        read_u32(reader)? as i32,
    );
    let mut lod = [0u8; 1];
    reader.read_exact(&mut lod)?;
    Ok(ChunkKey::new(coord, lod[0]))
}

fn write_bytes(writer: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(bytes)
}

fn read_bytes(reader: &mut impl Read) -> io::Result<Vec<u8>> {
    let len = read_u32(reader)?;
    if len > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("payload of {} bytes exceeds limit", len),
        ));
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::record::EditOp;
    use crate::edit::shape::EditShape;
    use glam::Vec3;

    #[test]
    fn test_edit_frame() {
        let mut record = EditRecord::new(EditOp::Add, EditShape::sphere(Vec3::new(1.0, 2.0, 3.0), 2.5))
            .with_material(9);
        record.edit_id = 0x0002_0000_0000_0007;
        record.sequence = 4;
        let delta = Delta::Edit { key: ChunkKey::at(-3, 0, 7, 0), record };
        let bytes = delta.encode();
        assert_eq!(&bytes[..4], b"VXRD");
        assert_eq!(bytes[4], KIND_EDIT);
        assert_eq!(Delta::decode(&bytes).unwrap(), delta);
    }

    #[test]
    fn test_mesh_frame_keeps_payload() {
        let delta = Delta::Mesh { key: ChunkKey::at(1, 1, 1, 2), generation: 42, bytes: vec![1, 2, 3, 4, 5] };
        assert_eq!(Delta::decode(&delta.encode()).unwrap(), delta);
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let mut bytes = Delta::ResyncRequest { key: ChunkKey::at(0, 0, 0, 0) }.encode();
        bytes[4] = 77;
        assert!(matches!(Delta::decode(&bytes), Err(Error::CorruptRecord(_))));
    }

    #[test]
    fn test_rejects_truncated_and_trailing() {
        let bytes = Delta::FullChunk { key: ChunkKey::at(0, 0, 0, 0), bytes: vec![7; 32] }.encode();
        assert!(Delta::decode(&bytes[..bytes.len() - 1]).is_err());
        let mut longer = bytes.clone();
        longer.push(0);
        assert!(Delta::decode(&longer).is_err());
    }
}
