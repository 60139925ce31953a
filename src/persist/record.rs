//! Chunk record codec.
//!
//! Layout: `VXCR` magic, u32 version, flags byte, u32 CRC-32 of the payload,
//! then the payload. The payload is an rkyv archive of [`ChunkData`],
//! lz4-compressed (size prepended) when the compression flag is set.

use rkyv::{Archive, Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::edit::log::ChunkEditLog;
use crate::voxel::chunk::{Chunk, ChunkKey};
use crate::voxel::voxel::{Material, Voxel};

const MAGIC: &[u8; 4] = b"VXCR";
const VERSION: u32 = 1;
const FLAG_LZ4: u8 = 1 << 0;
const HEADER_LEN: usize = 4 + 4 + 1 + 4;

/// Serializable chunk state
#[derive(Archive, Deserialize, Serialize)]
pub struct ChunkData {
    pub coord: [i32; 3],
    pub lod: u8,
    pub size: u32,
    pub generation: u64,
    pub densities: Vec<f32>,
    pub materials: Vec<Material>,
    /// Encoded [`ChunkEditLog`]
    pub log: Vec<u8>,
}

fn corrupt(msg: impl Into<String>) -> Error {
    Error::CorruptRecord(msg.into())
}

/// Encode a chunk, lz4-compressing the payload when `compress` is set.
pub fn encode_chunk(chunk: &Chunk, compress: bool) -> Result<Vec<u8>> {
    let samples = chunk.samples();
    let data = ChunkData {
        coord: chunk.key().coord.to_array(),
        lod: chunk.lod(),
        size: chunk.size(),
        generation: chunk.generation(),
        densities: samples.iter().map(|v| v.density).collect(),
        materials: samples.iter().map(|v| v.material).collect(),
        log: chunk.log().to_bytes(),
    };

    let archive = rkyv::to_bytes::<rkyv::rancor::Error>(&data)
        .map_err(|e| corrupt(format!("archive failed: {}", e)))?;
    let payload = if compress {
        lz4_flex::compress_prepend_size(&archive)
    } else {
        archive.to_vec()
    };

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.push(if compress { FLAG_LZ4 } else { 0 });
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode a chunk record. Any damage yields [`Error::CorruptRecord`].
pub fn decode_chunk(bytes: &[u8]) -> Result<Chunk> {
    if bytes.len() < HEADER_LEN {
        return Err(corrupt(format!("record too short ({} bytes)", bytes.len())));
    }
    if &bytes[0..4] != MAGIC {
        return Err(corrupt("bad chunk record magic"));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != VERSION {
        return Err(corrupt(format!("unsupported chunk record version {}", version)));
    }
    let flags = bytes[8];
    let crc = u32::from_le_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);
    let payload = &bytes[HEADER_LEN..];
    if crc32fast::hash(payload) != crc {
        return Err(corrupt("chunk record checksum mismatch"));
    }

    let raw = if flags & FLAG_LZ4 != 0 {
        lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| corrupt(format!("LZ4 decompression failed: {}", e)))?
    } else {
        payload.to_vec()
    };
    // rkyv needs the archive aligned.
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(raw.len());
    aligned.extend_from_slice(&raw);

    let archived = rkyv::access::<ArchivedChunkData, rkyv::rancor::Error>(&aligned)
        .map_err(|e| corrupt(format!("invalid archive: {}", e)))?;
    let data: ChunkData = rkyv::deserialize::<ChunkData, rkyv::rancor::Error>(archived)
        .map_err(|e| corrupt(format!("invalid archive: {}", e)))?;

    let size = data.size;
    let count = (size as usize).pow(3);
    if !size.is_power_of_two() || data.densities.len() != count || data.materials.len() != count {
        return Err(corrupt(format!(
            "sample count mismatch: size {}, {} densities, {} materials",
            size,
            data.densities.len(),
            data.materials.len()
        )));
    }
    if data.densities.iter().any(|d| d.is_nan()) {
        return Err(corrupt("NaN density in chunk record"));
    }

    let samples = data
        .densities
        .iter()
        .zip(&data.materials)
        .map(|(&density, &material)| Voxel { density, material })
        .collect();
    let log = ChunkEditLog::from_bytes(&data.log)
        .map_err(|e| corrupt(format!("edit log: {}", e)))?;
    let key = ChunkKey::new(glam::IVec3::from_array(data.coord), data.lod);
    Ok(Chunk::from_parts(key, size, samples, log, data.generation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::blend::blend_record;
    use crate::edit::record::{EditOp, EditRecord};
    use crate::edit::shape::EditShape;
    use glam::Vec3;

    fn edited_chunk() -> Chunk {
        let key = ChunkKey::at(-1, 2, 0, 0);
        let mut chunk = Chunk::new(key, 8, vec![Voxel::EMPTY; 512]);
        let mut record = EditRecord::new(EditOp::Add, EditShape::sphere(Vec3::new(-4.0, 20.0, 4.0), 2.5))
            .with_material(4);
        record.edit_id = 77;
        blend_record(chunk.samples_mut(), key, 8, &record);
        chunk.log_mut().append(record);
        chunk.bump_generation();
        chunk
    }

    #[test]
    fn test_round_trip_compressed_and_raw() {
        let chunk = edited_chunk();
        for compress in [true, false] {
            let decoded = decode_chunk(&encode_chunk(&chunk, compress).unwrap()).unwrap();
            assert_eq!(decoded.key(), chunk.key());
            assert_eq!(decoded.generation(), 1);
            assert_eq!(decoded.field_bytes(), chunk.field_bytes());
            assert_eq!(decoded.log(), chunk.log());
        }
    }

    #[test]
    fn test_flipped_byte_is_corrupt() {
        let mut bytes = encode_chunk(&edited_chunk(), true).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        assert!(matches!(decode_chunk(&bytes), Err(Error::CorruptRecord(_))));
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        let bytes = encode_chunk(&edited_chunk(), false).unwrap();
        let mut bad = bytes.clone();
        bad[1] = b'?';
        assert!(matches!(decode_chunk(&bad), Err(Error::CorruptRecord(_))));
        assert!(matches!(decode_chunk(&bytes[..6]), Err(Error::CorruptRecord(_))));
    }
}
