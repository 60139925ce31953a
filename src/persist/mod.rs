//! Persistence adapter: chunk and mesh codecs over a key-value store.

pub mod kv;
pub mod mesh_codec;
pub mod record;

use std::sync::Arc;

pub use kv::{DirKvStore, KvStore, MemoryKvStore, RecordKey};
pub use mesh_codec::MeshCodec;

use crate::core::config::CompressionConfig;
use crate::core::types::Result;
use crate::edit::overlay::EditOverlay;
use crate::mesh::Mesh;
use crate::voxel::chunk::{Chunk, ChunkKey};

/// Codecs bound to a storage backend.
#[derive(Clone)]
pub struct Persistence {
    kv: Arc<dyn KvStore>,
    compress_fields: bool,
    mesh_codec: MeshCodec,
}

impl Persistence {
    pub fn new(kv: Arc<dyn KvStore>, compression: &CompressionConfig) -> Self {
        Self {
            kv,
            compress_fields: compression.level > 0,
            mesh_codec: MeshCodec {
                mode: compression.mesh,
                position_bits: compression.position_bits,
                normal_bits: compression.normal_bits,
            },
        }
    }

    /// Memory-backed adapter with default compression
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKvStore::new()), &CompressionConfig::default())
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Encode a chunk record.
    pub fn save(&self, chunk: &Chunk) -> Result<Vec<u8>> {
        record::encode_chunk(chunk, self.compress_fields)
    }

    /// Decode a chunk record.
    pub fn load(&self, bytes: &[u8]) -> Result<Chunk> {
        record::decode_chunk(bytes)
    }

    pub fn compress_mesh(&self, mesh: &Mesh) -> Result<Vec<u8>> {
        Ok(self.mesh_codec.compress(mesh))
    }

    pub fn decompress_mesh(&self, bytes: &[u8]) -> Result<Mesh> {
        MeshCodec::decompress(bytes)
    }

    /// Encode and write a chunk under its key.
    pub fn store_chunk(&self, chunk: &Chunk) -> Result<()> {
        let bytes = self.save(chunk)?;
        log::debug!("Persisting {} ({} bytes)", chunk.key(), bytes.len());
        self.kv.put(RecordKey::chunk(chunk.key()), bytes)
    }

    /// Read and decode a chunk, `None` if no record exists.
    pub fn fetch_chunk(&self, key: ChunkKey) -> Result<Option<Chunk>> {
        match self.kv.get(RecordKey::chunk(key))? {
            Some(bytes) => self.load(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn remove_chunk(&self, key: ChunkKey) -> Result<()> {
        self.kv.delete(RecordKey::chunk(key))
    }

    /// Keys of every stored chunk record.
    pub fn stored_chunks(&self) -> Result<Vec<ChunkKey>> {
        Ok(self.kv.keys()?.iter().filter_map(RecordKey::chunk_key).collect())
    }

    pub fn store_overlay(&self, overlay: &EditOverlay) -> Result<()> {
        self.kv.put(RecordKey::OVERLAY, overlay.to_bytes())
    }

    /// Restore the edit overlay for participant `peer`.
    pub fn fetch_overlay(&self, peer: u16) -> Result<Option<EditOverlay>> {
        match self.kv.get(RecordKey::OVERLAY)? {
            Some(bytes) => EditOverlay::from_bytes(peer, &bytes)
                .map(Some)
                .map_err(|e| crate::core::error::Error::CorruptRecord(format!("overlay: {}", e))),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("compress_fields", &self.compress_fields)
            .field("mesh_codec", &self.mesh_codec)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Error;
    use crate::edit::record::{EditOp, EditRecord};
    use crate::edit::shape::EditShape;
    use crate::voxel::voxel::Voxel;
    use glam::{IVec3, Vec3};

    #[test]
    fn test_store_fetch_remove() {
        let persistence = Persistence::in_memory();
        let key = ChunkKey::at(4, 0, -4, 1);
        assert!(persistence.fetch_chunk(key).unwrap().is_none());

        let chunk = Chunk::new(key, 4, vec![Voxel::EMPTY; 64]);
        persistence.store_chunk(&chunk).unwrap();
        let loaded = persistence.fetch_chunk(key).unwrap().unwrap();
        assert_eq!(loaded.field_bytes(), chunk.field_bytes());
        assert_eq!(persistence.stored_chunks().unwrap(), vec![key]);

        persistence.remove_chunk(key).unwrap();
        assert!(persistence.fetch_chunk(key).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_stored_record() {
        let persistence = Persistence::in_memory();
        let key = ChunkKey::at(0, 0, 0, 0);
        persistence.kv().put(RecordKey::chunk(key), b"VXCR garbage".to_vec()).unwrap();
        assert!(matches!(persistence.fetch_chunk(key), Err(Error::CorruptRecord(_))));
    }

    #[test]
    fn test_overlay_slot() {
        let persistence = Persistence::in_memory();
        let mut overlay = EditOverlay::new(1);
        let mut record = EditRecord::new(EditOp::Add, EditShape::sphere(Vec3::ZERO, 1.0));
        record.edit_id = overlay.allocate_id();
        overlay.record(&record, IVec3::ZERO);
        persistence.store_overlay(&overlay).unwrap();

        let restored = persistence.fetch_overlay(1).unwrap().unwrap();
        assert_eq!(restored.edit_count(), 1);
        // The overlay slot is not a chunk.
        assert!(persistence.stored_chunks().unwrap().is_empty());
    }

    #[test]
    fn test_uncompressed_fields() {
        let compression = CompressionConfig { level: 0, ..Default::default() };
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()), &compression);
        let chunk = Chunk::new(ChunkKey::at(0, 0, 0, 0), 4, vec![Voxel::EMPTY; 64]);
        let bytes = persistence.save(&chunk).unwrap();
        assert!(bytes.len() > 64 * 8);
        assert_eq!(persistence.load(&bytes).unwrap().field_bytes(), chunk.field_bytes());
    }
}
