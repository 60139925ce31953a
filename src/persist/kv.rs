//! Key-value storage boundary and the two bundled backends.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use glam::IVec3;

use crate::core::types::Result;
use crate::voxel::chunk::ChunkKey;

/// Storage key of a persisted record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub coord: [i32; 3],
    pub lod: u8,
}

impl RecordKey {
    /// Reserved slot for the world edit overlay (no chunk has this LOD)
    pub const OVERLAY: RecordKey = RecordKey { coord: [0, 0, 0], lod: u8::MAX };

    pub fn chunk(key: ChunkKey) -> Self {
        Self { coord: key.coord.to_array(), lod: key.lod }
    }

    /// Chunk this record belongs to, `None` for reserved keys
    pub fn chunk_key(&self) -> Option<ChunkKey> {
        (*self != Self::OVERLAY).then(|| ChunkKey::new(IVec3::from_array(self.coord), self.lod))
    }

    fn file_name(&self) -> String {
        if *self == Self::OVERLAY {
            return "overlay.vxo".to_string();
        }
        let [x, y, z] = self.coord;
        format!("chunk_{}_{}_{}_{}.vxc", x, y, z, self.lod)
    }

    fn from_file_name(name: &str) -> Option<Self> {
        if name == "overlay.vxo" {
            return Some(Self::OVERLAY);
        }
        let stem = name.strip_prefix("chunk_")?.strip_suffix(".vxc")?;
        let mut parts = stem.split('_');
        let x = parts.next()?.parse().ok()?;
        let y = parts.next()?.parse().ok()?;
        let z = parts.next()?.parse().ok()?;
        let lod = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { coord: [x, y, z], lod })
    }
}

/// Host-provided byte storage.
pub trait KvStore: Send + Sync {
    fn get(&self, key: RecordKey) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: RecordKey, bytes: Vec<u8>) -> Result<()>;
    fn delete(&self, key: RecordKey) -> Result<()>;
    fn keys(&self) -> Result<Vec<RecordKey>>;
}

/// In-memory store, mostly for tests and tools.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    records: RwLock<HashMap<RecordKey, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: RecordKey) -> Result<Option<Vec<u8>>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(&key).cloned())
    }

    fn put(&self, key: RecordKey, bytes: Vec<u8>) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.insert(key, bytes);
        Ok(())
    }

    fn delete(&self, key: RecordKey) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.remove(&key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<RecordKey>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<RecordKey> = records.keys().copied().collect();
        keys.sort();
        Ok(keys)
    }
}

/// One file per record under a base directory.
#[derive(Debug, Clone)]
pub struct DirKvStore {
    base_dir: PathBuf,
}

impl DirKvStore {
    /// Open (creating if needed) a store rooted at `base_dir`.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;
        log::info!("Chunk store at {}", base_dir.display());
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the file holding `key`
    pub fn path_of(&self, key: RecordKey) -> PathBuf {
        self.base_dir.join(key.file_name())
    }
}

impl KvStore for DirKvStore {
    fn get(&self, key: RecordKey) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_of(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: RecordKey, bytes: Vec<u8>) -> Result<()> {
        // Write beside the target and rename so readers never see a torn file.
        let path = self.path_of(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, key: RecordKey) -> Result<()> {
        match fs::remove_file(self.path_of(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<RecordKey>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if let Some(key) = entry.file_name().to_str().and_then(RecordKey::from_file_name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
