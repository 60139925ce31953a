//! Edit overlay - world-level index of applied edits.
//!
//! LOD-0 chunks carry their own authoritative logs. Coarser chunks are
//! derived: they are rebuilt from the generator plus every overlay edit that
//! touches them, in the order the overlay first saw the edits.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use glam::IVec3;

use crate::edit::log::{read_record, read_u32, read_u64, write_record};
use crate::edit::record::EditRecord;
use crate::math::Aabb;

const MAGIC: &[u8; 4] = b"VXOV";
const VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq)]
struct OverlayEntry {
    record: EditRecord,
    /// LOD-0 chunk coordinates whose logs hold a sub-edit of this edit
    chunks: Vec<IVec3>,
}

/// Participant that allocated `edit_id`.
pub fn participant_of(edit_id: u64) -> u16 {
    (edit_id >> 48) as u16
}

/// Manages applied edits as a spatial overlay.
#[derive(Debug)]
pub struct EditOverlay {
    /// Entries by arrival order
    entries: BTreeMap<u64, OverlayEntry>,
    /// edit_id -> arrival order
    by_id: HashMap<u64, u64>,
    /// Index: LOD-0 chunk -> edit ids
    chunk_index: HashMap<IVec3, Vec<u64>>,
    next_order: u64,
    /// Next local edit id (low 48 bits)
    next_id: AtomicU64,
    /// Participant id in the high 16 bits keeps ids unique across peers
    id_base: u64,
}

impl EditOverlay {
    /// Create a new empty overlay for participant `peer`.
    pub fn new(peer: u16) -> Self {
        Self {
            entries: BTreeMap::new(),
            by_id: HashMap::new(),
            chunk_index: HashMap::new(),
            next_order: 0,
            next_id: AtomicU64::new(1),
            id_base: (peer as u64) << 48,
        }
    }

    /// Participant whose ids this overlay allocates.
    pub fn peer(&self) -> u16 {
        participant_of(self.id_base)
    }

    /// Reserve a fresh world edit id.
    pub fn allocate_id(&self) -> u64 {
        self.id_base | (self.next_id.fetch_add(1, Ordering::Relaxed) & 0xFFFF_FFFF_FFFF)
    }

    /// Note that LOD-0 chunk `coord` applied a sub-edit of `record`.
    ///
    /// Returns true the first time an edit id is seen.
    pub fn record(&mut self, record: &EditRecord, coord: IVec3) -> bool {
        if let Some(order) = self.by_id.get(&record.edit_id) {
            if let Some(entry) = self.entries.get_mut(order) {
                if !entry.chunks.contains(&coord) {
                    entry.chunks.push(coord);
                    self.chunk_index.entry(coord).or_default().push(record.edit_id);
                }
            }
            return false;
        }
        let mut stored = record.clone();
        stored.sequence = 0;
        let order = self.next_order;
        self.next_order += 1;
        self.entries.insert(order, OverlayEntry { record: stored, chunks: vec![coord] });
        self.by_id.insert(record.edit_id, order);
        self.chunk_index.entry(coord).or_default().push(record.edit_id);
        true
    }

    /// Drop the reference from `coord`; the edit disappears with its last reference.
    ///
    /// Returns true if the edit was removed entirely.
    pub fn forget(&mut self, edit_id: u64, coord: IVec3) -> bool {
        if let Some(ids) = self.chunk_index.get_mut(&coord) {
            ids.retain(|&id| id != edit_id);
            if ids.is_empty() {
                self.chunk_index.remove(&coord);
            }
        }
        let Some(&order) = self.by_id.get(&edit_id) else {
            return false;
        };
        let empty = match self.entries.get_mut(&order) {
            Some(entry) => {
                entry.chunks.retain(|c| *c != coord);
                entry.chunks.is_empty()
            }
            None => false,
        };
        if empty {
            self.entries.remove(&order);
            self.by_id.remove(&edit_id);
        }
        empty
    }

    /// Newest edit by arrival order.
    pub fn latest(&self) -> Option<&EditRecord> {
        self.entries.values().next_back().map(|e| &e.record)
    }

    /// LOD-0 chunks holding a sub-edit of `edit_id`.
    pub fn chunks_of(&self, edit_id: u64) -> Vec<IVec3> {
        self.by_id
            .get(&edit_id)
            .and_then(|order| self.entries.get(order))
            .map(|e| e.chunks.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, edit_id: u64) -> Option<&EditRecord> {
        self.by_id
            .get(&edit_id)
            .and_then(|order| self.entries.get(order))
            .map(|e| &e.record)
    }

    /// Edits whose influence intersects `region`, in arrival order.
    pub fn edits_in_region(&self, region: &Aabb) -> Vec<&EditRecord> {
        self.entries
            .values()
            .filter(|e| e.record.influence().intersects(region))
            .map(|e| &e.record)
            .collect()
    }

    /// Edit ids referencing a LOD-0 chunk.
    pub fn edits_for_chunk(&self, coord: IVec3) -> &[u64] {
        self.chunk_index.get(&coord).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of edits.
    pub fn edit_count(&self) -> usize {
        self.entries.len()
    }

    /// Encode the overlay for the persistence adapter.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let _ = self.write_to(&mut out);
        out
    }

    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&self.next_id.load(Ordering::Relaxed).to_le_bytes())?;
        writer.write_all(&(self.entries.len() as u32).to_le_bytes())?;
        for entry in self.entries.values() {
            write_record(writer, &entry.record)?;
            writer.write_all(&(entry.chunks.len() as u32).to_le_bytes())?;
            for c in &entry.chunks {
                for v in c.to_array() {
                    writer.write_all(&v.to_le_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Decode an overlay written by [`EditOverlay::to_bytes`].
    pub fn from_bytes(peer: u16, mut bytes: &[u8]) -> io::Result<Self> {
        let reader = &mut bytes;
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Invalid magic bytes"));
        }
        let version = read_u32(reader)?;
        if version != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unsupported version: {}", version),
            ));
        }
        let mut overlay = Self::new(peer);
        overlay.next_id.store(read_u64(reader)?, Ordering::Relaxed);
        let count = read_u32(reader)?;
        for _ in 0..count {
            let record = read_record(reader)?;
            let chunk_count = read_u32(reader)?;
            for _ in 0..chunk_count {
                let coord = IVec3::new(
                    read_u32(reader)? as i32,
                    read_u32(reader)? as i32,
                    read_u32(reader)? as i32,
                );
                overlay.record(&record, coord);
            }
        }
        Ok(overlay)
    }
}

impl Default for EditOverlay {
    fn default() -> Self {
        Self::new(0)
    }
}
