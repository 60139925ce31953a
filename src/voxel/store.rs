//! VoxelStore - sparse chunk storage with lazy materialization.
//!
//! Chunks live in an arena octree guarded by a structural `RwLock`; each
//! chunk sits behind its own fair lock in a [`ChunkHandle`]. The structural
//! lock is never held while waiting for a chunk lock.
//!
//! LOD-0 chunks are authoritative: they are loaded from persistence or
//! generated, and carry their own edit log. Coarser chunks are derived from
//! the generator plus the world edit overlay and are never persisted.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;

use glam::{IVec3, Vec3};

use crate::core::config::EngineConfig;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::edit::blend::blend_record;
use crate::edit::overlay::EditOverlay;
use crate::generation::WorldGenerator;
use crate::math::Aabb;
use crate::persist::Persistence;
use crate::voxel::chunk::{Chunk, ChunkKey, ChunkSnapshot};
use crate::voxel::chunk_handle::{ChunkHandle, ChunkState};
use crate::voxel::octree::ChunkOctree;
use crate::voxel::voxel::Voxel;

/// Sparse, lazily materialized chunk storage.
pub struct VoxelStore {
    chunk_size: u32,
    max_depth: u8,
    generation_retries: u32,
    generator: Arc<dyn WorldGenerator>,
    persistence: Persistence,
    overlay: RwLock<EditOverlay>,
    tree: RwLock<ChunkOctree>,
    dirty: Mutex<BTreeSet<ChunkKey>>,
    /// Access clock for LRU eviction
    clock: AtomicU64,
}

impl VoxelStore {
    pub fn new(config: &EngineConfig, generator: Arc<dyn WorldGenerator>, persistence: Persistence) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_depth: config.max_depth,
            generation_retries: config.generation_retries.max(1),
            generator,
            persistence,
            overlay: RwLock::new(EditOverlay::new(config.replication.peer)),
            tree: RwLock::new(ChunkOctree::new(config.max_depth)),
            dirty: Mutex::new(BTreeSet::new()),
            clock: AtomicU64::new(0),
        }
    }

    /// Store with the configured generator and in-memory persistence.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let generator = config.generator.build()?;
        let persistence = Persistence::new(
            Arc::new(crate::persist::MemoryKvStore::new()),
            &config.compression,
        );
        Ok(Self::new(config, generator, persistence))
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn max_depth(&self) -> u8 {
        self.max_depth
    }

    pub fn generator(&self) -> &Arc<dyn WorldGenerator> {
        &self.generator
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub fn overlay(&self) -> RwLockReadGuard<'_, EditOverlay> {
        self.overlay.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn overlay_mut(&self) -> RwLockWriteGuard<'_, EditOverlay> {
        self.overlay.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the overlay (restoring a persisted world).
    pub fn set_overlay(&self, overlay: EditOverlay) {
        *self.overlay_mut() = overlay;
    }

    fn tree(&self) -> RwLockReadGuard<'_, ChunkOctree> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn tree_mut(&self) -> RwLockWriteGuard<'_, ChunkOctree> {
        self.tree.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ---- Roots ----

    /// Create the octree root covering `root`. Returns true if new.
    pub fn ensure_root(&self, root: IVec3) -> bool {
        if self.tree().has_root(root) {
            return false;
        }
        self.tree_mut().ensure_root(root)
    }

    /// Root coordinate of the tree holding `key`
    pub fn root_of(&self, key: ChunkKey) -> IVec3 {
        key.ancestor(self.max_depth).coord
    }

    pub fn has_root(&self, root: IVec3) -> bool {
        self.tree().has_root(root)
    }

    pub fn roots(&self) -> Vec<IVec3> {
        let mut roots: Vec<IVec3> = self.tree().roots().collect();
        roots.sort_by_key(|r| (r.x, r.y, r.z));
        roots
    }

    /// Check if any LOD-0 chunk overlapping `region` lies under an existing root.
    pub fn is_materialized(&self, region: &Aabb) -> bool {
        let root_extent = self.chunk_size as f32 * (1u32 << self.max_depth) as f32;
        let tree = self.tree();
        region.cells(root_extent).any(|root| tree.has_root(root))
    }

    // ---- Slots ----

    /// Existing slot at `key`.
    pub fn handle(&self, key: ChunkKey) -> Option<Arc<ChunkHandle>> {
        self.tree().get(key)
    }

    /// Slot at `key`, created (with its root) if missing.
    fn slot(&self, key: ChunkKey) -> Result<Arc<ChunkHandle>> {
        if key.lod > self.max_depth {
            return Err(Error::Config(format!(
                "{} is above the octree depth {}",
                key, self.max_depth
            )));
        }
        if let Some(handle) = self.tree().get(key) {
            return Ok(handle);
        }
        let mut tree = self.tree_mut();
        tree.ensure_root(self.root_of(key));
        match tree.get_or_insert(key) {
            Some((handle, _)) => Ok(handle),
            None => Err(Error::Config(format!("{} has no octree root", key))),
        }
    }

    /// Run `f` on the materialized chunk under its exclusive lock.
    ///
    /// Returns `Ok(None)` only when `wait` is false and the lock is taken.
    fn locked<R>(&self, key: ChunkKey, wait: bool, f: impl FnOnce(&mut Chunk) -> R) -> Result<Option<R>> {
        loop {
            let handle = self.slot(key)?;
            let mut guard = if wait {
                handle.write()
            } else {
                match handle.try_write() {
                    Some(guard) => guard,
                    None => return Ok(None),
                }
            };
            if handle.is_evicted() {
                // Evicted while we queued; the slot is being removed.
                drop(guard);
                thread::yield_now();
                continue;
            }
            handle.touch(self.tick());
            self.materialize(key, &mut guard)?;
            return match guard.chunk_mut() {
                Some(chunk) => Ok(Some(f(chunk))),
                None => Err(Error::GenerationFailed {
                    key,
                    attempts: 0,
                    reason: "chunk not resident after materialization".into(),
                }),
            };
        }
    }

    /// Exclusive access to a chunk, waiting in FIFO order.
    pub fn with_write<R>(&self, key: ChunkKey, f: impl FnOnce(&mut Chunk) -> R) -> Result<R> {
        match self.locked(key, true, f)? {
            Some(r) => Ok(r),
            None => Err(Error::GenerationFailed {
                key,
                attempts: 0,
                reason: "lock unavailable".into(),
            }),
        }
    }

    /// Exclusive access without waiting; `Ok(None)` if the chunk is busy.
    pub fn try_with_write<R>(&self, key: ChunkKey, f: impl FnOnce(&mut Chunk) -> R) -> Result<Option<R>> {
        self.locked(key, false, f)
    }

    /// Exclusive access only if the chunk is already resident; never
    /// materializes.
    pub fn with_resident<R>(&self, key: ChunkKey, f: impl FnOnce(&mut Chunk) -> R) -> Option<R> {
        let handle = self.handle(key)?;
        let mut guard = handle.write();
        if handle.is_evicted() {
            return None;
        }
        guard.chunk_mut().map(f)
    }

    /// Shared access to a materialized chunk.
    pub fn with_read<R>(&self, key: ChunkKey, f: impl FnOnce(&Chunk) -> R) -> Result<R> {
        loop {
            let handle = self.slot(key)?;
            {
                let guard = handle.read();
                if handle.is_evicted() {
                    drop(guard);
                    thread::yield_now();
                    continue;
                }
                if let Some(chunk) = guard.chunk() {
                    handle.touch(self.tick());
                    return Ok(f(chunk));
                }
            }
            // Not resident yet: materialize under the write lock, then read.
            return self.with_write(key, |chunk| f(chunk));
        }
    }

    /// Snapshot of a chunk, loading or generating it on first access.
    pub fn get_chunk(&self, key: ChunkKey) -> Result<ChunkSnapshot> {
        self.with_read(key, Chunk::snapshot)
    }

    // ---- Materialization ----

    fn materialize(&self, key: ChunkKey, state: &mut ChunkState) -> Result<()> {
        match state {
            ChunkState::Resident(_) => Ok(()),
            ChunkState::Error(reason) => Err(Error::GenerationFailed {
                key,
                attempts: self.generation_retries,
                reason: reason.clone(),
            }),
            ChunkState::Unloaded => match self.build_chunk(key) {
                Ok(chunk) => {
                    *state = ChunkState::Resident(Box::new(chunk));
                    Ok(())
                }
                Err(e) => {
                    log::warn!("{} failed to materialize: {}", key, e);
                    *state = ChunkState::Error(e.to_string());
                    Err(e)
                }
            },
        }
    }

    fn build_chunk(&self, key: ChunkKey) -> Result<Chunk> {
        if key.lod == 0 {
            if let Some(chunk) = self.persistence.fetch_chunk(key)? {
                if chunk.key() != key || chunk.size() != self.chunk_size {
                    return Err(Error::CorruptRecord(format!(
                        "record for {} holds {} with size {}",
                        key,
                        chunk.key(),
                        chunk.size()
                    )));
                }
                log::debug!("Loaded {} ({} edits)", key, chunk.log().len());
                return Ok(chunk);
            }
        }
        let mut chunk = Chunk::new(key, self.chunk_size, self.base_field(key)?);
        if key.lod > 0 {
            self.replay_overlay(&mut chunk);
        }
        log::debug!("Generated {}", key);
        Ok(chunk)
    }

    /// Generator output for `key`, retried on faults and validated.
    pub fn base_field(&self, key: ChunkKey) -> Result<Vec<Voxel>> {
        let expected = (self.chunk_size as usize).pow(3);
        let mut reason = String::new();
        for attempt in 1..=self.generation_retries {
            match self.generator.generate(key, self.chunk_size) {
                Ok(samples) if samples.len() != expected => {
                    reason = format!("expected {} samples, got {}", expected, samples.len());
                }
                Ok(samples) if samples.iter().any(|v| !v.is_valid()) => {
                    reason = "NaN density".to_string();
                }
                Ok(samples) => return Ok(samples),
                Err(fault) => reason = fault.0,
            }
            log::warn!(
                "Generator fault on {} (attempt {}/{}): {}",
                key, attempt, self.generation_retries, reason
            );
        }
        Err(Error::GenerationFailed {
            key,
            attempts: self.generation_retries,
            reason,
        })
    }

    /// Blend every overlay edit touching a coarse chunk, in arrival order.
    fn replay_overlay(&self, chunk: &mut Chunk) {
        let key = chunk.key();
        let bounds = chunk.bounds();
        let overlay = self.overlay();
        for record in overlay.edits_in_region(&bounds) {
            blend_record(chunk.samples_mut(), key, self.chunk_size, record);
            chunk.log_mut().append(record.clone());
        }
    }

    /// Reset a coarse chunk to its base and replay the overlay.
    pub fn rebuild_derived(&self, chunk: &mut Chunk) -> Result<()> {
        let base = self.base_field(chunk.key())?;
        chunk.replace_samples(base);
        *chunk.log_mut() = Default::default();
        self.replay_overlay(chunk);
        chunk.bump_generation();
        chunk.set_dirty(true);
        Ok(())
    }

    /// Forget an `Error` state so the next access retries. Returns true if
    /// the chunk was in error.
    pub fn clear_error(&self, key: ChunkKey) -> bool {
        let Some(handle) = self.handle(key) else {
            return false;
        };
        let mut guard = handle.write();
        if matches!(*guard, ChunkState::Error(_)) {
            *guard = ChunkState::Unloaded;
            log::info!("Cleared error on {}", key);
            true
        } else {
            false
        }
    }

    pub fn is_error(&self, key: ChunkKey) -> bool {
        self.handle(key)
            .map(|h| matches!(*h.read(), ChunkState::Error(_)))
            .unwrap_or(false)
    }

    /// Replace a chunk wholesale (replication resync).
    ///
    /// The installed generation is raised past the local one so stale jobs
    /// cancel. The overlay is brought in line with the new log.
    pub fn install(&self, mut chunk: Chunk) -> Result<()> {
        let key = chunk.key();
        if chunk.size() != self.chunk_size {
            return Err(Error::CorruptRecord(format!(
                "installed {} has size {}, store uses {}",
                key,
                chunk.size(),
                self.chunk_size
            )));
        }
        if chunk.samples().iter().any(|v| !v.is_valid()) {
            return Err(Error::CorruptRecord(format!("installed {} has NaN samples", key)));
        }
        loop {
            let handle = self.slot(key)?;
            let mut guard = handle.write();
            if handle.is_evicted() {
                drop(guard);
                thread::yield_now();
                continue;
            }
            let local = guard.chunk().map(Chunk::generation).unwrap_or(handle.generation());
            chunk.set_generation(chunk.generation().max(local + 1));
            chunk.set_dirty(true);

            if key.lod == 0 {
                let mut overlay = self.overlay_mut();
                let stale: Vec<u64> = overlay
                    .edits_for_chunk(key.coord)
                    .iter()
                    .copied()
                    .filter(|id| !chunk.log().contains_edit(*id))
                    .collect();
                for id in stale {
                    overlay.forget(id, key.coord);
                }
                for record in chunk.log().records() {
                    overlay.record(record, key.coord);
                }
            }
            log::info!("Installed {} at generation {}", key, chunk.generation());
            *guard = ChunkState::Resident(Box::new(chunk));
            drop(guard);
            self.mark_dirty(key);
            return Ok(());
        }
    }

    // ---- Dirty tracking ----

    pub fn mark_dirty(&self, key: ChunkKey) {
        self.dirty.lock().unwrap_or_else(PoisonError::into_inner).insert(key);
    }

    /// Drain the dirty set in key order.
    pub fn take_dirty(&self) -> Vec<ChunkKey> {
        let mut dirty = self.dirty.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *dirty).into_iter().collect()
    }

    // ---- Queries ----

    /// Visit every resident chunk of the same LOD within Chebyshev `radius`
    /// of `key` (excluding `key`), in key order.
    pub fn for_each_neighbor(&self, key: ChunkKey, radius: i32, mut f: impl FnMut(&Chunk)) {
        let mut handles = Vec::new();
        {
            let tree = self.tree();
            for dz in -radius..=radius {
                for dy in -radius..=radius {
                    for dx in -radius..=radius {
                        let delta = IVec3::new(dx, dy, dz);
                        if delta == IVec3::ZERO {
                            continue;
                        }
                        if let Some(h) = tree.get(key.offset(delta)) {
                            handles.push(h);
                        }
                    }
                }
            }
        }
        handles.sort_by_key(|h| h.key);
        for handle in handles {
            let guard = handle.read();
            if let Some(chunk) = guard.chunk() {
                f(chunk);
            }
        }
    }

    /// Slots at `lod` whose box intersects `region`.
    pub fn handles_in_region(&self, region: &Aabb, lod: u8) -> Vec<Arc<ChunkHandle>> {
        let min = region.min.floor().as_ivec3();
        let max = region.max.floor().as_ivec3() + IVec3::ONE;
        let mut handles = self.tree().handles_in_box(min, max, lod, self.chunk_size);
        handles.sort_by_key(|h| h.key);
        handles
    }

    /// Keys of resident chunks, in key order.
    pub fn resident_keys(&self) -> Vec<ChunkKey> {
        let handles = self.tree().handles();
        let mut keys: Vec<ChunkKey> = handles
            .iter()
            .filter(|h| h.is_resident() && !h.is_evicted())
            .map(|h| h.key)
            .collect();
        keys.sort();
        keys
    }

    /// Number of chunk slots (resident, unloaded or failed)
    pub fn slot_count(&self) -> usize {
        self.tree().chunk_count()
    }

    pub fn resident_count(&self) -> usize {
        self.resident_keys().len()
    }

    /// Whether `key` is in memory, without waiting for its lock.
    pub fn is_resident(&self, key: ChunkKey) -> bool {
        self.handle(key).is_some_and(|h| h.is_resident() && !h.is_evicted())
    }

    /// Last published generation of a chunk slot.
    pub fn generation_of(&self, key: ChunkKey) -> Option<u64> {
        self.handle(key).map(|h| h.generation())
    }

    /// Identity of the current slot; changes whenever the chunk is evicted
    /// and re-created.
    pub fn eviction_epoch(&self, key: ChunkKey) -> Option<u64> {
        self.handle(key).map(|h| h.epoch())
    }

    /// Write a resident LOD-0 chunk through to persistence; the record is
    /// removed once the log is empty. Returns false if nothing was resident.
    pub fn persist(&self, key: ChunkKey) -> Result<bool> {
        if key.lod != 0 {
            return Ok(false);
        }
        let Some(handle) = self.handle(key) else {
            return Ok(false);
        };
        let guard = handle.read();
        let Some(chunk) = guard.chunk() else {
            return Ok(false);
        };
        if chunk.log().is_empty() {
            self.persistence.remove_chunk(key)?;
        } else {
            self.persistence.store_chunk(chunk)?;
        }
        Ok(true)
    }

    // ---- Eviction ----

    /// Free a chunk, persisting it first when it carries edits.
    ///
    /// Returns false if no slot exists.
    pub fn evict(&self, key: ChunkKey) -> Result<bool> {
        let Some(handle) = self.handle(key) else {
            return Ok(false);
        };
        {
            let mut guard = handle.write();
            if handle.is_evicted() {
                return Ok(false);
            }
            if let Some(chunk) = guard.chunk() {
                if chunk.lod() == 0 {
                    if chunk.log().is_empty() {
                        self.persistence.remove_chunk(key)?;
                    } else {
                        self.persistence.store_chunk(chunk)?;
                    }
                }
            }
            *guard = ChunkState::Unloaded;
            handle.mark_evicted();
        }
        {
            let mut tree = self.tree_mut();
            if tree.get(key).is_some_and(|h| Arc::ptr_eq(&h, &handle)) {
                tree.remove(key);
            }
        }
        self.dirty.lock().unwrap_or_else(PoisonError::into_inner).remove(&key);
        log::debug!("Evicted {}", key);
        Ok(true)
    }

    /// Chunks `evict_beyond` would free: those farther than `distance` from
    /// every viewer, then the least recently used ones until at most
    /// `capacity` slots remain. Takes no chunk lock.
    pub fn eviction_candidates(&self, viewers: &[Vec3], distance: f32, capacity: usize) -> Vec<ChunkKey> {
        let handles = self.tree().handles();
        let mut candidates = Vec::new();
        let mut kept = Vec::new();
        for handle in handles {
            let bounds = handle.key.bounds(self.chunk_size);
            let nearest = viewers
                .iter()
                .map(|v| bounds.distance_to_point(*v))
                .fold(f32::INFINITY, f32::min);
            if nearest > distance {
                candidates.push(handle.key);
            } else {
                kept.push(handle);
            }
        }
        if kept.len() > capacity {
            kept.sort_by_key(|h| (h.last_access(), h.key));
            let excess = kept.len() - capacity;
            candidates.extend(kept.into_iter().take(excess).map(|h| h.key));
        }
        candidates
    }

    /// Evict every chunk [`eviction_candidates`](Self::eviction_candidates) names.
    pub fn evict_beyond(&self, viewers: &[Vec3], distance: f32, capacity: usize) -> Result<Vec<ChunkKey>> {
        let mut evicted = Vec::new();
        for key in self.eviction_candidates(viewers, distance, capacity) {
            if self.evict(key)? {
                evicted.push(key);
            }
        }
        if !evicted.is_empty() {
            log::info!("Evicted {} chunk(s)", evicted.len());
        }
        Ok(evicted)
    }

    /// Persist every edited LOD-0 chunk and the overlay.
    pub fn flush(&self) -> Result<usize> {
        let mut stored = 0;
        for handle in self.tree().handles() {
            if handle.key.lod != 0 {
                continue;
            }
            let guard = handle.read();
            if let Some(chunk) = guard.chunk() {
                if !chunk.log().is_empty() {
                    self.persistence.store_chunk(chunk)?;
                    stored += 1;
                }
            }
        }
        self.persistence.store_overlay(&self.overlay())?;
        log::info!("Flushed {} chunk(s)", stored);
        Ok(stored)
    }
}

impl std::fmt::Debug for VoxelStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoxelStore")
            .field("chunk_size", &self.chunk_size)
            .field("max_depth", &self.max_depth)
            .field("tree", &*self.tree())
            .finish()
    }
}
