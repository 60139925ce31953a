//! ChunkHandle - per-chunk state behind a fair reader/writer lock.
//!
//! Writers (edits, materialization) are admitted strictly in the order they
//! asked for the lock. Readers (meshing, serialization) share the chunk while
//! no writer holds it or waits ahead of them, so a stream of readers cannot
//! starve an edit.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::voxel::chunk::{Chunk, ChunkKey};

/// State of a chunk slot in the store.
#[derive(Debug)]
pub enum ChunkState {
    /// Slot exists but the field has not been generated or loaded yet
    Unloaded,
    /// Field is in memory
    Resident(Box<Chunk>),
    /// Generation kept failing; accesses fail until the error is cleared
    Error(String),
}

impl ChunkState {
    /// Check if chunk data is available for reading.
    pub fn is_ready(&self) -> bool {
        matches!(self, ChunkState::Resident(_))
    }

    /// Get chunk data if available.
    pub fn chunk(&self) -> Option<&Chunk> {
        match self {
            ChunkState::Resident(chunk) => Some(chunk),
            _ => None,
        }
    }

    /// Get mutable chunk data if available.
    pub fn chunk_mut(&mut self) -> Option<&mut Chunk> {
        match self {
            ChunkState::Resident(chunk) => Some(chunk),
            _ => None,
        }
    }
}

/// Seen only through a guard that is mid-drop
static RELEASED: ChunkState = ChunkState::Unloaded;

#[derive(Debug, Default)]
struct GateState {
    /// Next writer ticket to hand out
    next_ticket: u64,
    /// Ticket of the writer allowed in next
    serving: u64,
    writer_active: bool,
    readers: usize,
}

impl GateState {
    fn writers_waiting(&self) -> bool {
        self.next_ticket != self.serving
    }
}

/// Ticketed FIFO gate in front of the state lock.
#[derive(Debug, Default)]
struct FairGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl FairGate {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire_write(&self) {
        let mut gate = self.lock();
        let ticket = gate.next_ticket;
        gate.next_ticket += 1;
        while gate.serving != ticket || gate.writer_active || gate.readers > 0 {
            gate = self.changed.wait(gate).unwrap_or_else(PoisonError::into_inner);
        }
        gate.serving += 1;
        gate.writer_active = true;
    }

    fn try_acquire_write(&self) -> bool {
        let mut gate = self.lock();
        if gate.writer_active || gate.readers > 0 || gate.writers_waiting() {
            return false;
        }
        gate.next_ticket += 1;
        gate.serving += 1;
        gate.writer_active = true;
        true
    }

    fn release_write(&self) {
        let mut gate = self.lock();
        gate.writer_active = false;
        drop(gate);
        self.changed.notify_all();
    }

    fn acquire_read(&self) {
        let mut gate = self.lock();
        while gate.writer_active || gate.writers_waiting() {
            gate = self.changed.wait(gate).unwrap_or_else(PoisonError::into_inner);
        }
        gate.readers += 1;
    }

    fn release_read(&self) {
        let mut gate = self.lock();
        gate.readers -= 1;
        let last = gate.readers == 0;
        drop(gate);
        if last {
            self.changed.notify_all();
        }
    }
}

/// Source of per-slot eviction epochs
static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// Thread-safe slot for one chunk.
pub struct ChunkHandle {
    pub key: ChunkKey,
    /// Unique per slot; a re-created slot for the same key gets a new one
    epoch: u64,
    gate: FairGate,
    state: RwLock<ChunkState>,
    /// Mirror of the chunk generation for lock-free cancellation checks
    generation: AtomicU64,
    /// Mirror of `state.is_ready()` for lock-free residency checks
    resident: AtomicBool,
    evicted: AtomicBool,
    /// Store clock value of the last access (for LRU eviction)
    last_access: AtomicU64,
}

impl ChunkHandle {
    /// Create a new unloaded chunk handle.
    pub fn new(key: ChunkKey) -> Self {
        Self {
            key,
            epoch: NEXT_EPOCH.fetch_add(1, Ordering::Relaxed),
            gate: FairGate::default(),
            state: RwLock::new(ChunkState::Unloaded),
            generation: AtomicU64::new(0),
            resident: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            last_access: AtomicU64::new(0),
        }
    }

    /// Create a handle with already-resident data.
    pub fn with_chunk(chunk: Chunk) -> Self {
        let handle = Self::new(chunk.key());
        handle.generation.store(chunk.generation(), Ordering::Release);
        handle.resident.store(true, Ordering::Release);
        *handle.state.write().unwrap_or_else(PoisonError::into_inner) =
            ChunkState::Resident(Box::new(chunk));
        handle
    }

    /// Shared access; waits behind any queued writer.
    pub fn read(&self) -> ChunkReadGuard<'_> {
        self.gate.acquire_read();
        ChunkReadGuard {
            handle: self,
            state: Some(self.state.read().unwrap_or_else(PoisonError::into_inner)),
        }
    }

    /// Exclusive access in FIFO order.
    pub fn write(&self) -> ChunkWriteGuard<'_> {
        self.gate.acquire_write();
        ChunkWriteGuard {
            handle: self,
            state: Some(self.state.write().unwrap_or_else(PoisonError::into_inner)),
        }
    }

    /// Exclusive access only if nobody holds or is queued for the chunk.
    pub fn try_write(&self) -> Option<ChunkWriteGuard<'_>> {
        if !self.gate.try_acquire_write() {
            return None;
        }
        Some(ChunkWriteGuard {
            handle: self,
            state: Some(self.state.write().unwrap_or_else(PoisonError::into_inner)),
        })
    }

    /// Generation last published by a writer.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether the last writer left the field in memory. Never blocks.
    pub fn is_resident(&self) -> bool {
        self.resident.load(Ordering::Acquire)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
    }

    pub fn touch(&self, tick: u64) {
        self.last_access.store(tick, Ordering::Relaxed);
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ChunkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkHandle")
            .field("key", &self.key)
            .field("epoch", &self.epoch)
            .field("generation", &self.generation())
            .field("resident", &self.is_resident())
            .field("evicted", &self.is_evicted())
            .field("gate", &self.gate)
            .finish()
    }
}

/// Shared guard; releases the gate on drop.
pub struct ChunkReadGuard<'a> {
    handle: &'a ChunkHandle,
    state: Option<RwLockReadGuard<'a, ChunkState>>,
}

impl Deref for ChunkReadGuard<'_> {
    type Target = ChunkState;

    fn deref(&self) -> &ChunkState {
        // Only `None` during drop.
        self.state.as_deref().unwrap_or(&RELEASED)
    }
}

impl Drop for ChunkReadGuard<'_> {
    fn drop(&mut self) {
        self.state.take();
        self.handle.gate.release_read();
    }
}

/// Exclusive guard; publishes the generation and releases the gate on drop.
pub struct ChunkWriteGuard<'a> {
    handle: &'a ChunkHandle,
    state: Option<RwLockWriteGuard<'a, ChunkState>>,
}

impl ChunkWriteGuard<'_> {
    pub fn handle(&self) -> &ChunkHandle {
        self.handle
    }
}

impl Deref for ChunkWriteGuard<'_> {
    type Target = ChunkState;

    fn deref(&self) -> &ChunkState {
        self.state.as_deref().unwrap_or(&RELEASED)
    }
}

impl DerefMut for ChunkWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut ChunkState {
        match self.state.as_deref_mut() {
            Some(state) => state,
            None => unreachable!("write guard used after release"),
        }
    }
}

impl Drop for ChunkWriteGuard<'_> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            if let Some(chunk) = state.chunk() {
                self.handle.generation.store(chunk.generation(), Ordering::Release);
            }
            self.handle.resident.store(state.is_ready(), Ordering::Release);
        }
        self.handle.gate.release_write();
    }
}
