//! VoxelWorld - the engine facade.
//!
//! Owns the store, the scheduler and an optional replication session. The
//! host sets viewers, submits edits and calls [`VoxelWorld::tick`] once per
//! frame; each tick plans the displayed layout, queues generation, meshing,
//! eviction and replication work and returns the mesh changes for the
//! renderer. A tick never waits on a chunk lock or on persistence.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};

use glam::Vec3;

use crate::core::config::EngineConfig;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::edit::pipeline::{AppliedEdit, ApplyOutcome, EditOutcome, Modifier, UndoneEdit};
use crate::edit::record::EditRecord;
use crate::generation::WorldGenerator;
use crate::mesh::{ActiveLayout, Mesh};
use crate::persist::{KvStore, MemoryKvStore, Persistence};
use crate::replication::{Delta, PollReport, Publisher, ReplicationSession, Transport};
use crate::streaming::{Job, JobKind, JobOutput, JobResult, JobStatus, LodPlanner, Scheduler};
use crate::voxel::chunk::ChunkKey;
use crate::voxel::store::VoxelStore;

/// A point of interest driving LOD and eviction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewer {
    pub position: Vec3,
}

impl Viewer {
    pub fn at(position: Vec3) -> Self {
        Self { position }
    }
}

/// Mesh change for the renderer.
#[derive(Clone, Debug)]
pub enum ChunkEvent {
    /// Display (or replace) the mesh of a chunk
    MeshReady { key: ChunkKey, mesh: Arc<Mesh> },
    /// The chunk left the layout
    MeshRemoved { key: ChunkKey },
    /// The chunk could not be generated or meshed; keep whatever fallback
    /// the host shows for it
    Failed { key: ChunkKey, reason: String },
}

impl ChunkEvent {
    pub fn key(&self) -> ChunkKey {
        match self {
            ChunkEvent::MeshReady { key, .. }
            | ChunkEvent::MeshRemoved { key }
            | ChunkEvent::Failed { key, .. } => *key,
        }
    }
}

/// Attached replication session. The session itself only runs inside
/// `Replicate` jobs; the world keeps the outbound half.
struct Replication {
    session: Arc<Mutex<ReplicationSession>>,
    publisher: Publisher,
    gaps: Arc<AtomicBool>,
    in_flight: bool,
}

pub struct VoxelWorld {
    config: EngineConfig,
    store: Arc<VoxelStore>,
    modifier: Modifier,
    planner: LodPlanner,
    scheduler: Scheduler,
    replication: Option<Replication>,
    publish_meshes: bool,
    viewers: Vec<Viewer>,
    layout: Arc<ActiveLayout>,
    /// Generation of the mesh currently shown for each chunk
    displayed: BTreeMap<ChunkKey, u64>,
    failed: BTreeSet<ChunkKey>,
    needs_mesh: BTreeSet<ChunkKey>,
    generating: HashSet<ChunkKey>,
    meshing: HashSet<ChunkKey>,
    evicting: HashSet<ChunkKey>,
    /// Apply and undo jobs not yet collected
    handoffs: usize,
    /// Chunks invalidated while their mesh job was in flight
    stale: HashSet<ChunkKey>,
    remote_meshes: Vec<Mesh>,
    undone: Vec<UndoneEdit>,
    closed: bool,
}

impl VoxelWorld {
    /// Build a world over `kv`, restoring a persisted edit overlay if present.
    pub fn new(config: EngineConfig, generator: Arc<dyn WorldGenerator>, kv: Arc<dyn KvStore>) -> Result<Self> {
        config.validate()?;
        let persistence = Persistence::new(kv, &config.compression);
        let store = Arc::new(VoxelStore::new(&config, generator, persistence));
        match store.persistence().fetch_overlay(config.replication.peer) {
            Ok(Some(overlay)) => {
                log::info!("Restored edit overlay ({} edits)", overlay.edit_count());
                store.set_overlay(overlay);
            }
            Ok(None) => {}
            Err(e) => log::warn!("Ignoring stored edit overlay: {}", e),
        }
        let scheduler = Scheduler::new(Arc::clone(&store), config.scheduler.worker_threads)?;
        log::info!(
            "World ready: chunk size {}, depth {}, {} worker(s)",
            config.chunk_size, config.max_depth, config.scheduler.worker_threads
        );
        Ok(Self {
            planner: LodPlanner::new(&config),
            modifier: Modifier::new(Arc::clone(&store)),
            config,
            store,
            scheduler,
            replication: None,
            publish_meshes: false,
            viewers: Vec::new(),
            layout: Arc::new(ActiveLayout::new()),
            displayed: BTreeMap::new(),
            failed: BTreeSet::new(),
            needs_mesh: BTreeSet::new(),
            generating: HashSet::new(),
            meshing: HashSet::new(),
            evicting: HashSet::new(),
            handoffs: 0,
            stale: HashSet::new(),
            remote_meshes: Vec::new(),
            undone: Vec::new(),
            closed: false,
        })
    }

    /// World with the configured generator and in-memory persistence.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let generator = config.generator.build()?;
        Self::new(config, generator, Arc::new(MemoryKvStore::new()))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<VoxelStore> {
        &self.store
    }

    pub fn modifier(&self) -> &Modifier {
        &self.modifier
    }

    /// Currently displayed chunk set
    pub fn layout(&self) -> &ActiveLayout {
        &self.layout
    }

    pub fn viewers(&self) -> &[Viewer] {
        &self.viewers
    }

    pub fn set_viewers(&mut self, viewers: impl IntoIterator<Item = Viewer>) {
        self.viewers = viewers.into_iter().collect();
    }

    /// Generation of the mesh shown for `key`
    pub fn mesh_generation(&self, key: ChunkKey) -> Option<u64> {
        self.displayed.get(&key).copied()
    }

    pub fn is_failed(&self, key: ChunkKey) -> bool {
        self.failed.contains(&key)
    }

    /// Jobs whose results the world still waits for
    pub fn pending_jobs(&self) -> usize {
        let replicating = self.replication.as_ref().is_some_and(|r| r.in_flight);
        self.generating.len() + self.meshing.len() + self.evicting.len() + self.handoffs + usize::from(replicating)
    }

    /// Block until the workers are idle. Results are collected by the next tick.
    pub fn wait_idle(&self) {
        self.scheduler.wait_idle();
    }

    // ---- Replication ----

    /// Replicate edits over `transport`, replacing any previous session.
    pub fn attach_transport(&mut self, transport: Box<dyn Transport>) {
        self.detach_transport();
        let session = ReplicationSession::new(self.modifier.clone(), transport, &self.config.replication);
        self.replication = Some(Replication {
            publisher: session.publisher(),
            gaps: session.gap_flag(),
            session: Arc::new(Mutex::new(session)),
            in_flight: false,
        });
        log::info!("Replication attached (peer {})", self.config.replication.peer);
    }

    /// Stop replicating and hand back the session. Waits for a replication
    /// job in flight; its report is still applied by the next tick.
    pub fn detach_transport(&mut self) -> Option<ReplicationSession> {
        let replication = self.replication.take()?;
        if replication.in_flight {
            self.scheduler.wait_idle();
        }
        match Arc::try_unwrap(replication.session) {
            Ok(session) => Some(session.into_inner().unwrap_or_else(PoisonError::into_inner)),
            Err(_) => {
                log::warn!("Replication session still shared; dropping it");
                None
            }
        }
    }

    /// Also ship every new local mesh to the peer.
    pub fn set_publish_meshes(&mut self, publish: bool) {
        self.publish_meshes = publish;
    }

    /// Meshes received from the peer since the last call
    pub fn take_remote_meshes(&mut self) -> Vec<Mesh> {
        std::mem::take(&mut self.remote_meshes)
    }

    // ---- Edits ----

    /// Apply an edit, waiting for chunk locks.
    ///
    /// Blocks the calling thread while a worker holds any affected chunk;
    /// a frame loop should prefer [`try_edit`](Self::try_edit).
    pub fn edit(&mut self, record: EditRecord) -> Result<EditOutcome> {
        self.ensure_open()?;
        let outcome = self.modifier.submit(record)?;
        self.after_edit(&outcome);
        Ok(outcome)
    }

    /// Apply an edit unless its first chunk is locked.
    ///
    /// Never waits: sub-edits whose chunk is busy once the first one has
    /// landed are finished by `Apply` jobs and published when they report.
    /// The returned outcome lists only the chunks applied in place.
    pub fn try_edit(&mut self, record: EditRecord) -> Result<EditOutcome> {
        self.ensure_open()?;
        let (outcome, deferred) = self.modifier.submit_nowait(record)?;
        self.after_edit(&outcome);
        for (key, record) in deferred {
            log::debug!("Handing sub-edit {:#x} on {} to the workers", record.edit_id, key);
            if self.submit(Job::Apply { key, record }) {
                self.handoffs += 1;
            }
        }
        Ok(outcome)
    }

    /// Undo the newest edit in the world, waiting for chunk locks.
    pub fn undo(&mut self) -> Result<Option<UndoneEdit>> {
        self.ensure_open()?;
        let undone = self.modifier.undo_last()?;
        if let Some(undone) = &undone {
            self.after_undo(undone);
        }
        Ok(undone)
    }

    /// Undo the newest edit on a worker. The result is applied by a later
    /// tick and handed out by [`take_undone`](Self::take_undone).
    pub fn queue_undo(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.scheduler.submit(Job::Undo)?;
        self.handoffs += 1;
        Ok(())
    }

    /// Undos finished by queued jobs since the last call
    pub fn take_undone(&mut self) -> Vec<UndoneEdit> {
        std::mem::take(&mut self.undone)
    }

    fn publisher(&self) -> Option<&Publisher> {
        self.replication.as_ref().map(|r| &r.publisher)
    }

    fn after_edit(&self, outcome: &EditOutcome) {
        let EditOutcome::Applied { edit_id, chunks } = outcome else {
            return;
        };
        for applied in chunks {
            self.submit(Job::Persist { key: applied.key });
        }
        if let Some(publisher) = self.publisher() {
            if let Err(e) = publisher.publish_edit(outcome) {
                log::warn!("Failed to publish edit {:#x}: {}", edit_id, e);
            }
        }
    }

    fn after_apply(&self, applied: &AppliedEdit) {
        self.submit(Job::Persist { key: applied.key });
        if let Some(publisher) = self.publisher() {
            if let Err(e) = publisher.publish_applied(applied) {
                log::warn!("Failed to publish edit {:#x}: {}", applied.record.edit_id, e);
            }
        }
    }

    fn after_undo(&self, undone: &UndoneEdit) {
        for &(key, _) in &undone.chunks {
            self.submit(Job::Persist { key });
        }
        if let Some(publisher) = self.publisher() {
            if let Err(e) = publisher.publish_undone(undone) {
                log::warn!("Failed to publish undo of {:#x}: {}", undone.edit_id, e);
            }
        }
    }

    /// Forget failures so the chunks are generated again.
    pub fn retry_failed(&mut self) {
        for key in std::mem::take(&mut self.failed) {
            self.store.clear_error(key);
            if self.layout.contains(key) {
                self.needs_mesh.insert(key);
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::Shutdown)
        } else {
            Ok(())
        }
    }

    // ---- Frame update ----

    /// Advance one frame and return the mesh changes.
    pub fn tick(&mut self) -> Vec<ChunkEvent> {
        let mut events = Vec::new();
        if self.closed {
            return events;
        }
        for result in self.scheduler.poll() {
            self.handle_result(result, &mut events);
        }
        self.replicate();
        self.update_layout(&mut events);
        self.queue_dirty();
        self.dispatch();
        self.evict();
        events
    }

    /// Hand received frames to a `Replicate` job. At most one runs at a time
    /// so deltas are applied in arrival order.
    fn replicate(&mut self) {
        let Some(replication) = &self.replication else {
            return;
        };
        if replication.in_flight {
            return;
        }
        let frames = match replication.session.try_lock() {
            Ok(session) => session.take_frames(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().take_frames(),
            Err(TryLockError::WouldBlock) => return,
        };
        // Open gaps need a pass even without traffic so they can time out.
        if frames.is_empty() && !replication.gaps.load(Ordering::Acquire) {
            return;
        }
        let job = Job::Replicate { session: Arc::clone(&replication.session), frames };
        let queued = self.submit(job);
        if let Some(replication) = self.replication.as_mut() {
            replication.in_flight = queued;
        }
    }

    fn after_replication(&mut self, report: PollReport) {
        for key in report.touched() {
            self.submit(Job::Persist { key });
        }
        if report.conflicts > 0 {
            log::debug!("{} conflicting remote edit(s), {} rebased", report.conflicts, report.rebased.len());
        }
        self.remote_meshes.extend(report.meshes);
    }

    fn handle_result(&mut self, result: JobResult, events: &mut Vec<ChunkEvent>) {
        let JobResult { key, kind, generation, status } = result;
        match (kind, status) {
            (JobKind::Replicate, status) => {
                if let Some(replication) = self.replication.as_mut() {
                    replication.in_flight = false;
                }
                match status {
                    JobStatus::Done(JobOutput::Replicated(report)) => self.after_replication(report),
                    JobStatus::Failed(e) => log::warn!("Replication pass failed: {}", e),
                    _ => {}
                }
            }
            (JobKind::Apply, status) => {
                self.handoffs = self.handoffs.saturating_sub(1);
                match status {
                    JobStatus::Done(JobOutput::Applied(ApplyOutcome::Applied(applied))) => self.after_apply(&applied),
                    JobStatus::Done(JobOutput::Applied(ApplyOutcome::Rejected(reason))) => {
                        log::warn!("Deferred sub-edit on {:?} rejected: {:?}", key, reason);
                    }
                    JobStatus::Failed(e) => log::warn!("Deferred sub-edit on {:?} failed: {}", key, e),
                    _ => {}
                }
            }
            (JobKind::Undo, status) => {
                self.handoffs = self.handoffs.saturating_sub(1);
                match status {
                    JobStatus::Done(JobOutput::Undone(Some(undone))) => {
                        self.after_undo(&undone);
                        self.undone.push(undone);
                    }
                    JobStatus::Failed(e) => log::warn!("Queued undo failed: {}", e),
                    _ => {}
                }
            }
            (kind, status) => {
                if let Some(key) = key {
                    self.handle_chunk_result(key, kind, generation, status, events);
                }
            }
        }
    }

    fn handle_chunk_result(
        &mut self,
        key: ChunkKey,
        kind: JobKind,
        generation: Option<u64>,
        status: JobStatus,
        events: &mut Vec<ChunkEvent>,
    ) {
        match (kind, status) {
            (JobKind::Generate, status) => {
                self.generating.remove(&key);
                match status {
                    JobStatus::Failed(e) => self.mark_failed(key, e, events),
                    _ => {
                        if self.layout.contains(key) {
                            self.needs_mesh.insert(key);
                        }
                    }
                }
            }
            (JobKind::Mesh, status) => {
                self.meshing.remove(&key);
                let stale = self.stale.remove(&key);
                if !self.layout.contains(key) {
                    return;
                }
                match status {
                    JobStatus::Done(JobOutput::Meshed(mesh)) => {
                        if stale || self.store.generation_of(key) != Some(mesh.generation) {
                            log::debug!("Dropping stale mesh of {} (generation {})", key, mesh.generation);
                            self.needs_mesh.insert(key);
                            return;
                        }
                        self.failed.remove(&key);
                        self.displayed.insert(key, mesh.generation);
                        let mesh = Arc::new(mesh);
                        if self.publish_meshes && self.replication.is_some() {
                            self.submit(Job::CompressMesh { mesh: Arc::clone(&mesh) });
                        }
                        events.push(ChunkEvent::MeshReady { key, mesh });
                    }
                    JobStatus::Failed(e) => self.mark_failed(key, e, events),
                    _ => {
                        self.needs_mesh.insert(key);
                    }
                }
            }
            (JobKind::Evict, status) => {
                self.evicting.remove(&key);
                if let JobStatus::Failed(e) = status {
                    log::warn!("Evicting {} failed: {}", key, e);
                }
            }
            (JobKind::Persist, JobStatus::Failed(e)) => {
                log::warn!("Persisting {} failed: {}", key, e);
            }
            (JobKind::CompressMesh, JobStatus::Done(JobOutput::Compressed(bytes))) => {
                if let Some(publisher) = self.publisher() {
                    let generation = generation.unwrap_or_default();
                    if let Err(e) = publisher.publish(&Delta::Mesh { key, generation, bytes }) {
                        log::warn!("Failed to publish mesh of {}: {}", key, e);
                    }
                }
            }
            (JobKind::CompressMesh, JobStatus::Failed(e)) => {
                log::warn!("Compressing mesh of {} failed: {}", key, e);
            }
            _ => {}
        }
    }

    fn mark_failed(&mut self, key: ChunkKey, error: Error, events: &mut Vec<ChunkEvent>) {
        if self.failed.insert(key) {
            log::warn!("{} failed: {}", key, error);
            events.push(ChunkEvent::Failed { key, reason: error.to_string() });
        }
    }

    fn positions(&self) -> Vec<Vec3> {
        self.viewers.iter().map(|v| v.position).collect()
    }

    fn update_layout(&mut self, events: &mut Vec<ChunkEvent>) {
        let positions = self.positions();
        for root in self.planner.roots_in_view(&positions) {
            self.store.ensure_root(root);
        }
        let layout = self.planner.plan(&positions);
        let removed: Vec<ChunkKey> = self.layout.iter().filter(|k| !layout.contains(*k)).collect();
        let added: Vec<ChunkKey> = layout.iter().filter(|k| !self.layout.contains(*k)).collect();
        if removed.is_empty() && added.is_empty() {
            return;
        }
        log::debug!("Layout: +{} -{} ({} chunks)", added.len(), removed.len(), layout.len());

        let chunk_size = self.store.chunk_size();
        for &key in &removed {
            self.needs_mesh.remove(&key);
            self.failed.remove(&key);
            if self.displayed.remove(&key).is_some() {
                events.push(ChunkEvent::MeshRemoved { key });
            }
        }
        // A LOD change on one side of a seam changes the other side's mesh.
        for &key in removed.iter().chain(&added) {
            self.needs_mesh.extend(layout.touching(key, chunk_size));
        }
        self.needs_mesh.extend(added);
        self.layout = Arc::new(layout);
    }

    fn queue_dirty(&mut self) {
        let chunk_size = self.store.chunk_size();
        for key in self.store.take_dirty() {
            if self.layout.contains(key) {
                self.needs_mesh.insert(key);
            }
            self.needs_mesh.extend(self.layout.touching(key, chunk_size));
        }
    }

    fn dispatch(&mut self) {
        let positions = self.positions();
        let chunk_size = self.store.chunk_size();
        let mut queue: Vec<(f32, ChunkKey)> = std::mem::take(&mut self.needs_mesh)
            .into_iter()
            .filter(|key| self.layout.contains(*key) && !self.failed.contains(key))
            .map(|key| {
                let bounds = key.bounds(chunk_size);
                let nearest = positions
                    .iter()
                    .map(|p| bounds.distance_to_point(*p))
                    .fold(f32::INFINITY, f32::min);
                (nearest, key)
            })
            .collect();
        queue.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        for (_, key) in queue {
            if self.meshing.contains(&key) {
                self.stale.insert(key);
            } else if self.generating.contains(&key) {
                // Meshed once generation reports back.
            } else if self.evicting.contains(&key) {
                // Re-queued once the eviction reports back.
                self.needs_mesh.insert(key);
            } else if !self.store.is_resident(key) {
                if self.submit(Job::Generate { key }) {
                    self.generating.insert(key);
                }
            } else {
                let layout = Arc::clone(&self.layout);
                if self.submit(Job::Mesh { key, layout }) {
                    self.meshing.insert(key);
                }
            }
        }
    }

    fn evict(&mut self) {
        if self.viewers.is_empty() {
            return;
        }
        let positions = self.positions();
        let eviction = &self.config.eviction;
        let candidates = self.store.eviction_candidates(&positions, eviction.distance, eviction.max_resident);
        for key in candidates {
            if self.evicting.contains(&key) || self.generating.contains(&key) || self.meshing.contains(&key) {
                continue;
            }
            if self.submit(Job::Evict { key }) {
                self.evicting.insert(key);
            }
        }
    }

    fn submit(&self, job: Job) -> bool {
        let kind = job.kind();
        let key = job.key();
        match self.scheduler.submit(job) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Could not queue {:?} job for {:?}: {}", kind, key, e);
                false
            }
        }
    }

    /// Stop the workers and flush edited chunks and the overlay.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.scheduler.shutdown();
        let stored = self.store.flush()?;
        log::info!("World shut down ({} chunk(s) flushed)", stored);
        Ok(())
    }
}

impl Drop for VoxelWorld {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("Shutdown flush failed: {}", e);
        }
    }
}

impl fmt::Debug for VoxelWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoxelWorld")
            .field("viewers", &self.viewers.len())
            .field("layout", &self.layout.len())
            .field("displayed", &self.displayed.len())
            .field("failed", &self.failed.len())
            .field("pending_jobs", &self.pending_jobs())
            .field("replicating", &self.replication.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}
