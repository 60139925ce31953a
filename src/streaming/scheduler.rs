//! Background job scheduler.
//!
//! Jobs run on an explicitly built rayon pool and report back over a tokio
//! unbounded channel that the control thread drains with `try_recv`, so
//! polling never blocks. Chunk jobs capture the chunk's generation and
//! eviction epoch at submit time; if either moved by the time a worker picks
//! it up, the job is reported as `Cancelled` without running. Edit, undo and
//! replication jobs always run: they are how the control thread hands off
//! work that may wait on chunk locks.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::core::error::Error;
use crate::core::types::Result;
use crate::edit::pipeline::{ApplyOutcome, Modifier, UndoneEdit};
use crate::edit::record::EditRecord;
use crate::mesh::{mesh_chunk, ActiveLayout, Mesh, Neighborhood};
use crate::replication::{PollReport, ReplicationSession};
use crate::voxel::chunk::ChunkKey;
use crate::voxel::store::VoxelStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    Generate,
    Mesh,
    Persist,
    CompressMesh,
    Evict,
    Apply,
    Undo,
    Replicate,
}

/// Work for the pool.
#[derive(Clone, Debug)]
pub enum Job {
    /// Materialize a chunk
    Generate { key: ChunkKey },
    /// Mesh a chunk against the displayed layout
    Mesh { key: ChunkKey, layout: Arc<ActiveLayout> },
    /// Write an edited LOD-0 chunk through to persistence
    Persist { key: ChunkKey },
    /// Encode a mesh with the persistence codec
    CompressMesh { mesh: Arc<Mesh> },
    /// Write back and drop a resident chunk
    Evict { key: ChunkKey },
    /// Apply one sub-edit, waiting for the chunk lock
    Apply { key: ChunkKey, record: EditRecord },
    /// Undo the newest world edit
    Undo,
    /// Feed received frames through a replication session
    Replicate { session: Arc<Mutex<ReplicationSession>>, frames: Vec<Vec<u8>> },
}

impl Job {
    /// Chunk the job works on, if it targets one
    pub fn key(&self) -> Option<ChunkKey> {
        match self {
            Job::Generate { key }
            | Job::Mesh { key, .. }
            | Job::Persist { key }
            | Job::Evict { key }
            | Job::Apply { key, .. } => Some(*key),
            Job::CompressMesh { mesh } => Some(mesh.key),
            Job::Undo | Job::Replicate { .. } => None,
        }
    }

    /// Whether a changed generation or epoch makes the job pointless.
    pub fn is_cancellable(&self) -> bool {
        !matches!(self, Job::Apply { .. } | Job::Undo | Job::Replicate { .. })
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Job::Generate { .. } => JobKind::Generate,
            Job::Mesh { .. } => JobKind::Mesh,
            Job::Persist { .. } => JobKind::Persist,
            Job::CompressMesh { .. } => JobKind::CompressMesh,
            Job::Evict { .. } => JobKind::Evict,
            Job::Apply { .. } => JobKind::Apply,
            Job::Undo => JobKind::Undo,
            Job::Replicate { .. } => JobKind::Replicate,
        }
    }
}

#[derive(Debug)]
pub enum JobOutput {
    Generated { generation: u64 },
    Meshed(Mesh),
    Persisted { stored: bool },
    Compressed(Vec<u8>),
    Evicted { evicted: bool },
    Applied(ApplyOutcome),
    Undone(Option<UndoneEdit>),
    Replicated(PollReport),
}

#[derive(Debug)]
pub enum JobStatus {
    Done(JobOutput),
    /// The chunk changed or was evicted before the job started
    Cancelled,
    Failed(Error),
}

#[derive(Debug)]
pub struct JobResult {
    pub key: Option<ChunkKey>,
    pub kind: JobKind,
    /// Chunk generation captured at submit time
    pub generation: Option<u64>,
    pub status: JobStatus,
}

/// Count of submitted jobs that have not reported yet.
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn begin(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn end(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn get(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self.idle.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

pub struct Scheduler {
    pool: rayon::ThreadPool,
    store: Arc<VoxelStore>,
    results_tx: mpsc::UnboundedSender<JobResult>,
    results_rx: mpsc::UnboundedReceiver<JobResult>,
    in_flight: Arc<InFlight>,
    closed: AtomicBool,
}

impl Scheduler {
    pub fn new(store: Arc<VoxelStore>, worker_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_threads.max(1))
            .thread_name(|i| format!("voxterra-worker-{}", i))
            .build()
            .map_err(|e| Error::Config(format!("worker pool: {}", e)))?;
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        log::info!("Scheduler started with {} worker(s)", worker_threads.max(1));
        Ok(Self {
            pool,
            store,
            results_tx,
            results_rx,
            in_flight: Arc::new(InFlight::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Queue a job. Fails with [`Error::Shutdown`] once shut down.
    pub fn submit(&self, job: Job) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let key = job.key();
        let kind = job.kind();
        let cancellable = job.is_cancellable();
        let generation = key.and_then(|k| self.store.generation_of(k));
        let epoch = key.and_then(|k| self.store.eviction_epoch(k));

        let store = Arc::clone(&self.store);
        let tx = self.results_tx.clone();
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.begin();
        self.pool.spawn(move || {
            let moved = match key {
                Some(k) if cancellable => (store.generation_of(k), store.eviction_epoch(k)) != (generation, epoch),
                _ => false,
            };
            let status = if let (true, Some(k)) = (moved, key) {
                log::debug!("Cancelled {:?} job for {}", kind, k);
                JobStatus::Cancelled
            } else {
                match run(&store, job) {
                    Ok(output) => JobStatus::Done(output),
                    Err(e) => JobStatus::Failed(e),
                }
            };
            // The receiver only goes away with the scheduler.
            let _ = tx.send(JobResult { key, kind, generation, status });
            in_flight.end();
        });
        Ok(())
    }

    /// Collect finished jobs without blocking.
    pub fn poll(&mut self) -> Vec<JobResult> {
        let mut results = Vec::new();
        while let Ok(result) = self.results_rx.try_recv() {
            results.push(result);
        }
        results
    }

    /// Jobs submitted but not yet reported
    pub fn in_flight(&self) -> usize {
        self.in_flight.get()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Block until every submitted job has reported.
    pub fn wait_idle(&self) {
        self.in_flight.wait_idle();
    }

    /// Refuse new jobs and wait for the in-flight ones.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::info!("Scheduler shutting down ({} job(s) in flight)", self.in_flight());
        }
        self.in_flight.wait_idle();
    }
}

fn run(store: &Arc<VoxelStore>, job: Job) -> Result<JobOutput> {
    match job {
        Job::Generate { key } => {
            let snapshot = store.get_chunk(key)?;
            Ok(JobOutput::Generated { generation: snapshot.generation })
        }
        Job::Mesh { key, layout } => {
            let nb = Neighborhood::gather(store, &layout, key)?;
            Ok(JobOutput::Meshed(mesh_chunk(&nb)))
        }
        Job::Persist { key } => Ok(JobOutput::Persisted { stored: store.persist(key)? }),
        Job::CompressMesh { mesh } => Ok(JobOutput::Compressed(store.persistence().compress_mesh(&mesh)?)),
        Job::Evict { key } => Ok(JobOutput::Evicted { evicted: store.evict(key)? }),
        Job::Apply { key, record } => Ok(JobOutput::Applied(Modifier::new(Arc::clone(store)).apply(key, record)?)),
        Job::Undo => Ok(JobOutput::Undone(Modifier::new(Arc::clone(store)).undo_last()?)),
        Job::Replicate { session, frames } => {
            let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(JobOutput::Replicated(session.process(frames)))
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("threads", &self.pool.current_num_threads())
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{EngineConfig, ReplicationConfig};
    use crate::edit::pipeline::EditOutcome;
    use crate::edit::record::EditOp;
    use crate::edit::shape::EditShape;
    use crate::generation::FlatGenerator;
    use crate::persist::Persistence;
    use crate::replication::{Delta, LoopbackTransport};
    use glam::{IVec3, Vec3};

    fn store() -> Arc<VoxelStore> {
        let config = EngineConfig {
            chunk_size: 16,
            max_depth: 2,
            lod_distances: vec![64.0, 128.0],
            ..Default::default()
        };
        let generator = Arc::new(FlatGenerator { height: 6.0, material: 1 });
        let store = Arc::new(VoxelStore::new(&config, generator, Persistence::in_memory()));
        store.ensure_root(IVec3::ZERO);
        store
    }

    fn drain(scheduler: &mut Scheduler, expected: usize) -> Vec<JobResult> {
        scheduler.wait_idle();
        let results = scheduler.poll();
        assert_eq!(results.len(), expected);
        results
    }

    #[test]
    fn test_generate_and_mesh() {
        let store = store();
        let mut scheduler = Scheduler::new(store.clone(), 2).unwrap();
        let key = ChunkKey::at(0, 0, 0, 0);
        scheduler.submit(Job::Generate { key }).unwrap();
        let results = drain(&mut scheduler, 1);
        assert!(matches!(results[0].status, JobStatus::Done(JobOutput::Generated { .. })));
        assert_eq!(store.resident_keys(), vec![key]);

        let layout = Arc::new(ActiveLayout::from_keys([key]));
        scheduler.submit(Job::Mesh { key, layout }).unwrap();
        let results = drain(&mut scheduler, 1);
        match &results[0].status {
            JobStatus::Done(JobOutput::Meshed(mesh)) => {
                assert_eq!(mesh.key, key);
                assert!(!mesh.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stale_generation_cancels() {
        let store = store();
        let key = ChunkKey::at(0, 0, 0, 0);
        store.get_chunk(key).unwrap();
        // A single worker kept busy so the next job starts after the edit.
        let mut scheduler = Scheduler::new(store.clone(), 1).unwrap();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let blocker = Arc::clone(&gate);
        scheduler.pool.spawn(move || {
            let (open, cv) = &*blocker;
            let mut open = open.lock().unwrap();
            while !*open {
                open = cv.wait(open).unwrap();
            }
        });
        let layout = Arc::new(ActiveLayout::from_keys([key]));
        scheduler.submit(Job::Mesh { key, layout }).unwrap();

        let modifier = Modifier::new(store.clone());
        let edit = EditRecord::new(EditOp::Add, EditShape::sphere(Vec3::new(8.0, 6.0, 8.0), 2.0));
        assert!(modifier.submit(edit).unwrap().is_applied());
        {
            let (open, cv) = &*gate;
            *open.lock().unwrap() = true;
            cv.notify_all();
        }
        let results = drain(&mut scheduler, 1);
        assert!(matches!(results[0].status, JobStatus::Cancelled));
    }

    #[test]
    fn test_evicted_chunk_cancels() {
        let store = store();
        let key = ChunkKey::at(0, 0, 0, 0);
        store.get_chunk(key).unwrap();
        let mut scheduler = Scheduler::new(store.clone(), 1).unwrap();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let blocker = Arc::clone(&gate);
        scheduler.pool.spawn(move || {
            let (open, cv) = &*blocker;
            let mut open = open.lock().unwrap();
            while !*open {
                open = cv.wait(open).unwrap();
            }
        });
        scheduler.submit(Job::Persist { key }).unwrap();
        store.evict(key).unwrap();
        store.get_chunk(key).unwrap();
        {
            let (open, cv) = &*gate;
            *open.lock().unwrap() = true;
            cv.notify_all();
        }
        let results = drain(&mut scheduler, 1);
        assert!(matches!(results[0].status, JobStatus::Cancelled));
    }

    #[test]
    fn test_failure_is_reported() {
        let store = store();
        let mut scheduler = Scheduler::new(store, 1).unwrap();
        // Above the octree depth, so the store refuses the key.
        let key = ChunkKey::at(0, 0, 0, 9);
        scheduler.submit(Job::Generate { key }).unwrap();
        let results = drain(&mut scheduler, 1);
        assert_eq!(results[0].generation, None);
        assert!(matches!(results[0].status, JobStatus::Failed(Error::Config(_))));
    }

    #[test]
    fn test_persist_and_compress() {
        let store = store();
        let key = ChunkKey::at(0, 0, 0, 0);
        let modifier = Modifier::new(store.clone());
        let edit = EditRecord::new(EditOp::Subtract, EditShape::sphere(Vec3::new(8.0, 6.0, 8.0), 3.0));
        assert!(modifier.submit(edit).unwrap().is_applied());

        let mut scheduler = Scheduler::new(store.clone(), 2).unwrap();
        scheduler.submit(Job::Persist { key }).unwrap();
        let results = drain(&mut scheduler, 1);
        assert!(matches!(results[0].status, JobStatus::Done(JobOutput::Persisted { stored: true })));
        assert!(store.persistence().fetch_chunk(key).unwrap().is_some());

        let mesh = crate::mesh::mesh_isolated(&store.get_chunk(key).unwrap());
        scheduler.submit(Job::CompressMesh { mesh: Arc::new(mesh.clone()) }).unwrap();
        let results = drain(&mut scheduler, 1);
        let JobStatus::Done(JobOutput::Compressed(bytes)) = &results[0].status else {
            panic!("compression failed");
        };
        let restored = store.persistence().decompress_mesh(bytes).unwrap();
        assert_eq!(restored.triangle_count(), mesh.triangle_count());
    }

    #[test]
    fn test_evict_job() {
        let store = store();
        let key = ChunkKey::at(0, 0, 0, 0);
        store.get_chunk(key).unwrap();
        let mut scheduler = Scheduler::new(store.clone(), 1).unwrap();
        scheduler.submit(Job::Evict { key }).unwrap();
        let results = drain(&mut scheduler, 1);
        assert_eq!(results[0].key, Some(key));
        assert!(matches!(results[0].status, JobStatus::Done(JobOutput::Evicted { evicted: true })));
        assert!(!store.is_resident(key));
    }

    #[test]
    fn test_apply_and_undo_jobs() {
        let store = store();
        let key = ChunkKey::at(0, 0, 0, 0);
        let mut record = EditRecord::new(EditOp::Add, EditShape::sphere(Vec3::new(8.0, 6.0, 8.0), 2.0));
        record.edit_id = store.overlay().allocate_id();
        let edit_id = record.edit_id;
        let mut scheduler = Scheduler::new(store.clone(), 2).unwrap();

        scheduler.submit(Job::Apply { key, record }).unwrap();
        let results = drain(&mut scheduler, 1);
        let JobStatus::Done(JobOutput::Applied(outcome)) = &results[0].status else {
            panic!("apply failed: {:?}", results[0].status);
        };
        assert!(outcome.is_applied());
        assert_eq!(store.with_read(key, |c| c.log().len()).unwrap(), 1);

        scheduler.submit(Job::Undo).unwrap();
        let results = drain(&mut scheduler, 1);
        assert_eq!(results[0].key, None);
        let JobStatus::Done(JobOutput::Undone(Some(undone))) = &results[0].status else {
            panic!("undo failed: {:?}", results[0].status);
        };
        assert_eq!(undone.edit_id, edit_id);
        assert_eq!(store.with_read(key, |c| c.log().len()).unwrap(), 0);
    }

    #[test]
    fn test_replicate_job() {
        let source = Modifier::new(store());
        let outcome = source
            .submit(EditRecord::new(EditOp::Add, EditShape::sphere(Vec3::new(8.0, 6.0, 8.0), 2.0)))
            .unwrap();
        let EditOutcome::Applied { chunks, .. } = outcome else {
            panic!("edit rejected");
        };
        let frames: Vec<Vec<u8>> = chunks
            .iter()
            .map(|a| Delta::Edit { key: a.key, record: a.record.clone() }.encode())
            .collect();

        let target = store();
        let (_raw, end) = LoopbackTransport::pair();
        let session = ReplicationSession::new(
            Modifier::new(target.clone()),
            Box::new(end),
            &ReplicationConfig::default(),
        );
        let mut scheduler = Scheduler::new(target.clone(), 1).unwrap();
        scheduler
            .submit(Job::Replicate { session: Arc::new(Mutex::new(session)), frames })
            .unwrap();
        let results = drain(&mut scheduler, 1);
        let JobStatus::Done(JobOutput::Replicated(report)) = &results[0].status else {
            panic!("replication failed: {:?}", results[0].status);
        };
        assert_eq!(report.applied.len(), chunks.len());
        let key = ChunkKey::at(0, 0, 0, 0);
        let fields = |s: &Arc<VoxelStore>| s.with_read(key, |c| c.field_bytes().to_vec()).unwrap();
        assert_eq!(fields(source.store()), fields(&target));
    }

    #[test]
    fn test_shutdown_refuses_jobs() {
        let store = store();
        let scheduler = Scheduler::new(store, 1).unwrap();
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());
        let err = scheduler.submit(Job::Generate { key: ChunkKey::at(0, 0, 0, 0) }).unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }
}
