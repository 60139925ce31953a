//! Modifier - applies edits to the store.
//!
//! A world edit is split into one record per intersecting LOD-0 chunk. Each
//! record is applied under the chunk's exclusive lock: blend, append to the
//! log, bump the generation, mark dirty. Coarser resident chunks are derived
//! views and receive the edit through the overlay.

use std::sync::Arc;

use crate::core::error::Error;
use crate::core::types::Result;
use crate::edit::blend::blend_record;
use crate::edit::record::EditRecord;
use crate::math::Aabb;
use crate::voxel::chunk::{Chunk, ChunkKey};
use crate::voxel::store::VoxelStore;

/// Why an edit was not applied. Not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// Non-blocking apply found the chunk locked
    Locked,
    /// No target chunk lies under an existing octree root
    NotMaterialized,
    /// The record's sequence was already applied
    Duplicate,
    /// The record's sequence is ahead of the chunk log
    OutOfOrder,
    /// A different record already holds the record's sequence. The record
    /// with the smaller edit id keeps the slot; `local_wins` tells which.
    Conflict { local_wins: bool },
}

/// A record that landed in a chunk log.
#[derive(Clone, Debug, PartialEq)]
pub struct AppliedEdit {
    pub key: ChunkKey,
    pub record: EditRecord,
    /// Chunk generation after the edit
    pub generation: u64,
    /// Samples the blend changed
    pub changed: usize,
}

/// Result of applying one record to one chunk.
#[derive(Clone, Debug, PartialEq)]
pub enum ApplyOutcome {
    Applied(AppliedEdit),
    Rejected(RejectReason),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied(_))
    }
}

/// Result of a world edit.
#[derive(Clone, Debug, PartialEq)]
pub enum EditOutcome {
    Applied { edit_id: u64, chunks: Vec<AppliedEdit> },
    Rejected(RejectReason),
}

impl EditOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, EditOutcome::Applied { .. })
    }

    pub fn edit_id(&self) -> Option<u64> {
        match self {
            EditOutcome::Applied { edit_id, .. } => Some(*edit_id),
            EditOutcome::Rejected(_) => None,
        }
    }
}

/// An edit removed by [`Modifier::undo_last`].
#[derive(Clone, Debug, PartialEq)]
pub struct UndoneEdit {
    pub edit_id: u64,
    /// LOD-0 chunks whose log lost the edit, with the popped sequence
    pub chunks: Vec<(ChunkKey, u64)>,
    /// LOD-0 chunks where a later record blocked the undo
    pub skipped: Vec<ChunkKey>,
}

/// Sub-edit left for a later blocking [`Modifier::apply`].
pub type DeferredEdit = (ChunkKey, EditRecord);

/// How a world edit waits for chunk locks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Wait {
    /// Queue on every chunk
    Always,
    /// Reject if the first chunk is busy, queue on the rest
    AfterFirst,
    /// Never queue; busy chunks after the first are deferred
    Never,
}

/// Edit pipeline over a shared store.
#[derive(Clone, Debug)]
pub struct Modifier {
    store: Arc<VoxelStore>,
}

impl Modifier {
    pub fn new(store: Arc<VoxelStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<VoxelStore> {
        &self.store
    }

    /// Apply a world edit, waiting for every chunk lock in FIFO order.
    pub fn submit(&self, edit: EditRecord) -> Result<EditOutcome> {
        Ok(self.submit_inner(edit, Wait::Always)?.0)
    }

    /// Like [`submit`](Self::submit), but rejects with `Locked` instead of
    /// waiting for the first chunk. Once one sub-edit has landed the rest
    /// are applied in full.
    pub fn try_submit(&self, edit: EditRecord) -> Result<EditOutcome> {
        Ok(self.submit_inner(edit, Wait::AfterFirst)?.0)
    }

    /// Apply a world edit without ever waiting for a chunk lock.
    ///
    /// A busy first chunk rejects the edit with `Locked`. Once one sub-edit
    /// has landed, sub-edits whose chunk is busy are returned for the caller
    /// to finish with [`apply`](Self::apply) off the calling thread.
    pub fn submit_nowait(&self, edit: EditRecord) -> Result<(EditOutcome, Vec<DeferredEdit>)> {
        self.submit_inner(edit, Wait::Never)
    }

    fn submit_inner(&self, mut edit: EditRecord, wait: Wait) -> Result<(EditOutcome, Vec<DeferredEdit>)> {
        let chunk_size = self.store.chunk_size();
        let targets = edit.affected_chunks(0, chunk_size);
        if !self.store.is_materialized(&edit.influence()) {
            log::debug!("Edit rejected: no materialized root under {:?}", edit.influence());
            return Ok((EditOutcome::Rejected(RejectReason::NotMaterialized), Vec::new()));
        }
        if edit.edit_id == 0 {
            edit.edit_id = self.store.overlay().allocate_id();
        }
        edit.sequence = 0;

        let mut applied = Vec::with_capacity(targets.len());
        let mut deferred = Vec::new();
        for key in targets {
            let blocking = match wait {
                Wait::Always => true,
                Wait::AfterFirst => !applied.is_empty(),
                Wait::Never => false,
            };
            let outcome = if blocking {
                self.apply(key, edit.clone())?
            } else {
                self.try_apply(key, edit.clone())?
            };
            match outcome {
                ApplyOutcome::Applied(done) => applied.push(done),
                ApplyOutcome::Rejected(RejectReason::Locked) if applied.is_empty() && deferred.is_empty() => {
                    return Ok((EditOutcome::Rejected(RejectReason::Locked), Vec::new()));
                }
                ApplyOutcome::Rejected(RejectReason::Locked) => deferred.push((key, edit.clone())),
                ApplyOutcome::Rejected(reason) => {
                    log::warn!("Sub-edit {} of edit {:#x} rejected: {:?}", key, edit.edit_id, reason);
                }
            }
        }
        log::debug!(
            "Edit {:#x} applied to {} chunk(s), {} deferred",
            edit.edit_id,
            applied.len(),
            deferred.len()
        );
        Ok((EditOutcome::Applied { edit_id: edit.edit_id, chunks: applied }, deferred))
    }

    /// Apply one record to a LOD-0 chunk, blocking for its lock.
    ///
    /// A record with a non-zero `sequence` (replicated) must be exactly the
    /// next one in the chunk log.
    pub fn apply(&self, key: ChunkKey, record: EditRecord) -> Result<ApplyOutcome> {
        self.apply_inner(key, record, true)
    }

    /// Apply without waiting; `Rejected(Locked)` if the chunk is busy.
    pub fn try_apply(&self, key: ChunkKey, record: EditRecord) -> Result<ApplyOutcome> {
        self.apply_inner(key, record, false)
    }

    fn apply_inner(&self, key: ChunkKey, record: EditRecord, wait: bool) -> Result<ApplyOutcome> {
        if key.lod != 0 {
            return Err(Error::Config(format!("edits target LOD-0 chunks, got {}", key)));
        }
        let chunk_size = self.store.chunk_size();
        let write = |chunk: &mut Chunk| -> ApplyOutcome {
            if record.sequence != 0 {
                if chunk.log().contains_edit(record.edit_id) {
                    return ApplyOutcome::Rejected(RejectReason::Duplicate);
                }
                let expected = chunk.log().next_sequence();
                if record.sequence < expected {
                    let holder = chunk.log().get(record.sequence).map_or(0, |r| r.edit_id);
                    return ApplyOutcome::Rejected(RejectReason::Conflict {
                        local_wins: holder < record.edit_id,
                    });
                }
                if record.sequence > expected {
                    return ApplyOutcome::Rejected(RejectReason::OutOfOrder);
                }
            } else if record.edit_id != 0 && chunk.log().contains_edit(record.edit_id) {
                return ApplyOutcome::Rejected(RejectReason::Duplicate);
            }
            let changed = blend_record(chunk.samples_mut(), key, chunk_size, &record);
            let mut stored = record.clone();
            stored.sequence = chunk.log_mut().append(record.clone());
            let generation = chunk.bump_generation();
            chunk.set_dirty(true);
            ApplyOutcome::Applied(AppliedEdit { key, record: stored, generation, changed })
        };

        let outcome = if wait {
            self.store.with_write(key, write)?
        } else {
            match self.store.try_with_write(key, write)? {
                Some(outcome) => outcome,
                None => return Ok(ApplyOutcome::Rejected(RejectReason::Locked)),
            }
        };

        if let ApplyOutcome::Applied(done) = &outcome {
            self.store.overlay_mut().record(&done.record, key.coord);
            self.mark_seams_dirty(&done.record.influence(), 0);
            self.update_coarse(&done.record);
        }
        Ok(outcome)
    }

    /// Mark chunks at `lod` whose samples or seams an edit region touches.
    fn mark_seams_dirty(&self, region: &Aabb, lod: u8) {
        let spacing = (1u32 << lod) as f32;
        let grown = region.inflated(spacing);
        let extent = (self.store.chunk_size() << lod) as f32;
        for coord in grown.cells(extent) {
            self.store.mark_dirty(ChunkKey::new(coord, lod));
        }
    }

    /// Blend a new edit into resident coarse chunks that have not seen it.
    fn update_coarse(&self, record: &EditRecord) {
        let chunk_size = self.store.chunk_size();
        let region = record.influence();
        for lod in 1..=self.store.max_depth() {
            for handle in self.store.handles_in_region(&region, lod) {
                let key = handle.key;
                let updated = self.store.with_resident(key, |chunk| {
                    if chunk.log().contains_edit(record.edit_id) {
                        return false;
                    }
                    blend_record(chunk.samples_mut(), key, chunk_size, record);
                    let mut stored = record.clone();
                    stored.sequence = 0;
                    chunk.log_mut().append(stored);
                    chunk.bump_generation();
                    chunk.set_dirty(true);
                    true
                });
                if updated == Some(true) {
                    self.mark_seams_dirty(&region, lod);
                }
            }
        }
    }

    /// Rebuild resident coarse chunks intersecting `region` from the overlay.
    pub fn rebuild_coarse(&self, region: &Aabb) -> Result<usize> {
        let mut rebuilt = 0;
        for lod in 1..=self.store.max_depth() {
            for handle in self.store.handles_in_region(region, lod) {
                let result = self
                    .store
                    .with_resident(handle.key, |chunk| self.store.rebuild_derived(chunk));
                if let Some(result) = result {
                    result?;
                    rebuilt += 1;
                    self.mark_seams_dirty(region, lod);
                }
            }
        }
        Ok(rebuilt)
    }

    /// Pop the newest record of a chunk if `accept` allows it, then rebuild
    /// the field from the generator base and the remaining log.
    fn pop_record(&self, key: ChunkKey, accept: impl Fn(&EditRecord) -> bool) -> Result<Option<EditRecord>> {
        let chunk_size = self.store.chunk_size();
        let popped = self.store.with_write(key, |chunk| -> Result<Option<EditRecord>> {
            match chunk.log().last() {
                Some(last) if accept(last) => {}
                _ => return Ok(None),
            }
            let mut samples = self.store.base_field(key)?;
            let record = chunk.log_mut().pop();
            for r in chunk.log().records() {
                blend_record(&mut samples, key, chunk_size, r);
            }
            chunk.replace_samples(samples);
            chunk.bump_generation();
            chunk.set_dirty(true);
            Ok(record)
        })??;
        if let Some(record) = &popped {
            self.mark_seams_dirty(&record.influence(), 0);
        }
        Ok(popped)
    }

    /// Undo the newest record of one LOD-0 chunk.
    pub fn undo_chunk(&self, key: ChunkKey) -> Result<Option<EditRecord>> {
        let Some(record) = self.pop_record(key, |_| true)? else {
            return Ok(None);
        };
        let removed = self.store.overlay_mut().forget(record.edit_id, key.coord);
        if removed {
            self.rebuild_coarse(&record.influence())?;
        }
        log::debug!("Undid sequence {} of {}", record.sequence, key);
        Ok(Some(record))
    }

    /// Undo the newest record of a chunk only if it has `sequence`
    /// (replicated undo).
    pub fn undo_sequence(&self, key: ChunkKey, sequence: u64) -> Result<ApplyOutcome> {
        let current = self.store.with_read(key, |chunk| chunk.log().len() as u64)?;
        if sequence > current {
            return Ok(ApplyOutcome::Rejected(RejectReason::OutOfOrder));
        }
        let Some(record) = self.pop_record(key, |last| last.sequence == sequence)? else {
            return Ok(ApplyOutcome::Rejected(RejectReason::Duplicate));
        };
        if self.store.overlay_mut().forget(record.edit_id, key.coord) {
            self.rebuild_coarse(&record.influence())?;
        }
        let generation = self.store.generation_of(key).unwrap_or_default();
        Ok(ApplyOutcome::Applied(AppliedEdit { key, record, generation, changed: 0 }))
    }

    /// Undo the newest world edit across every chunk it touched.
    pub fn undo_last(&self) -> Result<Option<UndoneEdit>> {
        let (edit_id, coords, influence) = {
            let overlay = self.store.overlay();
            let Some(latest) = overlay.latest() else {
                return Ok(None);
            };
            (latest.edit_id, overlay.chunks_of(latest.edit_id), latest.influence())
        };

        let mut undone = UndoneEdit { edit_id, chunks: Vec::new(), skipped: Vec::new() };
        for coord in coords {
            let key = ChunkKey::new(coord, 0);
            match self.pop_record(key, |last| last.edit_id == edit_id)? {
                Some(record) => undone.chunks.push((key, record.sequence)),
                None => {
                    log::warn!("Undo of edit {:#x} skipped {}: newer records on top", edit_id, key);
                    undone.skipped.push(key);
                }
            }
            self.store.overlay_mut().forget(edit_id, coord);
        }
        self.rebuild_coarse(&influence)?;
        log::info!("Undid edit {:#x} on {} chunk(s)", edit_id, undone.chunks.len());
        Ok(Some(undone))
    }

    /// Replace a chunk from a replication peer and refresh derived views.
    pub fn install(&self, chunk: Chunk) -> Result<()> {
        let bounds = chunk.bounds();
        let key = chunk.key();
        self.store.install(chunk)?;
        if key.lod == 0 {
            self.rebuild_coarse(&bounds)?;
            self.mark_seams_dirty(&bounds, 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec3;
    use crate::core::config::EngineConfig;
    use crate::edit::record::EditOp;
    use crate::edit::shape::EditShape;
    use crate::generation::{EmptyGenerator, FlatGenerator};
    use crate::persist::Persistence;
    use crate::voxel::voxel::Voxel;
    use glam::Vec3;
    use std::thread;

    fn config() -> EngineConfig {
        EngineConfig {
            chunk_size: 16,
            max_depth: 2,
            lod_distances: vec![64.0, 128.0],
            ..Default::default()
        }
    }

    fn modifier_with(generator: Arc<dyn crate::generation::WorldGenerator>) -> Modifier {
        let store = Arc::new(VoxelStore::new(&config(), generator, Persistence::in_memory()));
        store.ensure_root(IVec3::ZERO);
        Modifier::new(store)
    }

    fn modifier() -> Modifier {
        modifier_with(Arc::new(FlatGenerator { height: 6.0, material: 1 }))
    }

    fn ball(center: Vec3, radius: f32) -> EditRecord {
        EditRecord::new(EditOp::Add, EditShape::sphere(center, radius)).with_material(5)
    }

    fn field(m: &Modifier, key: ChunkKey) -> Vec<u8> {
        m.store().with_read(key, |c| c.field_bytes().to_vec()).unwrap()
    }

    #[test]
    fn test_submit_splits_across_chunks() {
        let m = modifier();
        let outcome = m.submit(ball(Vec3::new(16.0, 8.0, 8.0), 3.0)).unwrap();
        let EditOutcome::Applied { edit_id, chunks } = outcome else {
            panic!("edit rejected");
        };
        let keys: Vec<ChunkKey> = chunks.iter().map(|c| c.key).collect();
        assert_eq!(keys, vec![ChunkKey::at(0, 0, 0, 0), ChunkKey::at(1, 0, 0, 0)]);
        assert!(chunks.iter().all(|c| c.record.sequence == 1 && c.record.edit_id == edit_id));
        assert_eq!(m.store().overlay().chunks_of(edit_id).len(), 2);
        assert!(m.store().take_dirty().contains(&ChunkKey::at(1, 0, 0, 0)));
    }

    #[test]
    fn test_not_materialized() {
        let m = modifier();
        let outcome = m.submit(ball(Vec3::splat(500.0), 2.0)).unwrap();
        assert_eq!(outcome, EditOutcome::Rejected(RejectReason::NotMaterialized));
        assert_eq!(m.store().overlay().edit_count(), 0);
    }

    #[test]
    fn test_replay_reproduces_field() {
        let m = modifier();
        let key = ChunkKey::at(0, 0, 0, 0);
        m.submit(ball(Vec3::new(5.0, 6.0, 5.0), 3.0)).unwrap();
        m.submit(EditRecord::new(EditOp::Subtract, EditShape::cuboid(Vec3::new(8.0, 5.0, 8.0), Vec3::splat(2.0))))
            .unwrap();
        m.submit(EditRecord::new(EditOp::Paint, EditShape::sphere(Vec3::new(4.0, 6.0, 4.0), 4.0)).with_material(9))
            .unwrap();

        let (live, log) = m
            .store()
            .with_read(key, |c| (c.field_bytes().to_vec(), c.log().clone()))
            .unwrap();
        assert_eq!(log.len(), 3);
        let mut replay = m.store().base_field(key).unwrap();
        for record in log.records() {
            blend_record(&mut replay, key, 16, record);
        }
        assert_eq!(bytemuck::cast_slice::<Voxel, u8>(replay.as_slice()), live.as_slice());
    }

    #[test]
    fn test_sequence_checks() {
        let m = modifier();
        let key = ChunkKey::at(0, 0, 0, 0);
        let mut record = ball(Vec3::splat(4.0), 2.0);
        record.edit_id = 42;
        record.sequence = 2;
        assert_eq!(m.apply(key, record.clone()).unwrap(), ApplyOutcome::Rejected(RejectReason::OutOfOrder));
        record.sequence = 1;
        assert!(m.apply(key, record.clone()).unwrap().is_applied());
        assert_eq!(m.apply(key, record).unwrap(), ApplyOutcome::Rejected(RejectReason::Duplicate));
    }

    #[test]
    fn test_sequence_conflicts_resolved_by_edit_id() {
        let m = modifier();
        let key = ChunkKey::at(0, 0, 0, 0);
        let mut local = ball(Vec3::splat(4.0), 2.0);
        local.edit_id = 50;
        local.sequence = 1;
        assert!(m.apply(key, local.clone()).unwrap().is_applied());

        let mut remote = ball(Vec3::splat(9.0), 2.0);
        remote.sequence = 1;
        remote.edit_id = 70;
        assert_eq!(
            m.apply(key, remote.clone()).unwrap(),
            ApplyOutcome::Rejected(RejectReason::Conflict { local_wins: true })
        );
        remote.edit_id = 30;
        assert_eq!(
            m.apply(key, remote).unwrap(),
            ApplyOutcome::Rejected(RejectReason::Conflict { local_wins: false })
        );
        // A re-sent record is a duplicate whatever sequence it carries
        local.sequence = 2;
        assert_eq!(m.apply(key, local).unwrap(), ApplyOutcome::Rejected(RejectReason::Duplicate));
    }

    #[test]
    fn test_submit_nowait_defers_busy_chunks() {
        let m = modifier();
        let near = ChunkKey::at(0, 0, 0, 0);
        let far = ChunkKey::at(1, 0, 0, 0);
        m.store().get_chunk(near).unwrap();
        m.store().get_chunk(far).unwrap();
        let handle = m.store().handle(far).unwrap();
        let guard = handle.write();

        let (outcome, deferred) = m.submit_nowait(ball(Vec3::new(16.0, 8.0, 8.0), 3.0)).unwrap();
        let EditOutcome::Applied { chunks, .. } = outcome else {
            panic!("edit rejected");
        };
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].key, near);
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].0, far);

        drop(guard);
        let (key, record) = deferred.into_iter().next().unwrap();
        assert!(m.apply(key, record).unwrap().is_applied());
        assert_eq!(m.store().with_read(far, |c| c.log().len()).unwrap(), 1);
    }

    #[test]
    fn test_submit_nowait_rejects_busy_first_chunk() {
        let m = modifier();
        let key = ChunkKey::at(0, 0, 0, 0);
        m.store().get_chunk(key).unwrap();
        let handle = m.store().handle(key).unwrap();
        let _guard = handle.read();
        let (outcome, deferred) = m.submit_nowait(ball(Vec3::splat(4.0), 2.0)).unwrap();
        assert_eq!(outcome, EditOutcome::Rejected(RejectReason::Locked));
        assert!(deferred.is_empty());
    }

    #[test]
    fn test_try_apply_locked() {
        let m = modifier();
        let key = ChunkKey::at(0, 0, 0, 0);
        m.store().get_chunk(key).unwrap();
        let handle = m.store().handle(key).unwrap();
        let guard = handle.write();
        let outcome = m.try_apply(key, ball(Vec3::splat(4.0), 2.0)).unwrap();
        assert_eq!(outcome, ApplyOutcome::Rejected(RejectReason::Locked));
        let outcome = m.try_submit(ball(Vec3::splat(4.0), 2.0)).unwrap();
        assert_eq!(outcome, EditOutcome::Rejected(RejectReason::Locked));
        drop(guard);
        assert!(m.try_submit(ball(Vec3::splat(4.0), 2.0)).unwrap().is_applied());
    }

    #[test]
    fn test_add_then_undo_restores_base() {
        let m = modifier();
        let key = ChunkKey::at(0, 0, 0, 0);
        let base = field(&m, key);
        m.submit(ball(Vec3::new(16.0, 8.0, 8.0), 4.0)).unwrap();
        assert_ne!(field(&m, key), base);

        let undone = m.undo_last().unwrap().unwrap();
        assert_eq!(undone.chunks.len(), 2);
        assert!(undone.skipped.is_empty());
        assert_eq!(field(&m, key), base);
        assert_eq!(m.store().overlay().edit_count(), 0);
        assert!(m.undo_last().unwrap().is_none());
    }

    #[test]
    fn test_undo_keeps_earlier_edits() {
        let m = modifier();
        let key = ChunkKey::at(0, 0, 0, 0);
        m.submit(ball(Vec3::splat(4.0), 2.0)).unwrap();
        let after_first = field(&m, key);
        m.submit(ball(Vec3::splat(9.0), 2.0)).unwrap();
        m.undo_last().unwrap();
        assert_eq!(field(&m, key), after_first);
        let sequence = m.store().with_read(key, |c| c.log().next_sequence()).unwrap();
        assert_eq!(sequence, 2);
    }

    #[test]
    fn test_coarse_chunk_follows_edits() {
        let m = modifier_with(Arc::new(EmptyGenerator));
        let coarse = ChunkKey::at(0, 0, 0, 1);
        let before = field(&m, coarse);
        m.submit(ball(Vec3::splat(12.0), 5.0)).unwrap();
        assert_ne!(field(&m, coarse), before);
        // Eight LOD-0 sub-edits, but the coarse chunk blends the edit once.
        m.store().with_read(coarse, |c| assert_eq!(c.log().len(), 1)).unwrap();

        m.undo_last().unwrap();
        assert_eq!(field(&m, coarse), before);
    }

    #[test]
    fn test_undo_sequence() {
        let m = modifier();
        let key = ChunkKey::at(0, 0, 0, 0);
        m.submit(ball(Vec3::splat(4.0), 2.0)).unwrap();
        assert_eq!(m.undo_sequence(key, 3).unwrap(), ApplyOutcome::Rejected(RejectReason::OutOfOrder));
        assert!(m.undo_sequence(key, 1).unwrap().is_applied());
        assert_eq!(m.undo_sequence(key, 1).unwrap(), ApplyOutcome::Rejected(RejectReason::OutOfOrder));
    }

    #[test]
    fn test_disjoint_edits_in_parallel() {
        let m = modifier();
        let mut threads = Vec::new();
        for i in 0..4 {
            let m = m.clone();
            threads.push(thread::spawn(move || {
                let center = Vec3::new(8.0 + 16.0 * i as f32, 6.0, 8.0);
                m.submit(ball(center, 2.0)).unwrap()
            }));
        }
        for t in threads {
            assert!(t.join().unwrap().is_applied());
        }
        for x in 0..4 {
            let len = m.store().with_read(ChunkKey::at(x, 0, 0, 0), |c| c.log().len()).unwrap();
            assert_eq!(len, 1);
        }
    }

    #[test]
    fn test_same_chunk_edits_lose_nothing() {
        let m = modifier();
        let key = ChunkKey::at(0, 0, 0, 0);
        let mut threads = Vec::new();
        for t in 0..4 {
            let m = m.clone();
            threads.push(thread::spawn(move || {
                for i in 0..10 {
                    let center = Vec3::new(2.0 + i as f32, 4.0 + t as f32, 8.0);
                    m.submit(ball(center, 1.0)).unwrap();
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        let log = m.store().with_read(key, |c| c.log().clone()).unwrap();
        assert_eq!(log.len(), 40);
        let sequences: Vec<u64> = log.records().iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, (1..=40).collect::<Vec<u64>>());

        let mut replay = m.store().base_field(key).unwrap();
        for record in log.records() {
            blend_record(&mut replay, key, 16, record);
        }
        assert_eq!(bytemuck::cast_slice::<Voxel, u8>(replay.as_slice()), field(&m, key).as_slice());
    }
}
