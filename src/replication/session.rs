//! Replication session: ships local changes and applies remote ones.
//!
//! Remote edits go through the same [`Modifier::apply`] path as local ones.
//! Records that arrive ahead of the chunk log wait in a per-chunk reorder
//! buffer; a gap that stays open past the resync timeout is reported as
//! `DesyncDetected` and the peer is asked for the full chunk.
//!
//! Two peers editing one chunk at once both claim the same sequence. The
//! record with the smaller edit id keeps the slot: its author drops the
//! other record, the other author asks for the full chunk, installs it and
//! re-applies its own displaced edits on top.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::core::config::ReplicationConfig;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::edit::overlay::participant_of;
use crate::edit::pipeline::{AppliedEdit, ApplyOutcome, EditOutcome, Modifier, RejectReason, UndoneEdit};
use crate::edit::record::EditRecord;
use crate::mesh::Mesh;
use crate::replication::delta::Delta;
use crate::replication::transport::Transport;
use crate::voxel::chunk::ChunkKey;
use crate::voxel::store::VoxelStore;

/// What one [`ReplicationSession::poll`] did.
#[derive(Debug, Default)]
pub struct PollReport {
    /// Remote records applied, in application order
    pub applied: Vec<AppliedEdit>,
    /// Remote undos applied (chunk, popped sequence)
    pub undone: Vec<(ChunkKey, u64)>,
    pub duplicates: usize,
    /// Remote records that collided with a local record on one sequence
    pub conflicts: usize,
    /// Deltas parked in a reorder buffer
    pub buffered: usize,
    /// Chunks replaced by a `FullChunk`
    pub installed: Vec<ChunkKey>,
    /// Local records re-applied (and re-sent) after an install displaced them
    pub rebased: Vec<AppliedEdit>,
    /// Chunks sent in answer to a peer's resync request
    pub served: Vec<ChunkKey>,
    pub meshes: Vec<Mesh>,
    /// `DesyncDetected` for every gap that timed out
    pub desyncs: Vec<Error>,
}

impl PollReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
            && self.undone.is_empty()
            && self.duplicates == 0
            && self.conflicts == 0
            && self.buffered == 0
            && self.installed.is_empty()
            && self.rebased.is_empty()
            && self.served.is_empty()
            && self.meshes.is_empty()
            && self.desyncs.is_empty()
    }

    /// Chunks whose state changed and should be written back.
    pub fn touched(&self) -> Vec<ChunkKey> {
        let mut keys: Vec<ChunkKey> = self
            .applied
            .iter()
            .chain(&self.rebased)
            .map(|a| a.key)
            .chain(self.undone.iter().map(|&(key, _)| key))
            .chain(self.installed.iter().copied())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

#[derive(Debug)]
struct ReorderBuffer {
    edits: BTreeMap<u64, EditRecord>,
    /// Undo waiting for its sequence to become the log head
    undo: Option<u64>,
    /// Gap opened or last progressed
    since: Instant,
}

impl ReorderBuffer {
    fn new() -> Self {
        Self { edits: BTreeMap::new(), undo: None, since: Instant::now() }
    }

    fn is_empty(&self) -> bool {
        self.edits.is_empty() && self.undo.is_none()
    }
}

/// Outbound half of a session. Cheap to clone; sending never touches the
/// reorder buffers, so it can run while the session is busy elsewhere.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    store: Arc<VoxelStore>,
}

impl Publisher {
    pub fn publish(&self, delta: &Delta) -> Result<()> {
        self.transport.send(delta.encode())
    }

    /// Ship every sub-edit of a local edit. Returns the number of frames sent.
    pub fn publish_edit(&self, outcome: &EditOutcome) -> Result<usize> {
        let EditOutcome::Applied { chunks, .. } = outcome else {
            return Ok(0);
        };
        for applied in chunks {
            self.publish_applied(applied)?;
        }
        Ok(chunks.len())
    }

    pub fn publish_applied(&self, applied: &AppliedEdit) -> Result<()> {
        self.publish(&Delta::Edit { key: applied.key, record: applied.record.clone() })
    }

    pub fn publish_undo(&self, key: ChunkKey, sequence: u64) -> Result<()> {
        self.publish(&Delta::Undo { key, sequence })
    }

    /// Ship the per-chunk undos of a world-level undo.
    pub fn publish_undone(&self, undone: &UndoneEdit) -> Result<()> {
        for &(key, sequence) in &undone.chunks {
            self.publish_undo(key, sequence)?;
        }
        Ok(())
    }

    pub fn publish_mesh(&self, mesh: &Mesh) -> Result<()> {
        let bytes = self.store.persistence().compress_mesh(mesh)?;
        self.publish(&Delta::Mesh { key: mesh.key, generation: mesh.generation, bytes })
    }

    /// Ship the authoritative state of a chunk.
    pub fn publish_chunk(&self, key: ChunkKey) -> Result<()> {
        let bytes = self.store.with_read(key, |chunk| self.store.persistence().save(chunk))??;
        self.publish(&Delta::FullChunk { key, bytes })
    }

    pub fn request_resync(&self, key: ChunkKey) -> Result<()> {
        self.publish(&Delta::ResyncRequest { key })
    }

    fn send_resync(&self, key: ChunkKey) {
        if let Err(e) = self.request_resync(key) {
            log::warn!("Could not request resync of {}: {}", key, e);
        }
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher").finish_non_exhaustive()
    }
}

pub struct ReplicationSession {
    modifier: Modifier,
    transport: Arc<dyn Transport>,
    publisher: Publisher,
    /// Participant id of this side, the high bits of its edit ids
    peer: u16,
    resync_timeout: Duration,
    max_buffered: usize,
    pending: BTreeMap<ChunkKey, ReorderBuffer>,
    /// Mirrors `!pending.is_empty()` for readers without the session
    gaps: Arc<AtomicBool>,
}

impl ReplicationSession {
    pub fn new(modifier: Modifier, transport: Box<dyn Transport>, config: &ReplicationConfig) -> Self {
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let publisher = Publisher { transport: Arc::clone(&transport), store: Arc::clone(modifier.store()) };
        let peer = modifier.store().overlay().peer();
        Self {
            modifier,
            transport,
            publisher,
            peer,
            resync_timeout: Duration::from_millis(config.resync_timeout_ms),
            max_buffered: config.max_buffered.max(1),
            pending: BTreeMap::new(),
            gaps: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn modifier(&self) -> &Modifier {
        &self.modifier
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Shared flag, set while any chunk has an open gap.
    pub fn gap_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.gaps)
    }

    /// Chunks with an open gap
    pub fn pending_chunks(&self) -> Vec<ChunkKey> {
        self.pending.keys().copied().collect()
    }

    pub fn publish(&self, delta: &Delta) -> Result<()> {
        self.publisher.publish(delta)
    }

    pub fn publish_edit(&self, outcome: &EditOutcome) -> Result<usize> {
        self.publisher.publish_edit(outcome)
    }

    pub fn publish_applied(&self, applied: &AppliedEdit) -> Result<()> {
        self.publisher.publish_applied(applied)
    }

    pub fn publish_undo(&self, key: ChunkKey, sequence: u64) -> Result<()> {
        self.publisher.publish_undo(key, sequence)
    }

    pub fn publish_undone(&self, undone: &UndoneEdit) -> Result<()> {
        self.publisher.publish_undone(undone)
    }

    pub fn publish_mesh(&self, mesh: &Mesh) -> Result<()> {
        self.publisher.publish_mesh(mesh)
    }

    pub fn publish_chunk(&self, key: ChunkKey) -> Result<()> {
        self.publisher.publish_chunk(key)
    }

    pub fn request_resync(&self, key: ChunkKey) -> Result<()> {
        self.publisher.request_resync(key)
    }

    /// Inbound frames waiting on the transport. Never blocks.
    pub fn take_frames(&self) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.transport.try_recv()).collect()
    }

    /// Drain the transport and apply everything that can be applied.
    pub fn poll(&mut self) -> PollReport {
        let frames = self.take_frames();
        self.process(frames)
    }

    /// Apply received frames in order, then check open gaps.
    ///
    /// Faults on one delta are logged and do not stop the others.
    pub fn process(&mut self, frames: Vec<Vec<u8>>) -> PollReport {
        let mut report = PollReport::default();
        for frame in frames {
            let delta = match Delta::decode(&frame) {
                Ok(delta) => delta,
                Err(e) => {
                    log::warn!("Dropping replication frame: {}", e);
                    continue;
                }
            };
            let key = delta.key();
            if let Err(e) = self.handle(delta, &mut report) {
                log::warn!("Replication delta for {} failed: {}", key, e);
            }
        }
        self.check_gaps(&mut report);
        self.gaps.store(!self.pending.is_empty(), Ordering::Release);
        report
    }

    fn handle(&mut self, delta: Delta, report: &mut PollReport) -> Result<()> {
        match delta {
            Delta::Edit { key, record } => self.receive_edit(key, record, report),
            Delta::Undo { key, sequence } => self.receive_undo(key, sequence, report),
            Delta::FullChunk { key, bytes } => self.receive_chunk(key, &bytes, report),
            Delta::ResyncRequest { key } => {
                self.publish_chunk(key)?;
                log::debug!("Served resync of {}", key);
                report.served.push(key);
                Ok(())
            }
            Delta::Mesh { key, generation, bytes } => {
                let mut mesh = self.modifier.store().persistence().decompress_mesh(&bytes)?;
                mesh.key = key;
                mesh.generation = generation;
                report.meshes.push(mesh);
                Ok(())
            }
        }
    }

    fn receive_edit(&mut self, key: ChunkKey, record: EditRecord, report: &mut PollReport) -> Result<()> {
        match self.modifier.apply(key, record.clone())? {
            ApplyOutcome::Applied(done) => {
                report.applied.push(done);
                self.drain(key, report)
            }
            ApplyOutcome::Rejected(reason) => {
                self.rejected(key, record, reason, report);
                Ok(())
            }
        }
    }

    fn rejected(&mut self, key: ChunkKey, record: EditRecord, reason: RejectReason, report: &mut PollReport) {
        match reason {
            RejectReason::Duplicate => report.duplicates += 1,
            RejectReason::OutOfOrder => self.buffer(key, record, report),
            RejectReason::Conflict { local_wins } => {
                report.conflicts += 1;
                if local_wins {
                    log::debug!(
                        "Edit {:#x} lost sequence {} of {} to a local edit",
                        record.edit_id,
                        record.sequence,
                        key
                    );
                } else {
                    log::debug!(
                        "Edit {:#x} takes sequence {} of {}, requesting the chunk",
                        record.edit_id,
                        record.sequence,
                        key
                    );
                    self.publisher.send_resync(key);
                }
            }
            reason => log::warn!("Remote edit on {} rejected: {:?}", key, reason),
        }
    }

    /// Replace a chunk with the peer's copy, then re-apply local edits the
    /// copy does not carry.
    fn receive_chunk(&mut self, key: ChunkKey, bytes: &[u8], report: &mut PollReport) -> Result<()> {
        let store = self.modifier.store();
        let chunk = store.persistence().load(bytes)?;
        if chunk.key() != key {
            return Err(Error::CorruptRecord(format!("full chunk for {} carries {}", key, chunk.key())));
        }
        let peer = self.peer;
        let orphans: Vec<EditRecord> = store.with_read(key, |local| {
            local
                .log()
                .records()
                .iter()
                .filter(|r| participant_of(r.edit_id) == peer && !chunk.log().contains_edit(r.edit_id))
                .cloned()
                .collect()
        })?;
        self.modifier.install(chunk)?;
        if let Some(buffer) = self.pending.get_mut(&key) {
            buffer.since = Instant::now();
        }
        log::debug!("Installed {} from peer", key);
        report.installed.push(key);

        for mut record in orphans {
            let edit_id = record.edit_id;
            record.sequence = 0;
            match self.modifier.apply(key, record)? {
                ApplyOutcome::Applied(done) => {
                    if let Err(e) = self.publisher.publish_applied(&done) {
                        log::warn!("Failed to re-send edit {:#x}: {}", edit_id, e);
                    }
                    report.rebased.push(done);
                }
                other => log::warn!("Edit {:#x} not re-applied on {}: {:?}", edit_id, key, other),
            }
        }
        self.drain(key, report)
    }

    fn receive_undo(&mut self, key: ChunkKey, sequence: u64, report: &mut PollReport) -> Result<()> {
        match self.modifier.undo_sequence(key, sequence)? {
            ApplyOutcome::Applied(_) => {
                report.undone.push((key, sequence));
                self.drain(key, report)
            }
            ApplyOutcome::Rejected(RejectReason::OutOfOrder) => {
                self.pending.entry(key).or_insert_with(ReorderBuffer::new).undo = Some(sequence);
                report.buffered += 1;
                Ok(())
            }
            ApplyOutcome::Rejected(_) => {
                report.duplicates += 1;
                Ok(())
            }
        }
    }

    fn buffer(&mut self, key: ChunkKey, record: EditRecord, report: &mut PollReport) {
        let buffer = self.pending.entry(key).or_insert_with(ReorderBuffer::new);
        if let Some(existing) = buffer.edits.get(&record.sequence) {
            if existing.edit_id == record.edit_id {
                report.duplicates += 1;
                return;
            }
            // Two different records claim one slot: local order is unknowable.
            log::warn!("Conflicting records for sequence {} of {}", record.sequence, key);
            buffer.edits.clear();
            self.publisher.send_resync(key);
            return;
        }
        buffer.edits.insert(record.sequence, record);
        report.buffered += 1;
        if buffer.edits.len() > self.max_buffered {
            log::warn!("Reorder buffer of {} overflowed ({} records)", key, buffer.edits.len());
            buffer.edits.clear();
            self.publisher.send_resync(key);
        }
    }

    /// Apply buffered deltas that have become the next in line.
    fn drain(&mut self, key: ChunkKey, report: &mut PollReport) -> Result<()> {
        loop {
            let Some(buffer) = self.pending.get_mut(&key) else {
                return Ok(());
            };
            let head = self.modifier.store().with_read(key, |chunk| chunk.log().len() as u64)?;
            // Everything at or below the head is already in the log.
            buffer.edits = buffer.edits.split_off(&(head + 1));

            if head > 0 && buffer.undo == Some(head) {
                buffer.undo = None;
                buffer.since = Instant::now();
                if self.modifier.undo_sequence(key, head)?.is_applied() {
                    report.undone.push((key, head));
                }
                continue;
            }
            match buffer.edits.remove(&(head + 1)) {
                Some(record) => {
                    buffer.since = Instant::now();
                    match self.modifier.apply(key, record.clone())? {
                        ApplyOutcome::Applied(done) => report.applied.push(done),
                        ApplyOutcome::Rejected(reason) => {
                            log::debug!("Buffered edit on {} not applied: {:?}", key, reason);
                            self.rejected(key, record, reason, report);
                            return Ok(());
                        }
                    }
                }
                None => {
                    if buffer.is_empty() {
                        self.pending.remove(&key);
                    }
                    return Ok(());
                }
            }
        }
    }

    fn check_gaps(&mut self, report: &mut PollReport) {
        let now = Instant::now();
        let store = self.modifier.store();
        for (&key, buffer) in self.pending.iter_mut() {
            if buffer.is_empty() {
                continue;
            }
            let waited = now.duration_since(buffer.since);
            if waited < self.resync_timeout {
                continue;
            }
            let expected = store
                .with_read(key, |chunk| chunk.log().next_sequence())
                .unwrap_or_default();
            let waited_ms = waited.as_millis() as u64;
            log::warn!("Gap on {} open for {} ms, requesting resync", key, waited_ms);
            report.desyncs.push(Error::DesyncDetected { key, expected, waited_ms });
            self.publisher.send_resync(key);
            buffer.since = now;
        }
        self.pending.retain(|_, buffer| !buffer.is_empty());
    }
}

impl fmt::Debug for ReplicationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationSession")
            .field("peer", &self.peer)
            .field("resync_timeout", &self.resync_timeout)
            .field("max_buffered", &self.max_buffered)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EngineConfig;
    use crate::edit::record::EditOp;
    use crate::edit::shape::EditShape;
    use crate::generation::FlatGenerator;
    use crate::persist::Persistence;
    use crate::replication::transport::LoopbackTransport;
    use crate::voxel::store::VoxelStore;
    use glam::{IVec3, Vec3};
    use std::sync::Arc;

    fn modifier(peer: u16) -> Modifier {
        let mut config = EngineConfig { chunk_size: 16, max_depth: 2, ..Default::default() };
        config.lod_distances = vec![64.0, 128.0];
        config.replication.peer = peer;
        let generator = Arc::new(FlatGenerator { height: 6.0, material: 1 });
        let store = Arc::new(VoxelStore::new(&config, generator, Persistence::in_memory()));
        store.ensure_root(IVec3::ZERO);
        Modifier::new(store)
    }

    fn replication(timeout_ms: u64) -> ReplicationConfig {
        ReplicationConfig { resync_timeout_ms: timeout_ms, ..Default::default() }
    }

    fn ball(center: Vec3) -> EditRecord {
        EditRecord::new(EditOp::Add, EditShape::sphere(center, 2.5)).with_material(4)
    }

    fn field(m: &Modifier, key: ChunkKey) -> Vec<u8> {
        m.store().with_read(key, |c| c.field_bytes().to_vec()).unwrap()
    }

    fn log_len(m: &Modifier, key: ChunkKey) -> usize {
        m.store().with_read(key, |c| c.log().len()).unwrap()
    }

    /// Local edits on `source`, returned as the frames a peer would see.
    fn edit_frames(source: &Modifier, centers: &[Vec3]) -> Vec<Delta> {
        let mut frames = Vec::new();
        for &c in centers {
            if let EditOutcome::Applied { chunks, .. } = source.submit(ball(c)).unwrap() {
                for a in chunks {
                    frames.push(Delta::Edit { key: a.key, record: a.record });
                }
            }
        }
        frames
    }

    #[test]
    fn test_peers_converge_over_loopback() {
        let (ta, tb) = LoopbackTransport::pair();
        let a = ReplicationSession::new(modifier(1), Box::new(ta), &replication(60_000));
        let mut b = ReplicationSession::new(modifier(2), Box::new(tb), &replication(60_000));

        for c in [Vec3::new(4.0, 6.0, 4.0), Vec3::new(15.0, 6.0, 8.0)] {
            let outcome = a.modifier().submit(ball(c)).unwrap();
            a.publish_edit(&outcome).unwrap();
        }
        let report = b.poll();
        assert_eq!(report.applied.len(), 3);
        assert!(report.desyncs.is_empty());
        for key in [ChunkKey::at(0, 0, 0, 0), ChunkKey::at(1, 0, 0, 0)] {
            assert_eq!(field(a.modifier(), key), field(b.modifier(), key));
        }
        assert_eq!(b.modifier().store().overlay().edit_count(), 2);
    }

    #[test]
    fn test_concurrent_edits_on_one_chunk_converge() {
        let key = ChunkKey::at(0, 0, 0, 0);
        let (ta, tb) = LoopbackTransport::pair();
        let mut a = ReplicationSession::new(modifier(1), Box::new(ta), &replication(60_000));
        let mut b = ReplicationSession::new(modifier(2), Box::new(tb), &replication(60_000));

        // Both sides claim sequence 1 of the same chunk.
        let first = a.modifier().submit(ball(Vec3::new(5.0, 6.0, 5.0))).unwrap();
        a.publish_edit(&first).unwrap();
        let second = b.modifier().submit(ball(Vec3::new(10.0, 6.0, 10.0))).unwrap();
        b.publish_edit(&second).unwrap();

        let (mut conflicts, mut rebased) = (0, 0);
        for _ in 0..4 {
            for session in [&mut a, &mut b] {
                let report = session.poll();
                assert!(report.desyncs.is_empty());
                conflicts += report.conflicts;
                rebased += report.rebased.len();
            }
        }
        assert!(conflicts >= 1);
        assert_eq!(rebased, 1);
        assert_eq!(field(a.modifier(), key), field(b.modifier(), key));

        let ids = |m: &Modifier| -> Vec<u64> {
            m.store().with_read(key, |c| c.log().records().iter().map(|r| r.edit_id).collect()).unwrap()
        };
        assert_eq!(ids(a.modifier()).len(), 2);
        assert_eq!(ids(a.modifier()), ids(b.modifier()));
        // The smaller id keeps sequence 1.
        let EditOutcome::Applied { edit_id, .. } = first else {
            panic!("edit rejected");
        };
        assert_eq!(ids(b.modifier())[0], edit_id);
        assert_eq!(b.modifier().store().overlay().edit_count(), 2);
    }

    #[test]
    fn test_out_of_order_records_are_reordered() {
        let source = modifier(1);
        let frames = edit_frames(&source, &[Vec3::new(4.0, 6.0, 4.0), Vec3::new(8.0, 6.0, 8.0), Vec3::new(11.0, 6.0, 5.0)]);
        assert_eq!(frames.len(), 3);

        let (raw, tb) = LoopbackTransport::pair();
        let mut b = ReplicationSession::new(modifier(2), Box::new(tb), &replication(60_000));
        for i in [2, 0, 1] {
            raw.send(frames[i].encode()).unwrap();
        }
        let report = b.poll();
        assert_eq!(report.buffered, 1);
        let order: Vec<u64> = report.applied.iter().map(|a| a.record.sequence).collect();
        assert_eq!(order, vec![1, 2, 3]);
        let key = ChunkKey::at(0, 0, 0, 0);
        assert_eq!(field(&source, key), field(b.modifier(), key));
        assert!(b.pending_chunks().is_empty());
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let source = modifier(1);
        let frames = edit_frames(&source, &[Vec3::new(4.0, 6.0, 4.0)]);
        let (raw, tb) = LoopbackTransport::pair();
        let mut b = ReplicationSession::new(modifier(2), Box::new(tb), &replication(60_000));
        raw.send(frames[0].encode()).unwrap();
        raw.send(frames[0].encode()).unwrap();
        let report = b.poll();
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(log_len(b.modifier(), ChunkKey::at(0, 0, 0, 0)), 1);
    }

    #[test]
    fn test_gap_past_timeout_resyncs() {
        let key = ChunkKey::at(0, 0, 0, 0);
        let source = modifier(1);
        let frames = edit_frames(&source, &[Vec3::new(4.0, 6.0, 4.0), Vec3::new(9.0, 6.0, 9.0)]);

        let (raw, tb) = LoopbackTransport::pair();
        let mut b = ReplicationSession::new(modifier(2), Box::new(tb), &replication(0));
        // Sequence 1 is lost.
        raw.send(frames[1].encode()).unwrap();
        let report = b.poll();
        assert_eq!(report.desyncs.len(), 1);
        assert!(matches!(
            report.desyncs[0],
            Error::DesyncDetected { key: k, expected: 1, .. } if k == key
        ));
        let request = Delta::decode(&raw.try_recv().unwrap()).unwrap();
        assert_eq!(request, Delta::ResyncRequest { key });

        // The peer answers with the full chunk.
        let bytes = source.store().with_read(key, |c| source.store().persistence().save(c)).unwrap().unwrap();
        raw.send(Delta::FullChunk { key, bytes }.encode()).unwrap();
        let report = b.poll();
        assert_eq!(report.installed, vec![key]);
        assert!(report.desyncs.is_empty());
        assert_eq!(field(&source, key), field(b.modifier(), key));
        assert_eq!(log_len(b.modifier(), key), 2);
        assert!(b.pending_chunks().is_empty());
    }

    #[test]
    fn test_resync_request_is_served() {
        let (ta, tb) = LoopbackTransport::pair();
        let mut a = ReplicationSession::new(modifier(1), Box::new(ta), &replication(60_000));
        let mut b = ReplicationSession::new(modifier(2), Box::new(tb), &replication(60_000));
        a.modifier().submit(ball(Vec3::new(5.0, 6.0, 5.0))).unwrap();

        let key = ChunkKey::at(0, 0, 0, 0);
        b.request_resync(key).unwrap();
        assert_eq!(a.poll().served, vec![key]);
        assert_eq!(b.poll().installed, vec![key]);
        assert_eq!(field(a.modifier(), key), field(b.modifier(), key));
        assert_eq!(b.modifier().store().overlay().edit_count(), 1);
    }

    #[test]
    fn test_undo_replicates() {
        let (ta, tb) = LoopbackTransport::pair();
        let a = ReplicationSession::new(modifier(1), Box::new(ta), &replication(60_000));
        let mut b = ReplicationSession::new(modifier(2), Box::new(tb), &replication(60_000));
        let key = ChunkKey::at(0, 0, 0, 0);
        let before = field(b.modifier(), key);

        let outcome = a.modifier().submit(ball(Vec3::new(5.0, 6.0, 5.0))).unwrap();
        a.publish_edit(&outcome).unwrap();
        let undone = a.modifier().undo_last().unwrap().unwrap();
        a.publish_undone(&undone).unwrap();

        let report = b.poll();
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.undone, vec![(key, 1)]);
        assert_eq!(log_len(b.modifier(), key), 0);
        assert_eq!(field(b.modifier(), key), before);
    }

    #[test]
    fn test_early_undo_waits_for_its_record() {
        let source = modifier(1);
        let frames = edit_frames(&source, &[Vec3::new(5.0, 6.0, 5.0)]);
        let key = ChunkKey::at(0, 0, 0, 0);
        let (raw, tb) = LoopbackTransport::pair();
        let mut b = ReplicationSession::new(modifier(2), Box::new(tb), &replication(60_000));
        let before = field(b.modifier(), key);

        raw.send(Delta::Undo { key, sequence: 1 }.encode()).unwrap();
        raw.send(frames[0].encode()).unwrap();
        let report = b.poll();
        assert_eq!(report.buffered, 1);
        assert_eq!(report.undone, vec![(key, 1)]);
        assert_eq!(field(b.modifier(), key), before);
    }

    #[test]
    fn test_mesh_is_surfaced() {
        let (ta, tb) = LoopbackTransport::pair();
        let a = ReplicationSession::new(modifier(1), Box::new(ta), &replication(60_000));
        let mut b = ReplicationSession::new(modifier(2), Box::new(tb), &replication(60_000));
        let key = ChunkKey::at(0, 0, 0, 0);
        let snapshot = a.modifier().store().get_chunk(key).unwrap();
        let mesh = crate::mesh::mesh_isolated(&snapshot);
        assert!(!mesh.is_empty());
        a.publish_mesh(&mesh).unwrap();

        let report = b.poll();
        assert_eq!(report.meshes.len(), 1);
        assert_eq!(report.meshes[0].key, key);
        assert_eq!(report.meshes[0].triangle_count(), mesh.triangle_count());
    }

    #[test]
    fn test_garbage_frame_is_dropped() {
        let (raw, tb) = LoopbackTransport::pair();
        let mut b = ReplicationSession::new(modifier(2), Box::new(tb), &replication(60_000));
        raw.send(b"not a delta".to_vec()).unwrap();
        assert!(b.poll().is_empty());
    }
}
