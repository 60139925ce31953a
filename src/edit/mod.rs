//! Edit system: shapes, records, per-chunk logs, the world overlay and the
//! pipeline that applies edits to the store.

pub mod blend;
pub mod log;
pub mod overlay;
pub mod pipeline;
pub mod record;
pub mod shape;

pub use blend::blend_record;
pub use self::log::ChunkEditLog;
pub use overlay::{EditOverlay, participant_of};
pub use pipeline::{ApplyOutcome, AppliedEdit, EditOutcome, Modifier, RejectReason, UndoneEdit};
pub use record::{EditOp, EditRecord};
pub use shape::{Axis, EditShape, SdfStamp};
