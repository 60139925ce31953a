//! View-driven LOD planning and background job scheduling

pub mod lod;
pub mod scheduler;

pub use lod::LodPlanner;
pub use scheduler::{Job, JobKind, JobOutput, JobResult, JobStatus, Scheduler};
