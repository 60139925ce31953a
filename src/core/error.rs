//! Error types for the voxterra engine

use thiserror::Error;

use crate::voxel::chunk::ChunkKey;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    /// The generator kept failing for a chunk; the chunk is now marked `Error`.
    #[error("generation failed for {key} after {attempts} attempt(s): {reason}")]
    GenerationFailed {
        key: ChunkKey,
        attempts: u32,
        reason: String,
    },

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// A replication gap outlived the resync timeout.
    #[error("desync detected on {key}: expected sequence {expected}, waited {waited_ms} ms")]
    DesyncDetected {
        key: ChunkKey,
        expected: u64,
        waited_ms: u64,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("scheduler is shut down")]
    Shutdown,
}
