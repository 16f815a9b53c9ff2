//! Error types for checkpoint operations.

use thiserror::Error;

/// Errors that can occur while persisting or loading checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The requested thread has no stored checkpoint.
    #[error("no checkpoint found for thread '{0}'")]
    NotFound(String),

    /// A save was rejected because it would move the step index backwards.
    ///
    /// Step indices are strictly increasing per thread; a violation means
    /// two writers raced on the same thread or a caller replayed an old
    /// checkpoint without loading first.
    #[error("non-monotonic step index for thread '{thread_id}': have {existing}, got {attempted}")]
    NonMonotonicStep {
        thread_id: String,
        existing: u64,
        attempted: u64,
    },

    /// Checkpoint payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The underlying storage failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        CheckpointError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CheckpointError>;
