//! Error types for multi-device collectives.

use thiserror::Error;

/// Errors raised while setting up or using peer-shared buffers.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// The handle exchange finished without a buffer from this rank.
    #[error("rank {rank} did not publish a buffer during the handle exchange")]
    MissingPeer { rank: usize },

    /// Ranks contributed buffers of different sizes to one collective.
    #[error("size mismatch on rank {rank}: expected {expected} elements, got {actual}")]
    SizeMismatch {
        rank: usize,
        expected: usize,
        actual: usize,
    },

    /// Payload does not fit the buffer allocated at setup.
    #[error("payload of {requested} elements exceeds shared buffer of {capacity}")]
    BufferTooSmall { requested: usize, capacity: usize },

    /// A peer never signalled the current step.
    #[error("communication timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A peer thread panicked while holding a shared lock.
    #[error("shared buffer lock poisoned")]
    Poisoned,

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
