//! Error types for the decoding core.

use thiserror::Error;

use crate::distributed::DistributedError;

/// Errors surfaced by the sampling primitives and the batch decoder.
///
/// None of these are retried internally. Configuration and capacity errors
/// are reported before any work is enqueued; device faults poison the whole
/// batch until a new session is set up.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// A parameter is outside what the kernels support (e.g. top-k above the cap).
    #[error("unsupported parameter {name}: {value} exceeds maximum {max}")]
    UnsupportedParameter {
        name: &'static str,
        value: usize,
        max: usize,
    },

    /// The caller-provided workspace cannot hold the temporaries of this call.
    #[error("workspace too small: need {required} entries, have {available}")]
    WorkspaceTooSmall { required: usize, available: usize },

    /// Inconsistent or invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Admission or input would exceed setup-time capacity.
    #[error("{what} {requested} exceeds capacity {capacity}")]
    CapacityExceeded {
        what: &'static str,
        requested: usize,
        capacity: usize,
    },

    /// The slot still has enqueued work that has not completed.
    #[error("slot {slot} has pending work")]
    SlotBusy { slot: usize },

    /// The slot was reassigned since the handle was issued.
    #[error("stale handle for slot {slot}: epoch {held}, current {current}")]
    StaleSlot {
        slot: usize,
        held: u64,
        current: u64,
    },

    /// The slot holds no request.
    #[error("slot {slot} is empty")]
    EmptySlot { slot: usize },

    /// `setup` has not been called.
    #[error("decoder used before setup")]
    NotSetUp,

    /// A decode job failed while running on a stream.
    #[error("device fault: {0}")]
    Device(String),

    /// A previous device fault aborted this decoding session.
    #[error("batch faulted by an earlier device error; set up a new session")]
    BatchFaulted,

    /// Multi-device collective failure.
    #[error("distributed error: {0}")]
    Distributed(#[from] DistributedError),

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl DecodeError {
    /// Whether the failure is fatal for the whole batch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DecodeError::Device(_) | DecodeError::BatchFaulted | DecodeError::Distributed(_)
        )
    }

    /// The core never retries; callers restart the session instead.
    pub fn is_retriable(&self) -> bool {
        false
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;
