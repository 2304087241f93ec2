//! Batched autoregressive decoding core.
//!
//! Turns per-step logits from a model into token selections for a batch of
//! concurrent requests: greedy, top-k, top-p and beam search, plus draft
//! acceptance for speculative decoding. [`decoder::DecoderBatch`] owns the
//! per-slot state and runs steps on ordered worker streams.

pub mod beam;
pub mod config;
pub mod decoder;
pub mod distributed;
pub mod error;
pub mod logging;
pub mod sampling;
pub mod speculative;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{DecoderSetup, DecodingMode};
pub use decoder::{DecoderBatch, DecoderBatchInput, Request, SlotHandle};
pub use error::{DecodeError, Result};
pub use sampling::{FinishedState, SamplingConfig};
