//! Multi-device reduction over peer-shared buffers.
//!
//! This module provides:
//! - [`ProcessGroup`] - rank bookkeeping
//! - [`DeviceCommunicator`] - collectives (all_reduce, all_gather, broadcast)
//! - [`IpcMemory`] / [`AllReduceBuffers`] - buffers exchanged once between
//!   ranks and reused for every collective
//!
//! The decoder itself runs on one device and never calls into this module;
//! the model-execution side uses it to reduce tensor-parallel partial logits
//! before handing them to [`DecoderBatch`](crate::decoder::DecoderBatch).
//!
//! # Usage
//!
//! ```ignore
//! use batchdec_core::distributed::{AllReduceBuffers, IpcWorld, ReduceOp};
//!
//! let world = IpcWorld::new(2);
//! // On each rank's thread:
//! let buffers = AllReduceBuffers::new(&world, rank, 1024)?;
//! let summed = buffers.all_reduce(&partial, ReduceOp::Sum)?;
//! ```

mod communicator;
mod error;
mod ipc_memory;
mod process_group;

pub use communicator::{DeviceCommunicator, MockCommunicator, ReduceOp};
pub use error::DistributedError;
pub use ipc_memory::{AllReduceBuffers, IpcCommunicator, IpcMemory, IpcWorld, DEFAULT_PEER_TIMEOUT};
pub use process_group::{LocalProcessGroup, ProcessGroup};
