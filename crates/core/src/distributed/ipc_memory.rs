//! Peer-shared buffers for multi-device reduction.
//!
//! Every rank allocates its own buffer once and publishes a handle to it;
//! after a symmetric exchange each rank holds handles to all peers' buffers.
//! Collectives then read peers' memory directly, synchronized by per-buffer
//! step flags, without renegotiating anything. Handles are released when the
//! [`IpcMemory`] is dropped.
//!
//! Ranks are threads of this process sharing an [`IpcWorld`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, RwLock};
use std::time::{Duration, Instant};

use candle_core::{DType, Tensor};

use super::communicator::{DeviceCommunicator, ReduceOp};
use super::error::{DistributedError, Result};
use super::process_group::{LocalProcessGroup, ProcessGroup};

/// How long a rank waits for its peers to signal a step.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// One rank's buffer, readable by every peer.
#[derive(Debug)]
struct SharedBuffer {
    data: RwLock<Vec<f32>>,
    /// Elements written for the current step.
    len: AtomicUsize,
    /// Last step whose payload is complete.
    flag: AtomicU64,
}

impl SharedBuffer {
    fn zeroed(capacity: usize) -> Self {
        Self {
            data: RwLock::new(vec![0.0; capacity]),
            len: AtomicUsize::new(0),
            flag: AtomicU64::new(0),
        }
    }
}

/// Rendezvous used to exchange buffer handles.
#[derive(Debug)]
struct Exchange {
    world_size: usize,
    slots: Mutex<Vec<Option<Arc<SharedBuffer>>>>,
    barrier: Barrier,
}

/// The set of ranks that share buffers. Clone it into every rank's thread.
#[derive(Debug, Clone)]
pub struct IpcWorld {
    exchange: Arc<Exchange>,
}

impl IpcWorld {
    pub fn new(world_size: usize) -> Self {
        Self {
            exchange: Arc::new(Exchange {
                world_size,
                slots: Mutex::new(vec![None; world_size]),
                barrier: Barrier::new(world_size),
            }),
        }
    }

    pub fn world_size(&self) -> usize {
        self.exchange.world_size
    }

    pub fn process_group(&self, rank: usize) -> Result<LocalProcessGroup> {
        LocalProcessGroup::with_rank(rank, self.world_size())
    }
}

/// A buffer owned by one rank plus handles to every peer's buffer.
///
/// Construction is collective: every rank of the world must call
/// [`IpcMemory::open`] the same number of times and in the same order.
#[derive(Debug)]
pub struct IpcMemory {
    rank: usize,
    capacity: usize,
    /// Indexed by rank; `peers[rank]` is this rank's own buffer.
    peers: Vec<Arc<SharedBuffer>>,
}

impl IpcMemory {
    pub fn open(world: &IpcWorld, rank: usize, capacity: usize) -> Result<Self> {
        let exchange = &world.exchange;
        let world_size = exchange.world_size;
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        let own = Arc::new(SharedBuffer::zeroed(capacity));

        // Publish, then collect everyone's handle once all have published.
        {
            let mut slots = exchange.slots.lock().map_err(|_| DistributedError::Poisoned)?;
            slots[rank] = Some(Arc::clone(&own));
        }
        exchange.barrier.wait();
        let peers = {
            let slots = exchange.slots.lock().map_err(|_| DistributedError::Poisoned)?;
            slots
                .iter()
                .enumerate()
                .map(|(r, slot)| slot.clone().ok_or(DistributedError::MissingPeer { rank: r }))
                .collect::<Result<Vec<_>>>()
        };
        // Nobody clears its slot before every rank has read all of them.
        exchange.barrier.wait();
        {
            let mut slots = exchange.slots.lock().map_err(|_| DistributedError::Poisoned)?;
            slots[rank] = None;
        }
        let peers = peers?;
        tracing::debug!(rank, world_size, capacity, "opened peer buffers");
        Ok(Self {
            rank,
            capacity,
            peers,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.peers.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn own(&self) -> &SharedBuffer {
        &self.peers[self.rank]
    }

    /// Write `payload` into this rank's buffer and mark it complete for `step`.
    fn publish(&self, payload: &[f32], step: u64) -> Result<()> {
        if payload.len() > self.capacity {
            return Err(DistributedError::BufferTooSmall {
                requested: payload.len(),
                capacity: self.capacity,
            });
        }
        let own = self.own();
        {
            let mut data = own.data.write().map_err(|_| DistributedError::Poisoned)?;
            data[..payload.len()].copy_from_slice(payload);
        }
        own.len.store(payload.len(), Ordering::Release);
        own.flag.store(step, Ordering::Release);
        Ok(())
    }

    /// Spin until every peer has published `step`.
    fn wait_for(&self, step: u64, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        for peer in &self.peers {
            while peer.flag.load(Ordering::Acquire) < step {
                if start.elapsed() > timeout {
                    return Err(DistributedError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                std::thread::yield_now();
            }
        }
        Ok(())
    }

    /// Copy every rank's payload, in rank order.
    fn read_all(&self) -> Result<Vec<Vec<f32>>> {
        self.peers
            .iter()
            .map(|peer| {
                let len = peer.len.load(Ordering::Acquire);
                let data = peer.data.read().map_err(|_| DistributedError::Poisoned)?;
                Ok(data[..len].to_vec())
            })
            .collect()
    }
}

impl Drop for IpcMemory {
    fn drop(&mut self) {
        tracing::debug!(rank = self.rank, "releasing peer buffers");
    }
}

/// Double-buffered shared memory for repeated collectives.
///
/// Step `n` uses buffer `n % 2`. A rank can only reach step `n + 2` after
/// every peer signalled step `n + 1`, which they do after reading step `n`,
/// so a buffer is never overwritten while a peer still reads it.
#[derive(Debug)]
pub struct AllReduceBuffers {
    buffers: [IpcMemory; 2],
    step: AtomicU64,
    timeout: Duration,
}

impl AllReduceBuffers {
    /// Collective: allocate two `max_elements` buffers per rank.
    pub fn new(world: &IpcWorld, rank: usize, max_elements: usize) -> Result<Self> {
        let first = IpcMemory::open(world, rank, max_elements)?;
        let second = IpcMemory::open(world, rank, max_elements)?;
        Ok(Self {
            buffers: [first, second],
            step: AtomicU64::new(0),
            timeout: DEFAULT_PEER_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn rank(&self) -> usize {
        self.buffers[0].rank()
    }

    pub fn world_size(&self) -> usize {
        self.buffers[0].world_size()
    }

    pub fn capacity(&self) -> usize {
        self.buffers[0].capacity()
    }

    /// Number of collectives completed through these buffers.
    pub fn steps(&self) -> u64 {
        self.step.load(Ordering::Relaxed)
    }

    /// Publish `payload` and return every rank's payload in rank order.
    pub fn exchange(&self, payload: &[f32]) -> Result<Vec<Vec<f32>>> {
        let step = self.step.fetch_add(1, Ordering::Relaxed) + 1;
        let buffer = &self.buffers[(step % 2) as usize];
        buffer.publish(payload, step)?;
        buffer.wait_for(step, self.timeout)?;
        buffer.read_all()
    }

    /// Element-wise reduction of equally sized payloads.
    pub fn all_reduce(&self, payload: &[f32], op: ReduceOp) -> Result<Vec<f32>> {
        let gathered = self.exchange(payload)?;
        for (rank, contribution) in gathered.iter().enumerate() {
            if contribution.len() != payload.len() {
                return Err(DistributedError::SizeMismatch {
                    rank,
                    expected: payload.len(),
                    actual: contribution.len(),
                });
            }
        }
        let views: Vec<&[f32]> = gathered.iter().map(Vec::as_slice).collect();
        let mut out = vec![0.0; payload.len()];
        op.reduce_into(&mut out, &views);
        Ok(out)
    }
}

/// [`DeviceCommunicator`] backed by [`AllReduceBuffers`].
#[derive(Debug)]
pub struct IpcCommunicator {
    process_group: LocalProcessGroup,
    buffers: AllReduceBuffers,
}

impl IpcCommunicator {
    /// Collective: every rank of `world` must call this.
    pub fn new(world: &IpcWorld, rank: usize, max_elements: usize) -> Result<Self> {
        let process_group = world.process_group(rank)?;
        let buffers = AllReduceBuffers::new(world, rank, max_elements)?;
        Ok(Self {
            process_group,
            buffers,
        })
    }

    pub fn buffers(&self) -> &AllReduceBuffers {
        &self.buffers
    }
}

fn flatten_f32(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

impl DeviceCommunicator for IpcCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        let reduced = self.buffers.all_reduce(&flatten_f32(tensor)?, op)?;
        let out = Tensor::from_vec(reduced, tensor.shape(), tensor.device())?;
        Ok(out.to_dtype(tensor.dtype())?)
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor> {
        let gathered = self.buffers.exchange(&flatten_f32(tensor)?)?;
        let parts = gathered
            .into_iter()
            .enumerate()
            .map(|(rank, data)| {
                if data.len() != tensor.elem_count() {
                    return Err(DistributedError::SizeMismatch {
                        rank,
                        expected: tensor.elem_count(),
                        actual: data.len(),
                    });
                }
                Ok(Tensor::from_vec(data, tensor.shape(), tensor.device())?)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&parts, gather_dim)?.to_dtype(tensor.dtype())?)
    }

    fn broadcast(&self, tensor: &Tensor, src_rank: usize) -> Result<Tensor> {
        let world_size = self.process_group.world_size();
        if src_rank >= world_size {
            return Err(DistributedError::InvalidRank {
                rank: src_rank,
                world_size,
            });
        }
        let mut gathered = self.buffers.exchange(&flatten_f32(tensor)?)?;
        let data = gathered.swap_remove(src_rank);
        if data.len() != tensor.elem_count() {
            return Err(DistributedError::SizeMismatch {
                rank: src_rank,
                expected: tensor.elem_count(),
                actual: data.len(),
            });
        }
        Ok(Tensor::from_vec(data, tensor.shape(), tensor.device())?.to_dtype(tensor.dtype())?)
    }

    fn barrier(&self) -> Result<()> {
        self.buffers.exchange(&[]).map(|_| ())
    }
}
