//! Collective operations over a process group.

use candle_core::Tensor;

use super::error::Result;
use super::process_group::ProcessGroup;

/// Element-wise reduction applied by [`DeviceCommunicator::all_reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Product,
    Min,
    Max,
    /// Sum divided by world size.
    Average,
}

impl ReduceOp {
    /// Fold `contributions` (one slice per rank, rank order) into `out`.
    pub fn reduce_into(self, out: &mut [f32], contributions: &[&[f32]]) {
        let Some((first, rest)) = contributions.split_first() else {
            return;
        };
        out.copy_from_slice(first);
        for other in rest {
            for (acc, &x) in out.iter_mut().zip(other.iter()) {
                *acc = match self {
                    ReduceOp::Sum | ReduceOp::Average => *acc + x,
                    ReduceOp::Product => *acc * x,
                    ReduceOp::Min => acc.min(x),
                    ReduceOp::Max => acc.max(x),
                };
            }
        }
        if self == ReduceOp::Average {
            let n = contributions.len() as f32;
            for acc in out.iter_mut() {
                *acc /= n;
            }
        }
    }
}

/// Device-to-device collectives.
pub trait DeviceCommunicator: Send + Sync {
    fn process_group(&self) -> &dyn ProcessGroup;

    /// Reduce across all ranks; every rank receives the result.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;

    /// Concatenate every rank's tensor along `gather_dim`, in rank order.
    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor>;

    /// Every rank receives `src_rank`'s tensor.
    fn broadcast(&self, tensor: &Tensor, src_rank: usize) -> Result<Tensor>;

    fn barrier(&self) -> Result<()>;
}

/// Single-rank communicator: every collective is the identity.
pub struct MockCommunicator<P: ProcessGroup> {
    process_group: P,
}

impl<P: ProcessGroup> MockCommunicator<P> {
    pub fn new(process_group: P) -> Self {
        Self { process_group }
    }
}

impl<P: ProcessGroup> DeviceCommunicator for MockCommunicator<P> {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        if op == ReduceOp::Average || self.process_group.is_single() {
            return Ok(tensor.clone());
        }
        // Identical replicas: sum is world_size times the input.
        match op {
            ReduceOp::Sum => Ok((tensor * self.process_group.world_size() as f64)?),
            _ => Ok(tensor.clone()),
        }
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor> {
        if self.process_group.is_single() {
            return Ok(tensor.clone());
        }
        let tensors: Vec<Tensor> = (0..self.process_group.world_size())
            .map(|_| tensor.clone())
            .collect();
        Ok(Tensor::cat(&tensors, gather_dim)?)
    }

    fn broadcast(&self, tensor: &Tensor, _src_rank: usize) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalProcessGroup;
    use candle_core::{DType, Device};

    fn ones(shape: &[usize]) -> Tensor {
        Tensor::ones(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn reduce_ops_fold_in_rank_order() {
        let a = [1.0f32, 5.0];
        let b = [3.0f32, 2.0];
        let mut out = [0.0f32; 2];
        ReduceOp::Sum.reduce_into(&mut out, &[&a, &b]);
        assert_eq!(out, [4.0, 7.0]);
        ReduceOp::Max.reduce_into(&mut out, &[&a, &b]);
        assert_eq!(out, [3.0, 5.0]);
        ReduceOp::Min.reduce_into(&mut out, &[&a, &b]);
        assert_eq!(out, [1.0, 2.0]);
        ReduceOp::Product.reduce_into(&mut out, &[&a, &b]);
        assert_eq!(out, [3.0, 10.0]);
        ReduceOp::Average.reduce_into(&mut out, &[&a, &b]);
        assert_eq!(out, [2.0, 3.5]);
    }

    #[test]
    fn mock_single_rank_is_identity() {
        let comm = MockCommunicator::new(LocalProcessGroup::new());
        let input = ones(&[2, 3]);
        let reduced = comm.all_reduce(&input, ReduceOp::Sum).unwrap();
        assert_eq!(reduced.to_vec2::<f32>().unwrap(), input.to_vec2::<f32>().unwrap());
        assert_eq!(comm.all_gather(&input, 0).unwrap().dims(), &[2, 3]);
        comm.barrier().unwrap();
    }

    #[test]
    fn mock_replicated_gather_and_sum() {
        let comm = MockCommunicator::new(LocalProcessGroup::with_rank(0, 4).unwrap());
        let input = ones(&[2, 3]);
        assert_eq!(comm.all_gather(&input, 0).unwrap().dims(), &[8, 3]);
        let summed = comm.all_reduce(&input, ReduceOp::Sum).unwrap();
        assert_eq!(summed.to_vec2::<f32>().unwrap()[0], vec![4.0, 4.0, 4.0]);
        assert_eq!(comm.process_group().world_size(), 4);
    }
}
