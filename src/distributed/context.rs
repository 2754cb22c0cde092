//! Injected distributed capabilities for factor synchronization.
//!
//! Trackers never query process-group state globally; the caller hands them a
//! [`DistributedContext`], so single-process runs and tests can supply
//! [`LocalContext`] or a simulated world.

use std::sync::Arc;

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::{Communicator, ReduceOp, Runtime};
use numr::tensor::Tensor;

/// Process-group queries and the blocking sum-reduction used after a fit pass.
pub trait DistributedContext<R: Runtime<DType = DType>> {
    /// A multi-process group is active.
    fn is_initialized(&self) -> bool;

    /// Factors live on an accelerator that the collective backend can reach.
    fn accelerator_available(&self) -> bool;

    /// Rank of this process.
    fn rank(&self) -> usize;

    /// Sum `tensor` across all processes. The returned tensor holds the total
    /// on the coordinator (rank 0); other ranks must not rely on its value.
    fn reduce_sum_to_root(&self, tensor: Tensor<R>) -> Result<Tensor<R>>;
}

/// Single-process context: never initialized, so synchronization is skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalContext;

impl<R: Runtime<DType = DType>> DistributedContext<R> for LocalContext {
    fn is_initialized(&self) -> bool {
        false
    }

    fn accelerator_available(&self) -> bool {
        false
    }

    fn rank(&self) -> usize {
        0
    }

    fn reduce_sum_to_root(&self, tensor: Tensor<R>) -> Result<Tensor<R>> {
        Ok(tensor)
    }
}

/// Context backed by a numr [`Communicator`] (NCCL, MPI, NoOp).
///
/// The group counts as initialized when it spans more than one rank. The sum
/// is computed with an in-place all-reduce, so every rank (the coordinator
/// included) ends up holding the total.
pub struct CommunicatorContext {
    comm: Arc<dyn Communicator>,
    accelerator_available: bool,
}

impl CommunicatorContext {
    pub fn new(comm: Arc<dyn Communicator>, accelerator_available: bool) -> Self {
        Self {
            comm,
            accelerator_available,
        }
    }

    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }
}

impl<R: Runtime<DType = DType>> DistributedContext<R> for CommunicatorContext {
    fn is_initialized(&self) -> bool {
        self.comm.world_size() > 1
    }

    fn accelerator_available(&self) -> bool {
        self.accelerator_available
    }

    fn rank(&self) -> usize {
        self.comm.rank()
    }

    fn reduce_sum_to_root(&self, tensor: Tensor<R>) -> Result<Tensor<R>> {
        let tensor = tensor.contiguous();
        let (ptr, count, dtype) = (tensor.ptr(), tensor.numel(), tensor.dtype());

        // Safety: `tensor` is contiguous and owns `count` elements of `dtype` at `ptr`.
        unsafe {
            self.comm
                .all_reduce(ptr, count, dtype, ReduceOp::Sum)
                .map_err(|e| Error::DistributedError {
                    reason: format!("all_reduce of {count} {dtype:?} elements failed: {e}"),
                })?;
        }
        self.comm.sync().map_err(|e| Error::DistributedError {
            reason: format!("sync after factor reduction failed: {e}"),
        })?;
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use numr::runtime::NoOpCommunicator;
    use numr::runtime::cpu::{CpuDevice, CpuRuntime};

    #[test]
    fn test_local_context_is_inactive() {
        let ctx = LocalContext;
        assert!(!DistributedContext::<CpuRuntime>::is_initialized(&ctx));
        assert!(!DistributedContext::<CpuRuntime>::accelerator_available(&ctx));
    }

    #[test]
    fn test_noop_communicator_single_rank_not_initialized() {
        let ctx = CommunicatorContext::new(Arc::new(NoOpCommunicator), true);
        assert_eq!(ctx.world_size(), 1);
        assert!(!DistributedContext::<CpuRuntime>::is_initialized(&ctx));
        assert!(DistributedContext::<CpuRuntime>::accelerator_available(&ctx));
    }

    #[test]
    fn test_noop_communicator_reduce_keeps_values() {
        let device = CpuDevice::new();
        let ctx = CommunicatorContext::new(Arc::new(NoOpCommunicator), false);
        let t = Tensor::<CpuRuntime>::from_slice(&[4.0f32, 5.0], &[2], &device);
        let reduced = ctx.reduce_sum_to_root(t).unwrap();
        assert_eq!(reduced.to_vec::<f32>(), vec![4.0, 5.0]);
    }

    #[test]
    fn test_reduce_makes_strided_input_contiguous() {
        let device = CpuDevice::new();
        let ctx = CommunicatorContext::new(Arc::new(NoOpCommunicator), true);
        let t = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2], &device)
            .transpose(-2, -1)
            .unwrap();
        let reduced = ctx.reduce_sum_to_root(t).unwrap();
        assert!(reduced.is_contiguous());
        assert_eq!(reduced.to_vec::<f32>(), vec![1.0, 3.0, 2.0, 4.0]);
    }
}
