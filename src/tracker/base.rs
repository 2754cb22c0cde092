//! Contract shared by the covariance and Lambda trackers.
//!
//! A tracker walks an explicit per-pass state machine instead of relying on
//! implicit callback injection:
//!
//! ```text
//! Idle ──forward──▶ ForwardCached ──backward──▶ BackwardConsumed ──finalize──▶ Idle
//!                        │
//!                        └──backward (shared)──▶ SharedAccumulating ──finalize──▶ Idle
//! ```
//!
//! All accumulation happens on detached tensors; nothing the trackers compute
//! is recorded in the host's autograd graph.

use crate::distributed::DistributedContext;
use crate::error::{Error, Result};
use crate::factor::{FactorArguments, FactorStorage};
use crate::module::TrackableModule;
use crate::ops::FactorOps;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::{Tensor, TensorId};

/// Where a tracker is within the current fit pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerState {
    #[default]
    Idle,
    ForwardCached,
    /// Shared-parameter invocations are unwinding; per-sample gradients are
    /// being summed until the pass is finalized.
    SharedAccumulating,
    BackwardConsumed,
}

/// Everything a hook may touch on the module it is attached to.
pub struct HookContext<'a, R: Runtime, M> {
    /// Module name, for diagnostics.
    pub name: &'a str,
    pub module: &'a M,
    pub storage: &'a mut FactorStorage<R>,
    pub factor_args: &'a FactorArguments,
    /// Factor applied to incoming output gradients (e.g. `1 / loss_scale`).
    pub gradient_scale: f64,
}

/// Lifecycle every tracker implements.
pub trait Tracker<R: Runtime<DType = DType>> {
    /// Attach the forward hook for this fit pass.
    fn register_hooks(&mut self);

    /// Drop the forward hook and every pending backward hook.
    fn release_hooks(&mut self);

    fn hooks_registered(&self) -> bool;

    fn state(&self) -> TrackerState;

    /// Output tensor whose gradient the next backward firing expects.
    fn next_pending_output(&self) -> Option<TensorId>;

    /// Fired after the module's forward computation with its first positional
    /// input and the id of its output.
    fn forward_hook<C, M>(
        &mut self,
        client: &C,
        ctx: HookContext<'_, R, M>,
        input: &Tensor<R>,
        output: TensorId,
    ) -> Result<()>
    where
        C: FactorOps<R>,
        M: TrackableModule<R>;

    /// Fired with the gradient flowing into the most recently registered output.
    fn backward_hook<C, M>(
        &mut self,
        client: &C,
        ctx: HookContext<'_, R, M>,
        output_gradient: &Tensor<R>,
    ) -> Result<()>
    where
        C: FactorOps<R>,
        M: TrackableModule<R>;

    /// Close the pass after every backward firing has run.
    fn finalize_iteration<C, M>(&mut self, client: &C, ctx: HookContext<'_, R, M>) -> Result<()>
    where
        C: FactorOps<R>,
        M: TrackableModule<R>;

    /// Every factor of this tracker's group is present.
    fn exist(&self, storage: &FactorStorage<R>) -> bool;

    /// Sum this tracker's factors across processes onto the coordinator.
    fn synchronize(
        &self,
        storage: &mut FactorStorage<R>,
        dist: &dyn DistributedContext<R>,
        num_processes: usize,
    ) -> Result<()>;

    /// Drop this tracker's factors (and transient caches). Idempotent.
    fn release_memory(&mut self, storage: &mut FactorStorage<R>);

    fn clear_all_cache(&mut self);
}

/// Cast an output gradient to `target_dtype`, then undo any upstream scaling
/// (loss-reduction or loss-scaling factors) by multiplying with `gradient_scale`.
pub(crate) fn scale_output_gradient<R, C>(
    client: &C,
    output_gradient: &Tensor<R>,
    target_dtype: DType,
    gradient_scale: f64,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: FactorOps<R>,
{
    let gradient = if output_gradient.dtype() == target_dtype {
        output_gradient.clone()
    } else {
        client.cast(output_gradient, target_dtype)?
    };
    if gradient_scale == 1.0 {
        Ok(gradient)
    } else {
        client.mul_scalar(&gradient, gradient_scale).map_err(Error::Numr)
    }
}

/// Cast to `dtype` unless already there.
pub(crate) fn cast_to<R, C>(client: &C, tensor: &Tensor<R>, dtype: DType) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: FactorOps<R>,
{
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        client.cast(tensor, dtype).map_err(Error::Numr)
    }
}

/// Whether synchronization should run at all.
pub(crate) fn should_synchronize<R: Runtime<DType = DType>>(
    dist: &dyn DistributedContext<R>,
    factors_exist: bool,
) -> bool {
    dist.is_initialized() && dist.accelerator_available() && factors_exist
}

/// Reduce one factor matrix in storage.
pub(crate) fn reduce_factor<R: Runtime<DType = DType>>(
    dist: &dyn DistributedContext<R>,
    slot: &mut Option<Tensor<R>>,
) -> Result<()> {
    if let Some(tensor) = slot.take() {
        *slot = Some(dist.reduce_sum_to_root(tensor)?);
    }
    Ok(())
}

/// Reduce a processed-sample count by staging it through a one-element tensor
/// on `device`.
pub(crate) fn reduce_count<R: Runtime<DType = DType>>(
    dist: &dyn DistributedContext<R>,
    count: &mut Option<u64>,
    device: &R::Device,
) -> Result<()> {
    if let Some(n) = *count {
        let staged = Tensor::<R>::from_slice(&[n as i64], &[1], device);
        let reduced = dist.reduce_sum_to_root(staged)?;
        let total = reduced.to_vec::<i64>().first().copied().ok_or_else(|| {
            Error::DistributedError {
                reason: "reduced count tensor is empty".to_string(),
            }
        })?;
        *count = Some(total as u64);
    }
    Ok(())
}

pub(crate) fn hooks_not_registered(name: &str) -> Error {
    Error::TrackerError {
        reason: format!("hook fired on module '{name}' but no hooks are registered"),
    }
}

pub(crate) fn cache_not_found(name: &str) -> Error {
    Error::CacheNotFound {
        module: name.to_string(),
    }
}
