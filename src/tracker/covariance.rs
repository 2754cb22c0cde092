//! Activation and pseudo-gradient covariance tracking.

use std::marker::PhantomData;

use crate::distributed::DistributedContext;
use crate::error::Result;
use crate::factor::FactorStorage;
use crate::module::TrackableModule;
use crate::ops::FactorOps;
use crate::tracker::base::{
    HookContext, Tracker, TrackerState, cache_not_found, cast_to, hooks_not_registered,
    reduce_count, reduce_factor, scale_output_gradient, should_synchronize,
};
use crate::tracker::hooks::{BackwardPath, HookSet};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::{Tensor, TensorId};
use tracing::{debug, warn};

/// Accumulates `A = Σ xᵀx` over flattened input activations and
/// `G = Σ gᵀg` over flattened output gradients for one module.
pub struct CovarianceTracker<R: Runtime> {
    hooks: HookSet,
    state: TrackerState,
    _runtime: PhantomData<R>,
}

impl<R: Runtime<DType = DType>> Default for CovarianceTracker<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Runtime<DType = DType>> CovarianceTracker<R> {
    pub fn new() -> Self {
        Self {
            hooks: HookSet::new(),
            state: TrackerState::Idle,
            _runtime: PhantomData,
        }
    }

    fn update_activation_covariance_matrix<C, M>(
        client: &C,
        ctx: &mut HookContext<'_, R, M>,
        input_activation: &Tensor<R>,
    ) -> Result<()>
    where
        C: FactorOps<R>,
        M: TrackableModule<R>,
    {
        let (flattened, count) = ctx.module.get_flattened_activation(client, input_activation)?;
        let cov = &mut ctx.storage.covariance;
        if cov.activation.is_none() {
            debug!(module = ctx.name, dim = flattened.shape()[1], "allocating activation covariance");
        }
        accumulate_second_moment(
            client,
            &mut cov.activation,
            &mut cov.num_activation_processed,
            &flattened,
            count,
        )
    }

    fn update_gradient_covariance_matrix<C, M>(
        client: &C,
        ctx: &mut HookContext<'_, R, M>,
        output_gradient: &Tensor<R>,
    ) -> Result<()>
    where
        C: FactorOps<R>,
        M: TrackableModule<R>,
    {
        let (flattened, count) = ctx.module.get_flattened_gradient(client, output_gradient)?;
        let cov = &mut ctx.storage.covariance;
        if cov.gradient.is_none() {
            debug!(module = ctx.name, dim = flattened.shape()[1], "allocating gradient covariance");
        }
        accumulate_second_moment(
            client,
            &mut cov.gradient,
            &mut cov.num_gradient_processed,
            &flattened,
            count,
        )
    }
}

/// `matrix += flatᵀ flat`, `count += rows`, allocating both on first touch.
///
/// The matrix is sized to `flat`'s feature dimension and takes its dtype and
/// device. Storage is only written once the update has been computed, so a
/// shape error leaves the previous matrix and count in place.
fn accumulate_second_moment<R, C>(
    client: &C,
    matrix: &mut Option<Tensor<R>>,
    count: &mut Option<u64>,
    flat: &Tensor<R>,
    rows: u64,
) -> Result<()>
where
    R: Runtime<DType = DType>,
    C: FactorOps<R>,
{
    let flat_t = flat.transpose(-2, -1)?.contiguous();
    let update = client.matmul(&flat_t, flat)?;
    let updated = match matrix.as_ref() {
        Some(current) => client.add(current, &update)?,
        None => {
            let dim = flat.shape()[1];
            let zeros = Tensor::<R>::zeros(&[dim, dim], flat.dtype(), flat.device());
            client.add(&zeros, &update)?
        }
    };
    *matrix = Some(updated);
    *count = Some(count.unwrap_or(0) + rows);
    Ok(())
}

impl<R: Runtime<DType = DType>> Tracker<R> for CovarianceTracker<R> {
    fn register_hooks(&mut self) {
        let handle = self.hooks.register_forward();
        debug!(hook = handle.id(), "registered covariance forward hook");
    }

    fn release_hooks(&mut self) {
        self.hooks.release();
        self.state = TrackerState::Idle;
    }

    fn hooks_registered(&self) -> bool {
        self.hooks.is_registered()
    }

    fn state(&self) -> TrackerState {
        self.state
    }

    fn next_pending_output(&self) -> Option<TensorId> {
        self.hooks.peek_backward().map(|pending| pending.output)
    }

    fn forward_hook<C, M>(
        &mut self,
        client: &C,
        mut ctx: HookContext<'_, R, M>,
        input: &Tensor<R>,
        output: TensorId,
    ) -> Result<()>
    where
        C: FactorOps<R>,
        M: TrackableModule<R>,
    {
        if !self.hooks.is_registered() {
            return Err(hooks_not_registered(ctx.name));
        }
        let activation = cast_to(client, input, ctx.factor_args.activation_covariance_dtype)?;
        Self::update_activation_covariance_matrix(client, &mut ctx, &activation)?;
        self.hooks.register_backward(output, BackwardPath::Single);
        self.state = TrackerState::ForwardCached;
        Ok(())
    }

    fn backward_hook<C, M>(
        &mut self,
        client: &C,
        mut ctx: HookContext<'_, R, M>,
        output_gradient: &Tensor<R>,
    ) -> Result<()>
    where
        C: FactorOps<R>,
        M: TrackableModule<R>,
    {
        if self.hooks.pop_backward().is_none() {
            return Err(cache_not_found(ctx.name));
        }
        let gradient = scale_output_gradient(
            client,
            output_gradient,
            ctx.factor_args.gradient_covariance_dtype,
            ctx.gradient_scale,
        )?;
        Self::update_gradient_covariance_matrix(client, &mut ctx, &gradient)?;
        self.state = TrackerState::BackwardConsumed;
        Ok(())
    }

    fn finalize_iteration<C, M>(&mut self, _client: &C, ctx: HookContext<'_, R, M>) -> Result<()>
    where
        C: FactorOps<R>,
        M: TrackableModule<R>,
    {
        let dropped = self.hooks.drop_pending();
        if dropped > 0 {
            debug!(module = ctx.name, dropped, "backward hooks never fired this pass");
        }
        self.state = TrackerState::Idle;
        Ok(())
    }

    fn exist(&self, storage: &FactorStorage<R>) -> bool {
        storage.covariance.exist()
    }

    fn synchronize(
        &self,
        storage: &mut FactorStorage<R>,
        dist: &dyn DistributedContext<R>,
        num_processes: usize,
    ) -> Result<()> {
        let cov = &mut storage.covariance;
        if cov.is_partial() {
            warn!("covariance factors partially present; skipping synchronization");
        }
        if !should_synchronize(dist, cov.exist()) {
            return Ok(());
        }
        debug!(rank = dist.rank(), num_processes, "synchronizing covariance factors");

        reduce_factor(dist, &mut cov.activation)?;
        reduce_factor(dist, &mut cov.gradient)?;
        if let Some(device) = cov.activation.as_ref().map(|t| t.device().clone()) {
            reduce_count(dist, &mut cov.num_activation_processed, &device)?;
            reduce_count(dist, &mut cov.num_gradient_processed, &device)?;
        }
        Ok(())
    }

    fn release_memory(&mut self, storage: &mut FactorStorage<R>) {
        storage.covariance.release();
        debug!("released covariance factors");
    }

    fn clear_all_cache(&mut self) {
        // Covariance hooks hold no transient tensors.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factor::FactorArguments;
    use crate::module::Linear;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    fn layer(device: &numr::runtime::cpu::CpuDevice) -> Linear<CpuRuntime> {
        let weight = Tensor::<CpuRuntime>::from_slice(&[0.0f32; 6], &[3, 2], device);
        Linear::new(weight, None, false)
    }

    #[test]
    fn test_forward_backward_accumulates_both_matrices() {
        let (client, device) = cpu_setup();
        let module = layer(&device);
        let args = FactorArguments::default();
        let mut storage = FactorStorage::<CpuRuntime>::new();
        let mut tracker = CovarianceTracker::<CpuRuntime>::new();
        tracker.register_hooks();

        // x = [[1, 2], [3, 4]] → xᵀx = [[10, 14], [14, 20]]
        let x = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2], &device);
        let ctx = HookContext {
            name: "fc",
            module: &module,
            storage: &mut storage,
            factor_args: &args,
            gradient_scale: 1.0,
        };
        tracker.forward_hook(&client, ctx, &x, TensorId::new()).unwrap();
        assert_eq!(tracker.state(), TrackerState::ForwardCached);

        // g = [[1, 0, 1], [0, 1, 0]] → gᵀg = [[1,0,1],[0,1,0],[1,0,1]]
        let g = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 0.0, 1.0, 0.0, 1.0, 0.0], &[2, 3], &device);
        let ctx = HookContext {
            name: "fc",
            module: &module,
            storage: &mut storage,
            factor_args: &args,
            gradient_scale: 1.0,
        };
        tracker.backward_hook(&client, ctx, &g).unwrap();
        assert_eq!(tracker.state(), TrackerState::BackwardConsumed);

        assert!(tracker.exist(&storage));
        let a = storage.covariance.activation.as_ref().unwrap().to_vec::<f32>();
        assert_eq!(a, vec![10.0, 14.0, 14.0, 20.0]);
        let gg = storage.covariance.gradient.as_ref().unwrap().to_vec::<f32>();
        assert_eq!(gg, vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
        assert_eq!(storage.covariance.num_activation_processed, Some(2));
        assert_eq!(storage.covariance.num_gradient_processed, Some(2));
    }

    #[test]
    fn test_forward_without_registration_fails() {
        let (client, device) = cpu_setup();
        let module = layer(&device);
        let args = FactorArguments::default();
        let mut storage = FactorStorage::<CpuRuntime>::new();
        let mut tracker = CovarianceTracker::<CpuRuntime>::new();

        let x = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[1, 2], &device);
        let ctx = HookContext {
            name: "fc",
            module: &module,
            storage: &mut storage,
            factor_args: &args,
            gradient_scale: 1.0,
        };
        let err = tracker.forward_hook(&client, ctx, &x, TensorId::new()).unwrap_err();
        assert!(matches!(err, crate::error::Error::TrackerError { .. }));
        assert!(storage.covariance.activation.is_none());
    }

    #[test]
    fn test_backward_without_forward_is_cache_miss() {
        let (client, device) = cpu_setup();
        let module = layer(&device);
        let args = FactorArguments::default();
        let mut storage = FactorStorage::<CpuRuntime>::new();
        let mut tracker = CovarianceTracker::<CpuRuntime>::new();
        tracker.register_hooks();

        let g = Tensor::<CpuRuntime>::from_slice(&[1.0f32; 3], &[1, 3], &device);
        let ctx = HookContext {
            name: "fc",
            module: &module,
            storage: &mut storage,
            factor_args: &args,
            gradient_scale: 1.0,
        };
        let err = tracker.backward_hook(&client, ctx, &g).unwrap_err();
        assert!(matches!(err, crate::error::Error::CacheNotFound { .. }));
        assert!(storage.covariance.gradient.is_none());
    }

    #[test]
    fn test_activation_dtype_follows_config() {
        let (client, device) = cpu_setup();
        let module = layer(&device);
        let args = FactorArguments::default().with_activation_covariance_dtype(DType::F64);
        let mut storage = FactorStorage::<CpuRuntime>::new();
        let mut tracker = CovarianceTracker::<CpuRuntime>::new();
        tracker.register_hooks();

        let x = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 1.0], &[1, 2], &device);
        let ctx = HookContext {
            name: "fc",
            module: &module,
            storage: &mut storage,
            factor_args: &args,
            gradient_scale: 1.0,
        };
        tracker.forward_hook(&client, ctx, &x, TensorId::new()).unwrap();
        let a = storage.covariance.activation.as_ref().unwrap();
        assert_eq!(a.dtype(), DType::F64);
    }

    #[test]
    fn test_release_memory_idempotent() {
        let (_client, device) = cpu_setup();
        let mut storage = FactorStorage::<CpuRuntime>::new();
        let mut tracker = CovarianceTracker::<CpuRuntime>::new();

        tracker.release_memory(&mut storage);
        assert!(!tracker.exist(&storage));

        storage.covariance.activation =
            Some(Tensor::<CpuRuntime>::zeros(&[2, 2], DType::F32, &device));
        storage.covariance.num_activation_processed = Some(3);
        tracker.release_memory(&mut storage);
        tracker.release_memory(&mut storage);
        assert!(storage.covariance.activation.is_none());
        assert!(storage.covariance.num_activation_processed.is_none());
    }
}
