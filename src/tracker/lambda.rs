//! Lambda (eigenbasis curvature) tracking from per-sample gradients.

use crate::distributed::DistributedContext;
use crate::error::{Error, Result};
use crate::factor::{FactorArguments, FactorStorage};
use crate::module::TrackableModule;
use crate::ops::FactorOps;
use crate::tracker::base::{
    HookContext, Tracker, TrackerState, cache_not_found, cast_to, hooks_not_registered,
    reduce_count, reduce_factor, scale_output_gradient, should_synchronize,
};
use crate::tracker::cache::{ActivationCache, CachedActivation, into_device};
use crate::tracker::hooks::{BackwardPath, HookSet};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::{Tensor, TensorId};
use tracing::{debug, warn};

/// Accumulates `Λ = Σ_b (Q_gᵀ · psg_b · Q_a)²` for one module, where `psg_b`
/// is the per-sample weight gradient of sample `b` and `Q_a`, `Q_g` are the
/// activation and gradient eigenvectors. Strategies that approximate the
/// eigenbasis as the identity skip the rotation.
pub struct LambdaTracker<R: Runtime> {
    hooks: HookSet,
    state: TrackerState,
    cached_activations: ActivationCache<R>,
    /// Running sum over shared-parameter invocations within the current pass.
    cached_per_sample_gradient: Option<Tensor<R>>,
}

impl<R: Runtime<DType = DType>> Default for LambdaTracker<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Runtime<DType = DType>> LambdaTracker<R> {
    pub fn new() -> Self {
        Self {
            hooks: HookSet::new(),
            state: TrackerState::Idle,
            cached_activations: ActivationCache::default(),
            cached_per_sample_gradient: None,
        }
    }

    /// Number of activations waiting for their backward firing.
    pub fn num_cached_activations(&self) -> usize {
        self.cached_activations.len()
    }

    pub fn has_cached_per_sample_gradient(&self) -> bool {
        self.cached_per_sample_gradient.is_some()
    }

    fn non_shared_backward<C, M>(
        &mut self,
        client: &C,
        ctx: &mut HookContext<'_, R, M>,
        output_gradient: &Tensor<R>,
    ) -> Result<()>
    where
        C: FactorOps<R>,
        M: TrackableModule<R>,
    {
        let cached = self
            .cached_activations
            .take_single()
            .ok_or_else(|| cache_not_found(ctx.name))?;
        let gradient = scale_output_gradient(
            client,
            output_gradient,
            ctx.factor_args.per_sample_gradient_dtype,
            ctx.gradient_scale,
        )?;
        let activation = cached.restore(gradient.device())?;
        let per_sample_gradient = ctx
            .module
            .compute_per_sample_gradient(client, &activation, &gradient)?;
        let per_sample_gradient = cast_to(client, &per_sample_gradient, ctx.factor_args.lambda_dtype)?;
        self.clear_all_cache();
        update_lambda_matrix(client, ctx.name, ctx.storage, ctx.factor_args, &per_sample_gradient)?;
        self.state = TrackerState::BackwardConsumed;
        Ok(())
    }

    fn shared_backward<C, M>(
        &mut self,
        client: &C,
        ctx: &mut HookContext<'_, R, M>,
        output_gradient: &Tensor<R>,
    ) -> Result<()>
    where
        C: FactorOps<R>,
        M: TrackableModule<R>,
    {
        let cached = self
            .cached_activations
            .pop()
            .ok_or_else(|| cache_not_found(ctx.name))?;
        let gradient = scale_output_gradient(
            client,
            output_gradient,
            ctx.factor_args.per_sample_gradient_dtype,
            ctx.gradient_scale,
        )?;
        let activation = cached.restore(gradient.device())?;
        let per_sample_gradient = ctx
            .module
            .compute_per_sample_gradient(client, &activation, &gradient)?;
        self.state = TrackerState::SharedAccumulating;
        if per_sample_gradient.shape().first() == Some(&0) {
            return Ok(());
        }
        let summed = match self.cached_per_sample_gradient.take() {
            Some(running) => client.add(&running, &per_sample_gradient)?,
            None => {
                let zeros = Tensor::<R>::zeros(
                    per_sample_gradient.shape(),
                    per_sample_gradient.dtype(),
                    per_sample_gradient.device(),
                );
                client.add(&zeros, &per_sample_gradient)?
            }
        };
        self.cached_per_sample_gradient = Some(summed);
        Ok(())
    }
}

/// Fold one batch of per-sample gradients `[batch, r, c]` into the Lambda matrix.
///
/// Eigenvectors are checked before anything is allocated, so a missing
/// eigendecomposition leaves the Lambda factors exactly as they were.
pub(crate) fn update_lambda_matrix<R, C>(
    client: &C,
    name: &str,
    storage: &mut FactorStorage<R>,
    factor_args: &FactorArguments,
    per_sample_gradient: &Tensor<R>,
) -> Result<()>
where
    R: Runtime<DType = DType>,
    C: FactorOps<R>,
{
    let shape = per_sample_gradient.shape();
    if shape.len() != 3 {
        return Err(Error::InvalidArgument {
            arg: "per_sample_gradient",
            reason: format!("expected 3D [batch, r, c], got {shape:?}"),
        });
    }
    let (batch_size, rows, cols) = (shape[0], shape[1], shape[2]);
    if batch_size == 0 {
        debug!(module = name, "empty batch; lambda unchanged");
        return Ok(());
    }
    let strategy = factor_args.strategy;

    let squared_sum = if strategy.config().requires_eigendecomposition_for_lambda {
        let eigen = &mut storage.eigendecomposition;
        let (activation_eigenvectors, gradient_eigenvectors) = match (
            eigen.activation_eigenvectors.as_ref(),
            eigen.gradient_eigenvectors.as_ref(),
        ) {
            (Some(qa), Some(qg)) => (qa, qg),
            _ => {
                return Err(Error::FactorsNotFound {
                    strategy: strategy.to_string(),
                    reason: format!(
                        "the strategy {strategy} requires eigendecomposition results for \
                         Lambda computations, but they are not found for module '{name}'"
                    ),
                });
            }
        };

        // Keep the eigenvectors on the working device and dtype so later
        // batches skip the copy and the cast.
        let device = per_sample_gradient.device();
        let dtype = per_sample_gradient.dtype();
        let qa = into_device(activation_eigenvectors.clone(), device)?;
        let qa = cast_to(client, &qa, dtype)?;
        let qg = into_device(gradient_eigenvectors.clone(), device)?;
        let qg = cast_to(client, &qg, dtype)?;
        eigen.activation_eigenvectors = Some(qa.clone());
        eigen.gradient_eigenvectors = Some(qg.clone());

        if factor_args.use_iterative_lambda_aggregation {
            iterative_eigenbasis_squares(client, per_sample_gradient, &qa, &qg, batch_size, rows, cols)?
        } else {
            batched_eigenbasis_squares(client, per_sample_gradient, &qa, &qg, batch_size, rows, cols)?
        }
    } else {
        // Eigenbasis approximated as the identity.
        let squared = client.square(per_sample_gradient)?;
        client.sum(&squared, &[0], false)?
    };

    let lambda = &mut storage.lambda;
    let updated = match lambda.lambda_matrix.as_ref() {
        Some(current) => client.add(current, &squared_sum)?,
        None => {
            debug!(module = name, rows, cols, "allocating lambda matrix");
            let zeros = Tensor::<R>::zeros(
                &[rows, cols],
                per_sample_gradient.dtype(),
                per_sample_gradient.device(),
            );
            client.add(&zeros, &squared_sum)?
        }
    };
    lambda.lambda_matrix = Some(updated);
    lambda.num_lambda_processed = Some(lambda.num_lambda_processed.unwrap_or(0) + batch_size as u64);
    Ok(())
}

/// Rotate the whole batch through both eigenbases at once and sum the squares.
fn batched_eigenbasis_squares<R, C>(
    client: &C,
    per_sample_gradient: &Tensor<R>,
    qa: &Tensor<R>,
    qg: &Tensor<R>,
    batch_size: usize,
    rows: usize,
    cols: usize,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: FactorOps<R>,
{
    let rotated = rotate_activation_side(client, per_sample_gradient, qa, batch_size, rows, cols)?;

    // [B, r, c] → [r, B·c] so Q_gᵀ multiplies every sample in one product.
    let stacked = rotated
        .permute(&[1, 0, 2])?
        .contiguous()
        .reshape(&[rows, batch_size * cols])?;
    let qg_t = qg.transpose(-2, -1)?.contiguous();
    let rotated = client.matmul(&qg_t, &stacked)?;
    let rotated = rotated.reshape(&[rows, batch_size, cols])?;

    let squared = client.square(&rotated)?;
    client.sum(&squared, &[1], false).map_err(Error::Numr)
}

/// Rotate by `Q_a` for the whole batch, then by `Q_gᵀ` one sample at a time,
/// so the doubly rotated batch is never materialised at once.
fn iterative_eigenbasis_squares<R, C>(
    client: &C,
    per_sample_gradient: &Tensor<R>,
    qa: &Tensor<R>,
    qg: &Tensor<R>,
    batch_size: usize,
    rows: usize,
    cols: usize,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: FactorOps<R>,
{
    let rotated = rotate_activation_side(client, per_sample_gradient, qa, batch_size, rows, cols)?;
    let qg_t = qg.transpose(-2, -1)?.contiguous();

    let mut acc = Tensor::<R>::zeros(&[rows, cols], rotated.dtype(), rotated.device());
    for i in 0..batch_size {
        let sample = rotated.narrow(0, i, 1)?.contiguous().reshape(&[rows, cols])?;
        let sqrt_lambda = client.matmul(&qg_t, &sample)?;
        let squared = client.square(&sqrt_lambda)?;
        acc = client.add(&acc, &squared)?;
    }
    Ok(acc)
}

/// `psg_b · Q_a` for every sample, as one `[B·r, c] @ [c, c]` product.
fn rotate_activation_side<R, C>(
    client: &C,
    per_sample_gradient: &Tensor<R>,
    qa: &Tensor<R>,
    batch_size: usize,
    rows: usize,
    cols: usize,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: FactorOps<R>,
{
    let flat = per_sample_gradient
        .contiguous()
        .reshape(&[batch_size * rows, cols])?;
    let rotated = client.matmul(&flat, qa)?;
    Ok(rotated.reshape(&[batch_size, rows, cols])?)
}

impl<R: Runtime<DType = DType>> Tracker<R> for LambdaTracker<R> {
    fn register_hooks(&mut self) {
        let handle = self.hooks.register_forward();
        debug!(hook = handle.id(), "registered lambda forward hook");
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
        ctx: HookContext<'_, R, M>,
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
        let args = ctx.factor_args;
        let activation = cast_to(client, input, args.per_sample_gradient_dtype)?;
        let cached = if args.offload_activations_to_cpu {
            CachedActivation::offloaded(&activation)?
        } else {
            CachedActivation::on_device(activation)
        };

        let path = if args.has_shared_parameters {
            self.cached_activations.push(cached);
            BackwardPath::Shared
        } else {
            self.cached_activations.set_single(cached);
            BackwardPath::Single
        };
        self.hooks.register_backward(output, path);
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
        let pending = self
            .hooks
            .pop_backward()
            .ok_or_else(|| cache_not_found(ctx.name))?;
        match pending.path {
            BackwardPath::Single => self.non_shared_backward(client, &mut ctx, output_gradient),
            BackwardPath::Shared => self.shared_backward(client, &mut ctx, output_gradient),
        }
    }

    fn finalize_iteration<C, M>(&mut self, client: &C, ctx: HookContext<'_, R, M>) -> Result<()>
    where
        C: FactorOps<R>,
        M: TrackableModule<R>,
    {
        if ctx.factor_args.has_shared_parameters {
            if !self.cached_activations.is_empty() {
                warn!(
                    module = ctx.name,
                    remaining = self.cached_activations.len(),
                    "shared activations left without a backward firing"
                );
            }
            if let Some(summed) = self.cached_per_sample_gradient.take() {
                let summed = cast_to(client, &summed, ctx.factor_args.lambda_dtype)?;
                update_lambda_matrix(client, ctx.name, ctx.storage, ctx.factor_args, &summed)?;
            }
        }
        let dropped = self.hooks.drop_pending();
        if dropped > 0 {
            debug!(module = ctx.name, dropped, "backward hooks never fired this pass");
        }
        self.clear_all_cache();
        self.state = TrackerState::Idle;
        Ok(())
    }

    fn exist(&self, storage: &FactorStorage<R>) -> bool {
        storage.lambda.exist()
    }

    fn synchronize(
        &self,
        storage: &mut FactorStorage<R>,
        dist: &dyn DistributedContext<R>,
        num_processes: usize,
    ) -> Result<()> {
        let lambda = &mut storage.lambda;
        if lambda.is_partial() {
            warn!("lambda factors partially present; skipping synchronization");
        }
        if !should_synchronize(dist, lambda.exist()) {
            return Ok(());
        }
        debug!(rank = dist.rank(), num_processes, "synchronizing lambda factors");

        reduce_factor(dist, &mut lambda.lambda_matrix)?;
        if let Some(device) = lambda.lambda_matrix.as_ref().map(|t| t.device().clone()) {
            reduce_count(dist, &mut lambda.num_lambda_processed, &device)?;
        }
        Ok(())
    }

    fn release_memory(&mut self, storage: &mut FactorStorage<R>) {
        self.clear_all_cache();
        storage.lambda.release();
        debug!("released lambda factors");
    }

    fn clear_all_cache(&mut self) {
        self.cached_activations.clear();
        self.cached_per_sample_gradient = None;
    }
}
