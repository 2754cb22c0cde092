//! Module wrapper that owns factor storage and routes hook firings to the
//! tracker of the current fit phase.

use crate::distributed::DistributedContext;
use crate::error::{Error, Result};
use crate::factor::{FactorArguments, FactorStorage};
use crate::module::traits::TrackableModule;
use crate::ops::FactorOps;
use crate::tracker::{CovarianceTracker, HookContext, LambdaTracker, Tracker, TrackerState};
use numr::autograd::{GradStore, Var};
use numr::dtype::DType;
use numr::ops::TensorOps;
use numr::runtime::Runtime;
use numr::tensor::{Tensor, TensorId};
use tracing::debug;

/// Which factors the wrapped module is currently collecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModuleMode {
    /// Plain forward passes, no hooks.
    #[default]
    Default,
    CovarianceFit,
    LambdaFit,
}

/// The tracker attached for the active mode.
pub enum ActiveTracker<R: Runtime> {
    None,
    Covariance(CovarianceTracker<R>),
    Lambda(LambdaTracker<R>),
}

macro_rules! dispatch {
    ($tracker:expr, $t:ident => $body:expr, none => $none:expr) => {
        match $tracker {
            ActiveTracker::Covariance($t) => $body,
            ActiveTracker::Lambda($t) => $body,
            ActiveTracker::None => $none,
        }
    };
}

/// A layer plus everything needed to fit its influence factors.
pub struct TrackedModule<R: Runtime, M> {
    name: String,
    layer: M,
    storage: FactorStorage<R>,
    factor_args: FactorArguments,
    gradient_scale: f64,
    mode: ModuleMode,
    tracker: ActiveTracker<R>,
}

impl<R, M> TrackedModule<R, M>
where
    R: Runtime<DType = DType>,
    M: TrackableModule<R>,
{
    pub fn new(name: impl Into<String>, layer: M, factor_args: FactorArguments) -> Result<Self> {
        factor_args.validate()?;
        Ok(Self {
            name: name.into(),
            layer,
            storage: FactorStorage::new(),
            factor_args,
            gradient_scale: 1.0,
            mode: ModuleMode::Default,
            tracker: ActiveTracker::None,
        })
    }

    /// Scale applied to every incoming output gradient (e.g. `1 / loss_scale`).
    pub fn with_gradient_scale(mut self, gradient_scale: f64) -> Self {
        self.gradient_scale = gradient_scale;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layer(&self) -> &M {
        &self.layer
    }

    pub fn factor_args(&self) -> &FactorArguments {
        &self.factor_args
    }

    pub fn mode(&self) -> ModuleMode {
        self.mode
    }

    pub fn storage(&self) -> &FactorStorage<R> {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut FactorStorage<R> {
        &mut self.storage
    }

    pub fn tracker_state(&self) -> TrackerState {
        dispatch!(&self.tracker, t => t.state(), none => TrackerState::Idle)
    }

    /// Switch phase: release the previous tracker's hooks and register the new one.
    ///
    /// Factors already in storage are kept; call [`release_memory`](Self::release_memory)
    /// to drop them. Fails when the configured strategy has no use for the
    /// factors the requested phase collects.
    pub fn set_mode(&mut self, mode: ModuleMode) -> Result<()> {
        let config = self.factor_args.strategy_config();
        let needed = match mode {
            ModuleMode::Default => true,
            ModuleMode::CovarianceFit => config.requires_covariance_matrices,
            ModuleMode::LambdaFit => config.requires_lambda_matrices,
        };
        if !needed {
            return Err(Error::InvalidArgument {
                arg: "mode",
                reason: format!(
                    "strategy {} does not use the factors collected in {mode:?}",
                    self.factor_args.strategy
                ),
            });
        }
        dispatch!(&mut self.tracker, t => t.release_hooks(), none => ());
        self.tracker = match mode {
            ModuleMode::Default => ActiveTracker::None,
            ModuleMode::CovarianceFit => {
                let mut tracker = CovarianceTracker::new();
                tracker.register_hooks();
                ActiveTracker::Covariance(tracker)
            }
            ModuleMode::LambdaFit => {
                let mut tracker = LambdaTracker::new();
                tracker.register_hooks();
                ActiveTracker::Lambda(tracker)
            }
        };
        debug!(module = %self.name, ?mode, "module mode set");
        self.mode = mode;
        Ok(())
    }

    /// Run the layer, then fire the forward hook with its input and output.
    pub fn forward<C>(&mut self, client: &C, input: &Var<R>) -> Result<Var<R>>
    where
        C: FactorOps<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        let output = self.layer.forward(client, input)?;
        let Self {
            name,
            layer,
            storage,
            factor_args,
            gradient_scale,
            tracker,
            ..
        } = self;
        let ctx = HookContext {
            name: name.as_str(),
            module: &*layer,
            storage,
            factor_args: &*factor_args,
            gradient_scale: *gradient_scale,
        };
        dispatch!(tracker, t => t.forward_hook(client, ctx, input.tensor(), output.id())?, none => ());
        Ok(output)
    }

    /// Fire the most recently registered backward hook with the gradient of
    /// its output.
    pub fn backward<C>(&mut self, client: &C, output_gradient: &Tensor<R>) -> Result<()>
    where
        C: FactorOps<R>,
    {
        let Self {
            name,
            layer,
            storage,
            factor_args,
            gradient_scale,
            tracker,
            ..
        } = self;
        let ctx = HookContext {
            name: name.as_str(),
            module: &*layer,
            storage,
            factor_args: &*factor_args,
            gradient_scale: *gradient_scale,
        };
        dispatch!(tracker, t => t.backward_hook(client, ctx, output_gradient), none => Ok(()))
    }

    /// Output id the next backward firing expects a gradient for.
    pub fn next_pending_output(&self) -> Option<TensorId> {
        dispatch!(&self.tracker, t => t.next_pending_output(), none => None)
    }

    /// Drain pending backward hooks, newest first, using the output
    /// gradients recorded by autograd. Returns the number fired.
    pub fn backward_from_grads<C>(&mut self, client: &C, grads: &GradStore<R>) -> Result<usize>
    where
        C: FactorOps<R>,
    {
        let mut fired = 0;
        while let Some(output) = self.next_pending_output() {
            let gradient = grads.get(output).ok_or_else(|| Error::TrackerError {
                reason: format!(
                    "no gradient recorded for a pending output of module '{}'",
                    self.name
                ),
            })?;
            let gradient = gradient.clone();
            self.backward(client, &gradient)?;
            fired += 1;
        }
        Ok(fired)
    }

    /// Close the pass once every backward firing has run.
    pub fn finalize_iteration<C>(&mut self, client: &C) -> Result<()>
    where
        C: FactorOps<R>,
    {
        let Self {
            name,
            layer,
            storage,
            factor_args,
            gradient_scale,
            tracker,
            ..
        } = self;
        let ctx = HookContext {
            name: name.as_str(),
            module: &*layer,
            storage,
            factor_args: &*factor_args,
            gradient_scale: *gradient_scale,
        };
        dispatch!(tracker, t => t.finalize_iteration(client, ctx), none => Ok(()))
    }

    /// Whether the active tracker's factor group is complete.
    pub fn exist(&self) -> bool {
        dispatch!(&self.tracker, t => t.exist(&self.storage), none => false)
    }

    pub fn synchronize(&mut self, dist: &dyn DistributedContext<R>, num_processes: usize) -> Result<()> {
        dispatch!(&self.tracker, t => t.synchronize(&mut self.storage, dist, num_processes), none => Ok(()))
    }

    pub fn release_memory(&mut self) {
        dispatch!(&mut self.tracker, t => t.release_memory(&mut self.storage), none => ())
    }

    /// Detach the tracker without touching storage.
    pub fn release_hooks(&mut self) {
        dispatch!(&mut self.tracker, t => t.release_hooks(), none => ())
    }
}
