//! Capability set a module must expose to be tracked.

use crate::error::Result;
use crate::ops::FactorOps;
use numr::autograd::Var;
use numr::dtype::DType;
use numr::ops::TensorOps;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// A layer whose activations and output gradients can be turned into
/// Kronecker factors and per-sample gradients.
///
/// Forward passes go through `Var<R>` so the host's autograd keeps working;
/// the factor helpers operate on detached tensors.
pub trait TrackableModule<R: Runtime<DType = DType>> {
    /// Run the wrapped computation.
    fn forward<C>(&self, client: &C, input: &Var<R>) -> Result<Var<R>>
    where
        C: FactorOps<R> + TensorOps<R>,
        R::Client: TensorOps<R>;

    /// Flatten an input activation to `[N, d_in]` and return `N`, the number
    /// of rows contributing to the activation covariance.
    fn get_flattened_activation<C>(&self, client: &C, activation: &Tensor<R>) -> Result<(Tensor<R>, u64)>
    where
        C: FactorOps<R>;

    /// Flatten an output gradient to `[N, d_out]` and return `N`.
    fn get_flattened_gradient<C>(&self, client: &C, gradient: &Tensor<R>) -> Result<(Tensor<R>, u64)>
    where
        C: FactorOps<R>;

    /// Per-sample weight gradients `[batch, r, c]` from the cached input
    /// activation and the output gradient of the same invocation.
    fn compute_per_sample_gradient<C>(
        &self,
        client: &C,
        activation: &Tensor<R>,
        gradient: &Tensor<R>,
    ) -> Result<Tensor<R>>
    where
        C: FactorOps<R>;
}
