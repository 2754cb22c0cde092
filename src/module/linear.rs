//! Dense linear layer with Kronecker-factor hooks

use crate::error::{Error, Result};
use crate::module::traits::TrackableModule;
use crate::ops::FactorOps;
use numr::autograd::{Var, var_add, var_matmul, var_transpose};
use numr::dtype::DType;
use numr::ops::TensorOps;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Dense linear layer: output = input @ weight^T + bias
///
/// Kronecker factors are taken over the augmented input `[x, 1]` when a bias
/// is present, so per-sample gradients cover weight and bias together as a
/// `[out_features, in_features + 1]` block.
pub struct Linear<R: Runtime> {
    weight: Var<R>,
    bias: Option<Var<R>>,
}

impl<R: Runtime<DType = DType>> Linear<R> {
    /// Create from loaded tensors. `trainable` controls gradient tracking.
    pub fn new(weight: Tensor<R>, bias: Option<Tensor<R>>, trainable: bool) -> Self {
        Self {
            weight: Var::new(weight, trainable),
            bias: bias.map(|b| Var::new(b, trainable)),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Append a ones column so the bias shares the activation factor.
    fn augment_with_bias<C: FactorOps<R>>(&self, client: &C, rows: &Tensor<R>) -> Result<Tensor<R>> {
        if self.bias.is_none() {
            return Ok(rows.clone());
        }
        let mut shape = rows.shape().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = 1;
        }
        let ones = Tensor::<R>::ones(&shape, rows.dtype(), rows.device());
        client.cat(&[rows, &ones], -1).map_err(Error::Numr)
    }

    /// Collapse `[..., features]` to `[N, features]`.
    fn flatten_rows(tensor: &Tensor<R>, features: usize, arg: &'static str) -> Result<(Tensor<R>, usize)> {
        let shape = tensor.shape();
        if features == 0 || shape.is_empty() || shape[shape.len() - 1] != features {
            return Err(Error::InvalidArgument {
                arg,
                reason: format!("expected trailing dim {features}, got shape {shape:?}"),
            });
        }
        let rows = tensor.numel() / features;
        let flat = tensor.contiguous().reshape(&[rows, features])?;
        Ok((flat, rows))
    }

    /// Reshape `[batch, ..., features]` to `[batch, T, features]`.
    fn per_sample_rows(tensor: &Tensor<R>, features: usize, arg: &'static str) -> Result<Tensor<R>> {
        let shape = tensor.shape();
        if features == 0 || shape.len() < 2 || shape[shape.len() - 1] != features {
            return Err(Error::InvalidArgument {
                arg,
                reason: format!("expected [batch, ..., {features}], got shape {shape:?}"),
            });
        }
        let batch = shape[0];
        let steps = shape[1..shape.len() - 1].iter().product::<usize>();
        Ok(tensor.contiguous().reshape(&[batch, steps, features])?)
    }
}

impl<R: Runtime<DType = DType>> TrackableModule<R> for Linear<R> {
    /// Forward: input @ weight^T + bias
    ///
    /// input: `[..., in_features]`, output: `[..., out_features]`
    fn forward<C>(&self, client: &C, input: &Var<R>) -> Result<Var<R>>
    where
        C: FactorOps<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        let w_t = var_transpose(&self.weight).map_err(Error::Numr)?;
        let output = var_matmul(input, &w_t, client).map_err(Error::Numr)?;
        match &self.bias {
            Some(bias) => var_add(&output, bias, client).map_err(Error::Numr),
            None => Ok(output),
        }
    }

    fn get_flattened_activation<C>(&self, client: &C, activation: &Tensor<R>) -> Result<(Tensor<R>, u64)>
    where
        C: FactorOps<R>,
    {
        let (flat, rows) = Self::flatten_rows(activation, self.in_features(), "activation")?;
        let flat = self.augment_with_bias(client, &flat)?;
        Ok((flat, rows as u64))
    }

    fn get_flattened_gradient<C>(&self, _client: &C, gradient: &Tensor<R>) -> Result<(Tensor<R>, u64)>
    where
        C: FactorOps<R>,
    {
        let (flat, rows) = Self::flatten_rows(gradient, self.out_features(), "gradient")?;
        Ok((flat, rows as u64))
    }

    /// `psg[b] = sum_t g[b, t]^T a[b, t]` → `[batch, out_features, in_features (+1)]`
    fn compute_per_sample_gradient<C>(
        &self,
        client: &C,
        activation: &Tensor<R>,
        gradient: &Tensor<R>,
    ) -> Result<Tensor<R>>
    where
        C: FactorOps<R>,
    {
        let act = Self::per_sample_rows(activation, self.in_features(), "activation")?;
        let grad = Self::per_sample_rows(gradient, self.out_features(), "gradient")?;
        if act.shape()[..2] != grad.shape()[..2] {
            return Err(Error::InvalidArgument {
                arg: "gradient",
                reason: format!(
                    "batch/sequence dims differ: activation {:?}, gradient {:?}",
                    act.shape(),
                    grad.shape()
                ),
            });
        }
        if act.shape()[0] == 0 {
            // empty batch: nothing to multiply, keep the [0, r, c] layout
            let cols = self.in_features() + usize::from(self.bias.is_some());
            return Ok(Tensor::<R>::zeros(
                &[0, self.out_features(), cols],
                act.dtype(),
                act.device(),
            ));
        }
        let act = self.augment_with_bias(client, &act)?;
        let grad_t = grad.transpose(-2, -1)?.contiguous();
        client.matmul(&grad_t, &act).map_err(Error::Numr)
    }
}
