//! Typed per-module factor storage.
//!
//! Each factor group is a complete set or absent: a matrix and its processed
//! count are always set and cleared together.

use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Activation and pseudo-gradient covariance matrices with their counts.
///
/// The two counts are tracked independently; they diverge under gradient
/// checkpointing, where the forward pass runs more often than the backward.
pub struct CovarianceFactors<R: Runtime> {
    /// `[d_in, d_in]`
    pub activation: Option<Tensor<R>>,
    /// `[d_out, d_out]`
    pub gradient: Option<Tensor<R>>,
    pub num_activation_processed: Option<u64>,
    pub num_gradient_processed: Option<u64>,
}

impl<R: Runtime> Default for CovarianceFactors<R> {
    fn default() -> Self {
        Self {
            activation: None,
            gradient: None,
            num_activation_processed: None,
            num_gradient_processed: None,
        }
    }
}

impl<R: Runtime> CovarianceFactors<R> {
    pub fn exist(&self) -> bool {
        self.activation.is_some()
            && self.gradient.is_some()
            && self.num_activation_processed.is_some()
            && self.num_gradient_processed.is_some()
    }

    /// True when some, but not all, members of the group are present.
    pub fn is_partial(&self) -> bool {
        let present = [
            self.activation.is_some(),
            self.gradient.is_some(),
            self.num_activation_processed.is_some(),
            self.num_gradient_processed.is_some(),
        ];
        present.iter().any(|&p| p) && !present.iter().all(|&p| p)
    }

    pub fn release(&mut self) {
        self.activation = None;
        self.gradient = None;
        self.num_activation_processed = None;
        self.num_gradient_processed = None;
    }
}

/// Eigenvectors of the covariance matrices.
///
/// Produced by an external eigendecomposition stage; the trackers only read
/// them, moving and casting them to the working device and dtype on first use.
pub struct EigendecompositionFactors<R: Runtime> {
    /// `[d_in, d_in]`, columns are eigenvectors
    pub activation_eigenvectors: Option<Tensor<R>>,
    /// `[d_out, d_out]`, columns are eigenvectors
    pub gradient_eigenvectors: Option<Tensor<R>>,
}

impl<R: Runtime> Default for EigendecompositionFactors<R> {
    fn default() -> Self {
        Self {
            activation_eigenvectors: None,
            gradient_eigenvectors: None,
        }
    }
}

impl<R: Runtime> EigendecompositionFactors<R> {
    /// Both eigenvector sets are present.
    pub fn eigenvectors_exist(&self) -> bool {
        self.activation_eigenvectors.is_some() && self.gradient_eigenvectors.is_some()
    }

    pub fn release(&mut self) {
        self.activation_eigenvectors = None;
        self.gradient_eigenvectors = None;
    }
}

/// Lambda matrix (per-component curvature) and its processed-sample count.
pub struct LambdaFactors<R: Runtime> {
    /// `[r, c]`, shaped like one per-sample gradient
    pub lambda_matrix: Option<Tensor<R>>,
    pub num_lambda_processed: Option<u64>,
}

impl<R: Runtime> Default for LambdaFactors<R> {
    fn default() -> Self {
        Self {
            lambda_matrix: None,
            num_lambda_processed: None,
        }
    }
}

impl<R: Runtime> LambdaFactors<R> {
    pub fn exist(&self) -> bool {
        self.lambda_matrix.is_some() && self.num_lambda_processed.is_some()
    }

    pub fn is_partial(&self) -> bool {
        self.lambda_matrix.is_some() != self.num_lambda_processed.is_some()
    }

    pub fn release(&mut self) {
        self.lambda_matrix = None;
        self.num_lambda_processed = None;
    }
}

/// All factors owned by one tracked module.
pub struct FactorStorage<R: Runtime> {
    pub covariance: CovarianceFactors<R>,
    pub eigendecomposition: EigendecompositionFactors<R>,
    pub lambda: LambdaFactors<R>,
}

impl<R: Runtime> Default for FactorStorage<R> {
    fn default() -> Self {
        Self {
            covariance: CovarianceFactors::default(),
            eigendecomposition: EigendecompositionFactors::default(),
            lambda: LambdaFactors::default(),
        }
    }
}

impl<R: Runtime> FactorStorage<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install externally computed eigenvectors.
    pub fn set_eigenvectors(&mut self, activation: Tensor<R>, gradient: Tensor<R>) {
        self.eigendecomposition.activation_eigenvectors = Some(activation);
        self.eigendecomposition.gradient_eigenvectors = Some(gradient);
    }

    /// Drop every stored factor.
    pub fn clear(&mut self) {
        self.covariance.release();
        self.eigendecomposition.release();
        self.lambda.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use numr::dtype::DType;
    use numr::runtime::cpu::{CpuDevice, CpuRuntime};

    fn square(n: usize, device: &CpuDevice) -> Tensor<CpuRuntime> {
        Tensor::<CpuRuntime>::zeros(&[n, n], DType::F32, device)
    }

    #[test]
    fn test_covariance_exist_requires_every_member() {
        let device = CpuDevice::new();
        let mut cov = CovarianceFactors::<CpuRuntime>::default();
        assert!(!cov.exist());
        assert!(!cov.is_partial());

        cov.activation = Some(square(3, &device));
        cov.gradient = Some(square(2, &device));
        cov.num_activation_processed = Some(4);
        cov.num_gradient_processed = Some(4);
        assert!(cov.exist());

        cov.num_gradient_processed = None;
        assert!(!cov.exist());
        assert!(cov.is_partial());

        cov.num_gradient_processed = Some(4);
        cov.activation = None;
        assert!(!cov.exist());
    }

    #[test]
    fn test_lambda_exist_and_release() {
        let device = CpuDevice::new();
        let mut lambda = LambdaFactors::<CpuRuntime>::default();
        lambda.lambda_matrix = Some(square(2, &device));
        assert!(lambda.is_partial());
        lambda.num_lambda_processed = Some(1);
        assert!(lambda.exist());

        lambda.release();
        lambda.release();
        assert!(lambda.lambda_matrix.is_none());
        assert!(lambda.num_lambda_processed.is_none());
    }

    #[test]
    fn test_clear_drops_all_groups() {
        let device = CpuDevice::new();
        let mut storage = FactorStorage::<CpuRuntime>::new();
        storage.set_eigenvectors(square(3, &device), square(2, &device));
        storage.lambda.lambda_matrix = Some(square(2, &device));
        storage.lambda.num_lambda_processed = Some(2);
        assert!(storage.eigendecomposition.eigenvectors_exist());

        storage.clear();
        assert!(!storage.eigendecomposition.eigenvectors_exist());
        assert!(!storage.lambda.exist());
        assert!(!storage.covariance.exist());
    }
}
