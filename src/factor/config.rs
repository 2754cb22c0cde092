//! Factor fitting configuration: strategies and per-module factor arguments.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use numr::dtype::DType;
use serde::{Deserialize, Serialize};

/// Named algorithmic strategy for computing preconditioning factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactorStrategy {
    /// No curvature information; preconditioning is the identity.
    Identity,
    /// Diagonal curvature: Lambda in the raw parameter basis.
    Diagonal,
    /// Kronecker-factored curvature from the two covariance matrices.
    Kfac,
    /// Eigenvalue-corrected KFAC: Lambda in the covariance eigenbasis.
    #[default]
    Ekfac,
}

/// Factors a strategy needs, and how they combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyConfig {
    /// A covariance fit phase contributes to this strategy.
    pub requires_covariance_matrices: bool,
    /// A Lambda fit phase contributes to this strategy.
    pub requires_lambda_matrices: bool,
    /// Lambda is accumulated after rotating per-sample gradients into the
    /// eigenbasis of the covariance matrices. When false the eigenbasis is
    /// approximated as the identity.
    pub requires_eigendecomposition_for_lambda: bool,
}

impl FactorStrategy {
    /// All registered strategies.
    pub const ALL: [FactorStrategy; 4] = [
        FactorStrategy::Identity,
        FactorStrategy::Diagonal,
        FactorStrategy::Kfac,
        FactorStrategy::Ekfac,
    ];

    /// Look up the factor requirements for this strategy.
    pub fn config(self) -> StrategyConfig {
        match self {
            FactorStrategy::Identity => StrategyConfig {
                requires_covariance_matrices: false,
                requires_lambda_matrices: false,
                requires_eigendecomposition_for_lambda: false,
            },
            FactorStrategy::Diagonal => StrategyConfig {
                requires_covariance_matrices: false,
                requires_lambda_matrices: true,
                requires_eigendecomposition_for_lambda: false,
            },
            FactorStrategy::Kfac => StrategyConfig {
                requires_covariance_matrices: true,
                requires_lambda_matrices: false,
                requires_eigendecomposition_for_lambda: false,
            },
            FactorStrategy::Ekfac => StrategyConfig {
                requires_covariance_matrices: true,
                requires_lambda_matrices: true,
                requires_eigendecomposition_for_lambda: true,
            },
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FactorStrategy::Identity => "identity",
            FactorStrategy::Diagonal => "diagonal",
            FactorStrategy::Kfac => "kfac",
            FactorStrategy::Ekfac => "ekfac",
        }
    }
}

impl fmt::Display for FactorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FactorStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FactorStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidArgument {
                arg: "strategy",
                reason: format!(
                    "unknown strategy '{s}', expected one of identity, diagonal, kfac, ekfac"
                ),
            })
    }
}

/// Per-module factor fitting arguments
#[derive(Debug, Clone)]
pub struct FactorArguments {
    pub strategy: FactorStrategy,
    pub activation_covariance_dtype: DType,
    pub gradient_covariance_dtype: DType,
    pub per_sample_gradient_dtype: DType,
    pub lambda_dtype: DType,
    /// The module runs more than once per forward/backward pass (weight tying,
    /// recurrent reuse). Enables the LIFO activation stack and the finalize step.
    pub has_shared_parameters: bool,
    /// Keep cached activations in host memory between forward and backward.
    pub offload_activations_to_cpu: bool,
    /// Rotate per-sample gradients one sample at a time when building Lambda.
    pub use_iterative_lambda_aggregation: bool,
}

impl Default for FactorArguments {
    fn default() -> Self {
        Self {
            strategy: FactorStrategy::default(),
            activation_covariance_dtype: DType::F32,
            gradient_covariance_dtype: DType::F32,
            per_sample_gradient_dtype: DType::F32,
            lambda_dtype: DType::F32,
            has_shared_parameters: false,
            offload_activations_to_cpu: false,
            use_iterative_lambda_aggregation: false,
        }
    }
}

impl FactorArguments {
    pub fn with_strategy(mut self, strategy: FactorStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_activation_covariance_dtype(mut self, dtype: DType) -> Self {
        self.activation_covariance_dtype = dtype;
        self
    }

    pub fn with_gradient_covariance_dtype(mut self, dtype: DType) -> Self {
        self.gradient_covariance_dtype = dtype;
        self
    }

    pub fn with_per_sample_gradient_dtype(mut self, dtype: DType) -> Self {
        self.per_sample_gradient_dtype = dtype;
        self
    }

    pub fn with_lambda_dtype(mut self, dtype: DType) -> Self {
        self.lambda_dtype = dtype;
        self
    }

    pub fn with_shared_parameters(mut self, shared: bool) -> Self {
        self.has_shared_parameters = shared;
        self
    }

    pub fn with_offload_activations_to_cpu(mut self, offload: bool) -> Self {
        self.offload_activations_to_cpu = offload;
        self
    }

    pub fn with_iterative_lambda_aggregation(mut self, iterative: bool) -> Self {
        self.use_iterative_lambda_aggregation = iterative;
        self
    }

    /// Requirements of the configured strategy.
    pub fn strategy_config(&self) -> StrategyConfig {
        self.strategy.config()
    }

    /// Reject factor dtypes that cannot hold accumulated second moments.
    pub fn validate(&self) -> Result<()> {
        let dtypes = [
            ("activation_covariance_dtype", self.activation_covariance_dtype),
            ("gradient_covariance_dtype", self.gradient_covariance_dtype),
            ("per_sample_gradient_dtype", self.per_sample_gradient_dtype),
            ("lambda_dtype", self.lambda_dtype),
        ];
        for (arg, dtype) in dtypes {
            if !is_float_dtype(dtype) {
                return Err(Error::NonFloatDType { arg, dtype });
            }
        }
        Ok(())
    }
}

fn is_float_dtype(dtype: DType) -> bool {
    matches!(
        dtype,
        DType::F64 | DType::F32 | DType::F16 | DType::BF16 | DType::FP8E4M3 | DType::FP8E5M2
    )
}
