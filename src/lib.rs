//! # kronfac
//!
//! **Kronecker-factored curvature tracking for influence functions, built on numr.**
//!
//! kronfac attaches trackers to layers during a fit pass and accumulates the
//! factors an EKFAC-style influence computation needs:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ CovarianceTracker   A = Σ xᵀx      G = Σ gᵀg             │
//! │ LambdaTracker       Λ = Σ (Q_gᵀ · psg · Q_a)²            │
//! └───────────────────────────┬──────────────────────────────┘
//! │                          numr                             │
//! │            (tensors, ops, runtime, autograd, comm)        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Typed storage**: every factor is an explicit `Option` field in [`FactorStorage`]
//! - **Explicit hooks**: forward firings register pending backward hooks on a LIFO stack
//! - **Injected distribution**: synchronization goes through a [`DistributedContext`]
//! - Eigendecomposition and the phase loop stay with the caller

pub mod distributed;
pub mod error;
pub mod factor;
pub mod module;
pub mod ops;
pub mod tracker;

pub use distributed::{CommunicatorContext, DistributedContext, LocalContext};
pub use error::{Error, Result};
pub use factor::{FactorArguments, FactorStorage, FactorStrategy, StrategyConfig};
pub use module::{Linear, ModuleMode, TrackableModule, TrackedModule};
pub use ops::FactorOps;
pub use tracker::{CovarianceTracker, LambdaTracker, Tracker, TrackerState};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::error::{Error as NumrError, Result as NumrResult};
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;

#[cfg(test)]
pub(crate) mod test_utils {
    use numr::runtime::cpu::{CpuClient, CpuDevice};

    /// Create a CPU client and device for use in unit tests.
    pub(crate) fn cpu_setup() -> (CpuClient, CpuDevice) {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        (client, device)
    }
}
