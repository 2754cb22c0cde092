//! kronfac error types

use numr::dtype::DType;

/// kronfac result type
pub type Result<T> = std::result::Result<T, Error>;

/// kronfac errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations (shape mismatches on accumulation land here)
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Factors required by a strategy are absent from storage
    #[error("factors not found for strategy '{strategy}': {reason}")]
    FactorsNotFound {
        /// Strategy that required the factors
        strategy: String,
        /// Description of what is missing
        reason: String,
    },

    /// A backward firing found no cached activation to pair with
    #[error(
        "cached activations not found for module '{module}': every forward firing must be \
         followed by exactly one backward firing in the same pass"
    )]
    CacheNotFound {
        /// Name of the tracked module
        module: String,
    },

    /// Non-floating dtype requested for a factor
    #[error("dtype '{dtype:?}' is not a floating-point type (argument '{arg}')")]
    NonFloatDType {
        /// Argument name
        arg: &'static str,
        /// Offending dtype
        dtype: DType,
    },

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Tracker lifecycle misuse
    #[error("tracker error: {reason}")]
    TrackerError {
        /// Description of what went wrong
        reason: String,
    },

    /// Distributed communication error
    #[error("distributed error: {reason}")]
    DistributedError {
        /// Description of what went wrong
        reason: String,
    },
}
