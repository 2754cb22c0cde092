pub mod config;
pub mod storage;

pub use config::{FactorArguments, FactorStrategy, StrategyConfig};
pub use storage::{CovarianceFactors, EigendecompositionFactors, FactorStorage, LambdaFactors};
