//! Cross-process reduction of accumulated factors.

pub mod context;

pub use context::{CommunicatorContext, DistributedContext, LocalContext};
