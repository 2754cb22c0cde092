//! Per-module factor trackers and the hook plumbing they share.

pub mod base;
pub mod cache;
pub mod covariance;
pub mod hooks;
pub mod lambda;

pub use base::{HookContext, Tracker, TrackerState};
pub use cache::{ActivationCache, CachedActivation};
pub use covariance::CovarianceTracker;
pub use hooks::{BackwardPath, HookHandle, HookSet, PendingBackward};
pub use lambda::LambdaTracker;
