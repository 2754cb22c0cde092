//! Trackable layers and the wrapper that collects their factors.

pub mod linear;
pub mod tracked;
pub mod traits;

pub use linear::Linear;
pub use tracked::{ActiveTracker, ModuleMode, TrackedModule};
pub use traits::TrackableModule;
