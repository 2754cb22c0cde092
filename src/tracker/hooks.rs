//! Explicit hook registrations.
//!
//! A tracker owns one forward registration per fit pass. Every forward firing
//! registers a pending backward hook for the output it produced; backward
//! firings consume them newest-first, the order in which backpropagation
//! reaches repeated invocations of the same module.

use std::sync::atomic::{AtomicU64, Ordering};

use numr::tensor::TensorId;

static NEXT_HOOK_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a registered hook. Dropping it from the owning [`HookSet`]
/// unregisters the hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookHandle {
    id: u64,
}

impl HookHandle {
    fn new() -> Self {
        Self {
            id: NEXT_HOOK_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Which backward routine a pending hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackwardPath {
    /// One invocation per pass; consume the single cached activation.
    Single,
    /// Shared parameters; pop the activation stack and accumulate.
    Shared,
}

/// Backward hook registered on one forward output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBackward {
    pub handle: HookHandle,
    /// Output whose gradient fires this hook.
    pub output: TensorId,
    pub path: BackwardPath,
}

/// Hooks owned by a tracker for the lifetime of one fit pass.
#[derive(Debug, Default)]
pub struct HookSet {
    forward: Option<HookHandle>,
    pending_backward: Vec<PendingBackward>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the forward hook. Re-registering keeps the existing handle.
    pub fn register_forward(&mut self) -> HookHandle {
        *self
            .forward
            .get_or_insert_with(|| HookHandle::new())
    }

    pub fn is_registered(&self) -> bool {
        self.forward.is_some()
    }

    pub fn register_backward(&mut self, output: TensorId, path: BackwardPath) -> HookHandle {
        let handle = HookHandle::new();
        self.pending_backward.push(PendingBackward {
            handle,
            output,
            path,
        });
        handle
    }

    /// Most recently registered backward hook, without consuming it.
    pub fn peek_backward(&self) -> Option<&PendingBackward> {
        self.pending_backward.last()
    }

    pub fn pop_backward(&mut self) -> Option<PendingBackward> {
        self.pending_backward.pop()
    }

    pub fn num_pending(&self) -> usize {
        self.pending_backward.len()
    }

    /// Discard backward hooks that never fired; returns how many were dropped.
    pub fn drop_pending(&mut self) -> usize {
        let dropped = self.pending_backward.len();
        self.pending_backward.clear();
        dropped
    }

    /// Drop every handle, pending backward hooks included.
    pub fn release(&mut self) {
        self.forward = None;
        self.pending_backward.clear();
    }
}
