//! Activation caching between a forward firing and its backward firing.

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::{Device, Runtime};
use numr::tensor::Tensor;

/// Host-memory copy of an activation, kept when offloading is enabled.
struct HostSnapshot {
    bytes: Vec<u8>,
    shape: Vec<usize>,
    dtype: DType,
}

/// One cached input activation.
pub struct CachedActivation<R: Runtime> {
    inner: Stored<R>,
}

enum Stored<R: Runtime> {
    Device(Tensor<R>),
    Host(HostSnapshot),
}

impl<R: Runtime<DType = DType>> CachedActivation<R> {
    /// Keep the activation on its current device.
    pub fn on_device(tensor: Tensor<R>) -> Self {
        Self {
            inner: Stored::Device(tensor),
        }
    }

    /// Copy the activation to host memory, releasing the device buffer.
    pub fn offloaded(tensor: &Tensor<R>) -> Result<Self> {
        Ok(Self {
            inner: Stored::Host(HostSnapshot::of(tensor)?),
        })
    }

    pub fn is_offloaded(&self) -> bool {
        matches!(self.inner, Stored::Host(_))
    }

    pub fn shape(&self) -> &[usize] {
        match &self.inner {
            Stored::Device(t) => t.shape(),
            Stored::Host(snap) => &snap.shape,
        }
    }

    /// Materialise on `device` (the device the output gradient lives on).
    pub fn restore(self, device: &R::Device) -> Result<Tensor<R>> {
        match self.inner {
            Stored::Device(t) => into_device(t, device),
            Stored::Host(snap) => snap.upload(device),
        }
    }
}

impl HostSnapshot {
    fn of<R: Runtime<DType = DType>>(tensor: &Tensor<R>) -> Result<Self> {
        let contiguous = tensor.contiguous();
        let bytes = contiguous.to_bytes().map_err(|e| Error::TrackerError {
            reason: format!("failed to copy tensor to host: {e}"),
        })?;
        Ok(Self {
            bytes,
            shape: contiguous.shape().to_vec(),
            dtype: contiguous.dtype(),
        })
    }

    fn upload<R: Runtime<DType = DType>>(&self, device: &R::Device) -> Result<Tensor<R>> {
        Tensor::<R>::try_from_bytes(&self.bytes, &self.shape, self.dtype, device).map_err(|e| {
            Error::TrackerError {
                reason: format!("failed to copy tensor to device {}: {e}", device.id()),
            }
        })
    }
}

/// Copy `tensor` onto `device` through host memory.
pub(crate) fn copy_to_device<R: Runtime<DType = DType>>(
    tensor: &Tensor<R>,
    device: &R::Device,
) -> Result<Tensor<R>> {
    HostSnapshot::of(tensor)?.upload(device)
}

/// `tensor` on `device`; copied only when it lives elsewhere.
pub(crate) fn into_device<R: Runtime<DType = DType>>(
    tensor: Tensor<R>,
    device: &R::Device,
) -> Result<Tensor<R>> {
    if tensor.device().id() == device.id() {
        Ok(tensor)
    } else {
        copy_to_device(&tensor, device)
    }
}

/// Activations awaiting their backward firing.
///
/// `Stack` is a LIFO stack: a module invoked several times in one pass pushes
/// one activation per forward firing, and backpropagation reaches those
/// invocations in reverse, so each backward firing pops the newest entry.
pub enum ActivationCache<R: Runtime> {
    Empty,
    Single(CachedActivation<R>),
    Stack(Vec<CachedActivation<R>>),
}

impl<R: Runtime> Default for ActivationCache<R> {
    fn default() -> Self {
        ActivationCache::Empty
    }
}

impl<R: Runtime<DType = DType>> ActivationCache<R> {
    /// Overwrite the single slot (modules without shared parameters).
    pub fn set_single(&mut self, activation: CachedActivation<R>) {
        *self = ActivationCache::Single(activation);
    }

    pub fn take_single(&mut self) -> Option<CachedActivation<R>> {
        match std::mem::take(self) {
            ActivationCache::Single(activation) => Some(activation),
            other => {
                *self = other;
                None
            }
        }
    }

    pub fn push(&mut self, activation: CachedActivation<R>) {
        match self {
            ActivationCache::Stack(stack) => stack.push(activation),
            _ => *self = ActivationCache::Stack(vec![activation]),
        }
    }

    pub fn pop(&mut self) -> Option<CachedActivation<R>> {
        match self {
            ActivationCache::Stack(stack) => stack.pop(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ActivationCache::Empty => 0,
            ActivationCache::Single(_) => 1,
            ActivationCache::Stack(stack) => stack.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        *self = ActivationCache::Empty;
    }
}
