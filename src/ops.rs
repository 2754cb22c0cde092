//! numr client capabilities required by factor tracking.

use numr::ops::{
    BinaryOps, MatmulOps, ReduceOps, ScalarOps, ShapeOps, TypeConversionOps, UnaryOps,
};
use numr::runtime::{Runtime, RuntimeClient};

/// Every numr op family the trackers compose: matmul for the rank-k and
/// eigenbasis products, binary/reduce/unary for accumulation, scalar for
/// gradient rescaling, shape for bias augmentation, and casts between the
/// configured factor dtypes.
///
/// Blanket-implemented for any client that provides them all.
pub trait FactorOps<R: Runtime>:
    RuntimeClient<R>
    + MatmulOps<R>
    + BinaryOps<R>
    + ReduceOps<R>
    + UnaryOps<R>
    + ScalarOps<R>
    + ShapeOps<R>
    + TypeConversionOps<R>
{
}

impl<R, C> FactorOps<R> for C
where
    R: Runtime,
    C: RuntimeClient<R>
        + MatmulOps<R>
        + BinaryOps<R>
        + ReduceOps<R>
        + UnaryOps<R>
        + ScalarOps<R>
        + ShapeOps<R>
        + TypeConversionOps<R>,
{
}
