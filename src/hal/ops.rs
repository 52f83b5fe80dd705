use std::marker::PhantomData;

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tessel_derive::TensorOp;

use crate::loom::{num::Scalar, ops::InnerOp};

/// Whether an operand enters a product as is or transposed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TransOp {
    #[default]
    NoTrans,
    Trans,
}

impl TransOp {
    #[inline]
    pub fn is_trans(self) -> bool {
        matches!(self, TransOp::Trans)
    }

    /// The other one.
    #[inline]
    pub fn flip(self) -> Self {
        match self {
            TransOp::NoTrans => TransOp::Trans,
            TransOp::Trans => TransOp::NoTrans,
        }
    }
}

/// Geometry and coefficients of one tile product `C = alpha op(A) op(B) + beta C`.
///
/// All tiles are column-major matrices: `op(A)` is `m × k`, `op(B)` is `k × n`, `C` is `m × n`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GemmParams {
    pub trans_a: TransOp,
    pub trans_b: TransOp,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: f64,
    /// The old contents of `C` are ignored when zero.
    pub beta: f64,
}

/// io: `[A, B, C]`.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Scalar")]
pub struct GemmOp<T> {
    #[tensor_op]
    pub op: InnerOp,
    pub params: GemmParams,
    pub phantom: PhantomData<T>,
}

/// A tile product with operands rounded to half precision and accumulated in full precision.
///
/// io: `[A, B, C]`.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Scalar")]
pub struct GemmExOp<T> {
    #[tensor_op]
    pub op: InnerOp,
    pub params: GemmParams,
    pub phantom: PhantomData<T>,
}

/// io: `[src, dst]`.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Scalar")]
pub struct CopyOp<T> {
    #[tensor_op]
    pub op: InnerOp,
    pub phantom: PhantomData<T>,
}

/// Elementwise `dst *= src`. io: `[src, dst]`.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Scalar")]
pub struct ProdOp<T> {
    #[tensor_op]
    pub op: InnerOp,
    pub phantom: PhantomData<T>,
}

/// Elementwise type conversion. io: `[src, dst]`.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "S: Scalar, T: Scalar")]
pub struct ConvertOp<S, T> {
    #[tensor_op]
    pub op: InnerOp,
    pub phantom: PhantomData<(S, T)>,
}

/// Zeroes a tile of any element type. io: `[dst]`.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", name = "clear")]
pub struct ClearOp(pub InnerOp);

/// Elementwise functions applied in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Unary {
    Relu,
    DRelu,
    /// Exact form, through the error function.
    Gelu,
    DGelu,
    /// Tanh approximation.
    GeluTanh,
    DGeluTanh,
    Silu,
    DSilu,
    Identity,
    /// Derivative of the identity: fills ones.
    DIdentity,
}

/// io: `[dst]`.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Scalar")]
pub struct UnaryOp<T> {
    #[tensor_op]
    pub op: InnerOp,
    pub func: Unary,
    pub phantom: PhantomData<T>,
}

/// Fills a tile with normally distributed values.
///
/// Each element is drawn from a generator seeded by `seed` and the element's offset in the
/// whole tensor, so the result does not depend on the tiling. io: `[dst]`.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Scalar")]
pub struct RandnOp<T> {
    #[tensor_op]
    pub op: InnerOp,
    pub seed: u64,
    pub mean: f64,
    pub stddev: f64,
    /// Offset of every tile element in the column-major tensor.
    pub offsets: Vec<usize>,
    pub phantom: PhantomData<T>,
}
