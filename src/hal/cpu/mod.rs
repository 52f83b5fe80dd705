use half::f16;

use super::ops::{ClearOp, ConvertOp, CopyOp, GemmExOp, GemmOp, ProdOp, RandnOp, UnaryOp};
use crate::loom::device::CpuBuilder;

mod elementwise;
mod gemm;

impl CpuBuilder {
    /// Registers every kernel of [`hal`](crate::hal) for the supported element types.
    pub fn add_default_ops(self) -> Self {
        self.add_op::<GemmOp<f32>>()
            .add_op::<GemmOp<f64>>()
            .add_op::<GemmOp<f16>>()
            .add_op::<GemmExOp<f32>>()
            .add_op::<CopyOp<f32>>()
            .add_op::<CopyOp<f64>>()
            .add_op::<CopyOp<f16>>()
            .add_op::<ProdOp<f32>>()
            .add_op::<ProdOp<f64>>()
            .add_op::<ProdOp<f16>>()
            .add_op::<ConvertOp<f32, f16>>()
            .add_op::<ConvertOp<f16, f32>>()
            .add_op::<ConvertOp<f32, f64>>()
            .add_op::<ConvertOp<f64, f32>>()
            .add_op::<UnaryOp<f32>>()
            .add_op::<UnaryOp<f64>>()
            .add_op::<UnaryOp<f16>>()
            .add_op::<RandnOp<f32>>()
            .add_op::<RandnOp<f64>>()
            .add_op::<RandnOp<f16>>()
            .add_op::<ClearOp>()
    }
}
