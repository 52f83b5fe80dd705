use std::f64::consts::{FRAC_1_SQRT_2, PI};

use itertools::Itertools;

use crate::{
    hal::ops::{ClearOp, ConvertOp, CopyOp, ProdOp, RandnOp, Unary, UnaryOp},
    loom::{
        device::{Backend as _, BackendOp, cpu::Backend},
        num::{Float, Scalar},
    },
};

/// Error function, Abramowitz and Stegun 7.1.26. Absolute error below `1.5e-7`.
fn erf(x: f64) -> f64 {
    const P: f64 = 0.3275911;
    const A: [f64; 5] = [
        0.254829592,
        -0.284496736,
        1.421413741,
        -1.453152027,
        1.061405429,
    ];

    let t = 1.0 / (1.0 + P * x.abs());
    let poly = A.iter().rev().fold(0.0, |acc, a| acc * t + a) * t;
    let y = 1.0 - poly * (-x * x).exp();
    y.copysign(x)
}

/// Standard normal density.
#[inline]
fn pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * PI).sqrt()
}

#[inline]
fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn unary(func: Unary, x: f64) -> f64 {
    const GELU_TANH_C: f64 = 0.044715;
    let sqrt_2_over_pi = (2.0 / PI).sqrt();

    match func {
        Unary::Relu => x.max(0.0),
        Unary::DRelu => match x > 0.0 {
            true => 1.0,
            false => 0.0,
        },
        Unary::Gelu => 0.5 * x * (1.0 + erf(x * FRAC_1_SQRT_2)),
        Unary::DGelu => 0.5 * (1.0 + erf(x * FRAC_1_SQRT_2)) + x * pdf(x),
        Unary::GeluTanh => {
            let u = sqrt_2_over_pi * (x + GELU_TANH_C * x * x * x);
            0.5 * x * (1.0 + u.tanh())
        }
        Unary::DGeluTanh => {
            let u = sqrt_2_over_pi * (x + GELU_TANH_C * x * x * x);
            let t = u.tanh();
            let du = sqrt_2_over_pi * (1.0 + 3.0 * GELU_TANH_C * x * x);
            0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * du
        }
        Unary::Silu => x * sigmoid(x),
        Unary::DSilu => {
            let s = sigmoid(x);
            s * (1.0 + x * (1.0 - s))
        }
        Unary::Identity => x,
        Unary::DIdentity => 1.0,
    }
}

/// Draws a standard normal value for one element with Box-Muller.
fn normal(seed: u64, offset: usize) -> f64 {
    let mix = (offset as u64).wrapping_add(1).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    let mut rng = fastrand::Rng::with_seed(seed ^ mix);
    let u = 1.0 - rng.f64();
    let v = rng.f64();
    (-2.0 * u.ln()).sqrt() * (2.0 * PI * v).cos()
}

impl<T: Scalar> BackendOp<Backend> for CopyOp<T> {
    fn execute(&self, backend: &Backend) {
        let src = backend.fetch(self.op.io[0].id);
        let dst = backend.fetch(self.op.io[1].id);
        let src = src.read();
        dst.write().write_slice::<T>().copy_from_slice(src.read_slice());
    }
}

impl<T: Float> BackendOp<Backend> for ProdOp<T> {
    fn execute(&self, backend: &Backend) {
        let src = backend.fetch(self.op.io[0].id);
        let dst = backend.fetch(self.op.io[1].id);
        let src = src.read();
        let mut dst = dst.write();
        for (y, &x) in dst.write_slice::<T>().iter_mut().zip_eq(src.read_slice::<T>()) {
            *y = T::from_f64(y.to_f64() * x.to_f64());
        }
    }
}

impl<S: Float, T: Float> BackendOp<Backend> for ConvertOp<S, T> {
    fn execute(&self, backend: &Backend) {
        let src = backend.fetch(self.op.io[0].id);
        let dst = backend.fetch(self.op.io[1].id);
        let src = src.read();
        let mut dst = dst.write();
        for (y, &x) in dst.write_slice::<T>().iter_mut().zip_eq(src.read_slice::<S>()) {
            *y = T::from_f64(x.to_f64());
        }
    }
}

impl BackendOp<Backend> for ClearOp {
    fn execute(&self, backend: &Backend) {
        let dst = backend.fetch(self.0.io[0].id);
        dst.write().as_bytes_mut().fill(0);
    }
}

impl<T: Float> BackendOp<Backend> for UnaryOp<T> {
    fn execute(&self, backend: &Backend) {
        let dst = backend.fetch(self.op.io[0].id);
        let mut dst = dst.write();
        let f = |x: &mut T| *x = T::from_f64(unary(self.func, x.to_f64()));

        #[cfg(not(feature = "rayon"))]
        dst.write_slice::<T>().iter_mut().for_each(f);
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            dst.write_slice::<T>().par_iter_mut().for_each(f);
        }
    }
}

impl<T: Float> BackendOp<Backend> for RandnOp<T> {
    fn execute(&self, backend: &Backend) {
        let dst = backend.fetch(self.op.io[0].id);
        let mut dst = dst.write();
        for (y, &offset) in dst.write_slice::<T>().iter_mut().zip_eq(&self.offsets) {
            *y = T::from_f64(self.mean + self.stddev * normal(self.seed, offset));
        }
    }
}
