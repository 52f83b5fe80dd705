use crate::{
    hal::ops::{GemmExOp, GemmOp, GemmParams, TransOp},
    loom::{
        device::{Backend as _, BackendOp, cpu::Backend},
        num::Float,
    },
};

/// Column-major tile product. `load` gives the value an operand element contributes with.
fn gemm<T: Float>(
    params: &GemmParams,
    a: &[T],
    b: &[T],
    c: &mut [T],
    load: impl Fn(T) -> f64 + Send + Sync,
) {
    let GemmParams {
        trans_a,
        trans_b,
        m,
        n,
        k,
        alpha,
        beta,
    } = *params;
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(c.len(), m * n);

    let a_at = |i: usize, p: usize| match trans_a {
        TransOp::NoTrans => a[i + p * m],
        TransOp::Trans => a[p + i * k],
    };
    let b_at = |p: usize, j: usize| match trans_b {
        TransOp::NoTrans => b[p + j * k],
        TransOp::Trans => b[j + p * n],
    };
    let column = |j: usize, column: &mut [T]| {
        for (i, c) in column.iter_mut().enumerate() {
            let dot: f64 = (0..k).map(|p| load(a_at(i, p)) * load(b_at(p, j))).sum();
            let old = match beta == 0.0 {
                true => 0.0,
                false => beta * c.to_f64(),
            };
            *c = T::from_f64(alpha * dot + old);
        }
    };

    #[cfg(not(feature = "rayon"))]
    c.chunks_mut(m)
        .enumerate()
        .for_each(|(j, col)| column(j, col));
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        c.par_chunks_mut(m)
            .enumerate()
            .for_each(|(j, col)| column(j, col));
    }
}

impl<T: Float> BackendOp<Backend> for GemmOp<T> {
    fn execute(&self, backend: &Backend) {
        let a = backend.fetch(self.op.io[0].id);
        let b = backend.fetch(self.op.io[1].id);
        let c = backend.fetch(self.op.io[2].id);

        let (a, b, mut c) = (a.read(), b.read(), c.write());
        gemm(
            &self.params,
            a.read_slice(),
            b.read_slice(),
            c.write_slice(),
            T::to_f64,
        );
    }
}

impl<T: Float> BackendOp<Backend> for GemmExOp<T> {
    fn execute(&self, backend: &Backend) {
        let a = backend.fetch(self.op.io[0].id);
        let b = backend.fetch(self.op.io[1].id);
        let c = backend.fetch(self.op.io[2].id);

        let (a, b, mut c) = (a.read(), b.read(), c.write());
        gemm(
            &self.params,
            a.read_slice(),
            b.read_slice(),
            c.write_slice(),
            T::round_f16,
        );
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::gemm;
    use crate::hal::ops::{GemmParams, TransOp};

    /// Transposes a column-major `rows × cols` matrix.
    fn transpose(x: &[f64], rows: usize, cols: usize) -> Vec<f64> {
        let mut output = vec![0.0; x.len()];
        for (i, j) in itertools::iproduct!(0..rows, 0..cols) {
            output[j + i * cols] = x[i + j * rows];
        }
        output
    }

    #[test]
    fn test_gemm() {
        fastrand::seed(42);
        let [m, n, k] = [3, 4, 5];

        let a = (0..m * k).map(|_| fastrand::f64() - 0.5).collect_vec();
        let b = (0..k * n).map(|_| fastrand::f64() - 0.5).collect_vec();
        let c = (0..m * n).map(|_| fastrand::f64() - 0.5).collect_vec();

        let mut r#ref = vec![0.0; m * n];
        for (i, j) in itertools::iproduct!(0..m, 0..n) {
            let dot: f64 = (0..k).map(|p| a[i + p * m] * b[p + j * k]).sum();
            r#ref[i + j * m] = 2.0 * dot + 0.5 * c[i + j * m];
        }

        let a_t = transpose(&a, m, k);
        let b_t = transpose(&b, k, n);
        for (trans_a, trans_b) in itertools::iproduct!(
            [TransOp::NoTrans, TransOp::Trans],
            [TransOp::NoTrans, TransOp::Trans]
        ) {
            let params = GemmParams {
                trans_a,
                trans_b,
                m,
                n,
                k,
                alpha: 2.0,
                beta: 0.5,
            };
            let a = if trans_a.is_trans() { &a_t } else { &a };
            let b = if trans_b.is_trans() { &b_t } else { &b };
            let mut output = c.clone();
            gemm::<f64>(&params, a, b, &mut output, |x| x);
            for (x, y) in output.iter().zip_eq(&r#ref) {
                assert!((x - y).abs() < 1e-12, "{trans_a} {trans_b}: {x} != {y}");
            }
        }
    }

    #[test]
    fn test_gemm_overwrite() {
        let params = GemmParams {
            trans_a: TransOp::NoTrans,
            trans_b: TransOp::NoTrans,
            m: 1,
            n: 1,
            k: 2,
            alpha: 1.0,
            beta: 0.0,
        };
        // stale contents, even non-finite ones, do not leak into the result
        let mut c = [f32::NAN];
        gemm::<f32>(&params, &[1.0, 2.0], &[3.0, 4.0], &mut c, |x| x as f64);
        assert_eq!(c, [11.0]);
    }

    #[test]
    fn test_gemm_ex() {
        use crate::loom::num::Float;

        let params = GemmParams {
            trans_a: TransOp::NoTrans,
            trans_b: TransOp::NoTrans,
            m: 1,
            n: 1,
            k: 1,
            alpha: 1.0,
            beta: 0.0,
        };
        // operands are rounded to half precision before the product
        let mut c = [0.0f32];
        gemm::<f32>(&params, &[2049.0], &[1.0], &mut c, f32::round_f16);
        assert_eq!(c, [2048.0]);
    }
}
