use std::marker::PhantomData;

use super::ops::{
    ClearOp, ConvertOp, CopyOp, GemmExOp, GemmOp, GemmParams, ProdOp, RandnOp, TransOp, Unary,
    UnaryOp,
};
use crate::loom::{
    device::{Device, DeviceEvent},
    layout::Shape,
    num::{Float, Scalar},
    ops::{Access, AccessError, InnerOp, TensorOp},
    tensor::{Tensor, TensorError, TensorUntyped},
};

#[inline]
fn submit<D: Device>(device: &D, op: impl TensorOp) {
    device.execute(DeviceEvent::Submit { op: Box::new(op) });
}

/// Converts a linear index into column-major coordinates over `extents`.
fn unravel(mut index: usize, extents: &[usize]) -> Vec<usize> {
    extents
        .iter()
        .map(|&extent| {
            let coord = index % extent;
            index /= extent;
            coord
        })
        .collect()
}

/// Splits the axes of an operand into the kept part and the `ndim` contracted ones.
///
/// With `inner_last` the contracted axes trail, otherwise they lead.
pub(crate) fn split(shape: &[usize], ndim: usize, inner_last: bool) -> (&[usize], &[usize]) {
    match inner_last {
        true => shape.split_at(shape.len() - ndim),
        false => {
            let (inner, outer) = shape.split_at(ndim);
            (outer, inner)
        }
    }
}

/// Inverse of [`split`].
fn join(outer: &[usize], inner: &[usize], inner_last: bool) -> Vec<usize> {
    match inner_last {
        true => [outer, inner].concat(),
        false => [inner, outer].concat(),
    }
}

/// Fails if an op would read `src` while writing the same tiles as `dst`.
fn check_alias<D: Device>(
    dst: &TensorUntyped<D>,
    src: &TensorUntyped<D>,
) -> Result<(), TensorError> {
    match dst.same(src) {
        true => Err(AccessError::Aliased(dst.tag()).into()),
        false => Ok(()),
    }
}

/// Submits `C = alpha op(A) op(B) + beta C` contracting `ndim` axes, one op per tile triple.
#[allow(clippy::too_many_arguments)]
fn gemm_tiles<D, T, F>(
    alpha: f64,
    trans_a: TransOp,
    a: &Tensor<D, T>,
    trans_b: TransOp,
    b: &Tensor<D, T>,
    beta: f64,
    c: &Tensor<D, T>,
    ndim: usize,
    make: F,
) -> Result<(), TensorError>
where
    D: Device,
    T: Scalar,
    F: Fn(InnerOp, GemmParams) -> Box<dyn TensorOp>,
{
    a.check()?;
    b.check()?;
    c.check()?;
    check_alias(c, a)?;
    check_alias(c, b)?;
    if ndim > a.ndim() || ndim > b.ndim() {
        return Err(TensorError::ShapeMismatch(a.shape().clone(), b.shape().clone()));
    }

    // op(A) is [M..., K...] and op(B) is [K..., N...]
    let a_last = !trans_a.is_trans();
    let b_last = trans_b.is_trans();

    let (am, ak) = split(a.shape(), ndim, a_last);
    let (bn, bk) = split(b.shape(), ndim, b_last);
    let (am_tile, ak_tile) = split(a.basetile_shape(), ndim, a_last);
    let (bn_tile, bk_tile) = split(b.basetile_shape(), ndim, b_last);
    if ak != bk || ak_tile != bk_tile {
        return Err(TensorError::ShapeMismatch(a.shape().clone(), b.shape().clone()));
    }
    let shape: Shape = [am, bn].concat().into();
    if &shape != c.shape() {
        return Err(TensorError::ShapeMismatch(c.shape().clone(), shape));
    }
    let tile: Shape = [am_tile, bn_tile].concat().into();
    if &tile != c.basetile_shape() {
        return Err(TensorError::ShapeMismatch(c.basetile_shape().clone(), tile));
    }

    let (_, k_grid) = split(a.traits().grid(), ndim, a_last);
    let k_count: usize = k_grid.iter().product();

    for index in 0..c.traits().grid_volume() {
        let coords = c.traits().tile_index(index);
        let (cm, cn) = coords.split_at(am.len());
        let c_tile = c.traits().tile_shape(&coords);
        let m: usize = c_tile[..am.len()].iter().product();
        let n: usize = c_tile[am.len()..].iter().product();

        for step in 0..k_count {
            let ck = unravel(step, k_grid);
            let a_coords = join(cm, &ck, a_last);
            let b_coords = join(cn, &ck, b_last);
            let k = a.traits().tile_shape(&a_coords).volume() / m;

            let beta = match step {
                0 => beta,
                _ => 1.0,
            };
            let access = match beta == 0.0 {
                true => Access::WriteOnly,
                false => Access::ReadWrite,
            };
            let op = InnerOp::new([
                a.ir_at(&a_coords, Access::ReadOnly),
                b.ir_at(&b_coords, Access::ReadOnly),
                c.ir(index, access),
            ]);
            let params = GemmParams {
                trans_a,
                trans_b,
                m,
                n,
                k,
                alpha,
                beta,
            };
            c.device()
                .execute(DeviceEvent::Submit { op: make(op, params) });
        }
    }
    Ok(())
}

/// Tiled generalized matrix product `C = alpha op(A) op(B) + beta C`.
///
/// The last `ndim` axes of `op(A)` are contracted with the first `ndim` axes of `op(B)`.
/// A transposed `A` has its contracted axes first, a transposed `B` has them last. Partial products
/// over the contracted tiles are accumulated in tile order; with `beta == 0` the old contents of `C`
/// are ignored.
#[allow(clippy::too_many_arguments)]
pub fn gemm_async<D: Device, T: Float>(
    alpha: f64,
    trans_a: TransOp,
    a: &Tensor<D, T>,
    trans_b: TransOp,
    b: &Tensor<D, T>,
    beta: f64,
    c: &Tensor<D, T>,
    ndim: usize,
) -> Result<(), TensorError> {
    let make = |op, params| -> Box<dyn TensorOp> {
        let phantom = PhantomData::<T>;
        Box::new(GemmOp { op, params, phantom })
    };
    gemm_tiles(alpha, trans_a, a, trans_b, b, beta, c, ndim, make)
}

/// Same as [`gemm_async`], with operands rounded to half precision inside the kernel and
/// products accumulated in full precision.
#[allow(clippy::too_many_arguments)]
pub fn gemm_ex_async<D: Device, T: Float>(
    alpha: f64,
    trans_a: TransOp,
    a: &Tensor<D, T>,
    trans_b: TransOp,
    b: &Tensor<D, T>,
    beta: f64,
    c: &Tensor<D, T>,
    ndim: usize,
) -> Result<(), TensorError> {
    let make = |op, params| -> Box<dyn TensorOp> {
        let phantom = PhantomData::<T>;
        Box::new(GemmExOp { op, params, phantom })
    };
    gemm_tiles(alpha, trans_a, a, trans_b, b, beta, c, ndim, make)
}

/// Submits one op per tile reading `src` and writing `dst`, after checking they line up.
fn tile_pairs<D, S, T, Op>(
    src: &Tensor<D, S>,
    dst: &Tensor<D, T>,
    dst_access: Access,
    make: impl Fn(InnerOp) -> Op,
) -> Result<(), TensorError>
where
    D: Device,
    S: Scalar,
    T: Scalar,
    Op: TensorOp,
{
    src.check()?;
    dst.check()?;
    check_alias(dst, src)?;
    dst.check_aligned(src)?;

    for index in 0..dst.traits().grid_volume() {
        let op = InnerOp::new([src.ir(index, Access::ReadOnly), dst.ir(index, dst_access)]);
        submit(dst.device(), make(op));
    }
    Ok(())
}

/// Copies `src` into `dst`.
pub fn copy_async<D: Device, T: Scalar>(
    src: &Tensor<D, T>,
    dst: &Tensor<D, T>,
) -> Result<(), TensorError> {
    let phantom = PhantomData::<T>;
    tile_pairs(src, dst, Access::WriteOnly, |op| CopyOp { op, phantom })
}

/// Elementwise `dst *= src`.
pub fn prod_async<D: Device, T: Float>(
    src: &Tensor<D, T>,
    dst: &Tensor<D, T>,
) -> Result<(), TensorError> {
    let phantom = PhantomData::<T>;
    tile_pairs(src, dst, Access::ReadWrite, |op| ProdOp { op, phantom })
}

/// Converts `src` into the element type of `dst`.
pub fn convert_async<D: Device, S: Float, T: Float>(
    src: &Tensor<D, S>,
    dst: &Tensor<D, T>,
) -> Result<(), TensorError> {
    let phantom = PhantomData::<(S, T)>;
    tile_pairs(src, dst, Access::WriteOnly, |op| ConvertOp { op, phantom })
}

/// Applies `func` to every element of `dst` in place.
pub fn unary_async<D: Device, T: Float>(func: Unary, dst: &Tensor<D, T>) -> Result<(), TensorError> {
    dst.check()?;
    for index in 0..dst.traits().grid_volume() {
        let op = InnerOp::new([dst.ir(index, Access::ReadWrite)]);
        let phantom = PhantomData::<T>;
        submit(dst.device(), UnaryOp { op, func, phantom });
    }
    Ok(())
}

/// Zeroes `dst`.
pub fn clear_async<D: Device, T: Scalar>(dst: &Tensor<D, T>) -> Result<(), TensorError> {
    dst.check()?;
    for index in 0..dst.traits().grid_volume() {
        let op = InnerOp::new([dst.ir(index, Access::WriteOnly)]);
        submit(dst.device(), ClearOp(op));
    }
    Ok(())
}

/// Fills `dst` with normally distributed values. The result depends on `seed` only, not on the tiling.
pub fn randn_async<D: Device, T: Float>(
    dst: &Tensor<D, T>,
    seed: u64,
    mean: f64,
    stddev: f64,
) -> Result<(), TensorError> {
    dst.check()?;
    let traits = dst.traits();
    for index in 0..traits.grid_volume() {
        let coords = traits.tile_index(index);
        let offsets = traits.tile_elements(&coords).collect();
        let op = InnerOp::new([dst.ir(index, Access::WriteOnly)]);
        let phantom = PhantomData::<T>;
        let op = RandnOp {
            op,
            seed,
            mean,
            stddev,
            offsets,
            phantom,
        };
        submit(dst.device(), op);
    }
    Ok(())
}
