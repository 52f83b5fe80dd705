use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{model::Layer, precision::PrecisionMode};
use crate::{
    hal::{
        frontend::{convert_async, gemm_async, gemm_ex_async, randn_async, split},
        ops::TransOp,
    },
    loom::{
        device::Device,
        layout::{Shape, TensorTraits},
        moments::TensorMoments,
        num::{Float, Scalar},
        tag::NextTag,
        tensor::{Tensor, TensorError},
    },
};

/// Which side of the input the weight multiplies from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Side {
    /// `Y = op(X) W`.
    #[default]
    Left,
    /// `Y = W op(X)`.
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LinearConfig {
    pub side: Side,
    pub trans_x: TransOp,
    /// Number of input axes contracted against the weight.
    pub ndim: usize,
    /// Axes the weight adds to the output, in place of the contracted ones.
    pub add_shape: Vec<usize>,
    pub add_basetile_shape: Vec<usize>,
    pub fast_fp16: bool,
    pub convert_fp16: bool,
    /// The weight carries a gradient.
    pub trainable: bool,
}

impl LinearConfig {
    pub fn new(
        side: Side,
        ndim: usize,
        add_shape: impl Into<Vec<usize>>,
        add_basetile_shape: impl Into<Vec<usize>>,
    ) -> Self {
        Self {
            side,
            trans_x: TransOp::NoTrans,
            ndim,
            add_shape: add_shape.into(),
            add_basetile_shape: add_basetile_shape.into(),
            fast_fp16: false,
            convert_fp16: false,
            trainable: true,
        }
    }

    pub fn with_trans_x(mut self, trans_x: TransOp) -> Self {
        self.trans_x = trans_x;
        self
    }

    pub fn with_fast_fp16(mut self, fast_fp16: bool) -> Self {
        self.fast_fp16 = fast_fp16;
        self
    }

    pub fn with_convert_fp16(mut self, convert_fp16: bool) -> Self {
        self.convert_fp16 = convert_fp16;
        self
    }

    pub fn with_trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    /// Whether the contracted axes of the input trail its other axes.
    #[inline]
    fn inner_last(&self) -> bool {
        match self.side {
            Side::Left => !self.trans_x.is_trans(),
            Side::Right => self.trans_x.is_trans(),
        }
    }
}

/// Traits of the weight and the output of a linear layer over an input with traits `x`.
///
/// The contracted axes of the input are dropped and the added axes take their place, appended on
/// the left side and prepended on the right side. The weight holds the contracted axes and the
/// added ones in the same order.
pub fn linear_traits(
    x: &TensorTraits,
    config: &LinearConfig,
) -> Result<(TensorTraits, TensorTraits), TensorError> {
    let ndim = config.ndim;
    if ndim == 0 || ndim > x.ndim() {
        return Err(TensorError::ShapeMismatch(x.shape().clone(), Shape::from([ndim])));
    }
    let add = &config.add_shape[..];
    let add_tile = &config.add_basetile_shape[..];
    if add.len() != add_tile.len() {
        return Err(TensorError::ShapeMismatch(add.into(), add_tile.into()));
    }

    let inner_last = config.inner_last();
    let (outer, inner) = split(x.shape(), ndim, inner_last);
    let (outer_tile, inner_tile) = split(x.basetile_shape(), ndim, inner_last);
    let (w, w_tile, y, y_tile) = match config.side {
        Side::Left => (
            [inner, add].concat(),
            [inner_tile, add_tile].concat(),
            [outer, add].concat(),
            [outer_tile, add_tile].concat(),
        ),
        Side::Right => (
            [add, inner].concat(),
            [add_tile, inner_tile].concat(),
            [add, outer].concat(),
            [add_tile, outer_tile].concat(),
        ),
    };
    Ok((TensorTraits::new(w, w_tile)?, TensorTraits::new(y, y_tile)?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    X,
    Dx,
    W,
    Dw,
    Y,
    Dy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Forward,
    Weight,
    Input,
}

/// Arguments of one product `c = op(a) op(b) + beta c` over `ndim` axes.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Contraction {
    trans_a: TransOp,
    a: Operand,
    trans_b: TransOp,
    b: Operand,
    beta: f64,
    c: Operand,
    ndim: usize,
}

impl Contraction {
    /// The product a pass submits, given the input rank and the weight rank.
    fn new(
        side: Side,
        trans_x: TransOp,
        pass: Pass,
        ndim: usize,
        x_ndim: usize,
        w_ndim: usize,
    ) -> Self {
        use Operand::*;

        let (n, t) = (TransOp::NoTrans, TransOp::Trans);
        let ((trans_a, a), (trans_b, b)) = match (pass, side, trans_x) {
            (Pass::Forward, Side::Left, _) => ((trans_x, X), (n, W)),
            (Pass::Forward, Side::Right, _) => ((n, W), (trans_x, X)),
            (Pass::Weight, Side::Left, _) => ((trans_x.flip(), X), (n, Dy)),
            (Pass::Weight, Side::Right, _) => ((n, Dy), (trans_x.flip(), X)),
            (Pass::Input, Side::Left, TransOp::NoTrans) => ((n, Dy), (t, W)),
            (Pass::Input, Side::Left, TransOp::Trans) => ((n, W), (t, Dy)),
            (Pass::Input, Side::Right, TransOp::NoTrans) => ((t, W), (n, Dy)),
            (Pass::Input, Side::Right, TransOp::Trans) => ((t, Dy), (n, W)),
        };
        let (beta, c, ndim) = match pass {
            Pass::Forward => (0.0, Y, ndim),
            Pass::Weight => (1.0, Dw, x_ndim - ndim),
            Pass::Input => (1.0, Dx, w_ndim - ndim),
        };
        Self {
            trans_a,
            a,
            trans_b,
            b,
            beta,
            c,
            ndim,
        }
    }
}

/// The tensors a product picks its operands from.
struct Operands<'a, D: Device, U: Scalar> {
    x: &'a TensorMoments<D, U>,
    w: &'a TensorMoments<D, U>,
    y: &'a TensorMoments<D, U>,
}

impl<D: Device, U: Float> Operands<'_, D, U> {
    fn get(&self, operand: Operand) -> Result<&Tensor<D, U>, TensorError> {
        let (moments, grad) = match operand {
            Operand::X => (self.x, false),
            Operand::Dx => (self.x, true),
            Operand::W => (self.w, false),
            Operand::Dw => (self.w, true),
            Operand::Y => (self.y, false),
            Operand::Dy => (self.y, true),
        };
        match grad {
            true => moments.grad.as_ref().ok_or(TensorError::InvalidGradConfig),
            false => Ok(&moments.value),
        }
    }

    fn submit(&self, contraction: Contraction, fast: bool) -> Result<(), TensorError> {
        let Contraction {
            trans_a,
            a,
            trans_b,
            b,
            beta,
            c,
            ndim,
        } = contraction;
        let (a, b, c) = (self.get(a)?, self.get(b)?, self.get(c)?);
        match fast {
            true => gemm_ex_async(1.0, trans_a, a, trans_b, b, beta, c, ndim),
            false => gemm_async(1.0, trans_a, a, trans_b, b, beta, c, ndim),
        }
    }
}

/// Half-precision copies of the layer's tensors, used when products run converted.
#[derive(Debug)]
struct Shadow<D: Device> {
    x: TensorMoments<D, f16>,
    w: TensorMoments<D, f16>,
    y: TensorMoments<D, f16>,
}

impl<D: Device> Shadow<D> {
    fn operands(&self) -> Operands<'_, D, f16> {
        let Self { x, w, y } = self;
        Operands { x, w, y }
    }

    fn unregister(&self) -> Result<(), TensorError> {
        self.x.unregister()?;
        self.w.unregister()?;
        self.y.unregister()
    }
}

/// A linear layer without bias: `Y = op(X) W` or `Y = W op(X)`.
#[derive(Debug)]
pub struct Linear<D: Device, T: Float> {
    side: Side,
    trans_x: TransOp,
    ndim: usize,
    mode: PrecisionMode,
    /// Number of input elements contracted into one output element.
    fan_in: usize,
    x: TensorMoments<D, T>,
    w: TensorMoments<D, T>,
    y: TensorMoments<D, T>,
    shadow: Option<Shadow<D>>,
}

impl<D: Device, T: Float> Linear<D, T> {
    /// Creates the weight, the output and, for converted products, the half-precision shadows.
    ///
    /// Tags are consumed in the order: weight value, weight gradient, output value, output
    /// gradient, then the shadows of the input, the weight and the output, value before gradient.
    /// Every tensor is placed on the root node.
    pub fn generate(
        x: TensorMoments<D, T>,
        config: &LinearConfig,
        next_tag: NextTag,
    ) -> Result<(Self, NextTag), TensorError> {
        x.value.check()?;
        let (w_traits, y_traits) = linear_traits(x.value.traits(), config)?;
        let mode = PrecisionMode::resolve(T::DATA_TYPE, config.fast_fp16, config.convert_fp16);
        let (_, inner) = split(x.value.shape(), config.ndim, config.inner_last());
        let fan_in = inner.iter().product();

        let device = x.value.device();
        let distribution = w_traits.root_distribution();
        let (w_value, next_tag) = Tensor::new(device, w_traits, distribution, next_tag)?;
        let (w, next_tag) = match config.trainable {
            true => {
                let (w_grad, next_tag) = w_value.like(next_tag)?;
                (TensorMoments::tracked(w_value, w_grad)?, next_tag)
            }
            false => (TensorMoments::constant(w_value), next_tag),
        };

        let distribution = y_traits.root_distribution();
        let (y_value, next_tag) = Tensor::new(device, y_traits, distribution, next_tag)?;
        let (y_grad, next_tag) = y_value.like(next_tag)?;
        let y = TensorMoments::tracked(y_value, y_grad)?;

        let (shadow, next_tag) = match mode.needs_shadow() {
            true => {
                let (x16, next_tag) = TensorMoments::tracked_like(&x.value, next_tag)?;
                let (w16, next_tag) = TensorMoments::tracked_like(&w.value, next_tag)?;
                let (y16, next_tag) = TensorMoments::tracked_like(&y.value, next_tag)?;
                let shadow = Shadow {
                    x: x16,
                    w: w16,
                    y: y16,
                };
                (Some(shadow), next_tag)
            }
            false => (None, next_tag),
        };

        log::debug!(
            "linear {} {}: {} -> {}, weight {}, {mode}",
            config.side,
            config.trans_x,
            x.value.traits(),
            y.value.traits(),
            w.value.traits(),
        );
        let layer = Self {
            side: config.side,
            trans_x: config.trans_x,
            ndim: config.ndim,
            mode,
            fan_in,
            x,
            w,
            y,
            shadow,
        };
        Ok((layer, next_tag))
    }

    #[inline]
    pub fn weight(&self) -> &TensorMoments<D, T> {
        &self.w
    }

    #[inline]
    pub fn mode(&self) -> PrecisionMode {
        self.mode
    }

    fn contraction(&self, pass: Pass) -> Contraction {
        let (x_ndim, w_ndim) = (self.x.value.ndim(), self.w.value.ndim());
        Contraction::new(self.side, self.trans_x, pass, self.ndim, x_ndim, w_ndim)
    }

    fn operands(&self) -> Operands<'_, D, T> {
        let (x, w, y) = (&self.x, &self.w, &self.y);
        Operands { x, w, y }
    }

    /// Fails if any tensor the layer touches is released.
    fn check(&self) -> Result<(), TensorError> {
        self.x.check()?;
        self.w.check()?;
        self.y.check()?;
        if let Some(shadow) = &self.shadow {
            shadow.x.check()?;
            shadow.w.check()?;
            shadow.y.check()?;
        }
        Ok(())
    }
}

impl<D: Device, T: Float> Layer<D, T> for Linear<D, T> {
    #[inline]
    fn input(&self) -> &TensorMoments<D, T> {
        &self.x
    }

    #[inline]
    fn output(&self) -> &TensorMoments<D, T> {
        &self.y
    }

    fn parameters(&self) -> Vec<&TensorMoments<D, T>> {
        vec![&self.w]
    }

    #[cfg_attr(feature = "trace", tracing::instrument(name = "linear_forward", skip_all))]
    fn forward_async(&self) -> Result<(), TensorError> {
        self.check()?;
        let contraction = self.contraction(Pass::Forward);
        match &self.shadow {
            Some(shadow) => {
                convert_async(&self.x.value, &shadow.x.value)?;
                convert_async(&self.w.value, &shadow.w.value)?;
                shadow.operands().submit(contraction, false)?;
                convert_async(&shadow.y.value, &self.y.value)
            }
            None => {
                let fast = self.mode == PrecisionMode::FastFp16;
                self.operands().submit(contraction, fast)
            }
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(name = "linear_backward", skip_all))]
    fn backward_async(&self) -> Result<(), TensorError> {
        self.check()?;
        let passes = [
            (Pass::Weight, &self.w, self.shadow.as_ref().map(|x| &x.w)),
            (Pass::Input, &self.x, self.shadow.as_ref().map(|x| &x.x)),
        ];
        let passes = passes
            .into_iter()
            .filter_map(|(pass, full, half)| full.tracked_grad().map(|grad| (pass, grad, half)))
            .collect::<Vec<_>>();
        if passes.is_empty() {
            return Ok(());
        }

        match &self.shadow {
            Some(shadow) => {
                let operands = shadow.operands();
                convert_async(self.operands().get(Operand::Dy)?, operands.get(Operand::Dy)?)?;
                for (pass, grad, half) in passes {
                    let half = half
                        .and_then(|x| x.grad.as_ref())
                        .ok_or(TensorError::InvalidGradConfig)?;
                    convert_async(grad, half)?;
                    operands.submit(self.contraction(pass), false)?;
                    convert_async(half, grad)?;
                }
                Ok(())
            }
            None => {
                let fast = self.mode == PrecisionMode::FastFp16;
                for (pass, _, _) in passes {
                    self.operands().submit(self.contraction(pass), fast)?;
                }
                Ok(())
            }
        }
    }

    /// Fills the weight with normal values of standard deviation `1 / sqrt(fan_in)`.
    fn init_randn_async(&self, seed: u64) -> Result<(), TensorError> {
        let stddev = 1.0 / (self.fan_in as f64).sqrt();
        randn_async(&self.w.value, seed, 0.0, stddev)
    }

    /// Releases the weight, the output and the shadows. The input belongs to the caller.
    fn unregister(&self) -> Result<(), TensorError> {
        self.w.unregister()?;
        self.y.unregister()?;
        match &self.shadow {
            Some(shadow) => shadow.unregister(),
            None => Ok(()),
        }
    }
}
