#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{
    activation::{Activation, ActivationLayer},
    linear::{Linear, LinearConfig, Side, linear_traits},
};
use crate::{
    hal::frontend::{clear_async, split},
    loom::{
        device::Device, moments::TensorMoments, num::Float, tag::NextTag, tensor::TensorError,
    },
};

/// A differentiable step reading one moments bundle and writing another.
///
/// Passes only submit work to the device and return once it is enqueued.
pub trait Layer<D: Device, T: Float>: std::fmt::Debug + Send + Sync {
    fn input(&self) -> &TensorMoments<D, T>;
    fn output(&self) -> &TensorMoments<D, T>;
    /// Trainable state owned by the layer.
    fn parameters(&self) -> Vec<&TensorMoments<D, T>>;

    /// Computes the output value from the input value.
    fn forward_async(&self) -> Result<(), TensorError>;
    /// Consumes the output gradient. Accumulates into each parameter gradient and the input
    /// gradient that is tracked, and leaves the others untouched.
    fn backward_async(&self) -> Result<(), TensorError>;

    /// Randomizes the parameters.
    fn init_randn_async(&self, _seed: u64) -> Result<(), TensorError> {
        Ok(())
    }

    /// Releases every tensor the layer created.
    fn unregister(&self) -> Result<(), TensorError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LayerConfig {
    Linear(LinearConfig),
    /// Name of a registered activation.
    Activation(String),
}

impl From<LinearConfig> for LayerConfig {
    fn from(value: LinearConfig) -> Self {
        Self::Linear(value)
    }
}

impl From<Activation> for LayerConfig {
    fn from(value: Activation) -> Self {
        Self::Activation(value.to_string())
    }
}

/// A chain of layers, each consuming the output of the one before.
#[derive(Debug)]
pub struct Model<D: Device, T: Float> {
    /// The input followed by the output of every layer.
    activations: Vec<TensorMoments<D, T>>,
    layers: Vec<Box<dyn Layer<D, T>>>,
}

impl<D: Device, T: Float> Model<D, T> {
    pub fn new(
        activations: Vec<TensorMoments<D, T>>,
        layers: Vec<Box<dyn Layer<D, T>>>,
    ) -> Result<Self, TensorError> {
        if layers.is_empty() {
            return Err(TensorError::EmptyModel);
        }
        for (index, layer) in layers.iter().enumerate() {
            let linked = match (activations.get(index), activations.get(index + 1)) {
                (Some(input), Some(output)) => {
                    layer.input().same(input) && layer.output().same(output)
                }
                _ => false,
            };
            if !linked {
                return Err(TensorError::Disconnected(index));
            }
        }
        if activations.len() != layers.len() + 1 {
            return Err(TensorError::Disconnected(layers.len()));
        }
        Ok(Self {
            activations,
            layers,
        })
    }

    /// Generates one layer per config, feeding each the output of the previous one.
    ///
    /// Every config is checked against the shapes flowing through the chain before anything is
    /// created, so a failure registers no tiles.
    pub fn generate_chain(
        x: TensorMoments<D, T>,
        configs: &[LayerConfig],
        mut next_tag: NextTag,
    ) -> Result<(Self, NextTag), TensorError> {
        if configs.is_empty() {
            return Err(TensorError::EmptyModel);
        }
        x.check()?;
        let mut traits = x.value.traits().clone();
        for config in configs {
            match config {
                LayerConfig::Linear(config) => traits = linear_traits(&traits, config)?.1,
                LayerConfig::Activation(name) => {
                    name.parse::<Activation>()?;
                }
            }
        }

        let mut activations = vec![x];
        let mut layers: Vec<Box<dyn Layer<D, T>>> = Vec::with_capacity(configs.len());
        for config in configs {
            let input = activations[activations.len() - 1].clone();
            let layer: Box<dyn Layer<D, T>> = match config {
                LayerConfig::Linear(config) => {
                    let (layer, next) = Linear::generate(input, config, next_tag)?;
                    next_tag = next;
                    Box::new(layer)
                }
                LayerConfig::Activation(name) => {
                    let (layer, next) = ActivationLayer::generate(input, name, next_tag)?;
                    next_tag = next;
                    Box::new(layer)
                }
            };
            activations.push(layer.output().clone());
            layers.push(layer);
        }
        Ok((Self::new(activations, layers)?, next_tag))
    }

    /// A stack of `nlayers` linear layers that maps the input back to its own shape.
    ///
    /// The first layer contracts `ndim` axes of the input into one axis of extent `add_shape`,
    /// inner layers keep that axis, and the last layer expands it into the contracted axes again.
    #[allow(clippy::too_many_arguments)]
    pub fn deep_linear(
        x: TensorMoments<D, T>,
        side: Side,
        ndim: usize,
        add_shape: usize,
        add_basetile_shape: usize,
        nlayers: usize,
        next_tag: NextTag,
    ) -> Result<(Self, NextTag), TensorError> {
        if nlayers < 2 {
            return Err(TensorError::InvalidConfig("a deep linear model needs two layers"));
        }
        if ndim == 0 {
            return Err(TensorError::InvalidConfig("no axes to contract"));
        }
        if ndim > x.value.ndim() {
            let shape = x.value.shape().clone();
            return Err(TensorError::ShapeMismatch(shape, [ndim].into()));
        }

        let inner_last = side == Side::Left;
        let (_, inner) = split(x.value.shape(), ndim, inner_last);
        let (_, inner_tile) = split(x.value.basetile_shape(), ndim, inner_last);

        let first = LinearConfig::new(side, ndim, [add_shape], [add_basetile_shape]);
        let hidden = LinearConfig::new(side, 1, [add_shape], [add_basetile_shape]);
        let last = LinearConfig::new(side, 1, inner, inner_tile);
        let configs = std::iter::once(first)
            .chain(std::iter::repeat_n(hidden, nlayers - 2))
            .chain(std::iter::once(last))
            .map(LayerConfig::Linear)
            .collect::<Vec<_>>();
        Self::generate_chain(x, &configs, next_tag)
    }

    #[inline]
    pub fn input(&self) -> &TensorMoments<D, T> {
        &self.activations[0]
    }

    #[inline]
    pub fn output(&self) -> &TensorMoments<D, T> {
        &self.activations[self.layers.len()]
    }

    #[inline]
    pub fn activations(&self) -> &[TensorMoments<D, T>] {
        &self.activations
    }

    #[inline]
    pub fn layers(&self) -> &[Box<dyn Layer<D, T>>] {
        &self.layers
    }

    pub fn parameters(&self) -> Vec<&TensorMoments<D, T>> {
        self.layers.iter().flat_map(|layer| layer.parameters()).collect()
    }

    pub fn forward(&self) -> Result<(), TensorError> {
        self.layers.iter().try_for_each(|layer| layer.forward_async())
    }

    pub fn backward(&self) -> Result<(), TensorError> {
        self.layers.iter().rev().try_for_each(|layer| layer.backward_async())
    }

    /// Randomizes the parameters of every layer, with a distinct seed per layer.
    pub fn init_randn_async(&self, seed: u64) -> Result<(), TensorError> {
        self.layers
            .iter()
            .enumerate()
            .try_for_each(|(index, layer)| layer.init_randn_async(seed.wrapping_add(index as u64)))
    }

    /// Zeroes every tracked gradient of the parameters and the activations.
    pub fn clear_gradients(&self) -> Result<(), TensorError> {
        let moments = self.parameters().into_iter().chain(&self.activations);
        for grad in moments.filter_map(|x| x.tracked_grad()) {
            clear_async(grad)?;
        }
        Ok(())
    }

    /// Releases every layer output and every tensor the layers created. The input is kept.
    pub fn unregister(&self) -> Result<(), TensorError> {
        self.layers.iter().try_for_each(|layer| layer.unregister())
    }
}
