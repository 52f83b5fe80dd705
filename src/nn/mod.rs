//! Layers and models on top of distributed tensors.

pub mod activation;
pub mod linear;
pub mod model;
pub mod precision;

pub use activation::{Activation, ActivationLayer};
pub use linear::{Linear, LinearConfig, Side};
pub use model::{Layer, LayerConfig, Model};
pub use precision::PrecisionMode;
