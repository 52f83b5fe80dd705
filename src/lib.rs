//! Tiled distributed tensors and asynchronous layer execution.
//!
//! A [`Tensor`](loom::tensor::Tensor) is cut into tiles that are placed on nodes and registered
//! with a [`Device`](loom::device::Device). Layers in [`nn`] never compute anything themselves:
//! their passes cut tensor operations into tile ops through [`hal::frontend`] and submit them,
//! and the device runs each op once the ops before it on the same tiles are done.

pub mod hal;
pub mod loom;
pub mod nn;
