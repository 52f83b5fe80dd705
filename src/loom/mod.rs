//! The `loom` module provides the foundation the kernels and layers are built on.
//!
//! ## Key Components
//! 1. **Layout**:
//!    - Tensor shapes cut into base tiles (`TensorTraits`), column-major tile and element order.
//!    - Placement of tiles on nodes (root and block-cyclic distributions).
//!
//! 2. **Device Abstraction**:
//!    - A non-blocking `Device` trait taking registrations, submissions, hints and barriers.
//!    - A CPU reference runtime that orders ops by the tiles they read and write.
//!
//! 3. **Numerical System**:
//!    - Element types (`f32`, `f64`, `f16`) and their `DataType` tags.
//!
//! 4. **Tensors**:
//!    - Distributed tensors named by tags from a threaded `NextTag` allocator.
//!    - Value and gradient pairs (`TensorMoments`) passed between layers.
//!
//! ## Design Principles
//! - **Portability**: WASM support via `wasm_bindgen_futures`.
//! - **Extensibility**: Custom ops via the `TensorOp` trait and per-backend kernels.
//! - **Safety**: Access validation before any op is submitted.

#![cfg_attr(target_arch = "wasm32", allow(async_fn_in_trait))]

pub mod device;
pub mod layout;
pub mod moments;
pub mod num;
pub mod ops;
pub mod platform;
pub mod tag;
pub mod tensor;
