//! Tile kernels and their tensor-level submission.
//!
//! [`ops`] declares what each kernel reads and writes, [`cpu`] holds the kernel bodies of the
//! reference runtime, and [`frontend`] cuts tensor operations into tile ops.

pub mod cpu;
pub mod frontend;
pub mod ops;
