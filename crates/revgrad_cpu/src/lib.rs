//! Reference CPU kernels.
//!
//! Every kernel works on contiguous, row-major slices and receives its shape
//! parameters explicitly. Callers own allocation, including the scratch column
//! buffers of the convolution kernels.

pub mod float;
pub mod nn;
pub mod ops;
pub mod utils;

pub use float::Float;
