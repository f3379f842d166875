pub mod conv;
pub mod depthwise;
pub mod gemm;

pub use conv::ConvDims;
