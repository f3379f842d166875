use crate::{device::Device, dtype::DType};
use thiserror::Error;

pub const ERR_BACKWARD_TWICE: &str = "Trying to backward through the graph a second time, but the saved buffers have \
     already been freed. Request graph retention when calling backward the first time.";

#[derive(Debug, Error)]
pub enum Error {
    #[error("DType mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch { expected: DType, got: DType },
    #[error("Device mismatch: expected {}, got {}", .expected.name(), .got.name())]
    DeviceMismatch { expected: Device, got: Device },
    #[error("Unsupported data type")]
    UnsupportedDType,
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Incompatible shape: {0}")]
    IncompatibleShape(String),
    #[error("Invalid shape: {message}")]
    InvalidShape { message: String },
    #[error("Shape mismatch ({msg}): expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
        msg: String,
    },
    #[error("Dimension out of bounds: dimension {dim} is not valid for tensor with {ndim} dimensions")]
    DimensionOutOfBounds { dim: usize, ndim: usize },
    #[error("Unsupported: {0}")]
    Unsupported(String),

    // graph integrity
    #[error("{}", ERR_BACKWARD_TWICE)]
    BackwardTwice,
    #[error(
        "one of the variables needed for gradient computation has been modified by an inplace operation \
         (saved at version {expected}, now at version {current})"
    )]
    ModifiedInplace { expected: usize, current: usize },
    #[error("No grad accumulator for a saved leaf")]
    MissingGradAccumulator,
    #[error("No grad_fn for non-leaf saved variable")]
    MissingGradFn,

    #[error("Unsupported convolution parameters: {0}")]
    UnsupportedConvolution(String),

    // staged subgraphs
    #[error("Function compiled only for {compiled} derivatives; request more derivative stages when compiling")]
    DerivativeOrderExceeded { compiled: usize },
    #[error("Stage mismatch: {0}")]
    StageMismatch(String),

    #[error("Trace error: {0}")]
    Trace(String),
    #[error("Lock poisoned")]
    Lock,
    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Failures that mean the recorded graph can no longer produce a correct gradient.
    pub fn is_graph_integrity(&self) -> bool {
        matches!(
            self,
            Self::BackwardTwice | Self::ModifiedInplace { .. } | Self::MissingGradAccumulator | Self::MissingGradFn
        )
    }

    /// Failures raised when a compiled staged subgraph cannot serve the live inputs.
    pub fn is_stage_mismatch(&self) -> bool {
        matches!(self, Self::DerivativeOrderExceeded { .. } | Self::StageMismatch(_))
    }
}
