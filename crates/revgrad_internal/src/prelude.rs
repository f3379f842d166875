pub use crate::autograd::{
    conv::{conv, conv_traced, ConvParams},
    grad_mode::{is_grad_enabled, no_grad, NoGradGuard},
    tracer::{traced_apply, TracingContext, TracingState},
    Function, SavedVariable, Variable,
};
pub use crate::core::{
    config::{get_default_device, get_default_dtype, set_default_device, set_default_dtype, ConfigGuard},
    device::Device,
    dtype::*,
    error::{Error, Result},
};
pub use crate::tensor::Tensor;
