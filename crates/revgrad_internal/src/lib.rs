pub mod prelude;

pub use revgrad_autograd as autograd;
pub use revgrad_core as core;
pub use revgrad_tensor as tensor;

pub use revgrad_core::dtype::{bfloat16, float16, float32, float64, half};
