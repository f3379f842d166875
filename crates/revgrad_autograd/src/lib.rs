//! Reverse-mode automatic differentiation.
//!
//! Forward calls build a graph of [`Function`] nodes linked by [`Edge`]s; each
//! node knows how to turn gradients of its outputs into gradients of its inputs.
//! Backward nodes are themselves built from differentiable ops, so gradients of
//! gradients come out of the same machinery.

mod accumulate;
pub mod conv;
mod function;
pub mod functions;
pub mod grad_mode;
mod saved;
pub mod staged;
pub mod tracer;
mod variable;

pub use accumulate::GradAccumulator;
pub use function::{
    check_input_variables, compute_flags, wrap_outputs, Edge, Function, FunctionFlags, FunctionMeta,
};
pub use saved::SavedVariable;
pub use variable::{Variable, VariableFlags, VariableId};
