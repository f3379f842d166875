//! Differentiable view and arithmetic ops.
//!
//! Backward nodes of these ops are written with the same ops, so any gradient
//! they produce can itself be differentiated.

mod basic;

pub use basic::*;

use crate::{function::single, Function, Variable};
use revgrad_core::error::Result;

pub fn add(lhs: &Variable, rhs: &Variable) -> Result<Variable> {
    single(Add::new().apply(&[lhs.clone(), rhs.clone()])?, "Add")
}

/// Sum of the defined operands; undefined when none is defined.
pub fn add_defined(lhs: Variable, rhs: Variable) -> Result<Variable> {
    match (lhs.defined(), rhs.defined()) {
        (true, true) => add(&lhs, &rhs),
        (true, false) => Ok(lhs),
        _ => Ok(rhs),
    }
}

pub fn transpose(input: &Variable, dim0: usize, dim1: usize) -> Result<Variable> {
    single(Transpose::new(dim0, dim1).apply(&[input.clone()])?, "Transpose")
}

pub fn narrow(input: &Variable, dim: usize, start: usize, length: usize) -> Result<Variable> {
    single(Narrow::new(dim, start, length).apply(&[input.clone()])?, "Narrow")
}

pub fn cat(inputs: &[Variable], dim: usize) -> Result<Variable> {
    single(Cat::new(dim).apply(inputs)?, "Cat")
}

pub fn view(input: &Variable, shape: &[usize]) -> Result<Variable> {
    single(View::new(shape).apply(&[input.clone()])?, "View")
}

pub fn expand(input: &Variable, shape: &[usize]) -> Result<Variable> {
    single(Expand::new(shape).apply(&[input.clone()])?, "Expand")
}

pub fn contiguous(input: &Variable) -> Result<Variable> {
    single(Contiguous::new().apply(&[input.clone()])?, "Contiguous")
}

pub fn sum_to_size(input: &Variable, shape: &[usize]) -> Result<Variable> {
    single(SumToSize::new(shape).apply(&[input.clone()])?, "SumToSize")
}

pub fn unsqueeze(input: &Variable, dim: usize) -> Result<Variable> {
    let mut shape = input.shape()?.to_vec();
    if dim > shape.len() {
        return Err(revgrad_core::error::Error::DimensionOutOfBounds {
            dim,
            ndim: shape.len() + 1,
        });
    }
    shape.insert(dim, 1);
    view(&contiguous(input)?, &shape)
}

pub fn squeeze(input: &Variable, dim: usize) -> Result<Variable> {
    let mut shape = input.shape()?.to_vec();
    match shape.get(dim) {
        Some(1) => {
            shape.remove(dim);
            view(&contiguous(input)?, &shape)
        },
        Some(&size) => Err(revgrad_core::error::Error::InvalidShape {
            message: format!("cannot squeeze dimension {} of size {}", dim, size),
        }),
        None => Err(revgrad_core::error::Error::DimensionOutOfBounds { dim, ndim: shape.len() }),
    }
}
