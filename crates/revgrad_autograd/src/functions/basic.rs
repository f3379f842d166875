use crate::{check_input_variables, wrap_outputs, Function, FunctionFlags, FunctionMeta, SavedVariable, Variable};
use revgrad_core::error::{Error, Result};
use revgrad_tensor::Tensor;
use std::sync::Arc;

// ───── Shared plumbing ─────

macro_rules! node_common {
    ($name:ident) => {
        fn name(&self) -> String {
            stringify!($name).to_string()
        }

        fn meta(&self) -> &FunctionMeta {
            &self.meta
        }

        fn saved_variables(&self) -> Option<Vec<&SavedVariable>> {
            Some(Vec::new())
        }
    };
}

fn backward_node<F: Function + 'static>(node: F) -> Result<Arc<dyn Function>> {
    Ok(Arc::new(node))
}

fn undefined_grads(n: usize) -> Vec<Variable> {
    vec![Variable::undefined(); n]
}

/// Runs `f` on the single gradient of a one-output node, unless it is absent
/// or nothing downstream needs it.
fn unary_backward(
    node: &dyn Function,
    inputs: &[Variable],
    f: impl FnOnce(&Variable) -> Result<Variable>,
) -> Result<Vec<Variable>> {
    check_input_variables(&node.name(), inputs, 1, 0)?;
    if !inputs[0].defined() || !node.should_compute_output(0) {
        return Ok(undefined_grads(1));
    }
    Ok(vec![f(&inputs[0])?])
}

fn single_output(inputs: &[Variable], out: Tensor, ctor: impl FnOnce(FunctionFlags) -> Result<Arc<dyn Function>>) -> Result<Vec<Variable>> {
    wrap_outputs(inputs, vec![Some(out)], ctor)
}

// ───── Add ─────

#[derive(Default)]
pub struct Add {
    meta: FunctionMeta,
}

impl Add {
    pub fn new() -> Self {
        Self {
            meta: FunctionMeta::forward(),
        }
    }
}

impl Function for Add {
    node_common!(Add);

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        check_input_variables("Add", inputs, 2, 2)?;
        let out = inputs[0].data()?.add(inputs[1].data()?)?;
        single_output(inputs, out, |flags| {
            backward_node(AddBackward {
                meta: FunctionMeta::new(flags),
            })
        })
    }
}

pub struct AddBackward {
    meta: FunctionMeta,
}

impl Function for AddBackward {
    node_common!(AddBackward);

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        check_input_variables("AddBackward", inputs, 1, 0)?;
        let grad = &inputs[0];
        Ok((0..2)
            .map(|i| {
                if self.should_compute_output(i) {
                    grad.clone()
                } else {
                    Variable::undefined()
                }
            })
            .collect())
    }
}

// ───── Transpose ─────

pub struct Transpose {
    dim0: usize,
    dim1: usize,
    meta: FunctionMeta,
}

impl Transpose {
    pub fn new(dim0: usize, dim1: usize) -> Self {
        Self {
            dim0,
            dim1,
            meta: FunctionMeta::forward(),
        }
    }
}

impl Function for Transpose {
    node_common!(Transpose);

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        check_input_variables("Transpose", inputs, 1, 1)?;
        let out = inputs[0].data()?.transpose(self.dim0, self.dim1)?;
        let (dim0, dim1) = (self.dim0, self.dim1);
        single_output(inputs, out, |flags| {
            backward_node(TransposeBackward {
                dim0,
                dim1,
                meta: FunctionMeta::new(flags),
            })
        })
    }
}

pub struct TransposeBackward {
    dim0: usize,
    dim1: usize,
    meta: FunctionMeta,
}

impl Function for TransposeBackward {
    node_common!(TransposeBackward);

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        unary_backward(self, inputs, |grad| super::transpose(grad, self.dim0, self.dim1))
    }
}

// ───── Narrow ─────

pub struct Narrow {
    dim: usize,
    start: usize,
    length: usize,
    meta: FunctionMeta,
}

impl Narrow {
    pub fn new(dim: usize, start: usize, length: usize) -> Self {
        Self {
            dim,
            start,
            length,
            meta: FunctionMeta::forward(),
        }
    }
}

impl Function for Narrow {
    node_common!(Narrow);

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        check_input_variables("Narrow", inputs, 1, 1)?;
        let data = inputs[0].data()?;
        let out = data.narrow(self.dim, self.start, self.length)?;
        let input_shape = data.shape().to_vec();
        let (dim, start) = (self.dim, self.start);
        single_output(inputs, out, |flags| {
            backward_node(NarrowBackward {
                dim,
                start,
                input_shape,
                meta: FunctionMeta::new(flags),
            })
        })
    }
}

pub struct NarrowBackward {
    dim: usize,
    start: usize,
    input_shape: Vec<usize>,
    meta: FunctionMeta,
}

impl Function for NarrowBackward {
    node_common!(NarrowBackward);

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        unary_backward(self, inputs, |grad| {
            let grad_data = grad.data()?;
            let length = grad_data.shape()[self.dim];
            let after = self.input_shape[self.dim] - self.start - length;

            let zeros = |extent: usize| -> Result<Variable> {
                let mut shape = self.input_shape.clone();
                shape[self.dim] = extent;
                let zeros = Tensor::zeros_with_spec(&shape, grad_data.device(), grad_data.dtype())?;
                Ok(Variable::new(zeros, false))
            };

            let mut pieces = Vec::with_capacity(3);
            if self.start > 0 {
                pieces.push(zeros(self.start)?);
            }
            pieces.push(grad.clone());
            if after > 0 {
                pieces.push(zeros(after)?);
            }
            if pieces.len() == 1 {
                return Ok(grad.clone());
            }
            super::cat(&pieces, self.dim)
        })
    }
}

// ───── Cat ─────

pub struct Cat {
    dim: usize,
    meta: FunctionMeta,
}

impl Cat {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            meta: FunctionMeta::forward(),
        }
    }
}

impl Function for Cat {
    node_common!(Cat);

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        check_input_variables("Cat", inputs, inputs.len(), inputs.len())?;
        if inputs.is_empty() {
            return Err(Error::InvalidArgument("Cat expects at least one input".to_string()));
        }
        let tensors = inputs.iter().map(|v| v.data().cloned()).collect::<Result<Vec<_>>>()?;
        let out = Tensor::cat(&tensors, self.dim)?;
        let sizes = tensors.iter().map(|t| t.shape()[self.dim]).collect();
        let dim = self.dim;
        single_output(inputs, out, |flags| {
            backward_node(CatBackward {
                dim,
                sizes,
                meta: FunctionMeta::new(flags),
            })
        })
    }
}

pub struct CatBackward {
    dim: usize,
    sizes: Vec<usize>,
    meta: FunctionMeta,
}

impl Function for CatBackward {
    node_common!(CatBackward);

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        check_input_variables("CatBackward", inputs, 1, 0)?;
        let grad = &inputs[0];
        if !grad.defined() {
            return Ok(undefined_grads(self.sizes.len()));
        }

        let mut start = 0;
        let mut grads = Vec::with_capacity(self.sizes.len());
        for (i, &size) in self.sizes.iter().enumerate() {
            grads.push(if self.should_compute_output(i) {
                super::narrow(grad, self.dim, start, size)?
            } else {
                Variable::undefined()
            });
            start += size;
        }
        Ok(grads)
    }
}

// ───── View ─────

pub struct View {
    shape: Vec<usize>,
    meta: FunctionMeta,
}

impl View {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            meta: FunctionMeta::forward(),
        }
    }
}

impl Function for View {
    node_common!(View);

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        check_input_variables("View", inputs, 1, 1)?;
        let data = inputs[0].data()?;
        let out = data.view(&self.shape)?;
        let input_shape = data.shape().to_vec();
        single_output(inputs, out, |flags| {
            backward_node(ViewBackward {
                input_shape,
                meta: FunctionMeta::new(flags),
            })
        })
    }
}

pub struct ViewBackward {
    input_shape: Vec<usize>,
    meta: FunctionMeta,
}

impl Function for ViewBackward {
    node_common!(ViewBackward);

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        unary_backward(self, inputs, |grad| super::view(&super::contiguous(grad)?, &self.input_shape))
    }
}

// ───── Expand / SumToSize ─────

pub struct Expand {
    shape: Vec<usize>,
    meta: FunctionMeta,
}

impl Expand {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            meta: FunctionMeta::forward(),
        }
    }
}

impl Function for Expand {
    node_common!(Expand);

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        check_input_variables("Expand", inputs, 1, 1)?;
        let data = inputs[0].data()?;
        let out = data.expand(&self.shape)?;
        let input_shape = data.shape().to_vec();
        single_output(inputs, out, |flags| {
            backward_node(ExpandBackward {
                input_shape,
                meta: FunctionMeta::new(flags),
            })
        })
    }
}

pub struct ExpandBackward {
    input_shape: Vec<usize>,
    meta: FunctionMeta,
}

impl Function for ExpandBackward {
    node_common!(ExpandBackward);

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        unary_backward(self, inputs, |grad| super::sum_to_size(grad, &self.input_shape))
    }
}

pub struct SumToSize {
    shape: Vec<usize>,
    meta: FunctionMeta,
}

impl SumToSize {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            meta: FunctionMeta::forward(),
        }
    }
}

impl Function for SumToSize {
    node_common!(SumToSize);

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        check_input_variables("SumToSize", inputs, 1, 1)?;
        let data = inputs[0].data()?;
        let out = data.sum_to_shape(&self.shape)?;
        let input_shape = data.shape().to_vec();
        single_output(inputs, out, |flags| {
            backward_node(SumToSizeBackward {
                input_shape,
                meta: FunctionMeta::new(flags),
            })
        })
    }
}

pub struct SumToSizeBackward {
    input_shape: Vec<usize>,
    meta: FunctionMeta,
}

impl Function for SumToSizeBackward {
    node_common!(SumToSizeBackward);

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        unary_backward(self, inputs, |grad| super::expand(grad, &self.input_shape))
    }
}

// ───── Contiguous ─────

#[derive(Default)]
pub struct Contiguous {
    meta: FunctionMeta,
}

impl Contiguous {
    pub fn new() -> Self {
        Self {
            meta: FunctionMeta::forward(),
        }
    }
}

impl Function for Contiguous {
    node_common!(Contiguous);

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        check_input_variables("Contiguous", inputs, 1, 1)?;
        let out = inputs[0].data()?.contiguous()?;
        single_output(inputs, out, |flags| {
            backward_node(ContiguousBackward {
                meta: FunctionMeta::new(flags),
            })
        })
    }
}

pub struct ContiguousBackward {
    meta: FunctionMeta,
}

impl Function for ContiguousBackward {
    node_common!(ContiguousBackward);

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        unary_backward(self, inputs, |grad| Ok(grad.clone()))
    }
}
