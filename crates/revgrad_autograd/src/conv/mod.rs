//! N-dimensional convolution with first and second order backward.
//!
//! [`ConvForward`] runs the convolution and records a [`ConvBackward`] node;
//! that node's outputs are in turn differentiable through
//! [`ConvBackwardBackward`], which is composed entirely of differentiable ops.

mod backward;
mod double_backward;
pub mod engine;
mod forward;
mod params;

pub use backward::ConvBackward;
pub use double_backward::{output_padding_for, ConvBackwardBackward};
pub use engine::{register_engine, unregister_engine, ConvDescriptor, ConvolutionEngine, ConvolutionPlan};
pub use forward::ConvForward;
pub use params::{ConvParams, ConvStrategy};

use crate::{
    function::single,
    functions,
    tracer::{traced_apply, TracingContext},
    Function, Variable,
};
use revgrad_core::error::{Error, Result};
use revgrad_tensor::Tensor;
use std::sync::Arc;

/// Convolves `input` with `weight`, adding `bias` when it is defined.
pub fn conv(input: &Variable, weight: &Variable, bias: &Variable, params: ConvParams) -> Result<Variable> {
    single(
        ConvForward::new(params).apply(&[input.clone(), weight.clone(), bias.clone()])?,
        "ConvForward",
    )
}

/// Like [`conv`], mirroring the node into the trace of `ctx` when it is active.
pub fn conv_traced(
    ctx: &TracingContext,
    input: &Variable,
    weight: &Variable,
    bias: &Variable,
    params: ConvParams,
) -> Result<Variable> {
    let function: Arc<dyn Function> = Arc::new(ConvForward::new(params));
    single(
        traced_apply(ctx, &function, &[input.clone(), weight.clone(), bias.clone()])?,
        "ConvForward",
    )
}

// ───── Group slicing ─────

/// Contiguous slice `g` of `groups` equal parts of `tensor` along `dim`.
pub(crate) fn subtensor(tensor: &Tensor, dim: usize, groups: usize, g: usize) -> Result<Tensor> {
    let n = tensor.shape()[dim] / groups;
    tensor.narrow(dim, n * g, n)?.contiguous()
}

pub(crate) fn subvariable(variable: &Variable, dim: usize, groups: usize, g: usize) -> Result<Variable> {
    let n = variable.shape()?[dim] / groups;
    functions::narrow(variable, dim, n * g, n)
}

// ───── Accelerated path helpers ─────

pub(crate) fn accelerated_engine(input: &Tensor) -> Result<Arc<dyn ConvolutionEngine>> {
    engine::engine_for(input.device()).ok_or_else(|| {
        Error::UnsupportedConvolution(format!("no accelerated engine registered for {}", input.device()))
    })
}

pub(crate) fn plan_for(
    engine: &dyn ConvolutionEngine,
    params: &ConvParams,
    input: &Tensor,
    weight: &Tensor,
) -> Result<Arc<ConvolutionPlan>> {
    let input_shape = if params.transposed {
        params.output_size(input.shape(), weight.shape())
    } else {
        input.shape().to_vec()
    };
    let plan = engine.plan(ConvDescriptor {
        input_shape,
        weight_shape: weight.shape().to_vec(),
        dtype: input.dtype(),
        device: input.device(),
        geometry: params.geometry(),
        groups: params.groups,
        transposed: params.transposed,
        deterministic: params.deterministic,
        benchmark: params.benchmark,
    })?;
    log::debug!(
        "engine {} planned algorithm {} (workspace {} bytes)",
        engine.name(),
        plan.algorithm,
        plan.workspace_size
    );
    Ok(plan)
}

/// Adds a per-channel bias to `output` `[N, C, ..]`.
pub(crate) fn add_channel_bias(output: Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let Some(bias) = bias else {
        return Ok(output);
    };
    let mut shape = vec![1; output.ndim()];
    shape[1] = bias.size();
    let expanded = bias.contiguous()?.view(&shape)?.expand(output.shape())?;
    output.add(&expanded)
}
