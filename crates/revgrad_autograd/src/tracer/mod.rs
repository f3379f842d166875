//! Optional mirroring of node construction into a static trace.
//!
//! Tracing is driven through an explicit [`TracingContext`]; a disabled
//! context makes [`traced_apply`] a plain `apply`.

mod graph;
mod state;

pub use graph::{TraceGraph, TraceNode, TraceNodeId, TraceNodeKind, TraceValue, TraceValueId, ValueType};
pub use state::{BackwardSubgraph, EvalSubgraphGuard, TracingState};

use crate::{Function, Variable, VariableFlags};
use revgrad_core::error::{Error, Result};
use std::sync::Arc;

/// Handle to the trace a node-constructing call should record into.
#[derive(Clone, Default)]
pub struct TracingContext {
    state: Option<Arc<TracingState>>,
}

impl TracingContext {
    pub fn new(state: Arc<TracingState>) -> Self {
        Self { state: Some(state) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Option<&Arc<TracingState>> {
        self.state.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.is_active())
    }
}

/// Applies `function`, recording it as an opaque trace node when `ctx` is
/// active.
///
/// Traceable functions are applied directly. For the others the node records
/// the flags and traces of its inputs, a trace value per output and, unless
/// the node passes its state through, a context edge towards the node that
/// will evaluate its backward.
pub fn traced_apply(ctx: &TracingContext, function: &Arc<dyn Function>, inputs: &[Variable]) -> Result<Vec<Variable>> {
    let state = match ctx.state() {
        Some(state) if state.is_active() && !function.is_traceable() => state,
        _ => return function.apply(inputs),
    };

    let this_node = {
        let mut graph = state.graph()?;
        let var_flags = inputs.iter().map(VariableFlags::of).collect();
        let node = graph.add_node(TraceNodeKind::Opaque(function.name()), var_flags);
        for input in inputs {
            let value = state.value_trace(&mut graph, input);
            graph.add_node_input(node, value);
        }
        node
    };
    log::debug!("tracer: opaque node {} for {}", this_node, function.name());

    // the graph lock is not held while the function runs
    let outputs = function.apply(inputs)?;

    let mut graph = state.graph()?;
    for output in &outputs {
        let value = graph.add_node_output(this_node, output.opt_data().map(ValueType::of));
        if output.defined() {
            state.set_value_trace(output, value);
        }
    }

    if function.passes_state_transparently() {
        return Ok(outputs);
    }

    // evaluators of a backward consume the handle of their forward node
    let forward_ctx = function.meta().forward_ctx();
    if let Some(handle) = forward_ctx {
        graph.add_node_input(this_node, handle);
    }

    // inside an eval subgraph the enclosing trace already covers this backward
    let in_eval_subgraph = state.in_eval_subgraph();
    if !in_eval_subgraph {
        let saved = function.saved_variables().ok_or_else(|| {
            Error::Trace(format!(
                "saved_variables() needed but not implemented in {}",
                function.name()
            ))
        })?;
        let mut subgraph_inputs = inputs.to_vec();
        for saved_variable in saved {
            subgraph_inputs.push(saved_variable.unpack(Some(Arc::clone(function)))?);
        }
        state.record_backward_subgraph(&mut graph, &subgraph_inputs, &outputs)?;
    }

    if !in_eval_subgraph || forward_ctx.is_some() {
        let handle = graph.add_node_output(this_node, Some(ValueType::Handle));
        if let Some(backward) = outputs.iter().find_map(Variable::grad_fn) {
            backward.meta().set_forward_ctx(handle)?;
        }
    }
    Ok(outputs)
}
