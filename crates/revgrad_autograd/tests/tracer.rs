mod utils;

use revgrad_autograd::{
    conv::{self, ConvForward},
    tracer::{traced_apply, TraceNodeKind, TracingContext, TracingState, ValueType},
    wrap_outputs, Function, FunctionMeta, Variable,
};
use revgrad_core::{dtype::DType, error::Error, error::Result};
use revgrad_tensor::Tensor;
use std::sync::Arc;
use utils::{params, pattern, setup_variable};

fn leaves() -> Result<(Variable, Variable)> {
    let x = setup_variable(pattern(2 * 5 * 5, 1), DType::F32, &[1, 2, 5, 5], true)?;
    let w = setup_variable(pattern(3 * 2 * 9, 2), DType::F32, &[3, 2, 3, 3], true)?;
    Ok((x, w))
}

fn forward_node(ctx: &TracingContext, x: &Variable, w: &Variable) -> Result<Variable> {
    conv::conv_traced(ctx, x, w, &Variable::undefined(), params(&[1, 1], &[1, 1], &[1, 1], 1)?)
}

fn opaque_nodes(state: &TracingState, name: &str) -> Result<Vec<(usize, usize)>> {
    let graph = state.graph()?;
    Ok(graph
        .nodes()
        .iter()
        .filter(|n| n.kind == TraceNodeKind::Opaque(name.to_string()))
        .map(|n| (n.inputs.len(), n.outputs.len()))
        .collect())
}

/// Doubles its input; does not expose its captures.
struct Doubler {
    traceable: bool,
    meta: FunctionMeta,
}

impl Doubler {
    fn new(traceable: bool) -> Self {
        Self {
            traceable,
            meta: FunctionMeta::forward(),
        }
    }
}

struct DoublerBackward {
    meta: FunctionMeta,
}

impl Function for Doubler {
    fn name(&self) -> String {
        "Doubler".to_string()
    }

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        let out = inputs[0].data()?.mul_scalar(2.0)?;
        wrap_outputs(inputs, vec![Some(out)], |flags| {
            Ok(Arc::new(DoublerBackward {
                meta: FunctionMeta::new(flags),
            }) as Arc<dyn Function>)
        })
    }

    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn is_traceable(&self) -> bool {
        self.traceable
    }
}

impl Function for DoublerBackward {
    fn name(&self) -> String {
        "DoublerBackward".to_string()
    }

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        Ok(vec![Variable::new(inputs[0].data()?.mul_scalar(2.0)?, false)])
    }

    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }
}

#[test]
fn forward_records_opaque_node_and_handle() -> Result<()> {
    let (x, w) = leaves()?;
    let state = TracingState::new();
    let ctx = state.enter(&[x.clone(), w.clone()])?;
    assert!(ctx.is_active());

    let y = forward_node(&ctx, &x, &w)?;
    // x, w and the undefined bias in; y and the handle out
    assert_eq!(opaque_nodes(&state, "ConvForward")?, vec![(3, 2)]);

    let grad_fn = y.grad_fn().ok_or(Error::MissingGradFn)?;
    let handle = grad_fn.meta().forward_ctx().ok_or(Error::Trace("no context edge".into()))?;
    {
        let graph = state.graph()?;
        let value = graph.value(handle).ok_or(Error::Trace("dangling handle".into()))?;
        assert_eq!(value.ty, Some(ValueType::Handle));
        assert_eq!(value.offset, 1);
        assert_eq!(state.lookup(&y), graph.node(value.node).map(|n| n.outputs[0]));
        assert!(graph
            .nodes()
            .iter()
            .any(|n| n.kind == TraceNodeKind::Undefined));
    }

    let subgraphs = state.backward_subgraphs()?;
    assert_eq!(subgraphs.len(), 1);
    assert_eq!(subgraphs[0].stage, 0);

    state.exit(&[y])?;
    assert!(!ctx.is_active());
    let graph = state.graph()?;
    assert_eq!(graph.inputs().len(), 2);
    assert_eq!(graph.outputs().len(), 1);
    assert_eq!(graph.topo_order().len(), graph.nodes().len());
    assert!(graph.to_string().contains("ConvForward"));
    Ok(())
}

#[test]
fn backward_consumes_the_forward_handle() -> Result<()> {
    let (x, w) = leaves()?;
    let state = TracingState::new();
    let ctx = state.enter(&[x.clone(), w.clone()])?;
    let y = forward_node(&ctx, &x, &w)?;

    let backward = y.grad_fn().ok_or(Error::MissingGradFn)?;
    let handle = backward.meta().forward_ctx();
    let go = Variable::new(Tensor::ones_like(y.data()?)?, false);
    let grads = traced_apply(&ctx, &backward, &[go])?;
    assert_eq!(grads.len(), 3);

    // gO plus the handle in; gI, gW, the undefined gb and a new handle out
    assert_eq!(opaque_nodes(&state, "ConvBackward")?, vec![(2, 4)]);
    {
        let graph = state.graph()?;
        let node = graph
            .nodes()
            .iter()
            .find(|n| n.kind == TraceNodeKind::Opaque("ConvBackward".into()))
            .ok_or(Error::Trace("missing node".into()))?;
        assert_eq!(node.inputs.last().copied(), handle);
    }

    // the backward's own captures form a second subgraph
    let subgraphs = state.backward_subgraphs()?;
    assert_eq!(subgraphs.len(), 2);
    assert_eq!(subgraphs[1].inputs.len(), 4);
    assert_eq!(subgraphs[1].outputs.len(), 3);

    let double = grads[0].grad_fn().ok_or(Error::MissingGradFn)?;
    assert!(double.meta().forward_ctx().is_some());
    assert_ne!(double.meta().forward_ctx(), handle);
    state.exit(&grads[..2])
}

#[test]
fn eval_subgraph_skips_handles() -> Result<()> {
    let (x, w) = leaves()?;
    let state = TracingState::new();
    let ctx = state.enter(&[x.clone(), w.clone()])?;

    let y = {
        let _guard = state.eval_subgraph_guard();
        assert!(state.in_eval_subgraph());
        forward_node(&ctx, &x, &w)?
    };
    assert!(!state.in_eval_subgraph());

    assert_eq!(opaque_nodes(&state, "ConvForward")?, vec![(3, 1)]);
    assert!(state.backward_subgraphs()?.is_empty());
    let grad_fn = y.grad_fn().ok_or(Error::MissingGradFn)?;
    assert!(grad_fn.meta().forward_ctx().is_none());
    state.exit(&[y])
}

#[test]
fn eval_subgraph_keeps_existing_context_edges() -> Result<()> {
    let (x, w) = leaves()?;
    let state = TracingState::new();
    let ctx = state.enter(&[x.clone(), w.clone()])?;
    let y = forward_node(&ctx, &x, &w)?;
    let backward = y.grad_fn().ok_or(Error::MissingGradFn)?;

    let go = Variable::new(Tensor::ones_like(y.data()?)?, false);
    let grads = {
        let _guard = state.eval_subgraph_guard();
        traced_apply(&ctx, &backward, &[go])?
    };
    // handle in and out, but no new subgraph
    assert_eq!(opaque_nodes(&state, "ConvBackward")?, vec![(2, 4)]);
    assert_eq!(state.backward_subgraphs()?.len(), 1);
    state.exit(&grads[..1])
}

#[test]
fn hidden_captures_are_reported() -> Result<()> {
    let (x, _) = leaves()?;
    let state = TracingState::new();
    let ctx = state.enter(&[x.clone()])?;

    let doubler: Arc<dyn Function> = Arc::new(Doubler::new(false));
    let err = traced_apply(&ctx, &doubler, &[x.clone()]);
    assert!(matches!(err, Err(Error::Trace(ref m)) if m.contains("saved_variables() needed") && m.contains("Doubler")));

    // inside an eval subgraph the captures are never needed
    let _guard = state.eval_subgraph_guard();
    let out = traced_apply(&ctx, &doubler, &[x])?;
    assert_eq!(out.len(), 1);
    Ok(())
}

#[test]
fn traceable_functions_are_transparent() -> Result<()> {
    let (x, _) = leaves()?;
    let state = TracingState::new();
    let ctx = state.enter(&[x.clone()])?;
    let before = state.graph()?.nodes().len();

    let doubler: Arc<dyn Function> = Arc::new(Doubler::new(true));
    let out = traced_apply(&ctx, &doubler, &[x])?;
    assert_eq!(out[0].grad_fn().map(|f| f.name()).as_deref(), Some("DoublerBackward"));
    assert_eq!(state.graph()?.nodes().len(), before);
    Ok(())
}

#[test]
fn inactive_contexts_do_not_record() -> Result<()> {
    let (x, w) = leaves()?;
    let y = forward_node(&TracingContext::disabled(), &x, &w)?;
    assert!(y.grad_fn().is_some_and(|f| f.meta().forward_ctx().is_none()));

    let state = TracingState::new();
    let ctx = state.enter(&[x.clone(), w.clone()])?;
    state.exit(&[])?;
    let before = state.graph()?.nodes().len();
    let function: Arc<dyn Function> = Arc::new(ConvForward::new(params(&[1, 1], &[0, 0], &[1, 1], 1)?));
    traced_apply(&ctx, &function, &[x, w, Variable::undefined()])?;
    assert_eq!(state.graph()?.nodes().len(), before);
    Ok(())
}

#[test]
fn stages_track_flags() -> Result<()> {
    let (x, w) = leaves()?;
    let state = TracingState::new();
    let ctx = state.enter(&[x.clone(), w.clone()])?;
    let y = forward_node(&ctx, &x, &w)?;
    state.exit(&[y.clone()])?;

    assert_eq!(state.next_stage()?, 1);
    let go = Variable::new(Tensor::ones_like(y.data()?)?, false);
    let backward = y.grad_fn().ok_or(Error::MissingGradFn)?;
    let ctx = state.enter(&[go.clone()])?;
    let grads = traced_apply(&ctx, &backward, &[go])?;
    state.exit(&grads[..2])?;

    assert_eq!(state.num_stages()?, 2);
    let (inputs, outputs) = state.var_flags(0)?;
    assert!(inputs.iter().all(|f| f.requires_grad && f.defined));
    assert_eq!(outputs.len(), 1);
    let (inputs, outputs) = state.var_flags(1)?;
    assert!(!inputs[0].requires_grad);
    assert!(outputs.iter().all(|f| f.requires_grad));
    assert_eq!(state.output_edges(1)?.len(), 2);

    let graph = state.graph()?;
    assert_eq!(graph.stage_inputs(0).count(), 2);
    assert_eq!(graph.stage_inputs(1).count(), 1);
    assert!(state.var_flags(2).is_err());
    Ok(())
}

#[cfg(feature = "serde")]
#[test]
fn graph_serializes_to_json() -> Result<()> {
    let (x, w) = leaves()?;
    let state = TracingState::new();
    let ctx = state.enter(&[x.clone(), w.clone()])?;
    let y = forward_node(&ctx, &x, &w)?;
    state.exit(&[y])?;
    let json = state.graph()?.to_json()?;
    assert!(json.contains("ConvForward"));
    Ok(())
}
