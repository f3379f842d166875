use crate::{grad_mode, tracer::TraceValueId, SavedVariable, Variable};
use revgrad_core::error::{Error, Result};
use revgrad_tensor::Tensor;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

static SEQUENCE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Link from a node to output `input_nr` of the node that produced one of its inputs.
#[derive(Clone)]
pub struct Edge {
    pub function: Arc<dyn Function>,
    pub input_nr: usize,
}

impl Edge {
    pub fn new(function: Arc<dyn Function>, input_nr: usize) -> Self {
        Self { function, input_nr }
    }
}

impl PartialEq for Edge {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.function, &other.function) && self.input_nr == other.input_nr
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Edge({}, {})", self.function.name(), self.input_nr)
    }
}

impl std::fmt::Debug for dyn Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Summary of a node's inputs, computed before the node is built.
#[derive(Clone, Debug, Default)]
pub struct FunctionFlags {
    pub is_executable: bool,
    pub is_volatile: bool,
    pub next_functions: Vec<Option<Edge>>,
}

/// State shared by every node kind.
#[derive(Debug, Default)]
pub struct FunctionMeta {
    next_functions: Vec<Option<Edge>>,
    is_executable: bool,
    sequence_nr: usize,
    forward_ctx: Mutex<Option<TraceValueId>>,
}

impl FunctionMeta {
    pub fn new(flags: FunctionFlags) -> Self {
        Self {
            next_functions: flags.next_functions,
            is_executable: flags.is_executable,
            sequence_nr: SEQUENCE_COUNTER.fetch_add(1, Ordering::Relaxed),
            forward_ctx: Mutex::new(None),
        }
    }

    /// Metadata of a forward-only function: no edges.
    pub fn forward() -> Self {
        Self::new(FunctionFlags::default())
    }

    pub fn with_next_functions(next_functions: Vec<Option<Edge>>) -> Self {
        Self::new(FunctionFlags {
            is_executable: true,
            is_volatile: false,
            next_functions,
        })
    }

    pub fn next_functions(&self) -> &[Option<Edge>] {
        &self.next_functions
    }

    pub fn is_executable(&self) -> bool {
        self.is_executable
    }

    pub fn sequence_nr(&self) -> usize {
        self.sequence_nr
    }

    /// Trace handle of the forward node whose context this node consumes.
    pub fn forward_ctx(&self) -> Option<TraceValueId> {
        self.forward_ctx.lock().ok().and_then(|c| *c)
    }

    pub fn set_forward_ctx(&self, value: TraceValueId) -> Result<()> {
        *self.forward_ctx.lock().map_err(|_| Error::Lock)? = Some(value);
        Ok(())
    }
}

/// A node of the backward graph.
///
/// `apply` receives one gradient per output of the forward computation (an
/// undefined variable meaning zero) and returns one gradient per input, in
/// input order, leaving undefined the slots that are not needed.
pub trait Function: Send + Sync {
    fn name(&self) -> String;

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>>;

    fn meta(&self) -> &FunctionMeta;

    /// Drops saved payloads once the graph is no longer needed.
    fn release_variables(&self) {}

    /// Captures this node holds, needed when its backward is traced as an
    /// opaque subgraph. `None` means the node does not expose them.
    fn saved_variables(&self) -> Option<Vec<&SavedVariable>> {
        None
    }

    /// Traceable functions are transparent to the tracer: their internals are
    /// recorded instead of the function itself.
    fn is_traceable(&self) -> bool {
        false
    }

    fn passes_state_transparently(&self) -> bool {
        false
    }

    fn next_functions(&self) -> &[Option<Edge>] {
        self.meta().next_functions()
    }

    fn num_inputs(&self) -> usize {
        self.meta().next_functions().len()
    }

    /// Whether the gradient for input `index` is wired to anything.
    fn should_compute_output(&self, index: usize) -> bool {
        self.meta().next_functions().get(index).is_some_and(|e| e.is_some())
    }
}

pub fn compute_flags(inputs: &[Variable]) -> Result<FunctionFlags> {
    let grad_enabled = grad_mode::is_grad_enabled();
    let is_executable = grad_enabled && inputs.iter().any(Variable::requires_grad);
    let next_functions = inputs
        .iter()
        .map(|v| v.gradient_edge())
        .collect::<Result<Vec<_>>>()?;

    Ok(FunctionFlags {
        is_executable,
        is_volatile: !grad_enabled,
        next_functions,
    })
}

/// Wraps forward results, attaching a backward node built by `ctor` when any
/// input requires grad. `None` results become undefined variables.
pub fn wrap_outputs<F>(inputs: &[Variable], outputs: Vec<Option<Tensor>>, ctor: F) -> Result<Vec<Variable>>
where
    F: FnOnce(FunctionFlags) -> Result<Arc<dyn Function>>,
{
    let flags = compute_flags(inputs)?;
    if !flags.is_executable {
        return Ok(outputs
            .into_iter()
            .map(|t| t.map_or_else(Variable::undefined, |t| Variable::new(t, false)))
            .collect());
    }

    let grad_fn = ctor(flags)?;
    Ok(outputs
        .into_iter()
        .enumerate()
        .map(|(i, t)| t.map_or_else(Variable::undefined, |t| Variable::with_grad_fn(t, Arc::clone(&grad_fn), i)))
        .collect())
}

/// Checks arity: exactly `args` inputs, of which the first `required_args`
/// must be defined.
pub fn check_input_variables(name: &str, inputs: &[Variable], args: usize, required_args: usize) -> Result<()> {
    if inputs.len() != args {
        return Err(Error::InvalidArgument(format!(
            "{}: expected {} arguments (got {})",
            name,
            args,
            inputs.len()
        )));
    }
    if let Some(i) = inputs.iter().take(required_args).position(|v| !v.defined()) {
        return Err(Error::InvalidArgument(format!(
            "{}: expected a defined variable at argument {}",
            name, i
        )));
    }
    Ok(())
}

/// Extracts the single output of a one-output function.
pub(crate) fn single(mut outputs: Vec<Variable>, name: &str) -> Result<Variable> {
    if outputs.len() != 1 {
        return Err(Error::Internal {
            message: format!("{} returned {} outputs, expected 1", name, outputs.len()),
        });
    }
    Ok(outputs.remove(0))
}
