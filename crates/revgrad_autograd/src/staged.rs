//! Adapter turning a compiled multi-stage subgraph into a graph node.
//!
//! Stage `k` of a compiled function computes its `k`-th derivative. Running a
//! stage produces the node for stage `k + 1`, so repeated backward passes walk
//! the stages in order.

use crate::{
    tracer::{TracingState, ValueType},
    Edge, Function, FunctionMeta, SavedVariable, Variable, VariableFlags,
};
use revgrad_core::error::{Error, Result};
use revgrad_tensor::Tensor;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

/// Executes compiled stages. Implementations keep whatever state flows from
/// one stage to the next.
pub trait StageInterpreter: Send + Sync {
    /// Runs the next stage. `None` inputs are absent values the stage was
    /// compiled without.
    fn run_one_stage(&mut self, inputs: &[Option<Tensor>]) -> Result<Vec<Tensor>>;

    /// Type of input `index` of the next stage, used to synthesise zeros.
    fn tensor_type_for_input(&self, index: usize) -> Result<ValueType>;

    fn box_clone(&self) -> Box<dyn StageInterpreter>;
}

/// Flags and wiring of one stage, recorded when the trace was compiled.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StageDetails {
    pub input_flags: Vec<VariableFlags>,
    pub output_flags: Vec<VariableFlags>,
    /// Whether each stage input is consumed by any traced node.
    pub used_inputs: Vec<bool>,
    /// Positions of edges of the previous node to carry over, for values a
    /// stage reuses from earlier stages.
    pub copied_next_fns: Vec<usize>,
}

pub struct StagedSubgraphOperator {
    interpreter: Mutex<Option<Box<dyn StageInterpreter>>>,
    stage_details: Arc<Vec<StageDetails>>,
    stage: usize,
    keep_graph: bool,
    used: AtomicBool,
    meta: FunctionMeta,
}

impl StagedSubgraphOperator {
    pub fn new(
        interpreter: Box<dyn StageInterpreter>,
        stage_details: Arc<Vec<StageDetails>>,
        stage: usize,
        keep_graph: bool,
        meta: FunctionMeta,
    ) -> Self {
        Self {
            interpreter: Mutex::new(Some(interpreter)),
            stage_details,
            stage,
            keep_graph,
            used: AtomicBool::new(false),
            meta,
        }
    }

    pub fn stage(&self) -> usize {
        self.stage
    }

    fn stage_inputs(&self, details: &StageDetails, inputs: &[Variable]) -> Result<Vec<Option<Tensor>>> {
        if inputs.len() != details.input_flags.len() {
            return Err(Error::StageMismatch(format!(
                "stage {} was compiled for {} inputs, got {}",
                self.stage,
                details.input_flags.len(),
                inputs.len()
            )));
        }

        let interpreter = self.interpreter.lock().map_err(|_| Error::Lock)?;
        let mut tensors = Vec::with_capacity(inputs.len());
        for (i, (input, traced)) in inputs.iter().zip(details.input_flags.iter()).enumerate() {
            let actual = VariableFlags::of(input);
            if !traced.defined && actual.defined {
                return Err(Error::StageMismatch(format!(
                    "received a defined input {}, but the trace was compiled with the input being undefined",
                    i
                )));
            }
            if !traced.requires_grad && actual.requires_grad {
                return Err(Error::StageMismatch(format!(
                    "received input {} with requires_grad=true, but the trace was compiled with requires_grad=false",
                    i
                )));
            }

            // undefined values stand for zeros; give the stage real ones when it expects them
            let tensor = match input.opt_data() {
                Some(data) => Some(data.clone()),
                None if traced.defined => {
                    let interpreter = interpreter.as_ref().ok_or(Error::BackwardTwice)?;
                    Some(zeros_of(&interpreter.tensor_type_for_input(i)?)?)
                },
                None => None,
            };
            tensors.push(tensor);
        }
        Ok(tensors)
    }

    fn take_interpreter(&self) -> Result<Box<dyn StageInterpreter>> {
        let mut slot = self.interpreter.lock().map_err(|_| Error::Lock)?;
        let interpreter = if self.keep_graph {
            slot.as_ref().map(|i| i.box_clone())
        } else {
            slot.take()
        };
        interpreter.ok_or(Error::BackwardTwice)
    }

    /// Node for the next stage, wired to the edges carried over from this
    /// node and to the producers of this stage's inputs.
    fn next_node(&self, interpreter: Box<dyn StageInterpreter>, inputs: &[Variable]) -> Result<Arc<dyn Function>> {
        let next_stage = self.stage + 1;
        let mut next_functions: Vec<Option<Edge>> = Vec::new();

        // past the compiled order the node can only report the error when applied
        if let Some(next_details) = self.stage_details.get(next_stage) {
            let details = &self.stage_details[self.stage];
            for &idx in &next_details.copied_next_fns {
                next_functions.push(self.meta.next_functions().get(idx).cloned().flatten());
            }
            for (i, input) in inputs.iter().enumerate() {
                if !details.used_inputs.get(i).copied().unwrap_or(true) {
                    continue;
                }
                if !details.input_flags[i].requires_grad {
                    continue;
                }
                if !input.defined() || !input.requires_grad() {
                    next_functions.push(None);
                    continue;
                }
                next_functions.push(input.gradient_edge()?);
            }
        }

        Ok(Arc::new(StagedSubgraphOperator::new(
            interpreter,
            Arc::clone(&self.stage_details),
            next_stage,
            self.keep_graph,
            FunctionMeta::with_next_functions(next_functions),
        )))
    }
}

fn zeros_of(ty: &ValueType) -> Result<Tensor> {
    match ty {
        ValueType::Tensor { shape, dtype, device } => Tensor::zeros_with_spec(shape, *device, *dtype),
        ValueType::Handle => Err(Error::StageMismatch(
            "cannot synthesise a zero value for a handle input".to_string(),
        )),
    }
}

impl Function for StagedSubgraphOperator {
    fn name(&self) -> String {
        format!("StagedSubgraph[{}]", self.stage)
    }

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        let num_stages = self.stage_details.len();
        if self.stage >= num_stages {
            return Err(Error::DerivativeOrderExceeded {
                compiled: num_stages.saturating_sub(1),
            });
        }
        if self.used.load(Ordering::Acquire) {
            return Err(Error::BackwardTwice);
        }
        if !self.keep_graph {
            self.used.store(true, Ordering::Release);
        }

        let details = &self.stage_details[self.stage];
        let tensors = self.stage_inputs(details, inputs)?;

        let mut interpreter = self.take_interpreter()?;
        log::debug!("staged subgraph: running stage {} with {} inputs", self.stage, tensors.len());
        let outputs = interpreter.run_one_stage(&tensors)?;
        if outputs.len() != details.output_flags.len() {
            return Err(Error::StageMismatch(format!(
                "stage {} was compiled for {} outputs, produced {}",
                self.stage,
                details.output_flags.len(),
                outputs.len()
            )));
        }

        let mut interpreter = Some(interpreter);
        let mut grad_fn: Option<Arc<dyn Function>> = None;
        let mut output_nr = 0;
        let mut result = Vec::with_capacity(outputs.len());
        for (output, flags) in outputs.into_iter().zip(details.output_flags.iter()) {
            if !flags.requires_grad {
                result.push(Variable::new(output, false));
                continue;
            }
            if grad_fn.is_none() {
                let interpreter = interpreter.take().ok_or_else(|| Error::Internal {
                    message: "stage interpreter consumed twice".to_string(),
                })?;
                grad_fn = Some(self.next_node(interpreter, inputs)?);
            }
            if let Some(grad_fn) = grad_fn.as_ref() {
                result.push(Variable::with_grad_fn(output, Arc::clone(grad_fn), output_nr));
                output_nr += 1;
            }
        }
        Ok(result)
    }

    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn saved_variables(&self) -> Option<Vec<&SavedVariable>> {
        Some(Vec::new())
    }

    fn passes_state_transparently(&self) -> bool {
        true
    }
}

/// Builds staged nodes for a finished trace.
pub struct StagedFunctionFactory {
    interpreter: Box<dyn StageInterpreter>,
    stage_details: Arc<Vec<StageDetails>>,
}

impl StagedFunctionFactory {
    pub fn new(state: &TracingState, interpreter: Box<dyn StageInterpreter>) -> Result<Self> {
        let graph = state.graph()?;
        let num_stages = graph.stage() + 1;
        let mut stage_details = Vec::with_capacity(num_stages);

        for stage in 0..num_stages {
            let (input_flags, output_flags) = state.var_flags(stage)?;
            let used_inputs = graph.stage_inputs(stage).map(|v| !v.uses.is_empty()).collect();

            let mut copied_next_fns = Vec::new();
            if stage >= 1 {
                let current = state.output_edges(stage)?;
                let previous = state.output_edges(stage - 1)?;
                for edge in current.iter().flatten() {
                    if let Some(pos) = previous.iter().position(|p| p.as_ref() == Some(edge)) {
                        copied_next_fns.push(pos);
                    }
                }
            }

            stage_details.push(StageDetails {
                input_flags,
                output_flags,
                used_inputs,
                copied_next_fns,
            });
        }

        Ok(Self::from_details(stage_details, interpreter))
    }

    pub fn from_details(stage_details: Vec<StageDetails>, interpreter: Box<dyn StageInterpreter>) -> Self {
        Self {
            interpreter,
            stage_details: Arc::new(stage_details),
        }
    }

    pub fn stage_details(&self) -> &[StageDetails] {
        &self.stage_details
    }

    /// Stage-0 node. With `keep_graph` each use clones the interpreter so the
    /// node can run again.
    pub fn construct(&self, keep_graph: bool) -> Arc<dyn Function> {
        Arc::new(StagedSubgraphOperator::new(
            self.interpreter.box_clone(),
            Arc::clone(&self.stage_details),
            0,
            keep_graph,
            FunctionMeta::forward(),
        ))
    }
}
