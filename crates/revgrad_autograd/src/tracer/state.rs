use super::{
    graph::{TraceGraph, TraceNodeKind, TraceValueId, ValueType},
    TracingContext,
};
use crate::{Edge, Variable, VariableFlags, VariableId};
use dashmap::DashMap;
use revgrad_core::error::{Error, Result};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};

/// Inputs and outputs of a node whose backward must be evaluated as an opaque
/// subgraph when the trace is replayed.
#[derive(Clone, Debug)]
pub struct BackwardSubgraph {
    pub stage: usize,
    pub inputs: Vec<TraceValueId>,
    pub outputs: Vec<TraceValueId>,
}

#[derive(Default)]
struct StageRecord {
    input_flags: Vec<VariableFlags>,
    output_flags: Vec<VariableFlags>,
    output_edges: Vec<Option<Edge>>,
}

/// Everything recorded while tracing one function across its derivative stages.
pub struct TracingState {
    graph: Mutex<TraceGraph>,
    value_map: DashMap<VariableId, TraceValueId>,
    stages: Mutex<Vec<StageRecord>>,
    backward_subgraphs: Mutex<Vec<BackwardSubgraph>>,
    in_eval_subgraph: AtomicBool,
    active: AtomicBool,
}

impl TracingState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            graph: Mutex::new(TraceGraph::new()),
            value_map: DashMap::new(),
            stages: Mutex::new(vec![StageRecord::default()]),
            backward_subgraphs: Mutex::new(Vec::new()),
            in_eval_subgraph: AtomicBool::new(false),
            active: AtomicBool::new(false),
        })
    }

    pub fn graph(&self) -> Result<MutexGuard<'_, TraceGraph>> {
        self.graph.lock().map_err(|_| Error::Lock)
    }

    fn stages(&self) -> Result<MutexGuard<'_, Vec<StageRecord>>> {
        self.stages.lock().map_err(|_| Error::Lock)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn in_eval_subgraph(&self) -> bool {
        self.in_eval_subgraph.load(Ordering::Acquire)
    }

    pub fn set_in_eval_subgraph(&self, value: bool) {
        self.in_eval_subgraph.store(value, Ordering::Release);
    }

    /// Marks the trace as evaluating a backward subgraph until the guard drops.
    pub fn eval_subgraph_guard(&self) -> EvalSubgraphGuard<'_> {
        let prev = self.in_eval_subgraph.swap(true, Ordering::AcqRel);
        EvalSubgraphGuard { state: self, prev }
    }

    /// Registers `inputs` as graph inputs of the current stage and starts
    /// recording.
    pub fn enter(self: &Arc<Self>, inputs: &[Variable]) -> Result<TracingContext> {
        {
            let mut graph = self.graph()?;
            for input in inputs {
                let value = graph.add_input(input.opt_data().map(ValueType::of));
                if let Some(id) = input.id() {
                    self.value_map.insert(id, value);
                }
            }
            let stage = graph.stage();
            let mut stages = self.stages()?;
            stage_record(&mut stages, stage)?.input_flags = inputs.iter().map(VariableFlags::of).collect();
            log::debug!("tracer: entered stage {} with {} inputs", stage, inputs.len());
        }
        self.active.store(true, Ordering::Release);
        Ok(TracingContext::new(Arc::clone(self)))
    }

    /// Records the outputs of the current stage and stops recording.
    pub fn exit(&self, outputs: &[Variable]) -> Result<()> {
        let mut graph = self.graph()?;
        for output in outputs {
            let value = self.value_trace(&mut graph, output);
            graph.register_output(value);
        }
        let edges = outputs
            .iter()
            .map(Variable::gradient_edge)
            .collect::<Result<Vec<_>>>()?;

        let stage = graph.stage();
        let mut stages = self.stages()?;
        let record = stage_record(&mut stages, stage)?;
        record.output_flags = outputs.iter().map(VariableFlags::of).collect();
        record.output_edges = edges;
        self.active.store(false, Ordering::Release);
        log::debug!("tracer: exited stage {} with {} outputs", stage, outputs.len());
        Ok(())
    }

    /// Advances to the next derivative stage.
    pub fn next_stage(&self) -> Result<usize> {
        let stage = self.graph()?.advance_stage();
        self.stages()?.push(StageRecord::default());
        Ok(stage)
    }

    pub fn num_stages(&self) -> Result<usize> {
        Ok(self.graph()?.stage() + 1)
    }

    pub fn var_flags(&self, stage: usize) -> Result<(Vec<VariableFlags>, Vec<VariableFlags>)> {
        let stages = self.stages()?;
        let record = stages
            .get(stage)
            .ok_or_else(|| Error::Trace(format!("no flags recorded for stage {}", stage)))?;
        Ok((record.input_flags.clone(), record.output_flags.clone()))
    }

    pub fn output_edges(&self, stage: usize) -> Result<Vec<Option<Edge>>> {
        let stages = self.stages()?;
        stages
            .get(stage)
            .map(|r| r.output_edges.clone())
            .ok_or_else(|| Error::Trace(format!("no output edges recorded for stage {}", stage)))
    }

    pub fn backward_subgraphs(&self) -> Result<Vec<BackwardSubgraph>> {
        Ok(self.backward_subgraphs.lock().map_err(|_| Error::Lock)?.clone())
    }

    /// Trace value of `variable`, inserting a constant (or undefined) node for
    /// values produced outside the trace.
    pub(crate) fn value_trace(&self, graph: &mut TraceGraph, variable: &Variable) -> TraceValueId {
        let Some(id) = variable.id() else {
            let node = graph.add_node(TraceNodeKind::Undefined, Vec::new());
            return graph.add_node_output(node, None);
        };
        if let Some(value) = self.value_map.get(&id) {
            return *value;
        }
        let node = graph.add_node(TraceNodeKind::Constant, Vec::new());
        let value = graph.add_node_output(node, variable.opt_data().map(ValueType::of));
        self.value_map.insert(id, value);
        value
    }

    pub(crate) fn set_value_trace(&self, variable: &Variable, value: TraceValueId) {
        if let Some(id) = variable.id() {
            self.value_map.insert(id, value);
        }
    }

    pub fn lookup(&self, variable: &Variable) -> Option<TraceValueId> {
        variable.id().and_then(|id| self.value_map.get(&id).map(|v| *v))
    }

    pub(crate) fn record_backward_subgraph(&self, graph: &mut TraceGraph, inputs: &[Variable], outputs: &[Variable]) -> Result<()> {
        let record = BackwardSubgraph {
            stage: graph.stage(),
            inputs: inputs.iter().map(|v| self.value_trace(graph, v)).collect(),
            outputs: outputs.iter().map(|v| self.value_trace(graph, v)).collect(),
        };
        self.backward_subgraphs.lock().map_err(|_| Error::Lock)?.push(record);
        Ok(())
    }
}

fn stage_record(stages: &mut [StageRecord], stage: usize) -> Result<&mut StageRecord> {
    stages.get_mut(stage).ok_or_else(|| Error::Internal {
        message: format!("stage {} has no record", stage),
    })
}

pub struct EvalSubgraphGuard<'a> {
    state: &'a TracingState,
    prev: bool,
}

impl Drop for EvalSubgraphGuard<'_> {
    fn drop(&mut self) {
        self.state.set_in_eval_subgraph(self.prev);
    }
}
