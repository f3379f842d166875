use crate::VariableFlags;
use revgrad_core::{device::Device, dtype::DType};
use revgrad_tensor::Tensor;
use std::collections::{HashMap, VecDeque};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceNodeId(pub usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceValueId(pub usize);

impl std::fmt::Display for TraceNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl std::fmt::Display for TraceValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TraceNodeKind {
    /// A graph input registered by `enter`.
    Input,
    /// A node the trace cannot look into; carries the node's name.
    Opaque(String),
    /// A value that was not produced inside the trace.
    Constant,
    Undefined,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValueType {
    Tensor {
        shape: Vec<usize>,
        dtype: DType,
        device: Device,
    },
    /// Context edge linking a forward node to the node evaluating its backward.
    Handle,
}

impl ValueType {
    pub fn of(tensor: &Tensor) -> Self {
        ValueType::Tensor {
            shape: tensor.shape().to_vec(),
            dtype: tensor.dtype(),
            device: tensor.device(),
        }
    }
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceValue {
    pub id: TraceValueId,
    pub node: TraceNodeId,
    pub offset: usize,
    pub stage: usize,
    pub ty: Option<ValueType>,
    /// `(node, input position)` pairs consuming this value.
    pub uses: Vec<(TraceNodeId, usize)>,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceNode {
    pub id: TraceNodeId,
    pub kind: TraceNodeKind,
    pub stage: usize,
    pub inputs: Vec<TraceValueId>,
    pub outputs: Vec<TraceValueId>,
    pub var_flags: Vec<VariableFlags>,
}

/// Static record of the operations executed while tracing.
///
/// Ids are indices into the node and value tables and never change.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceGraph {
    nodes: Vec<TraceNode>,
    values: Vec<TraceValue>,
    inputs: Vec<TraceValueId>,
    outputs: Vec<TraceValueId>,
    stage: usize,
}

impl TraceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> usize {
        self.stage
    }

    pub(crate) fn advance_stage(&mut self) -> usize {
        self.stage += 1;
        self.stage
    }

    pub fn nodes(&self) -> &[TraceNode] {
        &self.nodes
    }

    pub fn values(&self) -> &[TraceValue] {
        &self.values
    }

    pub fn node(&self, id: TraceNodeId) -> Option<&TraceNode> {
        self.nodes.get(id.0)
    }

    pub fn value(&self, id: TraceValueId) -> Option<&TraceValue> {
        self.values.get(id.0)
    }

    pub fn inputs(&self) -> &[TraceValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TraceValueId] {
        &self.outputs
    }

    pub fn add_node(&mut self, kind: TraceNodeKind, var_flags: Vec<VariableFlags>) -> TraceNodeId {
        let id = TraceNodeId(self.nodes.len());
        self.nodes.push(TraceNode {
            id,
            kind,
            stage: self.stage,
            inputs: Vec::new(),
            outputs: Vec::new(),
            var_flags,
        });
        id
    }

    pub fn add_node_input(&mut self, node: TraceNodeId, value: TraceValueId) {
        let position = self.nodes[node.0].inputs.len();
        self.nodes[node.0].inputs.push(value);
        self.values[value.0].uses.push((node, position));
    }

    pub fn add_node_output(&mut self, node: TraceNodeId, ty: Option<ValueType>) -> TraceValueId {
        let id = TraceValueId(self.values.len());
        let offset = self.nodes[node.0].outputs.len();
        self.values.push(TraceValue {
            id,
            node,
            offset,
            stage: self.stage,
            ty,
            uses: Vec::new(),
        });
        self.nodes[node.0].outputs.push(id);
        id
    }

    /// Adds a graph input at the current stage.
    pub fn add_input(&mut self, ty: Option<ValueType>) -> TraceValueId {
        let node = self.add_node(TraceNodeKind::Input, Vec::new());
        let value = self.add_node_output(node, ty);
        self.inputs.push(value);
        value
    }

    pub fn register_output(&mut self, value: TraceValueId) {
        self.outputs.push(value);
    }

    /// Graph inputs registered at `stage`, in registration order.
    pub fn stage_inputs(&self, stage: usize) -> impl Iterator<Item = &TraceValue> + '_ {
        self.inputs
            .iter()
            .map(|id| &self.values[id.0])
            .filter(move |v| v.stage == stage)
    }

    /// Kahn ordering of the nodes; empty if the graph has a cycle.
    pub fn topo_order(&self) -> Vec<TraceNodeId> {
        let mut in_degree: HashMap<TraceNodeId, usize> = self.nodes.iter().map(|n| (n.id, 0)).collect();
        for node in &self.nodes {
            for input in &node.inputs {
                if self.values[input.0].node != node.id {
                    *in_degree.entry(node.id).or_insert(0) += 1;
                }
            }
        }

        let mut queue: VecDeque<TraceNodeId> = self
            .nodes
            .iter()
            .filter(|n| in_degree.get(&n.id) == Some(&0))
            .map(|n| n.id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node_id) = queue.pop_front() {
            order.push(node_id);
            for output in &self.nodes[node_id.0].outputs {
                for (user, _) in &self.values[output.0].uses {
                    if *user == node_id {
                        continue;
                    }
                    if let Some(degree) = in_degree.get_mut(user) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(*user);
                        }
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            order.clear();
        }
        order
    }

    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> revgrad_core::error::Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| revgrad_core::error::Error::Trace(e.to_string()))
    }
}

impl std::fmt::Display for TraceGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let list = |ids: &[TraceValueId]| ids.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
        writeln!(f, "graph({}) {{", list(&self.inputs))?;
        for node in &self.nodes {
            let kind = match &node.kind {
                TraceNodeKind::Input => continue,
                TraceNodeKind::Opaque(name) => name.as_str(),
                TraceNodeKind::Constant => "Constant",
                TraceNodeKind::Undefined => "Undefined",
            };
            writeln!(
                f,
                "  {} = {}({}), stage {}",
                list(&node.outputs),
                kind,
                list(&node.inputs),
                node.stage
            )?;
        }
        writeln!(f, "  return ({})", list(&self.outputs))?;
        write!(f, "}}")
    }
}
