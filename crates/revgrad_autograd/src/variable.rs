use crate::{accumulate::GradAccumulator, function::Edge, Function};
use revgrad_core::error::{Error, Result};
use revgrad_tensor::Tensor;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, Weak,
};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VariableId(pub usize);
static VARIABLE_COUNTER: AtomicUsize = AtomicUsize::new(1);
#[inline]
fn next_variable_id() -> VariableId {
    VariableId(VARIABLE_COUNTER.fetch_add(1, Ordering::Relaxed))
}

struct VariableInner {
    id: VariableId,
    data: Tensor,
    requires_grad: bool,
    grad_fn: Option<Arc<dyn Function>>,
    output_nr: usize,
    grad_accumulator: Mutex<Weak<GradAccumulator>>,
    grad: Mutex<Option<Tensor>>,
}

/// A tensor plus the lineage needed to differentiate through it.
///
/// A variable is exactly one of: a leaf that does not require grad, a leaf that
/// requires grad (gradients arrive through its lazily created
/// [`GradAccumulator`]), or a non-leaf with a producing node. The default value
/// is undefined and stands for an absent tensor or a structurally zero gradient.
#[derive(Clone, Default)]
pub struct Variable {
    inner: Option<Arc<VariableInner>>,
}

impl Variable {
    pub fn undefined() -> Self {
        Self::default()
    }

    /// A leaf variable.
    pub fn new(data: Tensor, requires_grad: bool) -> Self {
        Self::from_parts(next_variable_id(), data, requires_grad, None, 0, Weak::new())
    }

    /// Output `output_nr` of `grad_fn`.
    pub fn with_grad_fn(data: Tensor, grad_fn: Arc<dyn Function>, output_nr: usize) -> Self {
        Self::from_parts(next_variable_id(), data, true, Some(grad_fn), output_nr, Weak::new())
    }

    pub(crate) fn from_parts(
        id: VariableId,
        data: Tensor,
        requires_grad: bool,
        grad_fn: Option<Arc<dyn Function>>,
        output_nr: usize,
        grad_accumulator: Weak<GradAccumulator>,
    ) -> Self {
        Self {
            inner: Some(Arc::new(VariableInner {
                id,
                data,
                requires_grad: requires_grad || grad_fn.is_some(),
                grad_fn,
                output_nr,
                grad_accumulator: Mutex::new(grad_accumulator),
                grad: Mutex::new(None),
            })),
        }
    }

    fn inner(&self) -> Result<&VariableInner> {
        self.inner
            .as_deref()
            .ok_or_else(|| Error::InvalidArgument("operation on an undefined variable".to_string()))
    }

    pub fn defined(&self) -> bool {
        self.inner.is_some()
    }

    pub fn id(&self) -> Option<VariableId> {
        self.inner.as_ref().map(|i| i.id)
    }

    pub fn data(&self) -> Result<&Tensor> {
        Ok(&self.inner()?.data)
    }

    pub fn opt_data(&self) -> Option<&Tensor> {
        self.inner.as_ref().map(|i| &i.data)
    }

    pub fn shape(&self) -> Result<&[usize]> {
        Ok(self.data()?.shape())
    }

    pub fn requires_grad(&self) -> bool {
        self.inner.as_ref().is_some_and(|i| i.requires_grad)
    }

    pub fn is_leaf(&self) -> bool {
        self.inner.as_ref().map_or(true, |i| i.grad_fn.is_none())
    }

    pub fn grad_fn(&self) -> Option<Arc<dyn Function>> {
        self.inner.as_ref().and_then(|i| i.grad_fn.clone())
    }

    pub fn output_nr(&self) -> usize {
        self.inner.as_ref().map_or(0, |i| i.output_nr)
    }

    pub fn version(&self) -> usize {
        self.inner.as_ref().map_or(0, |i| i.data.version())
    }

    /// The accumulator of a leaf that requires grad, created on first use.
    ///
    /// The variable only keeps a weak reference; graph edges keep it alive.
    pub fn grad_accumulator(&self) -> Result<Option<Arc<GradAccumulator>>> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(None);
        };
        if inner.grad_fn.is_some() || !inner.requires_grad {
            return Ok(None);
        }

        let mut slot = inner.grad_accumulator.lock().map_err(|_| Error::Lock)?;
        if let Some(existing) = slot.upgrade() {
            return Ok(Some(existing));
        }
        let created = Arc::new(GradAccumulator::new(self.clone()));
        *slot = Arc::downgrade(&created);
        Ok(Some(created))
    }

    pub(crate) fn weak_grad_accumulator(&self) -> Result<Weak<GradAccumulator>> {
        match self.inner.as_ref() {
            Some(inner) => Ok(inner.grad_accumulator.lock().map_err(|_| Error::Lock)?.clone()),
            None => Ok(Weak::new()),
        }
    }

    /// Where gradients for this variable flow: its producing node, or its
    /// accumulator when it is a differentiable leaf.
    pub fn gradient_edge(&self) -> Result<Option<Edge>> {
        if !self.requires_grad() {
            return Ok(None);
        }
        if let Some(grad_fn) = self.grad_fn() {
            return Ok(Some(Edge::new(grad_fn, self.output_nr())));
        }
        Ok(self
            .grad_accumulator()?
            .map(|acc| Edge::new(acc as Arc<dyn Function>, 0)))
    }

    pub fn grad(&self) -> Option<Tensor> {
        self.inner
            .as_ref()
            .and_then(|i| i.grad.lock().ok().and_then(|g| g.clone()))
    }

    pub fn zero_grad(&self) -> Result<()> {
        *self.inner()?.grad.lock().map_err(|_| Error::Lock)? = None;
        Ok(())
    }

    pub(crate) fn accumulate_grad(&self, incoming: &Tensor) -> Result<()> {
        let mut slot = self.inner()?.grad.lock().map_err(|_| Error::Lock)?;
        let updated = match slot.as_ref() {
            Some(existing) => existing.add(incoming)?,
            None => incoming.to_device(incoming.device())?,
        };
        *slot = Some(updated);
        Ok(())
    }

    /// Same data, cut from the graph.
    pub fn detach(&self) -> Variable {
        match self.inner.as_ref() {
            Some(inner) => Variable::new(inner.data.clone(), false),
            None => Variable::undefined(),
        }
    }

    pub fn same_variable(&self, other: &Variable) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.as_ref() {
            None => f.write_str("Variable(undefined)"),
            Some(inner) => f
                .debug_struct("Variable")
                .field("id", &inner.id)
                .field("data", &inner.data)
                .field("requires_grad", &inner.requires_grad)
                .field("grad_fn", &inner.grad_fn.as_ref().map(|g| g.name()))
                .field("output_nr", &inner.output_nr)
                .finish(),
        }
    }
}

/// Definedness and differentiability of a value, as recorded by traces and
/// checked by staged subgraphs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VariableFlags {
    pub requires_grad: bool,
    pub is_volatile: bool,
    pub defined: bool,
}

impl VariableFlags {
    pub fn of(variable: &Variable) -> Self {
        Self {
            requires_grad: variable.requires_grad(),
            is_volatile: !crate::grad_mode::is_grad_enabled(),
            defined: variable.defined(),
        }
    }
}
