use crate::{accumulate::GradAccumulator, Function, Variable, VariableId};
use revgrad_core::error::{Error, Result};
use revgrad_tensor::{Tensor, VersionCounter};
use std::sync::{Arc, Mutex, Weak};

/// Forward-time snapshot of a [`Variable`] used by a node's backward.
///
/// Captures of a node's own outputs never hold that node: the caller supplies
/// it again on [`SavedVariable::unpack`].
#[derive(Debug, Default)]
pub struct SavedVariable {
    data: Mutex<Option<Tensor>>,
    version_counter: Option<VersionCounter>,
    expected_version: usize,
    requires_grad: bool,
    has_grad_fn: bool,
    output_nr: usize,
    grad_fn: Option<Arc<dyn Function>>,
    grad_accumulator: Weak<GradAccumulator>,
    id: Option<VariableId>,
}

impl SavedVariable {
    pub fn new(variable: &Variable, is_output: bool) -> Result<Self> {
        let Some(data) = variable.opt_data() else {
            return Ok(Self::default());
        };
        let grad_fn = variable.grad_fn();
        Ok(Self {
            data: Mutex::new(Some(data.clone())),
            version_counter: Some(data.version_counter().clone()),
            expected_version: data.version(),
            requires_grad: variable.requires_grad(),
            has_grad_fn: grad_fn.is_some(),
            output_nr: variable.output_nr(),
            grad_fn: if is_output { None } else { grad_fn },
            grad_accumulator: variable.weak_grad_accumulator()?,
            id: variable.id(),
        })
    }

    /// Whether the capture was taken from a defined variable.
    pub fn was_defined(&self) -> bool {
        self.version_counter.is_some()
    }

    pub fn id(&self) -> Option<VariableId> {
        self.id
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Rebuilds the captured variable.
    ///
    /// `saved_for` is the node to reattach when the capture was taken from that
    /// node's own output.
    pub fn unpack(&self, saved_for: Option<Arc<dyn Function>>) -> Result<Variable> {
        let data = self.data.lock().map_err(|_| Error::Lock)?.clone();
        let Some(data) = data else {
            if self.version_counter.is_some() {
                return Err(Error::BackwardTwice);
            }
            return Ok(Variable::undefined());
        };

        if let Some(counter) = self.version_counter.as_ref() {
            let current = counter.current();
            if current != self.expected_version {
                return Err(Error::ModifiedInplace {
                    expected: self.expected_version,
                    current,
                });
            }
        }

        let grad_fn = match (&self.grad_fn, saved_for) {
            (Some(grad_fn), _) => Some(Arc::clone(grad_fn)),
            (None, Some(saved_for)) if self.has_grad_fn => Some(saved_for),
            (None, None) if self.has_grad_fn => return Err(Error::MissingGradFn),
            _ => None,
        };

        if self.requires_grad && grad_fn.is_none() && self.grad_accumulator.strong_count() == 0 {
            return Err(Error::MissingGradAccumulator);
        }

        Ok(Variable::from_parts(
            self.id.unwrap_or_default(),
            data,
            self.requires_grad,
            grad_fn,
            self.output_nr,
            self.grad_accumulator.clone(),
        ))
    }

    /// Drops the payload; a later unpack reports a second backward.
    pub fn release(&self) {
        if let Ok(mut data) = self.data.lock() {
            *data = None;
        }
    }
}
