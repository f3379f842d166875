use crate::{check_input_variables, Function, FunctionMeta, Variable};
use revgrad_core::error::Result;

/// Sink node of a leaf that requires grad; sums every gradient it receives
/// into the leaf's `grad` slot.
pub struct GradAccumulator {
    variable: Variable,
    meta: FunctionMeta,
}

impl GradAccumulator {
    pub fn new(variable: Variable) -> Self {
        Self {
            variable,
            meta: FunctionMeta::new(Default::default()),
        }
    }

    pub fn variable(&self) -> &Variable {
        &self.variable
    }
}

impl Function for GradAccumulator {
    fn name(&self) -> String {
        "GradAccumulator".to_string()
    }

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        check_input_variables("GradAccumulator", inputs, 1, 0)?;
        if let Some(grad) = inputs[0].opt_data() {
            self.variable.accumulate_grad(grad)?;
        }
        Ok(Vec::new())
    }

    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn saved_variables(&self) -> Option<Vec<&crate::SavedVariable>> {
        Some(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revgrad_tensor::Tensor;
    use std::sync::Arc;

    #[test]
    fn sums_successive_gradients() -> Result<()> {
        let leaf = Variable::new(Tensor::zeros(&[3])?, true);
        let acc = leaf.grad_accumulator()?.expect("leaf requires grad");
        let grad = Variable::new(Tensor::ones(&[3])?, false);
        acc.apply(&[grad.clone()])?;
        acc.apply(&[grad])?;
        acc.apply(&[Variable::undefined()])?;

        assert_eq!(leaf.grad().expect("accumulated").to_vec_f64()?, vec![2.0; 3]);
        let again = leaf.grad_accumulator()?.expect("still alive");
        assert!(Arc::ptr_eq(&acc, &again));
        Ok(())
    }
}
