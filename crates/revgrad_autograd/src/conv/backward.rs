use super::{
    accelerated_engine, plan_for,
    params::{ConvParams, ConvStrategy},
    subtensor, ConvBackwardBackward, ConvolutionPlan,
};
use crate::{check_input_variables, wrap_outputs, Function, FunctionMeta, SavedVariable, Variable};
use revgrad_core::error::{Error, Result};
use revgrad_tensor::{compute_grad_bias, nn::ConvGrads, Columns, Tensor};
use std::sync::Arc;

/// First-order backward of [`super::ConvForward`].
///
/// Holds the forward inputs as captures, one scratch column buffer per group
/// and, when the accelerated path ran, the plan it chose.
pub struct ConvBackward {
    params: ConvParams,
    input: SavedVariable,
    weight: SavedVariable,
    bias: SavedVariable,
    columns: Vec<Columns>,
    plan: Option<Arc<ConvolutionPlan>>,
    meta: FunctionMeta,
}

impl ConvBackward {
    pub(crate) fn new(
        meta: FunctionMeta,
        params: ConvParams,
        input: &Variable,
        weight: &Variable,
        bias: &Variable,
        columns: Vec<Columns>,
        plan: Option<Arc<ConvolutionPlan>>,
    ) -> Result<Self> {
        Ok(Self {
            params,
            input: SavedVariable::new(input, false)?,
            weight: SavedVariable::new(weight, false)?,
            bias: SavedVariable::new(bias, false)?,
            columns,
            plan,
            meta,
        })
    }

    pub fn params(&self) -> &ConvParams {
        &self.params
    }

    pub fn plan(&self) -> Option<&Arc<ConvolutionPlan>> {
        self.plan.as_ref()
    }
}

impl Function for ConvBackward {
    fn name(&self) -> String {
        "ConvBackward".to_string()
    }

    fn apply(&self, grad_outputs: &[Variable]) -> Result<Vec<Variable>> {
        check_input_variables("ConvNdBackward", grad_outputs, 1, 0)?;
        self.params.check_padding()?;
        if !grad_outputs[0].defined() {
            return Ok(vec![Variable::undefined(), Variable::undefined(), Variable::undefined()]);
        }

        let input_var = self.input.unpack(None)?;
        let weight_var = self.weight.unpack(None)?;
        let bias_var = self.bias.unpack(None)?;

        let mut input = input_var.data()?.contiguous()?;
        let mut weight = weight_var.data()?.clone();
        let mut grad_output = grad_outputs[0].data()?.contiguous()?;

        let k = input.ndim();
        if k == 3 {
            input = input.unsqueeze(2)?;
            weight = weight.unsqueeze(2)?;
            grad_output = grad_output.unsqueeze(2)?;
        }

        let expected = self.params.output_size(input.shape(), weight.shape());
        if grad_output.shape() != expected.as_slice() {
            return Err(Error::ShapeMismatch {
                expected,
                got: grad_output.shape().to_vec(),
                msg: "ConvBackward grad_output must match the forward output".to_string(),
            });
        }

        let output_mask = [
            self.should_compute_output(0),
            self.should_compute_output(1),
            self.should_compute_output(2) && bias_var.defined(),
        ];

        let strategy = self.params.select_strategy(&input, &weight);
        log::debug!("ConvBackward: {:?} path, output mask {:?}", strategy, output_mask);

        let (mut grad_input, mut grad_weight, grad_bias) = match strategy {
            ConvStrategy::Depthwise => {
                let (grad_input, grad_weight) = if output_mask[0] || output_mask[1] {
                    input.depthwise_backward(
                        &grad_output,
                        &weight,
                        &self.params.geometry(),
                        [output_mask[0], output_mask[1]],
                    )?
                } else {
                    (None, None)
                };
                // depthwise kernels leave the bias to us
                let grad_bias = output_mask[2].then(|| compute_grad_bias(&grad_output)).transpose()?;
                (grad_input, grad_weight, grad_bias)
            },
            ConvStrategy::Accelerated => self.accelerated_backward(&input, &grad_output, &weight, output_mask)?,
            ConvStrategy::Generic => {
                generic_backward(&self.params, &input, &grad_output, &weight, &self.columns, output_mask)?
            },
        };

        if k == 3 {
            grad_input = grad_input.map(|g| g.squeeze(2)).transpose()?;
            grad_weight = grad_weight.map(|g| g.squeeze(2)).transpose()?;
        }

        // captures used outside the differentiable ops count as inputs of the next order
        let all_inputs = [grad_outputs[0].clone(), input_var.clone(), weight_var.clone()];
        wrap_outputs(&all_inputs, vec![grad_input, grad_weight, grad_bias], |flags| {
            let node = ConvBackwardBackward::new(
                FunctionMeta::new(flags),
                self.params.clone(),
                &input_var,
                &weight_var,
                &bias_var,
                &grad_outputs[0],
            )?;
            Ok(Arc::new(node) as Arc<dyn Function>)
        })
    }

    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn release_variables(&self) {
        self.input.release();
        self.weight.release();
        self.bias.release();
    }

    fn saved_variables(&self) -> Option<Vec<&SavedVariable>> {
        Some(vec![&self.input, &self.weight, &self.bias])
    }
}

impl ConvBackward {
    fn accelerated_backward(
        &self,
        input: &Tensor,
        grad_output: &Tensor,
        weight: &Tensor,
        output_mask: [bool; 3],
    ) -> Result<ConvGrads> {
        let engine = accelerated_engine(input)?;
        let plan = match self.plan.as_ref() {
            Some(plan) => Arc::clone(plan),
            None => plan_for(engine.as_ref(), &self.params, input, weight)?,
        };

        let grad_input = if !output_mask[0] {
            None
        } else if self.params.transposed {
            Some(engine.forward(&plan, grad_output, weight, None)?)
        } else {
            Some(engine.backward_data(&plan, grad_output, weight)?)
        };
        let grad_weight = if !output_mask[1] {
            None
        } else if self.params.transposed {
            Some(engine.backward_filter(&plan, input, grad_output)?)
        } else {
            Some(engine.backward_filter(&plan, grad_output, input)?)
        };
        let grad_bias = output_mask[2]
            .then(|| engine.backward_bias(&plan, grad_output))
            .transpose()?;
        Ok((grad_input, grad_weight, grad_bias))
    }
}

fn compute_backward(
    input: &Tensor,
    grad_output: &Tensor,
    weight: &Tensor,
    columns: &Columns,
    params: &ConvParams,
    output_mask: [bool; 3],
) -> Result<ConvGrads> {
    if !matches!(input.ndim(), 4 | 5) {
        return Err(Error::UnsupportedConvolution(
            "unsupported ConvNdBackward parameters".to_string(),
        ));
    }
    let geometry = params.geometry();
    if params.transposed {
        input.conv_transpose_backward(grad_output, weight, &geometry, columns, output_mask)
    } else {
        input.conv_backward(grad_output, weight, &geometry, columns, output_mask)
    }
}

fn generic_backward(
    params: &ConvParams,
    input: &Tensor,
    grad_output: &Tensor,
    weight: &Tensor,
    columns: &[Columns],
    output_mask: [bool; 3],
) -> Result<ConvGrads> {
    let groups = params.groups;
    if groups == 1 {
        return compute_backward(input, grad_output, weight, &columns[0], params, output_mask);
    }

    let mut grad_inputs = Vec::with_capacity(groups);
    let mut grad_weights = Vec::with_capacity(groups);
    let mut grad_biases = Vec::with_capacity(groups);
    for g in 0..groups {
        log::trace!("ConvBackward: group {}/{}", g + 1, groups);
        let input_g = subtensor(input, 1, groups, g)?;
        let grad_output_g = subtensor(grad_output, 1, groups, g)?;
        let weight_g = subtensor(weight, 0, groups, g)?;
        let (gi, gw, gb) = compute_backward(&input_g, &grad_output_g, &weight_g, &columns[g], params, output_mask)?;
        grad_inputs.extend(gi);
        grad_weights.extend(gw);
        grad_biases.extend(gb);
    }

    let cat_if = |needed: bool, parts: Vec<Tensor>, dim: usize| -> Result<Option<Tensor>> {
        if needed {
            Tensor::cat(&parts, dim).map(Some)
        } else {
            Ok(None)
        }
    };
    Ok((
        cat_if(output_mask[0], grad_inputs, 1)?,
        cat_if(output_mask[1], grad_weights, 0)?,
        cat_if(output_mask[2], grad_biases, 0)?,
    ))
}
