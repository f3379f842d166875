use super::{
    accelerated_engine, add_channel_bias,
    params::{check_input_shape_forward, ConvParams, ConvStrategy},
    plan_for, subtensor, ConvBackward, ConvolutionPlan,
};
use crate::{check_input_variables, wrap_outputs, Function, FunctionMeta, SavedVariable, Variable};
use revgrad_core::error::{Error, Result};
use revgrad_tensor::{Columns, Tensor};
use std::sync::Arc;

/// Forward convolution node.
///
/// Inputs are `(input, weight, bias)`, with `bias` allowed to be undefined.
pub struct ConvForward {
    params: ConvParams,
    meta: FunctionMeta,
}

impl ConvForward {
    pub fn new(params: ConvParams) -> Self {
        Self {
            params,
            meta: FunctionMeta::forward(),
        }
    }

    pub fn params(&self) -> &ConvParams {
        &self.params
    }
}

impl Function for ConvForward {
    fn name(&self) -> String {
        "ConvForward".to_string()
    }

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        check_input_variables("ConvNd", inputs, 3, 2)?;
        self.params.check_padding()?;

        let mut params = self.params.clone();
        let mut input = inputs[0].data()?.contiguous()?;
        let mut weight = inputs[1].data()?.clone();
        let bias = inputs[2].opt_data().cloned();

        check_input_shape_forward(&input, &weight, bias.as_ref(), params.groups, params.transposed)?;

        let k = input.ndim();
        if k == 3 {
            params.view1d_as_2d();
            input = input.unsqueeze(2)?;
            weight = weight.unsqueeze(2)?;
        }

        let columns: Vec<Columns> = (0..params.groups).map(|_| Columns::new()).collect();
        let mut plan = None;
        let strategy = params.select_strategy(&input, &weight);
        log::debug!(
            "ConvForward: {:?} path for input {:?}, weight {:?}, groups {}",
            strategy,
            input.shape(),
            weight.shape(),
            params.groups
        );

        let mut output = match strategy {
            ConvStrategy::Depthwise => input.depthwise_forward(&weight, bias.as_ref(), &params.geometry())?,
            ConvStrategy::Accelerated => {
                let (output, chosen) = accelerated_forward(&params, &input, &weight, bias.as_ref())?;
                plan = Some(chosen);
                output
            },
            ConvStrategy::Generic => generic_forward(&params, &input, &weight, bias.as_ref(), &columns)?,
        };

        if k == 3 {
            output = output.squeeze(2)?;
        }

        wrap_outputs(inputs, vec![Some(output)], |flags| {
            let backward = ConvBackward::new(
                FunctionMeta::new(flags),
                params,
                &inputs[0],
                &inputs[1],
                &inputs[2],
                columns,
                plan,
            )?;
            Ok(Arc::new(backward) as Arc<dyn Function>)
        })
    }

    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn saved_variables(&self) -> Option<Vec<&SavedVariable>> {
        Some(Vec::new())
    }
}

fn compute_output(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    columns: &Columns,
    params: &ConvParams,
) -> Result<Tensor> {
    if !matches!(input.ndim(), 4 | 5) {
        return Err(Error::UnsupportedConvolution("unsupported ConvNd parameters".to_string()));
    }
    let geometry = params.geometry();
    if params.transposed {
        input.conv_transpose_forward(weight, bias, &geometry, columns)
    } else {
        input.conv_forward(weight, bias, &geometry, columns)
    }
}

/// Reference semantics: one single-group call per channel slice, concatenated
/// along the channel dimension.
pub(crate) fn generic_forward(
    params: &ConvParams,
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    columns: &[Columns],
) -> Result<Tensor> {
    let groups = params.groups;
    if groups == 1 {
        return compute_output(input, weight, bias, &columns[0], params);
    }

    let outputs = (0..groups)
        .map(|g| {
            log::trace!("ConvForward: group {}/{}", g + 1, groups);
            let input_g = subtensor(input, 1, groups, g)?;
            let weight_g = subtensor(weight, 0, groups, g)?;
            let bias_g = bias.map(|b| subtensor(b, 0, groups, g)).transpose()?;
            compute_output(&input_g, &weight_g, bias_g.as_ref(), &columns[g], params)
        })
        .collect::<Result<Vec<_>>>()?;
    Tensor::cat(&outputs, 1)
}

fn accelerated_forward(
    params: &ConvParams,
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
) -> Result<(Tensor, Arc<ConvolutionPlan>)> {
    let engine = accelerated_engine(input)?;
    let plan = plan_for(engine.as_ref(), params, input, weight)?;
    let output = if params.transposed {
        // transposed convolution swaps the forward and backward-data roles
        let output = engine.backward_data(&plan, input, weight)?;
        add_channel_bias(output, bias)?
    } else {
        engine.forward(&plan, input, weight, bias)?
    };
    Ok((output, plan))
}
