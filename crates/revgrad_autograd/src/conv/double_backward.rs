use super::{conv, params::ConvParams, subvariable};
use crate::{
    check_input_variables,
    functions::{add_defined, cat, contiguous, expand, narrow, transpose, view},
    Function, FunctionMeta, SavedVariable, Variable,
};
use revgrad_core::error::{Error, Result};

/// Second-order backward of the convolution.
///
/// Takes the gradients of the three outputs of [`super::ConvBackward`]
/// (`ggI`, `ggW`, `ggb`) and returns gradients for its inputs
/// `(grad_output, input, weight)`.
pub struct ConvBackwardBackward {
    params: ConvParams,
    input: SavedVariable,
    weight: SavedVariable,
    bias: SavedVariable,
    grad_output: SavedVariable,
    meta: FunctionMeta,
}

impl ConvBackwardBackward {
    pub(crate) fn new(
        meta: FunctionMeta,
        params: ConvParams,
        input: &Variable,
        weight: &Variable,
        bias: &Variable,
        grad_output: &Variable,
    ) -> Result<Self> {
        Ok(Self {
            params,
            input: SavedVariable::new(input, false)?,
            weight: SavedVariable::new(weight, false)?,
            bias: SavedVariable::new(bias, false)?,
            grad_output: SavedVariable::new(grad_output, false)?,
            meta,
        })
    }

    /// `gW = conv(ggIᵀ, gOᵀ)ᵀ` with stride and dilation swapped, narrowed to
    /// the weight's spatial extent.
    fn grad_weight(&self, ggi: &Variable, grad_output: &Variable, weight: &Variable) -> Result<Variable> {
        let mut params = self.params.clone();
        let groups = params.groups;
        params.groups = 1;
        std::mem::swap(&mut params.stride, &mut params.dilation);

        let got = transpose(grad_output, 0, 1)?;
        let ggit = transpose(ggi, 0, 1)?;
        let undefined = Variable::undefined();

        let gwt = if groups == 1 {
            conv(&ggit, &got, &undefined, params)?
        } else {
            let parts = (0..groups)
                .map(|g| {
                    let ggit_g = subvariable(&ggit, 0, groups, g)?;
                    let got_g = subvariable(&got, 0, groups, g)?;
                    conv(&ggit_g, &got_g, &undefined, params.clone())
                })
                .collect::<Result<Vec<_>>>()?;
            cat(&parts, 1)?
        };

        let mut gw = transpose(&gwt, 0, 1)?;
        let weight_shape = weight.shape()?.to_vec();
        for (i, &extent) in weight_shape.iter().enumerate().skip(2) {
            if gw.shape()?[i] > extent {
                gw = narrow(&gw, i, 0, extent)?;
            }
        }
        Ok(gw)
    }

    /// `gI = convT(ggWᵀ, gOᵀ)ᵀ` with stride and dilation swapped and the
    /// output padding chosen so the transposed output matches the input.
    fn grad_input(&self, ggw: &Variable, grad_output: &Variable, input: &Variable, weight: &Variable) -> Result<Variable> {
        let mut params = self.params.clone();
        params.transposed = true;
        std::mem::swap(&mut params.stride, &mut params.dilation);

        let kernel = weight.shape()?[2..].to_vec();
        let input_shape = input.shape()?[2..].to_vec();
        let grad_output_shape = grad_output.shape()?[2..].to_vec();
        params.output_padding =
            output_padding_for(&params, &kernel, &input_shape, &grad_output_shape, params.output_padding.clone());

        let groups = params.groups;
        params.groups = 1;

        let ggwt = transpose(ggw, 0, 1)?;
        let got = transpose(grad_output, 0, 1)?;
        let undefined = Variable::undefined();

        let git = if groups == 1 {
            conv(&ggwt, &got, &undefined, params)?
        } else {
            let parts = (0..groups)
                .map(|g| {
                    let ggwt_g = subvariable(&ggwt, 1, groups, g)?;
                    let got_g = subvariable(&got, 0, groups, g)?;
                    conv(&ggwt_g, &got_g, &undefined, params.clone())
                })
                .collect::<Result<Vec<_>>>()?;
            cat(&parts, 0)?
        };
        transpose(&git, 0, 1)
    }
}

/// Output padding that makes the transposed-convolution size formula
/// reproduce `input` from `grad_output`.
///
/// `params` already has stride and dilation swapped; parameter vectors may be
/// longer than `kernel` when a 1-D problem was lifted to 2-D.
pub fn output_padding_for(
    params: &ConvParams,
    kernel: &[usize],
    input: &[usize],
    grad_output: &[usize],
    mut output_padding: Vec<i64>,
) -> Vec<i64> {
    let offset = params.stride.len() - kernel.len();
    for i in 0..kernel.len() {
        let j = i + offset;
        let expected = (kernel[i] as i64 - 1) * params.stride[j] as i64 - 2 * params.padding[j]
            + (params.dilation[j] as i64 * (grad_output[i] as i64 - 1) + 1);
        if expected != input[i] as i64 {
            output_padding[j] = input[i] as i64 - expected;
        }
    }
    output_padding
}

impl Function for ConvBackwardBackward {
    fn name(&self) -> String {
        "ConvBackwardBackward".to_string()
    }

    fn apply(&self, grad_grad_inputs: &[Variable]) -> Result<Vec<Variable>> {
        check_input_variables("ConvNdBackwardBackward", grad_grad_inputs, 3, 0)?;
        if self.params.transposed {
            return Err(Error::Unsupported(
                "ConvBackwardBackward does not support transposed convolution".to_string(),
            ));
        }

        let ggi = &grad_grad_inputs[0];
        let ggw = &grad_grad_inputs[1];
        let ggb = &grad_grad_inputs[2];

        let grad_output = self.grad_output.unpack(None)?;
        let weight = self.weight.unpack(None)?;
        let input = self.input.unpack(None)?;

        // ggO = conv(ggI, w) + conv(i, ggW) + ggb
        let mut ggo = Variable::undefined();
        let need_ggo = self.should_compute_output(0);
        if need_ggo && ggi.defined() {
            ggo = conv(ggi, &weight, &Variable::undefined(), self.params.clone())?;
        }
        if need_ggo && ggw.defined() {
            let term = conv(&input, ggw, &Variable::undefined(), self.params.clone())?;
            ggo = add_defined(ggo, term)?;
        }
        if need_ggo && ggb.defined() {
            let mut shape = vec![1; grad_output.shape()?.len()];
            shape[1] = ggb.shape()?[0];
            let ggb_view = view(&contiguous(ggb)?, &shape)?;
            let ggb_expanded = expand(&ggb_view, grad_output.shape()?)?;
            ggo = add_defined(ggo, ggb_expanded)?;
        }

        let gw = if self.should_compute_output(2) && ggi.defined() {
            self.grad_weight(ggi, &grad_output, &weight)?
        } else {
            Variable::undefined()
        };

        let gi = if self.should_compute_output(1) && ggw.defined() {
            self.grad_input(ggw, &grad_output, &input, &weight)?
        } else {
            Variable::undefined()
        };

        Ok(vec![ggo, gi, gw])
    }

    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn release_variables(&self) {
        self.input.release();
        self.weight.release();
        self.bias.release();
        self.grad_output.release();
    }

    fn saved_variables(&self) -> Option<Vec<&SavedVariable>> {
        Some(vec![&self.input, &self.weight, &self.bias, &self.grad_output])
    }
}
