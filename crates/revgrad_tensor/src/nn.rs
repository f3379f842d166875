//! Convolution kernel entry points.
//!
//! Each entry point computes one group on tensors of 2 or 3 spatial dimensions.
//! Grouping, transposition of the autograd parameters and strategy selection
//! happen in the caller.

use crate::{
    buffer::{with_dtype, Buffer},
    Element, Tensor,
};
use revgrad_core::error::{Error, Result};
use revgrad_cpu::{
    nn::{conv, depthwise, ConvDims},
    Float,
};
use std::sync::Mutex;

/// Non-negative spatial parameters of a convolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConvGeometry {
    pub stride: Vec<usize>,
    pub padding: Vec<usize>,
    pub dilation: Vec<usize>,
    pub output_padding: Vec<usize>,
}

impl ConvGeometry {
    pub fn spatial_dims(&self) -> usize {
        self.stride.len()
    }

    fn check(&self, spatial: usize) -> Result<()> {
        let lens = [
            self.stride.len(),
            self.padding.len(),
            self.dilation.len(),
            self.output_padding.len(),
        ];
        if lens.iter().any(|&l| l != spatial) {
            return Err(Error::InvalidArgument(format!(
                "expected {} spatial parameters, got stride {:?}, padding {:?}, dilation {:?}, output_padding {:?}",
                spatial, self.stride, self.padding, self.dilation, self.output_padding
            )));
        }
        if self.stride.iter().chain(self.dilation.iter()).any(|&v| v == 0) {
            return Err(Error::InvalidArgument(format!(
                "stride {:?} and dilation {:?} must be positive",
                self.stride, self.dilation
            )));
        }
        Ok(())
    }

    /// Spatial extent of the output for an input extent and kernel extent.
    pub fn output_spatial(&self, input: &[usize], kernel: &[usize], transposed: bool) -> Result<Vec<usize>> {
        (0..input.len())
            .map(|d| {
                let dilated_kernel = (self.dilation[d] * (kernel[d].max(1) - 1) + 1) as isize;
                let (i, s, p) = (input[d] as isize, self.stride[d] as isize, self.padding[d] as isize);
                let out = if transposed {
                    (i - 1) * s - 2 * p + dilated_kernel + self.output_padding[d] as isize
                } else {
                    let span = i + 2 * p - dilated_kernel;
                    if span < 0 {
                        0
                    } else {
                        span / s + 1
                    }
                };
                if out <= 0 {
                    return Err(Error::InvalidShape {
                        message: format!(
                            "calculated output size is not positive for input {:?}, kernel {:?}, stride {:?}, padding {:?}, dilation {:?}",
                            input, kernel, self.stride, self.padding, self.dilation
                        ),
                    });
                }
                Ok(out as usize)
            })
            .collect()
    }
}

/// Scratch column buffer reused across calls of one convolution group.
#[derive(Debug, Default)]
pub struct Columns {
    buffer: Mutex<Option<Buffer>>,
}

impl Columns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Elements currently allocated.
    pub fn capacity(&self) -> usize {
        self.buffer
            .lock()
            .map(|b| b.as_ref().map_or(0, Buffer::len))
            .unwrap_or(0)
    }

    fn with<T: Element, R>(&self, len: usize, f: impl FnOnce(&mut [T]) -> R) -> Result<R> {
        let mut guard = self.buffer.lock().map_err(|_| Error::Lock)?;
        let reusable = matches!(guard.as_ref(), Some(b) if b.dtype() == T::DTYPE && b.len() >= len);
        if !reusable {
            *guard = Some(Buffer::zeros(len, T::DTYPE));
        }
        let buffer = guard.as_mut().ok_or_else(|| Error::Internal {
            message: "column buffer missing after allocation".to_string(),
        })?;
        let got = buffer.dtype();
        let slice = T::slice_mut(buffer).ok_or(Error::DTypeMismatch {
            expected: T::DTYPE,
            got,
        })?;
        Ok(f(slice))
    }
}

fn check_conv_inputs(input: &Tensor, weight: &Tensor, op: &str) -> Result<usize> {
    input.check_same_spec(weight, op)?;
    let nd = input.ndim();
    if nd != 4 && nd != 5 {
        return Err(Error::UnsupportedConvolution(format!(
            "{} expects 4-D or 5-D input, got shape {:?}",
            op,
            input.shape()
        )));
    }
    if weight.ndim() != nd {
        return Err(Error::ShapeMismatch {
            expected: vec![nd],
            got: vec![weight.ndim()],
            msg: format!("{} weight rank", op),
        });
    }
    Ok(nd - 2)
}

fn dims_for(
    batch: usize,
    in_channels: usize,
    out_channels: usize,
    in_spatial: &[usize],
    out_spatial: &[usize],
    kernel: &[usize],
    geometry: &ConvGeometry,
) -> ConvDims {
    ConvDims {
        batch,
        in_channels,
        out_channels,
        in_spatial: in_spatial.to_vec(),
        out_spatial: out_spatial.to_vec(),
        kernel: kernel.to_vec(),
        stride: geometry.stride.clone(),
        padding: geometry.padding.clone(),
        dilation: geometry.dilation.clone(),
    }
}

fn with_bias<T: Element>(mut output: Vec<T>, bias: Option<Vec<T>>, plane: usize) -> Vec<T> {
    if let Some(bias) = bias {
        for (chunk, &b) in output.chunks_mut(plane.max(1)).zip(bias.iter().cycle()) {
            chunk.iter_mut().for_each(|v| *v += b);
        }
    }
    output
}

/// Sums `grad_output` over every dimension but the channel dimension.
pub fn compute_grad_bias(grad_output: &Tensor) -> Result<Tensor> {
    let transposed = grad_output.transpose(0, 1)?.contiguous()?;
    let channels = transposed.shape()[0];
    let rest = transposed.size() / channels.max(1);
    transposed.view(&[channels, rest])?.sum_dim(1)
}

pub type ConvGrads = (Option<Tensor>, Option<Tensor>, Option<Tensor>);

impl Tensor {
    /// Single-group convolution of `self` `[N, C, ..]` with `weight` `[O, C, k..]`.
    pub fn conv_forward(
        &self,
        weight: &Tensor,
        bias: Option<&Tensor>,
        geometry: &ConvGeometry,
        columns: &Columns,
    ) -> Result<Tensor> {
        let spatial = check_conv_inputs(self, weight, "conv_forward")?;
        geometry.check(spatial)?;
        let (n, c) = (self.shape()[0], self.shape()[1]);
        let o = weight.shape()[0];
        if weight.shape()[1] != c {
            return Err(Error::ShapeMismatch {
                expected: vec![o, c],
                got: weight.shape()[..2].to_vec(),
                msg: "conv_forward weight channels".to_string(),
            });
        }

        let kernel = &weight.shape()[2..];
        let out_spatial = geometry.output_spatial(&self.shape()[2..], kernel, false)?;
        let dims = dims_for(n, c, o, &self.shape()[2..], &out_spatial, kernel, geometry);

        let mut out_shape = vec![n, o];
        out_shape.extend_from_slice(&out_spatial);
        let out = with_dtype!(self.dtype(), T => {
            let input = self.contiguous_vec::<T>()?;
            let w = weight.contiguous_vec::<T>()?;
            let b = bias.map(|b| b.contiguous_vec::<T>()).transpose()?;
            let mut output = vec![T::ZERO; out_shape.iter().product()];
            columns.with::<T, _>(dims.columns_len(), |cols| {
                conv::conv_forward(&input, &w, b.as_deref(), &dims, cols, &mut output)
            })?;
            Tensor::from_vec_with_device(output, &out_shape, self.device())?
        });
        Ok(out)
    }

    /// Gradients of [`Tensor::conv_forward`] selected by `output_mask`
    /// (input, weight, bias).
    pub fn conv_backward(
        &self,
        grad_output: &Tensor,
        weight: &Tensor,
        geometry: &ConvGeometry,
        columns: &Columns,
        output_mask: [bool; 3],
    ) -> Result<ConvGrads> {
        let spatial = check_conv_inputs(self, weight, "conv_backward")?;
        geometry.check(spatial)?;
        let (n, c) = (self.shape()[0], self.shape()[1]);
        let o = weight.shape()[0];
        let dims = dims_for(
            n,
            c,
            o,
            &self.shape()[2..],
            &grad_output.shape()[2..],
            &weight.shape()[2..],
            geometry,
        );

        let (grad_input, grad_weight) = with_dtype!(self.dtype(), T => {
            let gout = grad_output.contiguous_vec::<T>()?;
            let w = weight.contiguous_vec::<T>()?;
            let grad_input = if output_mask[0] {
                let mut gin = vec![T::ZERO; self.size()];
                columns.with::<T, _>(dims.columns_len(), |cols| {
                    conv::conv_backward_input(&gout, &w, &dims, cols, &mut gin)
                })?;
                Some(Tensor::from_vec_with_device(gin, self.shape(), self.device())?)
            } else {
                None
            };
            let grad_weight = if output_mask[1] {
                let input = self.contiguous_vec::<T>()?;
                let mut gw = vec![T::ZERO; weight.size()];
                columns.with::<T, _>(dims.columns_len(), |cols| {
                    conv::conv_backward_weight(&input, &gout, &dims, cols, &mut gw)
                })?;
                Some(Tensor::from_vec_with_device(gw, weight.shape(), self.device())?)
            } else {
                None
            };
            (grad_input, grad_weight)
        });

        let grad_bias = output_mask[2].then(|| compute_grad_bias(grad_output)).transpose()?;
        Ok((grad_input, grad_weight, grad_bias))
    }

    /// Single-group transposed convolution of `self` `[N, C, ..]` with
    /// `weight` `[C, O, k..]`.
    pub fn conv_transpose_forward(
        &self,
        weight: &Tensor,
        bias: Option<&Tensor>,
        geometry: &ConvGeometry,
        columns: &Columns,
    ) -> Result<Tensor> {
        let spatial = check_conv_inputs(self, weight, "conv_transpose_forward")?;
        geometry.check(spatial)?;
        let (n, c) = (self.shape()[0], self.shape()[1]);
        let o = weight.shape()[1];
        if weight.shape()[0] != c {
            return Err(Error::ShapeMismatch {
                expected: vec![c, o],
                got: weight.shape()[..2].to_vec(),
                msg: "conv_transpose_forward weight channels".to_string(),
            });
        }

        let kernel = &weight.shape()[2..];
        let out_spatial = geometry.output_spatial(&self.shape()[2..], kernel, true)?;
        // the transposed op is the input gradient of a convolution from `out_spatial` back to ours
        let dims = dims_for(n, o, c, &out_spatial, &self.shape()[2..], kernel, geometry);

        let mut out_shape = vec![n, o];
        out_shape.extend_from_slice(&out_spatial);
        let plane: usize = out_spatial.iter().product();
        let out = with_dtype!(self.dtype(), T => {
            let input = self.contiguous_vec::<T>()?;
            let w = weight.contiguous_vec::<T>()?;
            let b = bias.map(|b| b.contiguous_vec::<T>()).transpose()?;
            let mut output = vec![T::ZERO; out_shape.iter().product()];
            columns.with::<T, _>(dims.columns_len(), |cols| {
                conv::conv_backward_input(&input, &w, &dims, cols, &mut output)
            })?;
            Tensor::from_vec_with_device(with_bias(output, b, plane), &out_shape, self.device())?
        });
        Ok(out)
    }

    pub fn conv_transpose_backward(
        &self,
        grad_output: &Tensor,
        weight: &Tensor,
        geometry: &ConvGeometry,
        columns: &Columns,
        output_mask: [bool; 3],
    ) -> Result<ConvGrads> {
        let spatial = check_conv_inputs(self, weight, "conv_transpose_backward")?;
        geometry.check(spatial)?;
        let (n, c) = (self.shape()[0], self.shape()[1]);
        let o = weight.shape()[1];
        let dims = dims_for(
            n,
            o,
            c,
            &grad_output.shape()[2..],
            &self.shape()[2..],
            &weight.shape()[2..],
            geometry,
        );

        let (grad_input, grad_weight) = with_dtype!(self.dtype(), T => {
            let gout = grad_output.contiguous_vec::<T>()?;
            let grad_input = if output_mask[0] {
                let w = weight.contiguous_vec::<T>()?;
                let mut gin = vec![T::ZERO; self.size()];
                columns.with::<T, _>(dims.columns_len(), |cols| {
                    conv::conv_forward(&gout, &w, None, &dims, cols, &mut gin)
                })?;
                Some(Tensor::from_vec_with_device(gin, self.shape(), self.device())?)
            } else {
                None
            };
            let grad_weight = if output_mask[1] {
                let input = self.contiguous_vec::<T>()?;
                let mut gw = vec![T::ZERO; weight.size()];
                columns.with::<T, _>(dims.columns_len(), |cols| {
                    conv::conv_backward_weight(&gout, &input, &dims, cols, &mut gw)
                })?;
                Some(Tensor::from_vec_with_device(gw, weight.shape(), self.device())?)
            } else {
                None
            };
            (grad_input, grad_weight)
        });

        let grad_bias = output_mask[2].then(|| compute_grad_bias(grad_output)).transpose()?;
        Ok((grad_input, grad_weight, grad_bias))
    }

    /// 2-D depthwise convolution with weight `[C * m, 1, kh, kw]`.
    pub fn depthwise_forward(&self, weight: &Tensor, bias: Option<&Tensor>, geometry: &ConvGeometry) -> Result<Tensor> {
        let dims = depthwise_dims(self, weight, geometry)?;
        let mut out_shape = vec![dims.batch, dims.out_channels];
        out_shape.extend_from_slice(&dims.out_spatial);

        let out = with_dtype!(self.dtype(), T => {
            let input = self.contiguous_vec::<T>()?;
            let w = weight.contiguous_vec::<T>()?;
            let b = bias.map(|b| b.contiguous_vec::<T>()).transpose()?;
            let mut output = vec![T::ZERO; out_shape.iter().product()];
            depthwise::depthwise_forward(&input, &w, b.as_deref(), &dims, &mut output);
            Tensor::from_vec_with_device(output, &out_shape, self.device())?
        });
        Ok(out)
    }

    /// Input and weight gradients of [`Tensor::depthwise_forward`].
    pub fn depthwise_backward(
        &self,
        grad_output: &Tensor,
        weight: &Tensor,
        geometry: &ConvGeometry,
        output_mask: [bool; 2],
    ) -> Result<(Option<Tensor>, Option<Tensor>)> {
        let dims = depthwise_dims(self, weight, geometry)?;
        let grads = with_dtype!(self.dtype(), T => {
            let gout = grad_output.contiguous_vec::<T>()?;
            let grad_input = if output_mask[0] {
                let w = weight.contiguous_vec::<T>()?;
                let mut gin = vec![T::ZERO; self.size()];
                depthwise::depthwise_backward_input(&gout, &w, &dims, &mut gin);
                Some(Tensor::from_vec_with_device(gin, self.shape(), self.device())?)
            } else {
                None
            };
            let grad_weight = if output_mask[1] {
                let input = self.contiguous_vec::<T>()?;
                let mut gw = vec![T::ZERO; weight.size()];
                depthwise::depthwise_backward_weight(&input, &gout, &dims, &mut gw);
                Some(Tensor::from_vec_with_device(gw, weight.shape(), self.device())?)
            } else {
                None
            };
            (grad_input, grad_weight)
        });
        Ok(grads)
    }
}

fn depthwise_dims(input: &Tensor, weight: &Tensor, geometry: &ConvGeometry) -> Result<ConvDims> {
    input.check_same_spec(weight, "depthwise")?;
    if input.ndim() != 4 || weight.ndim() != 4 || weight.shape()[1] != 1 {
        return Err(Error::UnsupportedConvolution(format!(
            "depthwise convolution expects 4-D input and [C * m, 1, kh, kw] weight, got {:?} and {:?}",
            input.shape(),
            weight.shape()
        )));
    }
    geometry.check(2)?;
    let (n, c) = (input.shape()[0], input.shape()[1]);
    let o = weight.shape()[0];
    if c == 0 || o % c != 0 {
        return Err(Error::UnsupportedConvolution(format!(
            "depthwise output channels {} must be a multiple of input channels {}",
            o, c
        )));
    }

    let kernel = &weight.shape()[2..];
    let out_spatial = geometry.output_spatial(&input.shape()[2..], kernel, false)?;
    Ok(dims_for(n, c, o, &input.shape()[2..], &out_spatial, kernel, geometry))
}
