//! Direct kernels for 2-D depthwise convolution.
//!
//! Input is `[batch, channels, h, w]`, weight is `[channels * multiplier, 1, kh, kw]`
//! and output channel `c * multiplier + j` reads only input channel `c`.

use crate::{nn::conv::ConvDims, Float};
use rayon::prelude::*;

#[inline]
fn multiplier(dims: &ConvDims) -> usize {
    dims.out_channels / dims.in_channels.max(1)
}

#[inline]
fn source(dims: &ConvDims, axis: usize, out: usize, k: usize) -> Option<usize> {
    let pos = (out * dims.stride[axis] + k * dims.dilation[axis]) as isize - dims.padding[axis] as isize;
    if pos < 0 || pos >= dims.in_spatial[axis] as isize {
        None
    } else {
        Some(pos as usize)
    }
}

pub fn depthwise_forward<T: Float>(input: &[T], weight: &[T], bias: Option<&[T]>, dims: &ConvDims, output: &mut [T]) {
    let (in_h, in_w) = (dims.in_spatial[0], dims.in_spatial[1]);
    let (out_h, out_w) = (dims.out_spatial[0], dims.out_spatial[1]);
    let (k_h, k_w) = (dims.kernel[0], dims.kernel[1]);
    let m = multiplier(dims);
    let plane = out_h * out_w;
    if plane == 0 {
        return;
    }

    output[..dims.batch * dims.out_channels * plane]
        .par_chunks_mut(plane)
        .enumerate()
        .for_each(|(idx, out)| {
            let (b, oc) = (idx / dims.out_channels, idx % dims.out_channels);
            let inp = &input[(b * dims.in_channels + oc / m) * in_h * in_w..][..in_h * in_w];
            let w = &weight[oc * k_h * k_w..][..k_h * k_w];
            let init = bias.map_or(T::ZERO, |bias| bias[oc]);

            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = init;
                    for ky in 0..k_h {
                        let Some(iy) = source(dims, 0, oy, ky) else { continue };
                        for kx in 0..k_w {
                            if let Some(ix) = source(dims, 1, ox, kx) {
                                acc += inp[iy * in_w + ix] * w[ky * k_w + kx];
                            }
                        }
                    }
                    out[oy * out_w + ox] = acc;
                }
            }
        });
}

pub fn depthwise_backward_input<T: Float>(grad_output: &[T], weight: &[T], dims: &ConvDims, grad_input: &mut [T]) {
    let (in_h, in_w) = (dims.in_spatial[0], dims.in_spatial[1]);
    let (out_h, out_w) = (dims.out_spatial[0], dims.out_spatial[1]);
    let (k_h, k_w) = (dims.kernel[0], dims.kernel[1]);
    let m = multiplier(dims);
    let plane = in_h * in_w;
    if plane == 0 {
        return;
    }

    grad_input[..dims.batch * dims.in_channels * plane]
        .par_chunks_mut(plane)
        .enumerate()
        .for_each(|(idx, gin)| {
            let (b, c) = (idx / dims.in_channels, idx % dims.in_channels);
            gin.fill(T::ZERO);
            for j in 0..m {
                let oc = c * m + j;
                let gout = &grad_output[(b * dims.out_channels + oc) * out_h * out_w..][..out_h * out_w];
                let w = &weight[oc * k_h * k_w..][..k_h * k_w];
                for oy in 0..out_h {
                    for ox in 0..out_w {
                        let g = gout[oy * out_w + ox];
                        for ky in 0..k_h {
                            let Some(iy) = source(dims, 0, oy, ky) else { continue };
                            for kx in 0..k_w {
                                if let Some(ix) = source(dims, 1, ox, kx) {
                                    gin[iy * in_w + ix] += g * w[ky * k_w + kx];
                                }
                            }
                        }
                    }
                }
            }
        });
}

pub fn depthwise_backward_weight<T: Float>(input: &[T], grad_output: &[T], dims: &ConvDims, grad_weight: &mut [T]) {
    let (in_h, in_w) = (dims.in_spatial[0], dims.in_spatial[1]);
    let (out_h, out_w) = (dims.out_spatial[0], dims.out_spatial[1]);
    let (k_h, k_w) = (dims.kernel[0], dims.kernel[1]);
    let m = multiplier(dims);
    let taps = k_h * k_w;
    if taps == 0 {
        return;
    }

    grad_weight[..dims.out_channels * taps]
        .par_chunks_mut(taps)
        .enumerate()
        .for_each(|(oc, gw)| {
            gw.fill(T::ZERO);
            for b in 0..dims.batch {
                let inp = &input[(b * dims.in_channels + oc / m) * in_h * in_w..][..in_h * in_w];
                let gout = &grad_output[(b * dims.out_channels + oc) * out_h * out_w..][..out_h * out_w];
                for ky in 0..k_h {
                    for kx in 0..k_w {
                        let mut acc = T::ZERO;
                        for oy in 0..out_h {
                            let Some(iy) = source(dims, 0, oy, ky) else { continue };
                            for ox in 0..out_w {
                                if let Some(ix) = source(dims, 1, ox, kx) {
                                    acc += inp[iy * in_w + ix] * gout[oy * out_w + ox];
                                }
                            }
                        }
                        gw[ky * k_w + kx] += acc;
                    }
                }
            }
        });
}
