//! im2col based convolution over any number of spatial dimensions.
//!
//! Every kernel here computes a single group. Grouped and transposed
//! convolution are composed on top by the callers.

use crate::{
    nn::gemm::gemm,
    utils::unravel_index,
    Float,
};
use rayon::prelude::*;

/// Shape parameters of one single-group convolution.
///
/// `in_spatial` and `out_spatial` are both explicit: a transposed convolution
/// with a large output padding runs these kernels with an output extent that the
/// usual size formula would not reproduce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvDims {
    pub batch: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub in_spatial: Vec<usize>,
    pub out_spatial: Vec<usize>,
    pub kernel: Vec<usize>,
    pub stride: Vec<usize>,
    pub padding: Vec<usize>,
    pub dilation: Vec<usize>,
}

impl ConvDims {
    pub fn spatial_dims(&self) -> usize {
        self.kernel.len()
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel.iter().product()
    }

    pub fn in_size(&self) -> usize {
        self.in_spatial.iter().product()
    }

    pub fn out_size(&self) -> usize {
        self.out_spatial.iter().product()
    }

    /// Length of the scratch buffer the im2col kernels need for one batch element.
    pub fn columns_len(&self) -> usize {
        self.in_channels * self.kernel_size() * self.out_size()
    }

    #[inline]
    fn input_index(&self, out_coords: &[usize], kernel_coords: &[usize]) -> Option<usize> {
        let mut idx = 0;
        for d in 0..self.spatial_dims() {
            let pos = (out_coords[d] * self.stride[d] + kernel_coords[d] * self.dilation[d]) as isize
                - self.padding[d] as isize;
            if pos < 0 || pos >= self.in_spatial[d] as isize {
                return None;
            }
            idx = idx * self.in_spatial[d] + pos as usize;
        }
        Some(idx)
    }
}

/// Unfolds one batch element `[in_channels, in_spatial..]` into
/// `[in_channels * kernel_size, out_size]` columns.
pub fn im2col<T: Float>(input: &[T], dims: &ConvDims, columns: &mut [T]) {
    let kernel_size = dims.kernel_size();
    let out_size = dims.out_size();
    let nd = dims.spatial_dims();
    if out_size == 0 {
        return;
    }

    columns[..dims.columns_len()]
        .par_chunks_mut(out_size)
        .enumerate()
        .for_each(|(row, col_row)| {
            let channel = row / kernel_size;
            let channel_base = channel * dims.in_size();
            let mut kernel_coords = vec![0; nd];
            let mut out_coords = vec![0; nd];
            unravel_index(row % kernel_size, &dims.kernel, &mut kernel_coords);

            for (l, col) in col_row.iter_mut().enumerate() {
                unravel_index(l, &dims.out_spatial, &mut out_coords);
                *col = match dims.input_index(&out_coords, &kernel_coords) {
                    Some(idx) => input[channel_base + idx],
                    None => T::ZERO,
                };
            }
        });
}

/// Folds columns back into one batch element, summing overlapping windows.
pub fn col2im<T: Float>(columns: &[T], dims: &ConvDims, output: &mut [T]) {
    let kernel_size = dims.kernel_size();
    let out_size = dims.out_size();
    let in_size = dims.in_size();
    let nd = dims.spatial_dims();

    output[..dims.in_channels * in_size].fill(T::ZERO);
    if in_size == 0 {
        return;
    }

    output[..dims.in_channels * in_size]
        .par_chunks_mut(in_size)
        .enumerate()
        .for_each(|(channel, plane)| {
            let mut kernel_coords = vec![0; nd];
            let mut out_coords = vec![0; nd];
            for k in 0..kernel_size {
                unravel_index(k, &dims.kernel, &mut kernel_coords);
                let row = &columns[(channel * kernel_size + k) * out_size..][..out_size];
                for (l, &value) in row.iter().enumerate() {
                    unravel_index(l, &dims.out_spatial, &mut out_coords);
                    if let Some(idx) = dims.input_index(&out_coords, &kernel_coords) {
                        plane[idx] += value;
                    }
                }
            }
        });
}

/// `output[n, out_channels, out..] = weight * im2col(input[n]) + bias`.
///
/// `weight` is `[out_channels, in_channels, kernel..]`, `columns` is a scratch
/// buffer of at least [`ConvDims::columns_len`] elements.
pub fn conv_forward<T: Float>(
    input: &[T],
    weight: &[T],
    bias: Option<&[T]>,
    dims: &ConvDims,
    columns: &mut [T],
    output: &mut [T],
) {
    let in_stride = dims.in_channels * dims.in_size();
    let out_size = dims.out_size();
    let out_stride = dims.out_channels * out_size;
    let k = dims.in_channels * dims.kernel_size();

    for b in 0..dims.batch {
        im2col(&input[b * in_stride..][..in_stride], dims, columns);
        let out = &mut output[b * out_stride..][..out_stride];
        gemm(false, false, dims.out_channels, out_size, k, weight, columns, out, false);

        if let Some(bias) = bias {
            out.par_chunks_mut(out_size.max(1))
                .zip(bias.par_iter())
                .for_each(|(plane, &bv)| plane.iter_mut().for_each(|v| *v += bv));
        }
    }
}

/// Gradient of [`conv_forward`] with respect to its input.
pub fn conv_backward_input<T: Float>(
    grad_output: &[T],
    weight: &[T],
    dims: &ConvDims,
    columns: &mut [T],
    grad_input: &mut [T],
) {
    let in_stride = dims.in_channels * dims.in_size();
    let out_size = dims.out_size();
    let out_stride = dims.out_channels * out_size;
    let k = dims.in_channels * dims.kernel_size();

    for b in 0..dims.batch {
        gemm(
            true,
            false,
            k,
            out_size,
            dims.out_channels,
            weight,
            &grad_output[b * out_stride..][..out_stride],
            columns,
            false,
        );
        col2im(columns, dims, &mut grad_input[b * in_stride..][..in_stride]);
    }
}

/// Gradient of [`conv_forward`] with respect to its weight, summed over the batch.
pub fn conv_backward_weight<T: Float>(
    input: &[T],
    grad_output: &[T],
    dims: &ConvDims,
    columns: &mut [T],
    grad_weight: &mut [T],
) {
    let in_stride = dims.in_channels * dims.in_size();
    let out_size = dims.out_size();
    let out_stride = dims.out_channels * out_size;
    let k = dims.in_channels * dims.kernel_size();

    grad_weight[..dims.out_channels * k].fill(T::ZERO);
    for b in 0..dims.batch {
        im2col(&input[b * in_stride..][..in_stride], dims, columns);
        gemm(
            false,
            true,
            dims.out_channels,
            k,
            out_size,
            &grad_output[b * out_stride..][..out_stride],
            columns,
            grad_weight,
            true,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn dims_1x1x4x4() -> ConvDims {
        ConvDims {
            batch: 1,
            in_channels: 1,
            out_channels: 1,
            in_spatial: vec![4, 4],
            out_spatial: vec![2, 2],
            kernel: vec![2, 2],
            stride: vec![2, 2],
            padding: vec![0, 0],
            dilation: vec![1, 1],
        }
    }

    #[test]
    fn forward_sums_non_overlapping_windows() {
        let dims = dims_1x1x4x4();
        let input: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let weight = vec![1.0f32; 4];
        let mut columns = vec![0.0f32; dims.columns_len()];
        let mut output = vec![0.0f32; 4];

        conv_forward(&input, &weight, Some(&[0.5]), &dims, &mut columns, &mut output);
        assert_eq!(output, vec![10.5, 18.5, 42.5, 50.5]);
    }

    #[test]
    fn backward_input_is_adjoint_of_forward() {
        let dims = ConvDims {
            batch: 2,
            in_channels: 2,
            out_channels: 3,
            in_spatial: vec![5, 4],
            out_spatial: vec![3, 2],
            kernel: vec![3, 2],
            stride: vec![2, 1],
            padding: vec![1, 0],
            dilation: vec![1, 2],
        };
        let x: Vec<f64> = (0..2 * 2 * 20).map(|v| ((v * 7) % 11) as f64 - 5.0).collect();
        let w: Vec<f64> = (0..3 * 2 * 6).map(|v| ((v * 5) % 7) as f64 - 3.0).collect();
        let g: Vec<f64> = (0..2 * 3 * 6).map(|v| ((v * 3) % 5) as f64 - 2.0).collect();
        let mut columns = vec![0.0; dims.columns_len()];

        let mut y = vec![0.0; g.len()];
        conv_forward(&x, &w, None, &dims, &mut columns, &mut y);
        let mut gx = vec![0.0; x.len()];
        conv_backward_input(&g, &w, &dims, &mut columns, &mut gx);
        let mut gw = vec![0.0; w.len()];
        conv_backward_weight(&x, &g, &dims, &mut columns, &mut gw);

        let dot = |a: &[f64], b: &[f64]| a.iter().zip(b).map(|(p, q)| p * q).sum::<f64>();
        assert_relative_eq!(dot(&y, &g), dot(&x, &gx), epsilon = 1e-9);
        assert_relative_eq!(dot(&y, &g), dot(&w, &gw), epsilon = 1e-9);
    }
}
