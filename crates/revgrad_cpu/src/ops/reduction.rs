use crate::Float;
use rayon::prelude::*;

/// Sums a contiguous tensor of shape `dims` over `dim`, writing the result with
/// that dimension removed.
pub fn sum_dim<T: Float>(input: &[T], dims: &[usize], dim: usize, out: &mut [T]) {
    let outer: usize = dims[..dim].iter().product();
    let reduced = dims[dim];
    let inner: usize = dims[dim + 1..].iter().product();
    debug_assert_eq!(out.len(), outer * inner);

    out.par_iter_mut().enumerate().for_each(|(i, o)| {
        let (outer_idx, inner_idx) = (i / inner.max(1), i % inner.max(1));
        let base = outer_idx * reduced * inner + inner_idx;
        let mut acc = T::ZERO;
        for r in 0..reduced {
            acc += input[base + r * inner];
        }
        *o = acc;
    });
}

/// Sums every row of a contiguous `[rows, cols]` matrix.
pub fn sum_rows<T: Float>(input: &[T], rows: usize, cols: usize, out: &mut [T]) {
    sum_dim(input, &[rows, cols], 1, out);
}
