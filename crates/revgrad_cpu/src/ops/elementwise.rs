use crate::{
    utils::{get_strided_index, is_contiguous},
    Float,
};
use rayon::prelude::*;

/// Gathers a strided view of `src` into the contiguous buffer `dst`.
pub fn strided_copy<T: Float>(src: &[T], dims: &[usize], strides: &[usize], offset: usize, dst: &mut [T]) {
    if is_contiguous(dims, strides) {
        let n = dst.len();
        dst.copy_from_slice(&src[offset..offset + n]);
        return;
    }

    dst.par_iter_mut().enumerate().for_each(|(i, out)| {
        *out = src[offset + get_strided_index(i, dims, strides)];
    });
}

/// Scatters the contiguous buffer `src` into a strided view of `dst`.
///
/// The view must not alias itself (no zero strides), which holds for every
/// layout an in-place write can target.
pub fn assign_strided<T: Float>(dst: &mut [T], dims: &[usize], strides: &[usize], offset: usize, src: &[T]) {
    if is_contiguous(dims, strides) {
        dst[offset..offset + src.len()].copy_from_slice(src);
        return;
    }

    for (i, &value) in src.iter().enumerate() {
        dst[offset + get_strided_index(i, dims, strides)] = value;
    }
}

pub fn fill_strided<T: Float>(dst: &mut [T], dims: &[usize], strides: &[usize], offset: usize, value: T) {
    let num_els: usize = dims.iter().product();
    if is_contiguous(dims, strides) {
        dst[offset..offset + num_els].fill(value);
        return;
    }

    for i in 0..num_els {
        dst[offset + get_strided_index(i, dims, strides)] = value;
    }
}

pub fn zip_map<T: Float>(lhs: &[T], rhs: &[T], out: &mut [T], f: impl Fn(T, T) -> T + Sync) {
    out.par_iter_mut()
        .zip(lhs.par_iter().zip(rhs.par_iter()))
        .for_each(|(o, (&a, &b))| *o = f(a, b));
}

pub fn map<T: Float>(input: &[T], out: &mut [T], f: impl Fn(T) -> T + Sync) {
    out.par_iter_mut()
        .zip(input.par_iter())
        .for_each(|(o, &a)| *o = f(a));
}

pub fn add_assign<T: Float>(dst: &mut [T], src: &[T]) {
    dst.par_iter_mut().zip(src.par_iter()).for_each(|(d, &s)| *d += s);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strided_copy_gathers_transposed_view() {
        let src: Vec<f32> = (0..6).map(|v| v as f32).collect();
        let mut dst = vec![0.0f32; 6];
        strided_copy(&src, &[3, 2], &[1, 3], 0, &mut dst);
        assert_eq!(dst, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn assign_strided_writes_narrowed_columns() {
        let mut dst = vec![0.0f64; 6];
        // column 1..3 of a [2, 3] matrix
        assign_strided(&mut dst, &[2, 2], &[3, 1], 1, &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(dst, vec![0.0, 1.0, 2.0, 0.0, 3.0, 4.0]);
    }
}
