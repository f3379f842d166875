use crate::Float;
use rayon::prelude::*;

/// `c[m, n] (+)= op(a)[m, k] * op(b)[k, n]` on contiguous row-major buffers.
///
/// With `trans_a` the buffer `a` holds a `[k, m]` matrix, with `trans_b` the
/// buffer `b` holds `[n, k]`. When `accumulate` is false `c` is overwritten.
#[allow(clippy::too_many_arguments)]
pub fn gemm<T: Float>(
    trans_a: bool,
    trans_b: bool,
    m: usize,
    n: usize,
    k: usize,
    a: &[T],
    b: &[T],
    c: &mut [T],
    accumulate: bool,
) {
    if m == 0 || n == 0 {
        return;
    }

    c[..m * n].par_chunks_mut(n).enumerate().for_each(|(i, c_row)| {
        for (j, out) in c_row.iter_mut().enumerate() {
            let mut acc = T::ZERO;
            for p in 0..k {
                let a_val = if trans_a { a[p * m + i] } else { a[i * k + p] };
                let b_val = if trans_b { b[j * k + p] } else { b[p * n + j] };
                acc += a_val * b_val;
            }
            if accumulate {
                *out += acc;
            } else {
                *out = acc;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transposed_operands() {
        // a = [[1, 2], [3, 4]], b = [[5, 6], [7, 8]]
        let a = [1.0f64, 2.0, 3.0, 4.0];
        let b = [5.0f64, 6.0, 7.0, 8.0];
        let mut c = [0.0f64; 4];

        gemm(false, false, 2, 2, 2, &a, &b, &mut c, false);
        assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);

        // a^T * b
        gemm(true, false, 2, 2, 2, &a, &b, &mut c, false);
        assert_eq!(c, [26.0, 30.0, 38.0, 44.0]);

        // accumulate a * b^T
        gemm(false, true, 2, 2, 2, &a, &b, &mut c, true);
        assert_eq!(c, [26.0 + 17.0, 30.0 + 23.0, 38.0 + 39.0, 44.0 + 53.0]);
    }
}
