#[inline]
pub fn is_contiguous(dims: &[usize], strides: &[usize]) -> bool {
    let mut acc = 1;
    for d in (0..dims.len()).rev() {
        if dims[d] > 1 && acc != strides[d] {
            return false;
        }
        acc *= dims[d];
    }
    true
}

/// Maps a row-major linear index over `dims` to a storage index under `strides`.
#[inline]
pub fn get_strided_index(idx: usize, dims: &[usize], strides: &[usize]) -> usize {
    let mut strided_i = 0;
    let mut remaining_idx = idx;

    for d in (0..dims.len()).rev() {
        strided_i += (remaining_idx % dims[d]) * strides[d];
        remaining_idx /= dims[d];
    }

    strided_i
}

/// Writes the row-major coordinates of `idx` into `coords`.
#[inline]
pub fn unravel_index(idx: usize, dims: &[usize], coords: &mut [usize]) {
    let mut remaining = idx;
    for d in (0..dims.len()).rev() {
        coords[d] = remaining % dims[d];
        remaining /= dims[d];
    }
}

#[inline]
pub fn ravel_index(coords: &[usize], dims: &[usize]) -> usize {
    coords.iter().zip(dims.iter()).fold(0, |acc, (&c, &d)| acc * d + c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strided_index_of_transposed_matrix() {
        // [2, 3] transposed to [3, 2] with strides [1, 3]
        let dims = [3, 2];
        let strides = [1, 3];
        let got: Vec<usize> = (0..6).map(|i| get_strided_index(i, &dims, &strides)).collect();
        assert_eq!(got, vec![0, 3, 1, 4, 2, 5]);
        assert!(!is_contiguous(&dims, &strides));
    }

    #[test]
    fn ravel_inverts_unravel() {
        let dims = [2, 3, 4];
        let mut coords = [0; 3];
        for idx in 0..24 {
            unravel_index(idx, &dims, &mut coords);
            assert_eq!(ravel_index(&coords, &dims), idx);
        }
    }
}
