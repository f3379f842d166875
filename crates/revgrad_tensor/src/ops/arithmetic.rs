use crate::{buffer::with_dtype, Tensor};
use revgrad_core::error::{Error, Result};
use revgrad_cpu::{
    ops::{elementwise, reduction},
    Float,
};

impl Tensor {
    fn zip_with(&self, rhs: &Tensor, op: &str, f: fn(f64, f64) -> f64) -> Result<Tensor> {
        self.check_same_spec(rhs, op)?;
        if self.shape() != rhs.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().to_vec(),
                got: rhs.shape().to_vec(),
                msg: format!("{} requires operands of the same shape", op),
            });
        }

        let out = with_dtype!(self.dtype(), T => {
            let lhs = self.contiguous_vec::<T>()?;
            let rhs = rhs.contiguous_vec::<T>()?;
            let mut out = vec![T::ZERO; lhs.len()];
            elementwise::zip_map(&lhs, &rhs, &mut out, |a, b| T::from_f64(f(a.to_f64(), b.to_f64())));
            Tensor::from_vec_with_device(out, self.shape(), self.device())?
        });
        Ok(out)
    }

    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        self.zip_with(rhs, "add", |a, b| a + b)
    }

    pub fn sub(&self, rhs: &Tensor) -> Result<Tensor> {
        self.zip_with(rhs, "sub", |a, b| a - b)
    }

    pub fn mul_scalar(&self, scalar: f64) -> Result<Tensor> {
        let out = with_dtype!(self.dtype(), T => {
            let input = self.contiguous_vec::<T>()?;
            let mut out = vec![T::ZERO; input.len()];
            let s = T::from_f64(scalar);
            elementwise::map(&input, &mut out, |a| a * s);
            Tensor::from_vec_with_device(out, self.shape(), self.device())?
        });
        Ok(out)
    }

    /// Sums over `dim`, removing it from the shape.
    pub fn sum_dim(&self, dim: usize) -> Result<Tensor> {
        if dim >= self.ndim() {
            return Err(Error::DimensionOutOfBounds { dim, ndim: self.ndim() });
        }

        let mut shape = self.shape().to_vec();
        shape.remove(dim);
        let out = with_dtype!(self.dtype(), T => {
            let input = self.contiguous_vec::<T>()?;
            let mut out = vec![T::ZERO; shape.iter().product()];
            reduction::sum_dim(&input, self.shape(), dim, &mut out);
            Tensor::from_vec_with_device(out, &shape, self.device())?
        });
        Ok(out)
    }

    pub fn sum_all(&self) -> Result<f64> {
        Ok(self.to_vec_f64()?.iter().sum())
    }

    /// Reduces a broadcast result back to `shape`: sums the leading extra
    /// dimensions and every dimension that `shape` holds at size one.
    pub fn sum_to_shape(&self, shape: &[usize]) -> Result<Tensor> {
        if self.shape() == shape {
            return Ok(self.clone());
        }
        if !revgrad_core::layout::Layout::from_shape(shape).can_broadcast_to(self.shape()) {
            return Err(Error::IncompatibleShape(format!(
                "cannot sum shape {:?} down to {:?}",
                self.shape(),
                shape
            )));
        }

        let mut out = self.clone();
        for _ in 0..self.ndim() - shape.len() {
            out = out.sum_dim(0)?;
        }
        for (d, &size) in shape.iter().enumerate() {
            if size == 1 && out.shape()[d] != 1 {
                out = out.sum_dim(d)?.unsqueeze(d)?;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_to_shape_reduces_broadcast_dims() -> Result<()> {
        let x = Tensor::ones(&[2, 3, 4])?;
        let s = x.sum_to_shape(&[3, 1])?;
        assert_eq!(s.shape(), &[3, 1]);
        assert_eq!(s.to_flatten_vec::<f32>()?, vec![8.0; 3]);
        assert!(x.sum_to_shape(&[2, 4]).is_err());
        Ok(())
    }
}
