use crate::{buffer::with_dtype, Element, Tensor};
use revgrad_core::error::{Error, Result};

impl Tensor {
    /// Same storage under a new shape. Fails on non-contiguous layouts.
    pub fn view(&self, shape: &[usize]) -> Result<Self> {
        Ok(self.with_layout(self.layout.view(shape)?))
    }

    /// Like [`Tensor::view`], copying first when the layout is strided.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        self.contiguous()?.view(shape)
    }

    pub fn narrow(&self, dim: usize, start: usize, length: usize) -> Result<Self> {
        Ok(self.with_layout(self.layout.narrow(dim, start, length)?))
    }

    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        Ok(self.with_layout(self.layout.transpose(dim0, dim1)?))
    }

    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        Ok(self.with_layout(self.layout.unsqueeze(dim)?))
    }

    pub fn squeeze(&self, dim: usize) -> Result<Self> {
        Ok(self.with_layout(self.layout.squeeze(dim)?))
    }

    pub fn expand(&self, shape: &[usize]) -> Result<Self> {
        Ok(self.with_layout(self.layout.expand(shape)?))
    }

    /// Returns `self` when already contiguous, otherwise a packed copy on new storage.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        self.to_device(self.device())
    }

    pub fn cat(tensors: &[Tensor], dim: usize) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::InvalidArgument("cat expects a non-empty list of tensors".to_string()))?;
        if dim >= first.ndim() {
            return Err(Error::DimensionOutOfBounds { dim, ndim: first.ndim() });
        }

        let mut shape = first.shape().to_vec();
        shape[dim] = 0;
        for t in tensors {
            first.check_same_spec(t, "cat")?;
            let compatible = t.ndim() == first.ndim()
                && t.shape().iter().zip(first.shape()).enumerate().all(|(d, (a, b))| d == dim || a == b);
            if !compatible {
                return Err(Error::ShapeMismatch {
                    expected: first.shape().to_vec(),
                    got: t.shape().to_vec(),
                    msg: format!("cat along dimension {}", dim),
                });
            }
            shape[dim] += t.shape()[dim];
        }

        Ok(with_dtype!(first.dtype(), T => {
            Tensor::from_vec_with_device(cat_typed::<T>(tensors, dim, &shape)?, &shape, first.device())?
        }))
    }
}

fn cat_typed<T: Element>(tensors: &[Tensor], dim: usize, shape: &[usize]) -> Result<Vec<T>> {
    let outer: usize = shape[..dim].iter().product();
    let inner: usize = shape[dim + 1..].iter().product();
    let parts = tensors
        .iter()
        .map(|t| t.contiguous_vec::<T>())
        .collect::<Result<Vec<_>>>()?;

    let mut out = Vec::with_capacity(outer * shape[dim] * inner);
    for o in 0..outer {
        for (t, part) in tensors.iter().zip(parts.iter()) {
            let chunk = t.shape()[dim] * inner;
            out.extend_from_slice(&part[o * chunk..(o + 1) * chunk]);
        }
    }
    Ok(out)
}
