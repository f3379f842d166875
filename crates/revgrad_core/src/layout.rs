use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    pub fn new(shape: &[usize], strides: &[usize], offset: usize) -> Self {
        Self {
            shape: shape.to_vec(),
            strides: strides.to_vec(),
            offset,
        }
    }

    pub fn from_shape(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            strides: Self::compute_strides(shape),
            offset: 0,
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }
    pub fn dim_size(&self, dim: usize) -> Option<usize> {
        self.shape.get(dim).copied()
    }
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_contiguous(&self) -> bool {
        let mut acc = 1;
        for d in (0..self.ndim()).rev() {
            if self.shape[d] > 1 && self.strides[d] != acc {
                return false;
            }
            acc *= self.shape[d];
        }
        true
    }

    fn check_dim(&self, dim: usize) -> Result<()> {
        if dim >= self.ndim() {
            return Err(Error::DimensionOutOfBounds { dim, ndim: self.ndim() });
        }
        Ok(())
    }

    /// Reinterprets a contiguous layout with a new shape of the same size.
    pub fn view(&self, new_shape: &[usize]) -> Result<Self> {
        let old_size = self.size();
        let new_size: usize = new_shape.iter().product();

        if old_size != new_size {
            return Err(Error::IncompatibleShape(format!(
                "Cannot view layout of size {} as shape {:?} (size {})",
                old_size, new_shape, new_size
            )));
        }
        if !self.is_contiguous() {
            return Err(Error::IncompatibleShape(format!(
                "view of shape {:?} requires a contiguous layout, got strides {:?}",
                new_shape, self.strides
            )));
        }

        Ok(Self {
            shape: new_shape.to_vec(),
            strides: Self::compute_strides(new_shape),
            offset: self.offset,
        })
    }

    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        self.check_dim(dim0)?;
        self.check_dim(dim1)?;

        let mut out = self.clone();
        out.shape.swap(dim0, dim1);
        out.strides.swap(dim0, dim1);
        Ok(out)
    }

    pub fn narrow(&self, dim: usize, start: usize, length: usize) -> Result<Self> {
        self.check_dim(dim)?;
        if start + length > self.shape[dim] {
            return Err(Error::InvalidArgument(format!(
                "narrow range {}..{} out of bounds for dimension {} with size {}",
                start,
                start + length,
                dim,
                self.shape[dim]
            )));
        }

        let mut out = self.clone();
        out.shape[dim] = length;
        out.offset += start * self.strides[dim];
        Ok(out)
    }

    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        if dim > self.ndim() {
            return Err(Error::DimensionOutOfBounds {
                dim,
                ndim: self.ndim() + 1,
            });
        }

        let stride = if dim < self.ndim() {
            self.strides[dim] * self.shape[dim]
        } else {
            1
        };
        let mut out = self.clone();
        out.shape.insert(dim, 1);
        out.strides.insert(dim, stride);
        Ok(out)
    }

    pub fn squeeze(&self, dim: usize) -> Result<Self> {
        self.check_dim(dim)?;
        if self.shape[dim] != 1 {
            return Err(Error::InvalidShape {
                message: format!("cannot squeeze dimension {} of size {}", dim, self.shape[dim]),
            });
        }

        let mut out = self.clone();
        out.shape.remove(dim);
        out.strides.remove(dim);
        Ok(out)
    }

    /// Broadcasts to `target`, giving expanded dimensions a zero stride.
    pub fn expand(&self, target: &[usize]) -> Result<Self> {
        if target.len() < self.ndim() {
            return Err(Error::IncompatibleShape(format!(
                "cannot expand shape {:?} to lower rank shape {:?}",
                self.shape, target
            )));
        }

        let rank_diff = target.len() - self.ndim();
        let mut strides = vec![0; target.len()];
        for (i, &size) in target.iter().enumerate() {
            if i < rank_diff {
                continue;
            }
            let src = self.shape[i - rank_diff];
            if src == size {
                strides[i] = self.strides[i - rank_diff];
            } else if src != 1 {
                return Err(Error::IncompatibleShape(format!(
                    "cannot expand shape {:?} to {:?}: dimension {} has size {} (expected 1 or {})",
                    self.shape, target, i, src, size
                )));
            }
        }

        Ok(Self {
            shape: target.to_vec(),
            strides,
            offset: self.offset,
        })
    }

    // helper

    pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
        if shape.is_empty() {
            return vec![];
        }

        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len() - 1).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    pub fn compute_size(shape: &[usize]) -> usize {
        shape.iter().product()
    }

    pub fn can_broadcast_to(&self, target: &[usize]) -> bool {
        if target.len() < self.shape.len() {
            return false;
        }
        let rank_diff = target.len() - self.shape.len();
        self.shape
            .iter()
            .zip(target[rank_diff..].iter())
            .all(|(&a, &b)| a == b || a == 1)
    }
}
