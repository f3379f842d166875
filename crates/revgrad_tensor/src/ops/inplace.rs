use crate::{buffer::with_dtype, Element, Expansion, Tensor};
use revgrad_core::error::{Error, Result};
use revgrad_cpu::{
    ops::elementwise::{assign_strided, fill_strided},
    Float,
};

impl Tensor {
    fn check_writable(&self) -> Result<()> {
        let aliased = self.shape().iter().zip(self.strides()).any(|(&size, &stride)| size > 1 && stride == 0);
        if aliased {
            return Err(Error::InvalidArgument(format!(
                "in-place write into an expanded view of shape {:?} with strides {:?}",
                self.shape(),
                self.strides()
            )));
        }
        Ok(())
    }

    /// Writes row-major `values` through this view and bumps the version counter.
    fn write_values<T: Element>(&self, values: &[T]) -> Result<()> {
        {
            let mut guard = self.write_buffer()?;
            let got = guard.dtype();
            let data = T::slice_mut(&mut guard).ok_or(Error::DTypeMismatch {
                expected: T::DTYPE,
                got,
            })?;
            assign_strided(data, self.shape(), self.strides(), self.offset(), values);
        }
        self.version_counter().bump();
        Ok(())
    }

    pub fn fill_(&self, value: f64) -> Result<()> {
        self.check_writable()?;
        with_dtype!(self.dtype(), T => {
            let mut guard = self.write_buffer()?;
            let got = guard.dtype();
            let data = T::slice_mut(&mut guard).ok_or(Error::DTypeMismatch { expected: T::DTYPE, got })?;
            fill_strided(data, self.shape(), self.strides(), self.offset(), T::from_f64(value));
        });
        self.version_counter().bump();
        Ok(())
    }

    /// `self += other`, broadcasting `other` to the shape of `self`.
    pub fn add_(&self, other: &Tensor) -> Result<()> {
        self.check_writable()?;
        self.check_same_spec(other, "add_")?;
        let other = other.expand(self.shape())?;

        with_dtype!(self.dtype(), T => {
            let mut values = self.contiguous_vec::<T>()?;
            let rhs = other.contiguous_vec::<T>()?;
            values.iter_mut().zip(rhs).for_each(|(v, r)| *v += r);
            self.write_values(&values)?;
        });
        Ok(())
    }

    /// Copies `src` into `self`, converting dtype.
    ///
    /// `src` is broadcast to the shape of `self` when possible. Otherwise the
    /// unexpanded operand is copied element by element, which requires equal
    /// element counts.
    pub fn copy_(&self, src: &Tensor) -> Result<()> {
        self.check_writable()?;
        let src = match src.try_expand_as(self) {
            Expansion::Expanded(t) => t,
            Expansion::NotExpanded => {
                log::warn!(
                    "copy_: cannot broadcast {:?} to {:?}, copying the unexpanded source",
                    src.shape(),
                    self.shape()
                );
                if src.size() != self.size() {
                    return Err(Error::ShapeMismatch {
                        expected: self.shape().to_vec(),
                        got: src.shape().to_vec(),
                        msg: "copy_ source has a different number of elements".to_string(),
                    });
                }
                src.clone()
            }
        };

        with_dtype!(self.dtype(), T => {
            let values = src.to_flatten_vec::<T>()?;
            self.write_values(&values)?;
        });
        Ok(())
    }
}
