use crate::{buffer::with_dtype, Element, Tensor};
use revgrad_core::error::{Error, Result};
use revgrad_cpu::Float;

impl Tensor {
    /// Row-major copy of the elements, converted to `T`.
    pub fn to_flatten_vec<T: Element>(&self) -> Result<Vec<T>> {
        if self.dtype() == T::DTYPE {
            return self.contiguous_vec::<T>();
        }
        Ok(self.to_vec_f64()?.into_iter().map(T::from_f64).collect())
    }

    pub fn to_vec_f64(&self) -> Result<Vec<f64>> {
        let values = with_dtype!(self.dtype(), T => {
            self.contiguous_vec::<T>()?.into_iter().map(Float::to_f64).collect()
        });
        Ok(values)
    }

    pub fn item(&self) -> Result<f64> {
        if self.size() != 1 {
            return Err(Error::InvalidArgument(format!(
                "item() can only be called on a tensor with a single element, but got tensor with {} elements",
                self.size()
            )));
        }
        Ok(self.to_vec_f64()?[0])
    }
}
