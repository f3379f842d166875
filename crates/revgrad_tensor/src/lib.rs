mod buffer;
mod creation;
pub mod nn;
mod ops;
mod vec;
mod version;

pub use buffer::{Buffer, Element};
pub use nn::{compute_grad_bias, Columns, ConvGeometry};
pub use ops::broadcasting::Expansion;
pub use version::VersionCounter;

use buffer::with_dtype;
use revgrad_core::{
    device::Device,
    dtype::DType,
    error::{Error, Result},
    layout::Layout,
};
use revgrad_cpu::ops::elementwise::strided_copy;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Element buffer plus the mutation counter of everything that views it.
pub struct Storage {
    buffer: RwLock<Buffer>,
    dtype: DType,
    version: VersionCounter,
}

impl Storage {
    fn new(buffer: Buffer) -> Self {
        Self {
            dtype: buffer.dtype(),
            buffer: RwLock::new(buffer),
            version: VersionCounter::new(),
        }
    }
}

/// A strided view over shared storage.
///
/// Cloning a tensor, and every view op, aliases the storage and therefore the
/// version counter. Storage is host resident; the device tag only routes
/// kernel selection.
#[derive(Clone)]
pub struct Tensor {
    storage: Arc<Storage>,
    layout: Layout,
    device: Device,
}

impl Tensor {
    pub(crate) fn from_buffer(buffer: Buffer, shape: &[usize], device: Device) -> Result<Self> {
        let layout = Layout::from_shape(shape);
        if buffer.len() != layout.size() {
            return Err(Error::InvalidShape {
                message: format!(
                    "buffer of {} elements cannot be viewed as shape {:?} ({} elements)",
                    buffer.len(),
                    shape,
                    layout.size()
                ),
            });
        }

        Ok(Self {
            storage: Arc::new(Storage::new(buffer)),
            layout,
            device,
        })
    }

    pub(crate) fn with_layout(&self, layout: Layout) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            layout,
            device: self.device,
        }
    }

    pub(crate) fn read_buffer(&self) -> Result<RwLockReadGuard<'_, Buffer>> {
        self.storage.buffer.read().map_err(|_| Error::Lock)
    }

    pub(crate) fn write_buffer(&self) -> Result<RwLockWriteGuard<'_, Buffer>> {
        self.storage.buffer.write().map_err(|_| Error::Lock)
    }

    /// Gathers the elements in row-major order into a fresh vector.
    pub(crate) fn contiguous_vec<T: Element>(&self) -> Result<Vec<T>> {
        let guard = self.read_buffer()?;
        let data = T::slice(&guard).ok_or(Error::DTypeMismatch {
            expected: T::DTYPE,
            got: guard.dtype(),
        })?;

        let mut out = vec![T::ZERO; self.size()];
        strided_copy(data, self.shape(), self.strides(), self.offset(), &mut out);
        Ok(out)
    }

    // layout

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    pub fn strides(&self) -> &[usize] {
        self.layout.strides()
    }

    pub fn offset(&self) -> usize {
        self.layout.offset()
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn ndim(&self) -> usize {
        self.layout.ndim()
    }

    pub fn dim_size(&self, dim: usize) -> Option<usize> {
        self.layout.dim_size(dim)
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    // storage

    pub fn version(&self) -> usize {
        self.storage.version.current()
    }

    pub fn version_counter(&self) -> &VersionCounter {
        &self.storage.version
    }

    pub fn shares_storage_with(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    // etc

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype
    }

    /// Contiguous copy tagged with `device`.
    pub fn to_device(&self, device: Device) -> Result<Self> {
        let copy = with_dtype!(self.dtype(), T => {
            Self::from_buffer(T::into_buffer(self.contiguous_vec::<T>()?), self.shape(), device)?
        });
        Ok(copy)
    }

    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if dtype == self.dtype() {
            return Ok(self.clone());
        }
        let values = self.to_vec_f64()?;
        Self::new_with_spec(values, self.shape(), self.device, dtype)
    }

    pub(crate) fn check_same_spec(&self, other: &Tensor, op: &str) -> Result<()> {
        if self.dtype() != other.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: other.dtype(),
            });
        }
        if self.device != other.device {
            return Err(Error::DeviceMismatch {
                expected: self.device,
                got: other.device,
            });
        }
        log::trace!("{}: {:?} with {:?}", op, self.shape(), other.shape());
        Ok(())
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape())
            .field("dtype", &self.dtype())
            .field("device", &self.device)
            .field("version", &self.version())
            .finish()
    }
}
