use crate::{
    buffer::{with_dtype, Buffer, Element},
    Tensor,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use revgrad_core::{
    config::{get_default_device, get_default_dtype},
    device::Device,
    dtype::DType,
    error::Result,
    layout::Layout,
};
use revgrad_cpu::Float;

impl Tensor {
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        Self::from_vec_with_device(data, shape, get_default_device())
    }

    pub fn from_vec_with_device<T: Element>(data: Vec<T>, shape: &[usize], device: Device) -> Result<Self> {
        Self::from_buffer(T::into_buffer(data), shape, device)
    }

    /// Builds a tensor of `dtype` from `f64` values, converting each element.
    pub fn new_with_spec(data: Vec<f64>, shape: &[usize], device: Device, dtype: DType) -> Result<Self> {
        let buffer = with_dtype!(dtype, T => {
            T::into_buffer(data.into_iter().map(T::from_f64).collect())
        });
        Self::from_buffer(buffer, shape, device)
    }

    pub fn zeros(shape: &[usize]) -> Result<Self> {
        Self::zeros_with_spec(shape, get_default_device(), get_default_dtype())
    }

    pub fn zeros_with_spec(shape: &[usize], device: Device, dtype: DType) -> Result<Self> {
        Self::from_buffer(Buffer::zeros(Layout::compute_size(shape), dtype), shape, device)
    }

    pub fn ones(shape: &[usize]) -> Result<Self> {
        Self::full(shape, 1.0)
    }

    pub fn ones_with_spec(shape: &[usize], device: Device, dtype: DType) -> Result<Self> {
        Self::full_with_spec(shape, 1.0, device, dtype)
    }

    pub fn full(shape: &[usize], value: f64) -> Result<Self> {
        Self::full_with_spec(shape, value, get_default_device(), get_default_dtype())
    }

    pub fn full_with_spec(shape: &[usize], value: f64, device: Device, dtype: DType) -> Result<Self> {
        Self::new_with_spec(vec![value; Layout::compute_size(shape)], shape, device, dtype)
    }

    pub fn zeros_like(src: &Tensor) -> Result<Self> {
        Self::zeros_with_spec(src.shape(), src.device(), src.dtype())
    }

    pub fn ones_like(src: &Tensor) -> Result<Self> {
        Self::ones_with_spec(src.shape(), src.device(), src.dtype())
    }

    pub fn full_like(src: &Tensor, value: f64) -> Result<Self> {
        Self::full_with_spec(src.shape(), value, src.device(), src.dtype())
    }

    pub fn randn(shape: &[usize]) -> Result<Self> {
        Self::randn_with_spec(shape, get_default_device(), get_default_dtype())
    }

    pub fn randn_with_spec(shape: &[usize], device: Device, dtype: DType) -> Result<Self> {
        let mut rng = rand::thread_rng();
        Self::sample_normal(&mut rng, shape, device, dtype)
    }

    /// Reproducible standard normal samples.
    pub fn randn_seeded(shape: &[usize], seed: u64, device: Device, dtype: DType) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::sample_normal(&mut rng, shape, device, dtype)
    }

    fn sample_normal<R: Rng>(rng: &mut R, shape: &[usize], device: Device, dtype: DType) -> Result<Self> {
        let values = (0..Layout::compute_size(shape))
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect();
        Self::new_with_spec(values, shape, device, dtype)
    }

    pub fn arange(n: usize) -> Result<Self> {
        Self::arange_with_spec(n, get_default_device(), get_default_dtype())
    }

    pub fn arange_with_spec(n: usize, device: Device, dtype: DType) -> Result<Self> {
        Self::new_with_spec((0..n).map(|v| v as f64).collect(), &[n], device, dtype)
    }
}
