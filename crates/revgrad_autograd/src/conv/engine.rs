//! Accelerated convolution engines.
//!
//! An engine is a handle/descriptor based library registered per device kind.
//! The convolution nodes decide when to call it; the engine owns its own
//! algorithm search and records the outcome in a [`ConvolutionPlan`] that the
//! backward pass reuses.

use dashmap::DashMap;
use revgrad_core::{device::Device, dtype::DType, error::Result};
use revgrad_tensor::{ConvGeometry, Tensor};
use std::sync::{Arc, LazyLock};

/// Describes one grouped, non-transposed convolution as seen by an engine.
///
/// Transposed convolutions are described by their underlying convolution:
/// `input_shape` is then the shape of the transposed op's output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConvDescriptor {
    pub input_shape: Vec<usize>,
    pub weight_shape: Vec<usize>,
    pub dtype: DType,
    pub device: Device,
    pub geometry: ConvGeometry,
    pub groups: usize,
    pub transposed: bool,
    pub deterministic: bool,
    pub benchmark: bool,
}

/// Algorithm and workspace chosen by an engine for a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvolutionPlan {
    pub descriptor: ConvDescriptor,
    pub algorithm: String,
    pub workspace_size: usize,
}

pub trait ConvolutionEngine: Send + Sync {
    fn name(&self) -> &str;

    fn supports_dilation(&self) -> bool {
        true
    }

    fn plan(&self, descriptor: ConvDescriptor) -> Result<Arc<ConvolutionPlan>>;

    /// Output of the described convolution.
    fn forward(&self, plan: &ConvolutionPlan, input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor>;

    /// Gradient with respect to the input, shaped like `plan.descriptor.input_shape`.
    fn backward_data(&self, plan: &ConvolutionPlan, grad_output: &Tensor, weight: &Tensor) -> Result<Tensor>;

    fn backward_filter(&self, plan: &ConvolutionPlan, grad_output: &Tensor, input: &Tensor) -> Result<Tensor>;

    fn backward_bias(&self, plan: &ConvolutionPlan, grad_output: &Tensor) -> Result<Tensor>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DeviceKind {
    Cpu,
    Cuda,
}

impl From<Device> for DeviceKind {
    fn from(device: Device) -> Self {
        match device {
            Device::CPU => DeviceKind::Cpu,
            Device::CUDA(_) => DeviceKind::Cuda,
        }
    }
}

static ENGINES: LazyLock<DashMap<DeviceKind, Arc<dyn ConvolutionEngine>>> = LazyLock::new(DashMap::new);

/// Registers `engine` for every device of the same kind as `device`,
/// returning the engine it replaces.
pub fn register_engine(device: Device, engine: Arc<dyn ConvolutionEngine>) -> Option<Arc<dyn ConvolutionEngine>> {
    log::debug!("registering convolution engine {} for {}", engine.name(), device);
    ENGINES.insert(device.into(), engine)
}

pub fn unregister_engine(device: Device) -> Option<Arc<dyn ConvolutionEngine>> {
    ENGINES.remove(&DeviceKind::from(device)).map(|(_, engine)| engine)
}

pub fn engine_for(device: Device) -> Option<Arc<dyn ConvolutionEngine>> {
    ENGINES.get(&DeviceKind::from(device)).map(|e| Arc::clone(e.value()))
}
