mod utils;

use revgrad_autograd::{
    conv::{self, register_engine, unregister_engine, ConvParams, ConvolutionEngine},
    Variable,
};
use revgrad_core::{config::ConfigGuard, device::Device, dtype::DType, error::Result};
use revgrad_tensor::Tensor;
use std::sync::{Arc, Mutex, MutexGuard};
use utils::{assert_close, backward, data, params, pattern, CountingEngine};

// the engine registry is process wide
static REGISTRY: Mutex<()> = Mutex::new(());

const GPU: Device = Device::CUDA(0);

struct Registered {
    engine: Arc<CountingEngine>,
    _lock: MutexGuard<'static, ()>,
}

impl Registered {
    fn new(supports_dilation: bool) -> Self {
        let lock = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
        let engine = Arc::new(CountingEngine::new(supports_dilation));
        register_engine(GPU, Arc::clone(&engine) as Arc<dyn ConvolutionEngine>);
        Self { engine, _lock: lock }
    }
}

impl Drop for Registered {
    fn drop(&mut self) {
        unregister_engine(GPU);
    }
}

fn on(device: Device, data: Vec<f64>, shape: &[usize], requires_grad: bool) -> Result<Variable> {
    Ok(Variable::new(
        Tensor::new_with_spec(data, shape, device, DType::F64)?,
        requires_grad,
    ))
}

/// Output and input/weight/bias gradients of one convolution on `device`.
fn run(device: Device, params: ConvParams, input: &[usize], weight: &[usize], bias: usize) -> Result<Vec<Tensor>> {
    let x = on(device, pattern(input.iter().product(), 1), input, true)?;
    let w = on(device, pattern(weight.iter().product(), 2), weight, true)?;
    let b = on(device, pattern(bias, 3), &[bias], true)?;
    let y = conv::conv(&x, &w, &b, params)?;
    let gy = on(device, pattern(y.data()?.size(), 4), y.shape()?, false)?;

    let mut out = vec![data(&y)?];
    for grad in backward(&y, gy)? {
        out.push(data(&grad)?);
    }
    Ok(out)
}

fn assert_same(actual: &[Tensor], expected: &[Tensor]) -> Result<()> {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert_close(a, e, DType::F64)?;
    }
    Ok(())
}

#[test]
fn accelerator_tensors_use_the_engine() -> Result<()> {
    let registered = Registered::new(true);
    let p = params(&[2, 1], &[1, 0], &[1, 1], 1)?;

    let fast = run(GPU, p.clone(), &[2, 3, 7, 6], &[4, 3, 3, 2], 4)?;
    assert_eq!(fast[0].device(), GPU);
    // one plan, reused by the backward
    assert_eq!(registered.engine.calls(), [1, 1, 1, 1, 1]);

    let reference = run(Device::CPU, p, &[2, 3, 7, 6], &[4, 3, 3, 2], 4)?;
    assert_same(&fast, &reference)
}

#[test]
fn transposed_swaps_engine_roles() -> Result<()> {
    let registered = Registered::new(true);
    let p = || ConvParams::transposed(&[2, 2], &[1, 0], &[2, 2], &[1, 1], 1);

    let fast = run(GPU, p()?, &[1, 3, 4, 5], &[3, 2, 3, 3], 2)?;
    // forward runs backward_data, backward runs forward and backward_filter
    assert_eq!(registered.engine.calls(), [1, 1, 1, 1, 1]);

    let reference = run(Device::CPU, p()?, &[1, 3, 4, 5], &[3, 2, 3, 3], 2)?;
    assert_same(&fast, &reference)
}

#[test]
fn cpu_tensors_never_use_an_engine() -> Result<()> {
    let registered = Registered::new(true);
    register_engine(Device::CPU, Arc::clone(&registered.engine) as Arc<dyn ConvolutionEngine>);

    let result = run(Device::CPU, params(&[1, 1], &[1, 1], &[1, 1], 1)?, &[1, 2, 5, 5], &[3, 2, 3, 3], 3);
    unregister_engine(Device::CPU);
    result?;
    assert_eq!(registered.engine.calls(), [0; 5]);
    Ok(())
}

#[test]
fn deterministic_dilation_falls_back() -> Result<()> {
    let registered = Registered::new(true);
    let shapes = (&[1, 2, 9, 9][..], &[3, 2, 3, 3][..]);

    let reference = run(Device::CPU, params(&[1, 1], &[0, 0], &[2, 2], 1)?, shapes.0, shapes.1, 3)?;
    {
        let _guard = ConfigGuard::with(|c| c.deterministic = true);
        let generic = run(GPU, params(&[1, 1], &[0, 0], &[2, 2], 1)?, shapes.0, shapes.1, 3)?;
        assert_same(&generic, &reference)?;
    }
    assert_eq!(registered.engine.calls(), [0; 5]);

    // dilation alone is fine for an engine that supports it
    run(GPU, params(&[1, 1], &[0, 0], &[2, 2], 1)?, shapes.0, shapes.1, 3)?;
    assert_eq!(registered.engine.calls()[0], 1);
    Ok(())
}

#[test]
fn engines_without_dilation_fall_back() -> Result<()> {
    let registered = Registered::new(false);
    run(GPU, params(&[1, 1], &[0, 0], &[2, 1], 1)?, &[1, 2, 9, 9], &[3, 2, 3, 3], 3)?;
    assert_eq!(registered.engine.calls(), [0; 5]);

    run(GPU, params(&[1, 1], &[0, 0], &[1, 1], 1)?, &[1, 2, 9, 9], &[3, 2, 3, 3], 3)?;
    assert_eq!(registered.engine.calls()[0], 1);
    Ok(())
}

#[test]
fn large_output_padding_falls_back() -> Result<()> {
    let registered = Registered::new(true);
    // output_padding 1 is not smaller than the dilation
    let p = ConvParams::transposed(&[2, 2], &[0, 0], &[1, 1], &[1, 1], 1)?;
    assert!(p.is_output_padding_big());
    let out = run(GPU, p, &[1, 3, 4, 4], &[3, 2, 3, 3], 2)?;
    assert_eq!(out[0].shape(), &[1, 2, 10, 10]);
    assert_eq!(registered.engine.calls(), [0; 5]);
    Ok(())
}

#[test]
fn disabled_by_configuration() -> Result<()> {
    let registered = Registered::new(true);
    let p = {
        let _guard = ConfigGuard::with(|c| c.accelerated_enabled = false);
        params(&[1, 1], &[1, 1], &[1, 1], 1)?
    };
    run(GPU, p, &[1, 2, 5, 5], &[3, 2, 3, 3], 3)?;
    assert_eq!(registered.engine.calls(), [0; 5]);
    Ok(())
}
