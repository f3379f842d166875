#![allow(dead_code)]

use revgrad_autograd::{
    conv::{ConvDescriptor, ConvParams, ConvolutionEngine, ConvolutionPlan},
    staged::StageInterpreter,
    tracer::ValueType,
    Function, Variable,
};
use revgrad_core::{
    config::set_default_device,
    device::Device,
    dtype::DType,
    error::{Error, Result},
};
use revgrad_tensor::{compute_grad_bias, Columns, Tensor};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

pub fn setup_device() {
    let _ = env_logger::builder().is_test(true).try_init();
    set_default_device(Device::CPU);
}

pub fn setup_tensor_with_shape(data: Vec<f64>, dtype: DType, shape: &[usize]) -> Result<Tensor> {
    setup_device();
    Tensor::new_with_spec(data, shape, Device::CPU, dtype)
}

pub fn setup_variable(data: Vec<f64>, dtype: DType, shape: &[usize], requires_grad: bool) -> Result<Variable> {
    Ok(Variable::new(setup_tensor_with_shape(data, dtype, shape)?, requires_grad))
}

/// Deterministic small integers, exactly representable in every float dtype.
pub fn pattern(len: usize, seed: usize) -> Vec<f64> {
    (0..len).map(|i| ((i * 7 + seed * 3) % 5) as f64 - 2.0).collect()
}

pub fn tolerance(dtype: DType) -> f64 {
    match dtype {
        DType::BF16 => 1e-1,
        DType::F16 => 1e-2,
        DType::F32 => 1e-4,
        DType::F64 => 1e-10,
    }
}

pub fn assert_close(actual: &Tensor, expected: &Tensor, dtype: DType) -> Result<()> {
    assert_eq!(actual.shape(), expected.shape());
    let tol = tolerance(dtype);
    for (a, e) in actual.to_vec_f64()?.iter().zip(expected.to_vec_f64()?) {
        approx::assert_abs_diff_eq!(*a, e, epsilon = tol * e.abs().max(1.0));
    }
    Ok(())
}

pub fn dot(a: &Tensor, b: &Tensor) -> Result<f64> {
    assert_eq!(a.shape(), b.shape());
    Ok(a.to_vec_f64()?.iter().zip(b.to_vec_f64()?).map(|(x, y)| x * y).sum())
}

pub fn params(stride: &[usize], padding: &[i64], dilation: &[usize], groups: usize) -> Result<ConvParams> {
    ConvParams::new(stride, padding, dilation, groups)
}

/// Applies the producing node of `output` to `grad`.
pub fn backward(output: &Variable, grad: Variable) -> Result<Vec<Variable>> {
    let grad_fn = output
        .grad_fn()
        .ok_or_else(|| Error::InvalidArgument("output has no grad_fn".to_string()))?;
    grad_fn.apply(&[grad])
}

pub fn data(variable: &Variable) -> Result<Tensor> {
    variable.data().cloned()
}

pub fn grad_fn_name(variable: &Variable) -> Option<String> {
    variable.grad_fn().map(|f| f.name())
}

// ───── Accelerated engine stand-in ─────

/// Engine computing with the reference kernels and counting its calls.
#[derive(Default)]
pub struct CountingEngine {
    pub dilation: bool,
    pub plans: AtomicUsize,
    pub forwards: AtomicUsize,
    pub backward_data: AtomicUsize,
    pub backward_filter: AtomicUsize,
    pub backward_bias: AtomicUsize,
}

impl CountingEngine {
    pub fn new(dilation: bool) -> Self {
        Self {
            dilation,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> [usize; 5] {
        [
            self.plans.load(Ordering::SeqCst),
            self.forwards.load(Ordering::SeqCst),
            self.backward_data.load(Ordering::SeqCst),
            self.backward_filter.load(Ordering::SeqCst),
            self.backward_bias.load(Ordering::SeqCst),
        ]
    }
}

fn missing(what: &str) -> Error {
    Error::Internal {
        message: format!("reference kernel skipped {}", what),
    }
}

impl ConvolutionEngine for CountingEngine {
    fn name(&self) -> &str {
        "counting"
    }

    fn supports_dilation(&self) -> bool {
        self.dilation
    }

    fn plan(&self, descriptor: ConvDescriptor) -> Result<Arc<ConvolutionPlan>> {
        self.plans.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ConvolutionPlan {
            descriptor,
            algorithm: "implicit-gemm".to_string(),
            workspace_size: 0,
        }))
    }

    fn forward(&self, plan: &ConvolutionPlan, input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        self.forwards.fetch_add(1, Ordering::SeqCst);
        input.conv_forward(weight, bias, &plan.descriptor.geometry, &Columns::new())
    }

    fn backward_data(&self, plan: &ConvolutionPlan, grad_output: &Tensor, weight: &Tensor) -> Result<Tensor> {
        self.backward_data.fetch_add(1, Ordering::SeqCst);
        let input = Tensor::zeros_with_spec(&plan.descriptor.input_shape, grad_output.device(), grad_output.dtype())?;
        let (grad_input, _, _) = input.conv_backward(
            grad_output,
            weight,
            &plan.descriptor.geometry,
            &Columns::new(),
            [true, false, false],
        )?;
        grad_input.ok_or_else(|| missing("grad_input"))
    }

    fn backward_filter(&self, plan: &ConvolutionPlan, grad_output: &Tensor, input: &Tensor) -> Result<Tensor> {
        self.backward_filter.fetch_add(1, Ordering::SeqCst);
        let weight = Tensor::zeros_with_spec(&plan.descriptor.weight_shape, input.device(), input.dtype())?;
        let (_, grad_weight, _) = input.conv_backward(
            grad_output,
            &weight,
            &plan.descriptor.geometry,
            &Columns::new(),
            [false, true, false],
        )?;
        grad_weight.ok_or_else(|| missing("grad_weight"))
    }

    fn backward_bias(&self, _plan: &ConvolutionPlan, grad_output: &Tensor) -> Result<Tensor> {
        self.backward_bias.fetch_add(1, Ordering::SeqCst);
        compute_grad_bias(grad_output)
    }
}

// ───── Stage interpreter stand-in ─────

/// Every stage multiplies each input by `factor`; the inputs of every run are logged.
#[derive(Clone)]
pub struct ScaleInterpreter {
    pub factor: f64,
    pub input_shape: Vec<usize>,
    pub log: Arc<Mutex<Vec<Vec<Option<Vec<f64>>>>>>,
}

impl ScaleInterpreter {
    pub fn new(factor: f64, input_shape: &[usize]) -> Self {
        Self {
            factor,
            input_shape: input_shape.to_vec(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn runs(&self) -> Vec<Vec<Option<Vec<f64>>>> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl StageInterpreter for ScaleInterpreter {
    fn run_one_stage(&mut self, inputs: &[Option<Tensor>]) -> Result<Vec<Tensor>> {
        let seen = inputs
            .iter()
            .map(|t| t.as_ref().map(|t| t.to_vec_f64()).transpose())
            .collect::<Result<Vec<_>>>()?;
        self.log.lock().map_err(|_| Error::Lock)?.push(seen);
        inputs
            .iter()
            .flatten()
            .map(|t| t.mul_scalar(self.factor))
            .collect()
    }

    fn tensor_type_for_input(&self, _index: usize) -> Result<ValueType> {
        Ok(ValueType::Tensor {
            shape: self.input_shape.clone(),
            dtype: DType::F32,
            device: Device::CPU,
        })
    }

    fn box_clone(&self) -> Box<dyn StageInterpreter> {
        Box::new(self.clone())
    }
}

#[macro_export]
macro_rules! test_ops_with_dtype {
    ([
        $($op:ident: [$($dtype:ident),*$(,)?]),*$(,)?
    ]) => {
        $(
            mod $op {
                use super::*;
                use paste::paste;
                paste! {
                    $(
                        #[test]
                        fn [<$dtype:lower>]() -> Result<()> {
                            test_functions::[<$op _test>](DType::$dtype)
                        }
                    )*
                }
            }
        )*
    };
}
