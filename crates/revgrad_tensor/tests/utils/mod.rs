#![allow(dead_code)]

use revgrad_core::{
    config::set_default_device,
    device::Device,
    dtype::DType,
    error::Result,
};
use revgrad_tensor::Tensor;

pub fn setup_device() {
    set_default_device(Device::CPU);
}

pub fn setup_tensor_with_shape(data: Vec<f64>, dtype: DType, shape: &[usize]) -> Result<Tensor> {
    setup_device();
    Tensor::new_with_spec(data, shape, Device::CPU, dtype)
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
