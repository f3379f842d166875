use half::{bf16, f16};
use std::ops::{Add, AddAssign, Mul, Neg, Sub};

/// Element types the kernels are instantiated for.
pub trait Float:
    Copy
    + Send
    + Sync
    + PartialOrd
    + Default
    + std::fmt::Debug
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + 'static
{
    const ZERO: Self;
    const ONE: Self;

    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;
}

macro_rules! impl_float {
    ($type:ty, $zero:expr, $one:expr, $from:expr, $to:expr) => {
        impl Float for $type {
            const ZERO: Self = $zero;
            const ONE: Self = $one;

            #[inline]
            fn from_f64(value: f64) -> Self {
                $from(value)
            }

            #[inline]
            fn to_f64(self) -> f64 {
                $to(self)
            }
        }
    };
}

impl_float!(f32, 0.0f32, 1.0f32, |v: f64| v as f32, |v: f32| v as f64);
impl_float!(f64, 0.0f64, 1.0f64, |v: f64| v, |v: f64| v);
impl_float!(f16, f16::ZERO, f16::ONE, f16::from_f64, |v: f16| v.to_f64());
impl_float!(bf16, bf16::ZERO, bf16::ONE, bf16::from_f64, |v: bf16| v.to_f64());
