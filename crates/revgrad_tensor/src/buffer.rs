use half::{bf16, f16};
use revgrad_core::dtype::DType;
use revgrad_cpu::Float;

/// Host resident element storage.
#[derive(Debug, Clone)]
pub enum Buffer {
    BF16(Vec<bf16>),
    F16(Vec<f16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Buffer {
    pub fn zeros(len: usize, dtype: DType) -> Self {
        match dtype {
            DType::BF16 => Self::BF16(vec![bf16::ZERO; len]),
            DType::F16 => Self::F16(vec![f16::ZERO; len]),
            DType::F32 => Self::F32(vec![0.0; len]),
            DType::F64 => Self::F64(vec![0.0; len]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::BF16(_) => DType::BF16,
            Self::F16(_) => DType::F16,
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::BF16(v) => v.len(),
            Self::F16(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Element types a [`Buffer`] can hold.
pub trait Element: Float {
    const DTYPE: DType;

    fn slice(buffer: &Buffer) -> Option<&[Self]>;
    fn slice_mut(buffer: &mut Buffer) -> Option<&mut [Self]>;
    fn into_buffer(data: Vec<Self>) -> Buffer;
}

macro_rules! impl_element {
    ($type:ty, $variant:ident) => {
        impl Element for $type {
            const DTYPE: DType = DType::$variant;

            fn slice(buffer: &Buffer) -> Option<&[Self]> {
                match buffer {
                    Buffer::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn slice_mut(buffer: &mut Buffer) -> Option<&mut [Self]> {
                match buffer {
                    Buffer::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn into_buffer(data: Vec<Self>) -> Buffer {
                Buffer::$variant(data)
            }
        }
    };
}

impl_element!(bf16, BF16);
impl_element!(f16, F16);
impl_element!(f32, F32);
impl_element!(f64, F64);

/// Runs `$body` with `$T` bound to the element type of `$dtype`.
macro_rules! with_dtype {
    ($dtype:expr, $T:ident => $body:block) => {
        match $dtype {
            revgrad_core::dtype::DType::BF16 => {
                type $T = half::bf16;
                $body
            }
            revgrad_core::dtype::DType::F16 => {
                type $T = half::f16;
                $body
            }
            revgrad_core::dtype::DType::F32 => {
                type $T = f32;
                $body
            }
            revgrad_core::dtype::DType::F64 => {
                type $T = f64;
                $body
            }
        }
    };
}

pub(crate) use with_dtype;
