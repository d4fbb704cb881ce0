use bytemuck::Pod;
use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    F64,
    F32,
    F16,
    I32,
    U32,
    U8,
}

impl DataType {
    /// Size in bytes of the widest scalar type.
    pub const MAX_SIZE: usize = 8;

    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F64 => 8,
            DataType::F32 => 4,
            DataType::F16 => 2,
            DataType::I32 => 4,
            DataType::U32 => 4,
            DataType::U8 => 1,
        }
    }
}

pub trait Zero {
    fn zero() -> Self;
}

impl Zero for f64 {
    fn zero() -> Self {
        0.0
    }
}

impl Zero for f32 {
    fn zero() -> Self {
        0.0
    }
}

impl Zero for f16 {
    fn zero() -> Self {
        Self::ZERO
    }
}

impl Zero for i32 {
    fn zero() -> Self {
        0
    }
}

impl Zero for u32 {
    fn zero() -> Self {
        0
    }
}

impl Zero for u8 {
    fn zero() -> Self {
        0
    }
}

pub trait Scalar: Sized + Pod + Zero + PartialEq + std::fmt::Debug + Send + Sync + sealed::Sealed {
    const DATA_TYPE: DataType;

    fn to_f64(self) -> f64;
    /// Float to integer conversions truncate and saturate.
    fn from_f64(value: f64) -> Self;
}

impl Scalar for f64 {
    const DATA_TYPE: DataType = DataType::F64;

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }
}

impl Scalar for f32 {
    const DATA_TYPE: DataType = DataType::F32;

    #[inline]
    fn to_f64(self) -> f64 {
        self.into()
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl Scalar for f16 {
    const DATA_TYPE: DataType = DataType::F16;

    #[inline]
    fn to_f64(self) -> f64 {
        self.to_f64()
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }
}

impl Scalar for i32 {
    const DATA_TYPE: DataType = DataType::I32;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value as i32
    }
}

impl Scalar for u32 {
    const DATA_TYPE: DataType = DataType::U32;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value as u32
    }
}

impl Scalar for u8 {
    const DATA_TYPE: DataType = DataType::U8;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value as u8
    }
}

mod sealed {
    use half::f16;

    pub trait Sealed {}

    impl Sealed for f64 {}
    impl Sealed for f32 {}
    impl Sealed for f16 {}
    impl Sealed for i32 {}
    impl Sealed for u32 {}
    impl Sealed for u8 {}
}
