use bytemuck::Pod;
use derive_more::Display;
use half::{bf16, f16};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    F32,
    F64,
    F16,
    BF16,
    I64,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F64 => 8,
            DataType::F16 => 2,
            DataType::BF16 => 2,
            DataType::I64 => 8,
        }
    }
}

pub trait Zero {
    fn zero() -> Self;
}

impl Zero for f32 {
    fn zero() -> Self {
        0.0
    }
}

impl Zero for f64 {
    fn zero() -> Self {
        0.0
    }
}

impl Zero for f16 {
    fn zero() -> Self {
        Self::ZERO
    }
}

impl Zero for bf16 {
    fn zero() -> Self {
        Self::ZERO
    }
}

impl Zero for i64 {
    fn zero() -> Self {
        0
    }
}

/// Element type of a tile.
pub trait Scalar: Sized + Pod + Zero + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    const DATA_TYPE: DataType;
}

impl Scalar for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

impl Scalar for f64 {
    const DATA_TYPE: DataType = DataType::F64;
}

impl Scalar for f16 {
    const DATA_TYPE: DataType = DataType::F16;
}

impl Scalar for bf16 {
    const DATA_TYPE: DataType = DataType::BF16;
}

impl Scalar for i64 {
    const DATA_TYPE: DataType = DataType::I64;
}
