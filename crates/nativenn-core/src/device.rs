//! Device and dtype descriptions.

use crate::error::BindingError;
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Execution backends known to the bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DeviceType {
    /// Host memory
    Cpu,
    /// NVIDIA CUDA
    Cuda,
    /// Apple Metal Performance Shaders
    Mps,
    /// DirectML on Windows
    DirectMl,
}

impl DeviceType {
    /// Lower-case name used in device strings.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Mps => "mps",
            Self::DirectMl => "directml",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = BindingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "mps" => Ok(Self::Mps),
            "directml" | "dml" => Ok(Self::DirectMl),
            _ => Err(BindingError::InvalidDevice { spec: s.to_string() }),
        }
    }
}

/// A device: backend type plus optional ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Device {
    /// Backend type
    pub kind: DeviceType,
    /// Device ordinal, `None` for the backend's current device
    pub index: Option<u32>,
}

impl Device {
    /// The host CPU.
    pub const CPU: Self = Self::new(DeviceType::Cpu, None);

    /// Creates a device description.
    pub const fn new(kind: DeviceType, index: Option<u32>) -> Self {
        Self { kind, index }
    }

    /// The CUDA device with the given ordinal.
    pub const fn cuda(index: u32) -> Self {
        Self::new(DeviceType::Cuda, Some(index))
    }

    /// The DirectML device with the given ordinal.
    pub const fn directml(index: u32) -> Self {
        Self::new(DeviceType::DirectMl, Some(index))
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::CPU
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}:{}", self.kind, index),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl FromStr for Device {
    type Err = BindingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BindingError::InvalidDevice { spec: s.to_string() };
        match s.trim().split_once(':') {
            Some((kind, index)) => {
                let kind = kind.parse::<DeviceType>().map_err(|_| invalid())?;
                let index = index.trim().parse::<u32>().map_err(|_| invalid())?;
                Ok(Self::new(kind, Some(index)))
            }
            None => Ok(Self::new(s.parse::<DeviceType>()?, None)),
        }
    }
}

impl From<DeviceType> for Device {
    fn from(kind: DeviceType) -> Self {
        Self::new(kind, None)
    }
}

/// Numeric representation of tensor elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DType {
    /// Boolean
    Bool,
    /// Unsigned 8-bit integer
    UInt8,
    /// Signed 8-bit integer
    Int8,
    /// Signed 16-bit integer
    Int16,
    /// Signed 32-bit integer
    Int32,
    /// Signed 64-bit integer
    Int64,
    /// IEEE half precision
    Float16,
    /// Brain floating point
    BFloat16,
    /// IEEE single precision
    Float32,
    /// IEEE double precision
    Float64,
}

impl DType {
    /// Returns true for floating-point representations.
    pub const fn is_floating_point(self) -> bool {
        matches!(
            self,
            Self::Float16 | Self::BFloat16 | Self::Float32 | Self::Float64
        )
    }

    /// Size of one element in bytes.
    pub const fn element_size(self) -> usize {
        match self {
            Self::Bool | Self::UInt8 | Self::Int8 => 1,
            Self::Int16 | Self::Float16 | Self::BFloat16 => 2,
            Self::Int32 | Self::Float32 => 4,
            Self::Int64 | Self::Float64 => 8,
        }
    }

    /// Lower-case name used in dtype strings.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::UInt8 => "uint8",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float16 => "float16",
            Self::BFloat16 => "bfloat16",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = BindingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bool" => Ok(Self::Bool),
            "uint8" | "u8" => Ok(Self::UInt8),
            "int8" | "i8" => Ok(Self::Int8),
            "int16" | "i16" | "short" => Ok(Self::Int16),
            "int32" | "i32" | "int" => Ok(Self::Int32),
            "int64" | "i64" | "long" => Ok(Self::Int64),
            "float16" | "f16" | "half" => Ok(Self::Float16),
            "bfloat16" | "bf16" => Ok(Self::BFloat16),
            "float32" | "f32" | "float" => Ok(Self::Float32),
            "float64" | "f64" | "double" => Ok(Self::Float64),
            _ => Err(BindingError::InvalidDType { spec: s.to_string() }),
        }
    }
}
