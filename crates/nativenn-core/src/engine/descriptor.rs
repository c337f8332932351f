//! Construction descriptors passed to the engine.
//!
//! A descriptor is the fully defaulted configuration of one native module:
//! every shape-shaped option is already expanded to one value per spatial
//! dimension.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How convolution inputs are padded at the borders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PaddingMode {
    /// Pad with zeros
    #[default]
    Zeros,
    /// Mirror the input without repeating the edge
    Reflect,
    /// Repeat the edge value
    Replicate,
    /// Wrap around
    Circular,
}

impl fmt::Display for PaddingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Zeros => "zeros",
            Self::Reflect => "reflect",
            Self::Replicate => "replicate",
            Self::Circular => "circular",
        };
        f.write_str(name)
    }
}

/// Padding amount for a convolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConvPadding {
    /// Explicit amount per spatial dimension
    Explicit(Vec<i64>),
    /// No padding
    Valid,
    /// Pad so the output has the input's spatial shape
    Same,
}

/// Native configuration of a convolution.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConvDescriptor {
    /// Number of spatial dimensions (1, 2 or 3)
    pub spatial_dims: usize,
    /// Input channels
    pub in_channels: i64,
    /// Output channels
    pub out_channels: i64,
    /// Kernel extent per spatial dimension
    pub kernel_size: Vec<i64>,
    /// Stride per spatial dimension
    pub stride: Vec<i64>,
    /// Padding amount or policy
    pub padding: ConvPadding,
    /// Dilation per spatial dimension
    pub dilation: Vec<i64>,
    /// Border handling
    pub padding_mode: PaddingMode,
    /// Blocked connections between input and output channels
    pub groups: i64,
    /// Whether a bias parameter is created
    pub bias: bool,
}

/// Native configuration of batch and instance normalization.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NormDescriptor {
    /// Number of spatial dimensions (1, 2 or 3)
    pub spatial_dims: usize,
    /// Channel count `C`
    pub num_features: i64,
    /// Value added to the variance for numerical stability
    pub eps: f64,
    /// Running statistics update factor
    pub momentum: f64,
    /// Whether learnable affine parameters are created
    pub affine: bool,
    /// Whether running statistics buffers are created
    pub track_running_stats: bool,
}

/// Native configuration of layer normalization.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerNormDescriptor {
    /// Trailing input shape that is normalized
    pub normalized_shape: Vec<i64>,
    /// Value added to the variance for numerical stability
    pub eps: f64,
    /// Whether per-element affine parameters are created
    pub elementwise_affine: bool,
}

/// Everything the engine needs to build one native module.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ModuleDescriptor {
    /// Convolution over 1, 2 or 3 spatial dimensions
    Conv(ConvDescriptor),
    /// Batch normalization
    BatchNorm(NormDescriptor),
    /// Instance normalization
    InstanceNorm(NormDescriptor),
    /// Layer normalization
    LayerNorm(LayerNormDescriptor),
}

impl ModuleDescriptor {
    /// Short name of the native module family.
    pub fn family(&self) -> &'static str {
        match self {
            Self::Conv(_) => "conv",
            Self::BatchNorm(_) => "batch_norm",
            Self::InstanceNorm(_) => "instance_norm",
            Self::LayerNorm(_) => "layer_norm",
        }
    }
}
