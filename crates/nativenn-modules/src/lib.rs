//! Convolution and normalization modules backed by a native tensor engine.
//!
//! Every module here is a [`Module`](nativenn_core::module::Module) of a
//! concrete [`ModuleKind`](nativenn_core::module::ModuleKind); the kinds only
//! supply their options, slot declarations and input checks. Handle
//! ownership, the registry and device migration come from `nativenn-core`.
//!
//! # Modules
//!
//! - [`conv`]: `Conv1d`, `Conv2d`, `Conv3d`
//! - [`normalization`]: batch, instance and layer normalization
//! - [`functional`]: stateless convolutions
//! - [`size`]: per-dimension sizes and padding policies

pub mod conv;
pub mod functional;
pub mod normalization;
pub mod size;

pub use conv::{
    conv1d, conv2d, conv3d, Conv, Conv1d, Conv1dConfig, Conv2d, Conv2dConfig, Conv3d, Conv3dConfig, ConvConfig,
    ConvKind,
};
pub use normalization::{
    batch_norm1d, batch_norm2d, batch_norm3d, instance_norm1d, instance_norm2d, instance_norm3d, layer_norm,
    BatchNorm, BatchNorm1d, BatchNorm2d, BatchNorm3d, BatchNormKind, InstanceNorm, InstanceNorm1d, InstanceNorm2d,
    InstanceNorm3d, InstanceNormKind, LayerNorm, LayerNormConfig, LayerNormKind, NormConfig,
};
pub use size::{Padding, Size};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::conv::{Conv1d, Conv1dConfig, Conv2d, Conv2dConfig, Conv3d, Conv3dConfig, ConvConfig};
    pub use crate::functional::ConvOptions;
    pub use crate::normalization::{
        BatchNorm1d, BatchNorm2d, BatchNorm3d, InstanceNorm1d, InstanceNorm2d, InstanceNorm3d, LayerNorm,
        LayerNormConfig, NormConfig,
    };
    pub use crate::size::{Padding, Size};
}
