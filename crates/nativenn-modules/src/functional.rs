//! Stateless convolutions.
//!
//! These pass the tensors straight to the engine's functional entry point.
//! Nothing is registered and the caller keeps ownership of every argument.

use crate::size::Size;
use nativenn_core::error::{BindingError, Result};
use nativenn_core::handle::RawHandle;
use nativenn_core::tensor::Tensor;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Options of a functional convolution with `D` spatial dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConvOptions<const D: usize> {
    /// Stride, default 1
    pub stride: Size<D>,
    /// Zero padding on both sides, default 0
    pub padding: Size<D>,
    /// Spacing between kernel elements, default 1
    pub dilation: Size<D>,
    /// Blocked connections from input to output channels, default 1
    pub groups: i64,
}

impl<const D: usize> Default for ConvOptions<D> {
    fn default() -> Self {
        Self {
            stride: Size::uniform(1),
            padding: Size::uniform(0),
            dilation: Size::uniform(1),
            groups: 1,
        }
    }
}

impl<const D: usize> ConvOptions<D> {
    /// Set the stride.
    pub fn stride(mut self, stride: impl Into<Size<D>>) -> Self {
        self.stride = stride.into();
        self
    }

    /// Set the padding.
    pub fn padding(mut self, padding: impl Into<Size<D>>) -> Self {
        self.padding = padding.into();
        self
    }

    /// Set the dilation.
    pub fn dilation(mut self, dilation: impl Into<Size<D>>) -> Self {
        self.dilation = dilation.into();
        self
    }

    /// Set the number of groups.
    pub fn groups(mut self, groups: i64) -> Self {
        self.groups = groups;
        self
    }
}

fn conv<const D: usize>(
    name: &str,
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    options: &ConvOptions<D>,
) -> Result<Tensor> {
    let rank = input.dim()?;
    if rank != D + 1 && rank != D + 2 {
        return Err(BindingError::invalid_input_rank(
            name,
            format!("{} (unbatched) or {} (batched)", D + 1, D + 2),
            rank,
        ));
    }
    let weight_rank = weight.dim()?;
    if weight_rank != D + 2 {
        return Err(BindingError::shape_mismatch(
            format!("a weight of rank {}", D + 2),
            format!("{:?}", weight.shape()?),
        ));
    }

    let input_raw = input.raw()?;
    let weight_raw = weight.raw()?;
    let bias_raw = match bias {
        Some(bias) => bias.raw()?,
        None => RawHandle::NULL,
    };
    tracing::trace!(op = name, stride = %options.stride, padding = %options.padding, "functional convolution");

    let engine = input.engine();
    let output = engine.invoke_tensor("conv_functional", |native, status| {
        native.conv_functional(
            input_raw,
            weight_raw,
            bias_raw,
            options.stride.as_slice(),
            options.padding.as_slice(),
            options.dilation.as_slice(),
            options.groups,
            status,
        )
    })?;
    Tensor::try_from_raw(engine.clone(), output)
}

/// 1-D convolution of `input` with `weight` (`[out, in / groups, k]`).
pub fn conv1d(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>, options: &ConvOptions<1>) -> Result<Tensor> {
    conv("conv1d", input, weight, bias, options)
}

/// 2-D convolution of `input` with `weight` (`[out, in / groups, kh, kw]`).
pub fn conv2d(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>, options: &ConvOptions<2>) -> Result<Tensor> {
    conv("conv2d", input, weight, bias, options)
}

/// 3-D convolution of `input` with `weight` (`[out, in / groups, kd, kh, kw]`).
pub fn conv3d(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>, options: &ConvOptions<3>) -> Result<Tensor> {
    conv("conv3d", input, weight, bias, options)
}
