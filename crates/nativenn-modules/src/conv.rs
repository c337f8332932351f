//! Convolution modules over 1, 2 and 3 spatial dimensions.
//!
//! A convolution holds a `weight` parameter of shape
//! `[out_channels, in_channels / groups, k_1, ..., k_D]` and an optional
//! `bias` parameter of shape `[out_channels]`. Inputs are either batched
//! `[N, C, L_1, ..., L_D]` or unbatched `[C, L_1, ..., L_D]`.
//!
//! # Example
//!
//! ```ignore
//! let conv = Conv2dConfig::new(3, 16, 3).stride(2).padding(1).build(&engine)?;
//! let output = conv.forward(&input)?;
//! ```

use crate::size::{Padding, Size};
use nativenn_core::device::{DType, Device};
use nativenn_core::engine::{ConvDescriptor, Engine, ModuleDescriptor, PaddingMode};
use nativenn_core::error::{BindingError, Result};
use nativenn_core::module::{slot, AffineKind, Module, ModuleKind, SlotSpec};
use std::marker::PhantomData;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Options of a convolution with `D` spatial dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConvConfig<const D: usize> {
    /// Channels in the input
    pub in_channels: i64,
    /// Channels produced by the convolution
    pub out_channels: i64,
    /// Kernel extent
    pub kernel_size: Size<D>,
    /// Stride, default 1
    pub stride: Size<D>,
    /// Padding, default 0
    pub padding: Padding<D>,
    /// Spacing between kernel elements, default 1
    pub dilation: Size<D>,
    /// Border handling, default zeros
    pub padding_mode: PaddingMode,
    /// Blocked connections from input to output channels, default 1
    pub groups: i64,
    /// Whether a learnable bias is added, default true
    pub bias: bool,
    /// Target device, engine default when unset
    pub device: Option<Device>,
    /// Target dtype, engine default when unset
    pub dtype: Option<DType>,
}

/// Options of a 1-D convolution.
pub type Conv1dConfig = ConvConfig<1>;
/// Options of a 2-D convolution.
pub type Conv2dConfig = ConvConfig<2>;
/// Options of a 3-D convolution.
pub type Conv3dConfig = ConvConfig<3>;

impl<const D: usize> ConvConfig<D> {
    /// Options with the given channel counts and kernel, everything else
    /// defaulted.
    pub fn new(in_channels: i64, out_channels: i64, kernel_size: impl Into<Size<D>>) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size: kernel_size.into(),
            stride: Size::uniform(1),
            padding: Padding::default(),
            dilation: Size::uniform(1),
            padding_mode: PaddingMode::Zeros,
            groups: 1,
            bias: true,
            device: None,
            dtype: None,
        }
    }

    /// Set the stride.
    pub fn stride(mut self, stride: impl Into<Size<D>>) -> Self {
        self.stride = stride.into();
        self
    }

    /// Set the padding.
    pub fn padding(mut self, padding: impl Into<Padding<D>>) -> Self {
        self.padding = padding.into();
        self
    }

    /// Set the dilation.
    pub fn dilation(mut self, dilation: impl Into<Size<D>>) -> Self {
        self.dilation = dilation.into();
        self
    }

    /// Set the border handling.
    pub fn padding_mode(mut self, padding_mode: PaddingMode) -> Self {
        self.padding_mode = padding_mode;
        self
    }

    /// Set the number of groups.
    pub fn groups(mut self, groups: i64) -> Self {
        self.groups = groups;
        self
    }

    /// Enable or disable the bias.
    pub fn bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Set the target device.
    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Set the target dtype.
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Builds the module on `engine`.
    pub fn build(self, engine: &Engine) -> Result<Conv<D>> {
        Module::new(engine, self)
    }

    fn validate(&self) -> Result<()> {
        let positive = [
            ("in_channels", self.in_channels),
            ("out_channels", self.out_channels),
            ("groups", self.groups),
        ];
        for (parameter, value) in positive {
            if value <= 0 {
                return Err(BindingError::invalid_configuration(
                    format!("{parameter} must be positive"),
                    parameter,
                    value.to_string(),
                ));
            }
        }
        for (parameter, channels) in [("in_channels", self.in_channels), ("out_channels", self.out_channels)] {
            if channels % self.groups != 0 {
                return Err(BindingError::invalid_configuration(
                    format!("{parameter} must be divisible by groups ({})", self.groups),
                    parameter,
                    channels.to_string(),
                ));
            }
        }
        for (parameter, size) in [
            ("kernel_size", &self.kernel_size),
            ("stride", &self.stride),
            ("dilation", &self.dilation),
        ] {
            if !size.all(|v| v > 0) {
                return Err(BindingError::invalid_configuration(
                    format!("{parameter} must be positive in every dimension"),
                    parameter,
                    size.to_string(),
                ));
            }
        }
        match self.padding {
            Padding::Explicit(size) if !size.all(|v| v >= 0) => Err(BindingError::invalid_configuration(
                "padding must be non-negative",
                "padding",
                size.to_string(),
            )),
            Padding::Same if !self.stride.all(|v| v == 1) => Err(BindingError::invalid_configuration(
                "padding='same' is not supported for strided convolutions",
                "padding",
                "same",
            )),
            _ => Ok(()),
        }
    }
}

/// Convolution kind with `D` spatial dimensions.
#[derive(Debug)]
pub struct ConvKind<const D: usize>(PhantomData<[(); D]>);

impl<const D: usize> ModuleKind for ConvKind<D> {
    type Config = ConvConfig<D>;

    const NAME: &'static str = match D {
        1 => "Conv1d",
        2 => "Conv2d",
        3 => "Conv3d",
        _ => "ConvNd",
    };

    const SLOTS: &'static [SlotSpec] = &[SlotSpec::parameter(slot::BIAS), SlotSpec::parameter(slot::WEIGHT)];

    fn descriptor(config: &ConvConfig<D>) -> Result<ModuleDescriptor> {
        if !(1..=3).contains(&D) {
            return Err(BindingError::invalid_configuration(
                "convolutions support 1 to 3 spatial dimensions",
                "spatial_dims",
                D.to_string(),
            ));
        }
        config.validate()?;
        Ok(ModuleDescriptor::Conv(ConvDescriptor {
            spatial_dims: D,
            in_channels: config.in_channels,
            out_channels: config.out_channels,
            kernel_size: config.kernel_size.as_slice().to_vec(),
            stride: config.stride.as_slice().to_vec(),
            padding: config.padding.into(),
            dilation: config.dilation.as_slice().to_vec(),
            padding_mode: config.padding_mode,
            groups: config.groups,
            bias: config.bias,
        }))
    }

    fn check_input(_config: &ConvConfig<D>, shape: &[i64]) -> Result<()> {
        let rank = shape.len();
        if rank == D + 1 || rank == D + 2 {
            Ok(())
        } else {
            Err(BindingError::invalid_input_rank(
                Self::NAME,
                format!("{} (unbatched) or {} (batched)", D + 1, D + 2),
                rank,
            ))
        }
    }

    fn placement(config: &ConvConfig<D>) -> (Option<Device>, Option<DType>) {
        (config.device, config.dtype)
    }
}

impl<const D: usize> AffineKind for ConvKind<D> {}

/// A convolution module with `D` spatial dimensions.
pub type Conv<const D: usize> = Module<ConvKind<D>>;
/// 1-D convolution.
pub type Conv1d = Conv<1>;
/// 2-D convolution.
pub type Conv2d = Conv<2>;
/// 3-D convolution.
pub type Conv3d = Conv<3>;

/// Creates a 1-D convolution with default options.
pub fn conv1d(engine: &Engine, in_channels: i64, out_channels: i64, kernel_size: i64) -> Result<Conv1d> {
    Conv1dConfig::new(in_channels, out_channels, kernel_size).build(engine)
}

/// Creates a 2-D convolution with default options.
pub fn conv2d(
    engine: &Engine,
    in_channels: i64,
    out_channels: i64,
    kernel_size: impl Into<Size<2>>,
) -> Result<Conv2d> {
    Conv2dConfig::new(in_channels, out_channels, kernel_size).build(engine)
}

/// Creates a 3-D convolution with default options.
///
/// # Arguments
/// * `in_channels` - Channels in the input volume
/// * `out_channels` - Channels produced by the convolution
/// * `kernel_size` - Kernel extent as a scalar or `(depth, height, width)`
pub fn conv3d(
    engine: &Engine,
    in_channels: i64,
    out_channels: i64,
    kernel_size: impl Into<Size<3>>,
) -> Result<Conv3d> {
    Conv3dConfig::new(in_channels, out_channels, kernel_size).build(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nativenn_core::engine::ConvPadding;

    #[test]
    fn test_descriptor_expands_scalars() {
        let config = Conv3dConfig::new(4, 8, 3).stride((1, 2, 2)).padding(1);
        let ModuleDescriptor::Conv(descriptor) = ConvKind::<3>::descriptor(&config).unwrap() else {
            panic!("expected a convolution descriptor");
        };
        assert_eq!(descriptor.kernel_size, vec![3, 3, 3]);
        assert_eq!(descriptor.stride, vec![1, 2, 2]);
        assert_eq!(descriptor.padding, ConvPadding::Explicit(vec![1, 1, 1]));
        assert_eq!(descriptor.dilation, vec![1, 1, 1]);
        assert!(descriptor.bias);
    }

    #[test]
    fn test_invalid_configurations() {
        let cases = [
            Conv2dConfig::new(0, 8, 3),
            Conv2dConfig::new(4, 8, 3).groups(3),
            Conv2dConfig::new(4, 6, 3).groups(4),
            Conv2dConfig::new(4, 8, (3, 0)),
            Conv2dConfig::new(4, 8, 3).dilation(0),
            Conv2dConfig::new(4, 8, 3).padding(-1),
            Conv2dConfig::new(4, 8, 3).stride(2).padding(Padding::Same),
        ];
        for config in cases {
            let err = ConvKind::<2>::descriptor(&config).unwrap_err();
            assert!(
                matches!(err, BindingError::InvalidConfiguration { .. }),
                "{config:?} gave {err}"
            );
        }
    }

    #[test]
    fn test_rank_contract() {
        let config = Conv1dConfig::new(2, 2, 1);
        assert!(ConvKind::<1>::check_input(&config, &[2, 5]).is_ok());
        assert!(ConvKind::<1>::check_input(&config, &[1, 2, 5]).is_ok());
        let err = ConvKind::<1>::check_input(&config, &[1, 1, 2, 5]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid number of dimensions for Conv1d input: expected 2 (unbatched) or 3 (batched), got 4"
        );
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ConvKind::<1>::NAME, "Conv1d");
        assert_eq!(ConvKind::<2>::NAME, "Conv2d");
        assert_eq!(ConvKind::<3>::NAME, "Conv3d");
    }
}
