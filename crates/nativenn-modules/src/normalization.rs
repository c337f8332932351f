//! Batch, instance and layer normalization modules.
//!
//! Batch and instance normalization share their slot layout: affine
//! `weight`/`bias` parameters of shape `[C]`, and `running_mean`,
//! `running_var` and `num_batches_tracked` buffers. Each slot is empty when
//! the corresponding option (`affine`, `track_running_stats`) is disabled.
//! `num_batches_tracked` is an `int64` scalar advanced by the engine; it keeps
//! its dtype when the module is cast.
//!
//! Accepted input ranks:
//!
//! | module | ranks |
//! |---|---|
//! | `BatchNorm1d` | 2 or 3 |
//! | `BatchNorm2d` | 4 |
//! | `BatchNorm3d` | 5 |
//! | `InstanceNorm1d` | 2 or 3 |
//! | `InstanceNorm2d` | 3 or 4 |
//! | `InstanceNorm3d` | 4 or 5 |

use nativenn_core::device::{DType, Device};
use nativenn_core::engine::{Engine, LayerNormDescriptor, ModuleDescriptor, NormDescriptor};
use nativenn_core::error::{BindingError, Result};
use nativenn_core::module::{slot, AffineKind, Module, ModuleKind, RunningStatsKind, SlotSpec};
use std::marker::PhantomData;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const NORM_SLOTS: &[SlotSpec] = &[
    SlotSpec::parameter(slot::BIAS),
    SlotSpec::parameter(slot::WEIGHT),
    SlotSpec::buffer(slot::RUNNING_MEAN),
    SlotSpec::buffer(slot::RUNNING_VAR),
    SlotSpec::read_only_buffer(slot::NUM_BATCHES_TRACKED),
];

/// Options of batch and instance normalization.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NormConfig<const D: usize> {
    /// Channel count `C`
    pub num_features: i64,
    /// Added to the variance for numerical stability, default 1e-5
    pub eps: f64,
    /// Running statistics update factor, default 0.1
    pub momentum: f64,
    /// Learnable per-channel affine parameters
    pub affine: bool,
    /// Running statistics buffers
    pub track_running_stats: bool,
    /// Target device, engine default when unset
    pub device: Option<Device>,
    /// Target dtype, engine default when unset
    pub dtype: Option<DType>,
}

impl<const D: usize> NormConfig<D> {
    /// Batch normalization defaults: affine, tracking running statistics.
    pub fn new(num_features: i64) -> Self {
        Self {
            num_features,
            eps: 1e-5,
            momentum: 0.1,
            affine: true,
            track_running_stats: true,
            device: None,
            dtype: None,
        }
    }

    /// Instance normalization defaults: no affine parameters, no running
    /// statistics.
    pub fn instance(num_features: i64) -> Self {
        Self {
            affine: false,
            track_running_stats: false,
            ..Self::new(num_features)
        }
    }

    /// Set eps.
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Set the momentum.
    pub fn momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    /// Enable or disable the affine parameters.
    pub fn affine(mut self, affine: bool) -> Self {
        self.affine = affine;
        self
    }

    /// Enable or disable running statistics.
    pub fn track_running_stats(mut self, track: bool) -> Self {
        self.track_running_stats = track;
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

    fn descriptor(&self) -> Result<NormDescriptor> {
        if !(1..=3).contains(&D) {
            return Err(BindingError::invalid_configuration(
                "normalization supports 1 to 3 spatial dimensions",
                "spatial_dims",
                D.to_string(),
            ));
        }
        if self.num_features <= 0 {
            return Err(BindingError::invalid_configuration(
                "num_features must be positive",
                "num_features",
                self.num_features.to_string(),
            ));
        }
        if !(self.eps.is_finite() && self.eps > 0.0) {
            return Err(BindingError::invalid_configuration(
                "eps must be positive and finite",
                "eps",
                self.eps.to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.momentum) {
            return Err(BindingError::invalid_configuration(
                "momentum must lie in [0, 1]",
                "momentum",
                self.momentum.to_string(),
            ));
        }
        Ok(NormDescriptor {
            spatial_dims: D,
            num_features: self.num_features,
            eps: self.eps,
            momentum: self.momentum,
            affine: self.affine,
            track_running_stats: self.track_running_stats,
        })
    }
}

fn check_rank(module: &str, accepted: &[usize], shape: &[i64]) -> Result<()> {
    if accepted.contains(&shape.len()) {
        return Ok(());
    }
    let expected = accepted
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" or ");
    Err(BindingError::invalid_input_rank(module, expected, shape.len()))
}

/// Batch normalization kind with `D` spatial dimensions.
#[derive(Debug)]
pub struct BatchNormKind<const D: usize>(PhantomData<[(); D]>);

impl<const D: usize> ModuleKind for BatchNormKind<D> {
    type Config = NormConfig<D>;

    const NAME: &'static str = match D {
        1 => "BatchNorm1d",
        2 => "BatchNorm2d",
        3 => "BatchNorm3d",
        _ => "BatchNormNd",
    };

    const SLOTS: &'static [SlotSpec] = NORM_SLOTS;

    fn descriptor(config: &NormConfig<D>) -> Result<ModuleDescriptor> {
        config.descriptor().map(ModuleDescriptor::BatchNorm)
    }

    fn check_input(_config: &NormConfig<D>, shape: &[i64]) -> Result<()> {
        // (N, C) is also accepted in one dimension.
        if D == 1 {
            check_rank(Self::NAME, &[2, 3], shape)
        } else {
            check_rank(Self::NAME, &[D + 2], shape)
        }
    }

    fn placement(config: &NormConfig<D>) -> (Option<Device>, Option<DType>) {
        (config.device, config.dtype)
    }
}

impl<const D: usize> AffineKind for BatchNormKind<D> {}
impl<const D: usize> RunningStatsKind for BatchNormKind<D> {}

/// Instance normalization kind with `D` spatial dimensions.
#[derive(Debug)]
pub struct InstanceNormKind<const D: usize>(PhantomData<[(); D]>);

impl<const D: usize> ModuleKind for InstanceNormKind<D> {
    type Config = NormConfig<D>;

    const NAME: &'static str = match D {
        1 => "InstanceNorm1d",
        2 => "InstanceNorm2d",
        3 => "InstanceNorm3d",
        _ => "InstanceNormNd",
    };

    const SLOTS: &'static [SlotSpec] = NORM_SLOTS;

    fn descriptor(config: &NormConfig<D>) -> Result<ModuleDescriptor> {
        config.descriptor().map(ModuleDescriptor::InstanceNorm)
    }

    fn check_input(_config: &NormConfig<D>, shape: &[i64]) -> Result<()> {
        check_rank(Self::NAME, &[D + 1, D + 2], shape)
    }

    fn placement(config: &NormConfig<D>) -> (Option<Device>, Option<DType>) {
        (config.device, config.dtype)
    }
}

impl<const D: usize> AffineKind for InstanceNormKind<D> {}
impl<const D: usize> RunningStatsKind for InstanceNormKind<D> {}

/// Batch normalization with `D` spatial dimensions.
pub type BatchNorm<const D: usize> = Module<BatchNormKind<D>>;
/// Batch normalization over `(N, C)` or `(N, C, L)` inputs.
pub type BatchNorm1d = BatchNorm<1>;
/// Batch normalization over `(N, C, H, W)` inputs.
pub type BatchNorm2d = BatchNorm<2>;
/// Batch normalization over `(N, C, D, H, W)` inputs.
pub type BatchNorm3d = BatchNorm<3>;

/// Instance normalization with `D` spatial dimensions.
pub type InstanceNorm<const D: usize> = Module<InstanceNormKind<D>>;
/// Instance normalization over `(C, L)` or `(N, C, L)` inputs.
pub type InstanceNorm1d = InstanceNorm<1>;
/// Instance normalization over `(C, H, W)` or `(N, C, H, W)` inputs.
pub type InstanceNorm2d = InstanceNorm<2>;
/// Instance normalization over `(C, D, H, W)` or `(N, C, D, H, W)` inputs.
pub type InstanceNorm3d = InstanceNorm<3>;

/// Creates a `BatchNorm1d` with default options.
pub fn batch_norm1d(engine: &Engine, num_features: i64) -> Result<BatchNorm1d> {
    BatchNorm1d::new(engine, NormConfig::new(num_features))
}

/// Creates a `BatchNorm2d` with default options.
pub fn batch_norm2d(engine: &Engine, num_features: i64) -> Result<BatchNorm2d> {
    BatchNorm2d::new(engine, NormConfig::new(num_features))
}

/// Creates a `BatchNorm3d` with default options.
pub fn batch_norm3d(engine: &Engine, num_features: i64) -> Result<BatchNorm3d> {
    BatchNorm3d::new(engine, NormConfig::new(num_features))
}

/// Creates an `InstanceNorm1d` with default options.
pub fn instance_norm1d(engine: &Engine, num_features: i64) -> Result<InstanceNorm1d> {
    InstanceNorm1d::new(engine, NormConfig::instance(num_features))
}

/// Creates an `InstanceNorm2d` with default options.
pub fn instance_norm2d(engine: &Engine, num_features: i64) -> Result<InstanceNorm2d> {
    InstanceNorm2d::new(engine, NormConfig::instance(num_features))
}

/// Creates an `InstanceNorm3d` with default options.
pub fn instance_norm3d(engine: &Engine, num_features: i64) -> Result<InstanceNorm3d> {
    InstanceNorm3d::new(engine, NormConfig::instance(num_features))
}

/// Options of layer normalization.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerNormConfig {
    /// Trailing input shape that is normalized
    pub normalized_shape: Vec<i64>,
    /// Added to the variance for numerical stability, default 1e-5
    pub eps: f64,
    /// Learnable per-element affine parameters, default true
    pub elementwise_affine: bool,
    /// Target device, engine default when unset
    pub device: Option<Device>,
    /// Target dtype, engine default when unset
    pub dtype: Option<DType>,
}

impl LayerNormConfig {
    /// Options normalizing over `normalized_shape`.
    pub fn new(normalized_shape: impl Into<Vec<i64>>) -> Self {
        Self {
            normalized_shape: normalized_shape.into(),
            eps: 1e-5,
            elementwise_affine: true,
            device: None,
            dtype: None,
        }
    }

    /// Set eps.
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Enable or disable the affine parameters.
    pub fn elementwise_affine(mut self, affine: bool) -> Self {
        self.elementwise_affine = affine;
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
    pub fn build(self, engine: &Engine) -> Result<LayerNorm> {
        LayerNorm::new(engine, self)
    }
}

/// Layer normalization kind.
#[derive(Debug)]
pub struct LayerNormKind;

impl ModuleKind for LayerNormKind {
    type Config = LayerNormConfig;

    const NAME: &'static str = "LayerNorm";

    const SLOTS: &'static [SlotSpec] = &[SlotSpec::parameter(slot::BIAS), SlotSpec::parameter(slot::WEIGHT)];

    fn descriptor(config: &LayerNormConfig) -> Result<ModuleDescriptor> {
        let shape = &config.normalized_shape;
        if shape.is_empty() || shape.iter().any(|&d| d <= 0) {
            return Err(BindingError::invalid_configuration(
                "normalized_shape must be non-empty with positive extents",
                "normalized_shape",
                format!("{shape:?}"),
            ));
        }
        if !(config.eps.is_finite() && config.eps > 0.0) {
            return Err(BindingError::invalid_configuration(
                "eps must be positive and finite",
                "eps",
                config.eps.to_string(),
            ));
        }
        Ok(ModuleDescriptor::LayerNorm(LayerNormDescriptor {
            normalized_shape: shape.clone(),
            eps: config.eps,
            elementwise_affine: config.elementwise_affine,
        }))
    }

    fn check_input(config: &LayerNormConfig, shape: &[i64]) -> Result<()> {
        let normalized = &config.normalized_shape;
        if shape.len() < normalized.len() {
            return Err(BindingError::invalid_input_rank(
                Self::NAME,
                format!("at least {}", normalized.len()),
                shape.len(),
            ));
        }
        if !shape.ends_with(normalized) {
            return Err(BindingError::shape_mismatch(
                format!("[*, {}]", normalized.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")),
                format!("{shape:?}"),
            ));
        }
        Ok(())
    }

    fn placement(config: &LayerNormConfig) -> (Option<Device>, Option<DType>) {
        (config.device, config.dtype)
    }
}

impl AffineKind for LayerNormKind {}

/// Layer normalization over the trailing dimensions of the input.
pub type LayerNorm = Module<LayerNormKind>;

/// Creates a `LayerNorm` with default options.
pub fn layer_norm(engine: &Engine, normalized_shape: impl Into<Vec<i64>>) -> Result<LayerNorm> {
    LayerNormConfig::new(normalized_shape).build(engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let batch = NormConfig::<2>::new(8);
        assert!(batch.affine && batch.track_running_stats);
        assert_eq!(batch.eps, 1e-5);
        assert_eq!(batch.momentum, 0.1);

        let instance = NormConfig::<1>::instance(8);
        assert!(!instance.affine && !instance.track_running_stats);
        assert_eq!(instance.eps, 1e-5);
    }

    #[test]
    fn test_rank_tables() {
        let config1 = NormConfig::<1>::new(3);
        let config2 = NormConfig::<2>::new(3);
        let config3 = NormConfig::<3>::new(3);

        assert!(BatchNormKind::<1>::check_input(&config1, &[4, 3]).is_ok());
        assert!(BatchNormKind::<1>::check_input(&config1, &[4, 3, 7]).is_ok());
        assert!(BatchNormKind::<2>::check_input(&config2, &[3, 5, 5]).is_err());
        assert!(BatchNormKind::<2>::check_input(&config2, &[1, 3, 5, 5]).is_ok());
        assert!(BatchNormKind::<3>::check_input(&config3, &[1, 3, 2, 5, 5]).is_ok());

        assert!(InstanceNormKind::<1>::check_input(&config1, &[3]).is_err());
        assert!(InstanceNormKind::<2>::check_input(&config2, &[3, 5, 5]).is_ok());
        assert!(InstanceNormKind::<3>::check_input(&config3, &[3, 2, 5, 5]).is_ok());
        assert!(InstanceNormKind::<3>::check_input(&config3, &[1, 3, 2, 5, 5, 1]).is_err());
    }

    #[test]
    fn test_batch_norm2d_rank_message() {
        let err = BatchNormKind::<2>::check_input(&NormConfig::new(3), &[3, 5, 5]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid number of dimensions for BatchNorm2d input: expected 4, got 3"
        );
    }

    #[test]
    fn test_layer_norm_trailing_shape() {
        let config = LayerNormConfig::new(vec![4, 8]);
        assert!(LayerNormKind::check_input(&config, &[2, 4, 8]).is_ok());
        assert!(LayerNormKind::check_input(&config, &[4, 8]).is_ok());
        assert!(matches!(
            LayerNormKind::check_input(&config, &[2, 8, 4]),
            Err(BindingError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            LayerNormKind::check_input(&config, &[8]),
            Err(BindingError::InvalidInputRank { .. })
        ));
    }

    #[test]
    fn test_invalid_norm_options() {
        assert!(BatchNormKind::<2>::descriptor(&NormConfig::new(0)).is_err());
        assert!(BatchNormKind::<2>::descriptor(&NormConfig::new(3).eps(0.0)).is_err());
        assert!(InstanceNormKind::<1>::descriptor(&NormConfig::instance(3).momentum(1.5)).is_err());
        assert!(LayerNormKind::descriptor(&LayerNormConfig::new(Vec::new())).is_err());
    }
}
