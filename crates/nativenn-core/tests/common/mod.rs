//! Module kinds used by the integration tests.

#![allow(dead_code)]

use nativenn_core::prelude::*;

/// Statistics-tracking kind backed by the engine's batch normalization.
pub struct Tracked;

impl ModuleKind for Tracked {
    type Config = i64;

    const NAME: &'static str = "Tracked";

    const SLOTS: &'static [SlotSpec] = &[
        SlotSpec::parameter(slot::BIAS),
        SlotSpec::parameter(slot::WEIGHT),
        SlotSpec::buffer(slot::RUNNING_MEAN),
        SlotSpec::buffer(slot::RUNNING_VAR),
        SlotSpec::read_only_buffer(slot::NUM_BATCHES_TRACKED),
    ];

    fn descriptor(num_features: &i64) -> Result<ModuleDescriptor> {
        Ok(ModuleDescriptor::BatchNorm(NormDescriptor {
            spatial_dims: 1,
            num_features: *num_features,
            eps: 1e-5,
            momentum: 0.1,
            affine: true,
            track_running_stats: true,
        }))
    }

    fn check_input(_: &i64, shape: &[i64]) -> Result<()> {
        if (2..=3).contains(&shape.len()) {
            Ok(())
        } else {
            Err(BindingError::invalid_input_rank(Self::NAME, "2 or 3", shape.len()))
        }
    }

    fn placement(_: &i64) -> (Option<Device>, Option<DType>) {
        (None, None)
    }
}

impl AffineKind for Tracked {}
impl RunningStatsKind for Tracked {}

pub const FEATURES: i64 = 4;

pub fn tracked(engine: &Engine) -> Module<Tracked> {
    Module::<Tracked>::new(engine, FEATURES).expect("module construction")
}

pub fn batch(engine: &Engine, value: f64) -> Tensor {
    Tensor::full(engine, &[2, FEATURES], value, TensorOptions::default()).expect("input tensor")
}

pub fn parameter(engine: &Engine, values: &[f64]) -> Parameter {
    Tensor::from_slice(engine, values, &[values.len() as i64], TensorOptions::default())
        .and_then(Tensor::into_parameter)
        .expect("parameter")
}
