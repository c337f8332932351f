//! Typed slot accessors.
//!
//! Module kinds opt into the accessors that match their slots by
//! implementing the marker traits below.

use super::{slot, Module, ModuleKind};
use crate::error::Result;
use crate::parameter::Parameter;
use crate::tensor::Tensor;

/// Kinds with `weight` and `bias` parameter slots.
pub trait AffineKind: ModuleKind {}

/// Kinds that track running statistics in buffers.
pub trait RunningStatsKind: ModuleKind {}

impl<K: AffineKind> Module<K> {
    /// The weight parameter, if present.
    pub fn weight(&self) -> Result<Option<Parameter>> {
        self.parameter(slot::WEIGHT)
    }

    /// Replaces or removes the weight parameter.
    pub fn set_weight(&self, value: Option<&Parameter>) -> Result<()> {
        self.set_parameter(slot::WEIGHT, value)
    }

    /// The bias parameter, if present.
    pub fn bias(&self) -> Result<Option<Parameter>> {
        self.parameter(slot::BIAS)
    }

    /// Replaces or removes the bias parameter.
    pub fn set_bias(&self, value: Option<&Parameter>) -> Result<()> {
        self.set_parameter(slot::BIAS, value)
    }
}

impl<K: RunningStatsKind> Module<K> {
    /// The running mean buffer, if tracked.
    pub fn running_mean(&self) -> Result<Option<Tensor>> {
        self.buffer(slot::RUNNING_MEAN)
    }

    /// Replaces or removes the running mean buffer.
    pub fn set_running_mean(&self, value: Option<&Tensor>) -> Result<()> {
        self.set_buffer(slot::RUNNING_MEAN, value)
    }

    /// The running variance buffer, if tracked.
    pub fn running_var(&self) -> Result<Option<Tensor>> {
        self.buffer(slot::RUNNING_VAR)
    }

    /// Replaces or removes the running variance buffer.
    pub fn set_running_var(&self, value: Option<&Tensor>) -> Result<()> {
        self.set_buffer(slot::RUNNING_VAR, value)
    }

    /// Batch counter maintained by the engine. Read-only.
    pub fn num_batches_tracked(&self) -> Result<Option<Tensor>> {
        self.buffer(slot::NUM_BATCHES_TRACKED)
    }

    /// Resets the running mean to zero, the running variance to one and the
    /// batch counter to zero.
    ///
    /// The engine resets the buffers in place, so registered entries keep
    /// pointing at the same storage.
    pub fn reset_running_stats(&self) -> Result<()> {
        let state = self.state.lock();
        K::reset_running_stats(&self.engine, state.handles.primary()?)
    }
}
