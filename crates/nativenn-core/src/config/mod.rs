//! Configuration utilities for the bindings.

pub mod defaults;

// Re-export key items
pub use defaults::{ambient_defaults, EngineDefaults, EngineDefaultsBuilder, DEVICE_ENV, DTYPE_ENV};
