//! Engine-wide defaults for device and dtype.
//!
//! Construction functions that are not given an explicit device or dtype fall
//! back to the defaults of the [`Engine`](crate::engine::Engine) they run on.
//! Engines created with [`Engine::new`](crate::engine::Engine::new) inherit the
//! process-wide ambient defaults, which are read once from the environment.

use crate::device::{DType, Device};
use once_cell::sync::Lazy;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Environment variable overriding the ambient default device.
pub const DEVICE_ENV: &str = "NATIVENN_DEFAULT_DEVICE";

/// Environment variable overriding the ambient default dtype.
pub const DTYPE_ENV: &str = "NATIVENN_DEFAULT_DTYPE";

/// Default placement for newly constructed modules and tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EngineDefaults {
    /// Device used when none is requested.
    pub device: Device,
    /// Dtype used when none is requested.
    pub dtype: DType,
}

impl EngineDefaults {
    /// Reads the defaults from the environment.
    ///
    /// Unset or unparsable variables fall back to `cpu` and `float32`.
    pub fn from_env() -> Self {
        let fallback = Self::default();
        let device = std::env::var(DEVICE_ENV)
            .ok()
            .and_then(|spec| spec.parse().ok())
            .unwrap_or(fallback.device);
        let dtype = std::env::var(DTYPE_ENV)
            .ok()
            .and_then(|spec| spec.parse().ok())
            .unwrap_or(fallback.dtype);
        Self { device, dtype }
    }
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            device: Device::CPU,
            dtype: DType::Float32,
        }
    }
}

/// Process-wide defaults detected at first use.
pub static AMBIENT_DEFAULTS: Lazy<Arc<EngineDefaults>> =
    Lazy::new(|| Arc::new(EngineDefaults::from_env()));

/// Get the ambient defaults.
pub fn ambient_defaults() -> &'static EngineDefaults {
    &AMBIENT_DEFAULTS
}

/// Builder for creating custom engine defaults.
pub struct EngineDefaultsBuilder {
    defaults: EngineDefaults,
}

impl EngineDefaultsBuilder {
    /// Create a new builder starting from the ambient defaults.
    pub fn new() -> Self {
        Self {
            defaults: *ambient_defaults(),
        }
    }

    /// Set the default device.
    pub fn device(mut self, device: Device) -> Self {
        self.defaults.device = device;
        self
    }

    /// Set the default dtype.
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.defaults.dtype = dtype;
        self
    }

    /// Build the defaults.
    pub fn build(self) -> EngineDefaults {
        self.defaults
    }
}

impl Default for EngineDefaultsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
