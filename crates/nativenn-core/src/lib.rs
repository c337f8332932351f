//! Core protocol for modules backed by a native tensor engine.
//!
//! This crate owns the part of the bindings that is independent of any
//! particular layer type: how native resource handles are owned and released,
//! how failures reported by the engine are surfaced after every call, how a
//! module's trainable state is mirrored into a managed registry, and how
//! modules are moved between devices and numeric representations.
//!
//! # Key Concepts
//!
//! - **Handles**: opaque, move-only references to engine-owned resources,
//!   released exactly once
//! - **Error channel**: a per-call failure slot checked after every native call
//! - **Tensors and parameters**: owning wrappers around tensor handles
//! - **Registry**: the managed name-to-slot mirror of a native module
//! - **Migration**: the native fast path and the manual per-slot fallback
//!
//! # Modules
//!
//! - [`config`]: Engine-wide defaults (device and dtype)
//! - [`device`]: Device and dtype descriptions
//! - [`engine`]: The native engine boundary and the error channel
//! - [`error`]: Error types for binding operations
//! - [`handle`]: Raw and owned native handles
//! - [`module`]: The generic module wrapper and its accessors
//! - [`parameter`]: Trainable tensor wrapper
//! - [`registry`]: Parameter/buffer registry
//! - [`tensor`]: Tensor wrapper
//! - `testing`: Reference-engine helpers (feature `test-utils`)

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod handle;
pub mod module;
pub mod parameter;
pub mod registry;
pub mod tensor;

#[cfg(feature = "test-utils")]
pub mod testing;

// Re-export commonly used items at the crate root
pub use error::{BindingError, Result};

/// Prelude module for convenient imports.
///
/// # Example
/// ```
/// use nativenn_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{ambient_defaults, EngineDefaults, EngineDefaultsBuilder};
    pub use crate::device::{DType, Device, DeviceType};
    pub use crate::engine::{
        ConvDescriptor, ConvPadding, Engine, ErrorChannel, LayerNormDescriptor, ModuleDescriptor,
        NativeEngine, NativeErrorKind, NativeFailure, NormDescriptor, PaddingMode,
    };
    pub use crate::error::{BindingError, Result};
    pub use crate::handle::RawHandle;
    pub use crate::module::{
        slot, AffineKind, MigrationPath, Module, ModuleKind, RunningStatsKind, SlotSpec,
    };
    pub use crate::parameter::Parameter;
    pub use crate::registry::{Registry, RegistryEntry, SlotKind};
    pub use crate::tensor::{Tensor, TensorOptions};

    #[cfg(feature = "test-utils")]
    pub use crate::engine::reference::ReferenceEngine;
}
