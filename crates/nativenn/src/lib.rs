//! Neural-network modules backed by a native tensor engine.
//!
//! This crate re-exports the protocol crate and the concrete module kinds:
//!
//! - [`core`]: handles, error channel, tensors, registry and migration
//! - [`modules`]: convolution, normalization and functional convolution
//!
//! # Example
//!
//! ```ignore
//! use nativenn::prelude::*;
//!
//! let engine = Engine::new(native);
//! let conv = Conv2dConfig::new(3, 16, 3).padding(1).build(&engine)?;
//! conv.to_device(Device::cuda(0))?;
//! let output = conv.forward(&input)?;
//! ```

pub use nativenn_core as core;
pub use nativenn_modules as modules;

pub use nativenn_core::{BindingError, Result};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use nativenn_core::prelude::*;
    pub use nativenn_modules::functional;
    pub use nativenn_modules::prelude::*;
}
