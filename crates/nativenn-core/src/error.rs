//! Error types for binding operations.
//!
//! Two families of failures exist. Native failures are reported by the engine
//! through the per-call [`ErrorChannel`](crate::engine::ErrorChannel) and carry
//! the engine's own message. Wrapper failures (rank checks, unknown slots,
//! use after disposal) are raised before any native call is made.

use crate::engine::{NativeErrorKind, NativeFailure};
use crate::registry::SlotKind;
use thiserror::Error;

/// Errors that can occur when driving the native engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    /// The native engine reported a failure.
    ///
    /// The engine populated the error channel for the call. The message is
    /// passed through unchanged.
    #[error("Native engine failure ({kind}): {message}")]
    Native {
        /// Category reported by the engine
        kind: NativeErrorKind,
        /// Message reported by the engine
        message: String,
    },

    /// A native call that must produce a handle returned null without
    /// reporting a failure.
    #[error("Native call `{operation}` returned a null handle without reporting an error")]
    NullHandle {
        /// Name of the native entry point
        operation: String,
    },

    /// The input tensor has a rank the module does not accept.
    #[error("Invalid number of dimensions for {module} input: expected {expected}, got {actual}")]
    InvalidInputRank {
        /// Module kind name
        module: String,
        /// Accepted ranks
        expected: String,
        /// Rank of the offending input
        actual: usize,
    },

    /// The input tensor's shape is incompatible with the module.
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Expected shape
        expected: String,
        /// Actual shape
        actual: String,
    },

    /// The module kind declares no slot with this name.
    #[error("{module} has no slot named `{slot}`")]
    UnknownSlot {
        /// Module kind name
        module: String,
        /// Requested slot
        slot: String,
    },

    /// The slot exists but holds the other kind of state.
    #[error("Slot `{slot}` of {module} holds a {expected}, not a {actual}")]
    SlotKindMismatch {
        /// Module kind name
        module: String,
        /// Requested slot
        slot: String,
        /// Kind declared for the slot
        expected: SlotKind,
        /// Kind requested by the caller
        actual: SlotKind,
    },

    /// The slot cannot be assigned by the host.
    #[error("Slot `{slot}` of {module} is read-only")]
    ReadOnlySlot {
        /// Module kind name
        module: String,
        /// Requested slot
        slot: String,
    },

    /// The wrapper's handle was already released.
    #[error("{what} has already been disposed")]
    Released {
        /// Description of the disposed object
        what: String,
    },

    /// Invalid construction options.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Description of the configuration error
        reason: String,
        /// Name of the invalid option
        parameter: String,
        /// Value that was invalid
        value: String,
    },

    /// A device string could not be parsed.
    #[error("Invalid device specification `{spec}`")]
    InvalidDevice {
        /// The rejected string
        spec: String,
    },

    /// A dtype string could not be parsed.
    #[error("Invalid dtype specification `{spec}`")]
    InvalidDType {
        /// The rejected string
        spec: String,
    },
}

impl BindingError {
    /// Create a Native error.
    pub fn native<S: Into<String>>(kind: NativeErrorKind, message: S) -> Self {
        Self::Native {
            kind,
            message: message.into(),
        }
    }

    /// Create a NullHandle error for a native entry point.
    pub fn null_handle<S: Into<String>>(operation: S) -> Self {
        Self::NullHandle {
            operation: operation.into(),
        }
    }

    /// Create an InvalidInputRank error.
    pub fn invalid_input_rank<S1, S2>(module: S1, expected: S2, actual: usize) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::InvalidInputRank {
            module: module.into(),
            expected: expected.into(),
            actual,
        }
    }

    /// Create a ShapeMismatch error.
    pub fn shape_mismatch<S1, S2>(expected: S1, actual: S2) -> Self
    where
        S1: std::fmt::Display,
        S2: std::fmt::Display,
    {
        Self::ShapeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create an UnknownSlot error.
    pub fn unknown_slot<S1: Into<String>, S2: Into<String>>(module: S1, slot: S2) -> Self {
        Self::UnknownSlot {
            module: module.into(),
            slot: slot.into(),
        }
    }

    /// Create a Released error.
    pub fn released<S: Into<String>>(what: S) -> Self {
        Self::Released { what: what.into() }
    }

    /// Create an InvalidConfiguration error.
    pub fn invalid_configuration<S1, S2, S3>(reason: S1, parameter: S2, value: S3) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::InvalidConfiguration {
            reason: reason.into(),
            parameter: parameter.into(),
            value: value.into(),
        }
    }

    /// Returns true for failures raised by the wrapper before reaching the engine.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::InvalidInputRank { .. }
                | Self::ShapeMismatch { .. }
                | Self::UnknownSlot { .. }
                | Self::SlotKindMismatch { .. }
                | Self::ReadOnlySlot { .. }
                | Self::InvalidConfiguration { .. }
        )
    }

    /// Returns the engine's error kind for native failures.
    pub fn native_kind(&self) -> Option<NativeErrorKind> {
        match self {
            Self::Native { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<NativeFailure> for BindingError {
    fn from(failure: NativeFailure) -> Self {
        Self::Native {
            kind: failure.kind,
            message: failure.message,
        }
    }
}

/// Result type alias for binding operations.
pub type Result<T> = std::result::Result<T, BindingError>;
