//! Per-call error channel.
//!
//! Every native entry point receives an [`ErrorChannel`] and records its
//! failure there instead of (or in addition to) signalling it through the
//! return value. The wrapper creates a fresh channel for each call and checks
//! it afterwards, so concurrent calls never observe each other's failures.

use crate::error::{BindingError, Result};
use parking_lot::Mutex;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Category of a failure reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NativeErrorKind {
    /// Memory or resource allocation failed.
    Allocation,
    /// An argument was rejected by the engine.
    InvalidArgument,
    /// A handle was unknown or already released.
    InvalidHandle,
    /// The operation is not supported for the requested backend or dtype.
    Unsupported,
    /// Operands live on different devices or in different dtypes.
    DeviceMismatch,
    /// Any other runtime failure.
    Runtime,
}

impl fmt::Display for NativeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Allocation => "allocation",
            Self::InvalidArgument => "invalid argument",
            Self::InvalidHandle => "invalid handle",
            Self::Unsupported => "unsupported",
            Self::DeviceMismatch => "device mismatch",
            Self::Runtime => "runtime",
        };
        f.write_str(name)
    }
}

/// A failure reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeFailure {
    /// Failure category
    pub kind: NativeErrorKind,
    /// Engine message
    pub message: String,
}

impl NativeFailure {
    /// Creates a failure record.
    pub fn new<S: Into<String>>(kind: NativeErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Failure slot for one logical native call.
#[derive(Debug, Default)]
pub struct ErrorChannel {
    slot: Mutex<Option<NativeFailure>>,
}

impl ErrorChannel {
    /// Creates an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure. A later failure replaces an earlier one.
    pub fn record<S: Into<String>>(&self, kind: NativeErrorKind, message: S) {
        *self.slot.lock() = Some(NativeFailure::new(kind, message));
    }

    /// Returns true if no failure was recorded.
    pub fn is_clear(&self) -> bool {
        self.slot.lock().is_none()
    }

    /// Returns a copy of the recorded failure, if any.
    pub fn peek(&self) -> Option<NativeFailure> {
        self.slot.lock().clone()
    }

    /// Removes and returns the recorded failure.
    pub fn take(&self) -> Option<NativeFailure> {
        self.slot.lock().take()
    }

    /// Converts a recorded failure into an error, clearing the channel.
    pub fn check(&self) -> Result<()> {
        match self.take() {
            Some(failure) => Err(BindingError::from(failure)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_channel_checks_ok() {
        let channel = ErrorChannel::new();
        assert!(channel.is_clear());
        assert!(channel.check().is_ok());
    }

    #[test]
    fn test_check_consumes_failure() {
        let channel = ErrorChannel::new();
        channel.record(NativeErrorKind::Runtime, "first");
        channel.record(NativeErrorKind::Allocation, "second");

        assert_eq!(
            channel.peek(),
            Some(NativeFailure::new(NativeErrorKind::Allocation, "second"))
        );
        let err = channel.check().unwrap_err();
        assert_eq!(err.native_kind(), Some(NativeErrorKind::Allocation));
        assert!(channel.is_clear());
        assert!(channel.check().is_ok());
    }

    #[test]
    fn test_channels_are_independent() {
        let a = ErrorChannel::new();
        let b = ErrorChannel::new();
        a.record(NativeErrorKind::InvalidHandle, "stale");

        assert!(!a.is_clear());
        assert!(b.is_clear());
    }
}
