//! Raw and owned native handles.
//!
//! A [`RawHandle`] is the address-sized identifier the engine hands out. It is
//! `Copy` and carries no ownership. Ownership lives in [`TensorHandle`] and
//! [`ModuleHandles`], which are move-only and release their native resources
//! exactly once: either through an explicit `release` call or on drop,
//! whichever comes first.

use crate::engine::Engine;
use crate::error::{BindingError, Result};
use std::fmt;

/// Opaque identifier of an engine-owned resource.
///
/// The zero value denotes "absent" and is never dereferenced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RawHandle(usize);

impl RawHandle {
    /// The absent handle.
    pub const NULL: Self = Self(0);

    /// Wraps an identifier produced by the engine.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the underlying identifier.
    pub const fn as_raw(self) -> usize {
        self.0
    }

    /// Returns true for the absent handle.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

/// Owned reference to a native tensor.
pub(crate) struct TensorHandle {
    raw: RawHandle,
    released: bool,
    engine: Engine,
}

impl TensorHandle {
    /// Adopts `raw`. The caller must not release it independently afterwards.
    pub(crate) fn adopt(engine: Engine, raw: RawHandle) -> Self {
        debug_assert!(!raw.is_null(), "adopting a null tensor handle");
        Self {
            raw,
            released: false,
            engine,
        }
    }

    pub(crate) fn raw(&self) -> Result<RawHandle> {
        if self.released {
            Err(BindingError::released("tensor"))
        } else {
            Ok(self.raw)
        }
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released
    }

    /// Releases the native reference. Returns false if it was already released.
    pub(crate) fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        tracing::trace!(handle = %self.raw, "releasing tensor handle");
        self.engine.native().tensor_release(self.raw);
        true
    }
}

impl fmt::Debug for TensorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorHandle")
            .field("raw", &self.raw)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for TensorHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// The primary/dispatch handle pair of a native module.
///
/// Both handles share one lifetime and are released together. The dispatch
/// handle is only ever passed back to the engine on release.
pub(crate) struct ModuleHandles {
    primary: RawHandle,
    dispatch: RawHandle,
    released: bool,
    engine: Engine,
}

impl ModuleHandles {
    pub(crate) fn adopt(engine: Engine, primary: RawHandle, dispatch: RawHandle) -> Self {
        debug_assert!(!primary.is_null(), "adopting a null module handle");
        Self {
            primary,
            dispatch,
            released: false,
            engine,
        }
    }

    pub(crate) fn primary(&self) -> Result<RawHandle> {
        if self.released {
            Err(BindingError::released("module"))
        } else {
            Ok(self.primary)
        }
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released
    }

    pub(crate) fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        tracing::trace!(primary = %self.primary, dispatch = %self.dispatch, "releasing module handles");
        self.engine.native().module_release(self.primary, self.dispatch);
        true
    }
}

impl fmt::Debug for ModuleHandles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandles")
            .field("primary", &self.primary)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for ModuleHandles {
    fn drop(&mut self) {
        self.release();
    }
}
