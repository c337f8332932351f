//! Trainable tensors.

use crate::engine::Engine;
use crate::error::Result;
use crate::handle::RawHandle;
use crate::tensor::Tensor;
use std::ops::Deref;

/// A tensor tagged as a learnable module parameter.
///
/// A parameter derefs to its [`Tensor`], so every tensor query works on it
/// directly. Conversions through [`Tensor::to`] return plain tensors; use
/// [`Tensor::into_parameter`] to tag the result again.
#[derive(Debug)]
pub struct Parameter {
    tensor: Tensor,
}

impl Parameter {
    /// Wraps an owned tensor without any native call.
    pub(crate) fn adopt(tensor: Tensor) -> Self {
        Self { tensor }
    }

    /// Adopts a raw handle the engine already tracks as trainable.
    pub(crate) fn from_raw(engine: Engine, raw: RawHandle) -> Self {
        Self::adopt(Tensor::from_raw(engine, raw))
    }

    /// The underlying tensor.
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Unwraps the tensor.
    pub fn into_tensor(self) -> Tensor {
        self.tensor
    }

    /// A new parameter sharing this one's storage.
    pub fn shallow_clone(&self) -> Result<Self> {
        Ok(Self::adopt(self.tensor.shallow_clone()?))
    }
}

impl Deref for Parameter {
    type Target = Tensor;

    fn deref(&self) -> &Tensor {
        &self.tensor
    }
}

impl AsRef<Tensor> for Parameter {
    fn as_ref(&self) -> &Tensor {
        &self.tensor
    }
}
