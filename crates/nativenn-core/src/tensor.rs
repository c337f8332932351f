//! Tensor wrapper.
//!
//! A [`Tensor`] owns exactly one native reference. Several wrappers may point
//! at the same native storage (the engine reference-counts it), but each
//! wrapper releases only its own reference, exactly once.
//!
//! Shape, dtype and device are queried from the engine on first use. The
//! shape of a handle never changes, so it is cached; dtype and device are
//! cached the same way because conversions always produce a new handle.

use crate::device::{DType, Device};
use crate::engine::Engine;
use crate::error::{BindingError, Result};
use crate::handle::{RawHandle, TensorHandle};
use crate::parameter::Parameter;
use once_cell::sync::OnceCell;
use std::fmt;

/// Placement of a tensor created from host data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TensorOptions {
    /// Element type, engine default when `None`
    pub dtype: Option<DType>,
    /// Device, engine default when `None`
    pub device: Option<Device>,
}

impl TensorOptions {
    /// Options with the given dtype.
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Options with the given device.
    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }
}

/// An n-dimensional array living in engine memory.
pub struct Tensor {
    handle: TensorHandle,
    shape: OnceCell<Vec<i64>>,
    dtype: OnceCell<DType>,
    device: OnceCell<Device>,
}

impl Tensor {
    /// Adopts a handle returned by the engine.
    ///
    /// The caller must not release `raw` independently afterwards. Fails
    /// with [`BindingError::NullHandle`] when `raw` is null.
    pub fn try_from_raw(engine: Engine, raw: RawHandle) -> Result<Self> {
        if raw.is_null() {
            return Err(BindingError::null_handle("tensor adoption"));
        }
        Ok(Self::from_raw(engine, raw))
    }

    /// Adopts a non-null handle the crate obtained from the engine.
    pub(crate) fn from_raw(engine: Engine, raw: RawHandle) -> Self {
        Self {
            handle: TensorHandle::adopt(engine, raw),
            shape: OnceCell::new(),
            dtype: OnceCell::new(),
            device: OnceCell::new(),
        }
    }

    /// Creates a tensor from host data laid out in row-major order.
    pub fn from_slice(
        engine: &Engine,
        data: &[f64],
        shape: &[i64],
        options: TensorOptions,
    ) -> Result<Self> {
        let expected = element_count(shape)?;
        if expected != data.len() {
            return Err(BindingError::shape_mismatch(
                format!("{expected} elements for shape {shape:?}"),
                format!("{} elements", data.len()),
            ));
        }
        let dtype = options.dtype.unwrap_or(engine.defaults().dtype);
        let device = options.device.unwrap_or(engine.defaults().device);
        let raw = engine.invoke_tensor("tensor_from_data", |native, status| {
            native.tensor_from_data(data, shape, dtype, device, status)
        })?;
        Ok(Self::from_raw(engine.clone(), raw))
    }

    /// Creates a tensor filled with `value`.
    pub fn full(engine: &Engine, shape: &[i64], value: f64, options: TensorOptions) -> Result<Self> {
        let len = element_count(shape)?;
        Self::from_slice(engine, &vec![value; len], shape, options)
    }

    /// Creates a tensor of zeros.
    pub fn zeros(engine: &Engine, shape: &[i64], options: TensorOptions) -> Result<Self> {
        Self::full(engine, shape, 0.0, options)
    }

    /// Creates a tensor of ones.
    pub fn ones(engine: &Engine, shape: &[i64], options: TensorOptions) -> Result<Self> {
        Self::full(engine, shape, 1.0, options)
    }

    /// The engine this tensor lives in.
    pub fn engine(&self) -> &Engine {
        self.handle.engine()
    }

    /// The raw handle, valid while this wrapper is alive and not disposed.
    pub fn raw(&self) -> Result<RawHandle> {
        self.handle.raw()
    }

    /// Shape of the tensor.
    pub fn shape(&self) -> Result<Vec<i64>> {
        let raw = self.raw()?;
        self.shape
            .get_or_try_init(|| {
                let shape = self
                    .engine()
                    .invoke(|native, status| native.tensor_shape(raw, status))?;
                shape.ok_or_else(|| BindingError::null_handle("tensor_shape"))
            })
            .cloned()
    }

    /// Number of dimensions.
    pub fn dim(&self) -> Result<usize> {
        Ok(self.shape()?.len())
    }

    /// Number of elements.
    pub fn numel(&self) -> Result<usize> {
        element_count(&self.shape()?)
    }

    /// Element type.
    pub fn dtype(&self) -> Result<DType> {
        let raw = self.raw()?;
        self.dtype
            .get_or_try_init(|| {
                self.engine()
                    .invoke(|native, status| native.tensor_dtype(raw, status))?
                    .ok_or_else(|| BindingError::null_handle("tensor_dtype"))
            })
            .copied()
    }

    /// Device holding the data.
    pub fn device(&self) -> Result<Device> {
        let raw = self.raw()?;
        self.device
            .get_or_try_init(|| {
                self.engine()
                    .invoke(|native, status| native.tensor_device(raw, status))?
                    .ok_or_else(|| BindingError::null_handle("tensor_device"))
            })
            .copied()
    }

    /// Copies the elements to the host in row-major order.
    pub fn to_vec(&self) -> Result<Vec<f64>> {
        let raw = self.raw()?;
        self.engine()
            .invoke(|native, status| native.tensor_data(raw, status))?
            .ok_or_else(|| BindingError::null_handle("tensor_data"))
    }

    /// Identity of the native storage. Aliases of one storage compare equal.
    pub fn storage_id(&self) -> Result<u64> {
        let raw = self.raw()?;
        let id = self
            .engine()
            .invoke(|native, status| native.tensor_storage_id(raw, status))?;
        if id == 0 {
            return Err(BindingError::null_handle("tensor_storage_id"));
        }
        Ok(id)
    }

    /// Whether the engine tracks gradients for this tensor.
    pub fn requires_grad(&self) -> Result<bool> {
        let raw = self.raw()?;
        self.engine()
            .invoke(|native, status| native.tensor_requires_grad(raw, status))
    }

    /// A new, independently owned reference to the same storage.
    pub fn shallow_clone(&self) -> Result<Self> {
        let raw = self.raw()?;
        let alias = self
            .engine()
            .invoke_tensor("tensor_alias", |native, status| native.tensor_alias(raw, status))?;
        Ok(Self::from_raw(self.engine().clone(), alias))
    }

    /// Converts to `device` and `dtype` through the engine.
    ///
    /// The result is a new wrapper; `self` is left untouched.
    pub fn to(&self, device: Device, dtype: DType) -> Result<Self> {
        let raw = self.raw()?;
        let converted = self.engine().invoke_tensor("tensor_to", |native, status| {
            native.tensor_to(raw, device, dtype, status)
        })?;
        Ok(Self::from_raw(self.engine().clone(), converted))
    }

    /// Moves to `device`, keeping the dtype.
    pub fn to_device(&self, device: Device) -> Result<Self> {
        self.to(device, self.dtype()?)
    }

    /// Casts to `dtype`, keeping the device.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        self.to(self.device()?, dtype)
    }

    /// Marks the tensor trainable and re-tags it as a [`Parameter`].
    ///
    /// No data is copied; the same native reference changes owner.
    pub fn into_parameter(self) -> Result<Parameter> {
        let raw = self.raw()?;
        self.engine().invoke(|native, status| {
            native.tensor_set_requires_grad(raw, true, status);
        })?;
        Ok(Parameter::adopt(self))
    }

    /// Releases the native reference now. Further calls are no-ops.
    pub fn dispose(&mut self) {
        self.handle.release();
    }

    /// Whether [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.handle.is_released()
    }
}

/// Element count of `shape`, rejecting negative extents and overflow.
fn element_count(shape: &[i64]) -> Result<usize> {
    let invalid = || BindingError::shape_mismatch("a representable element count", format!("{shape:?}"));
    if shape.iter().any(|&d| d < 0) {
        return Err(invalid());
    }
    shape
        .iter()
        .try_fold(1i64, |acc, &d| acc.checked_mul(d))
        .and_then(|count| usize::try_from(count).ok())
        .ok_or_else(invalid)
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("handle", &self.handle)
            .field("shape", &self.shape.get())
            .field("dtype", &self.dtype.get())
            .field("device", &self.device.get())
            .finish()
    }
}
