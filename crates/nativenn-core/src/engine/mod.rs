//! The native engine boundary.
//!
//! [`NativeEngine`] lists every entry point the bindings consume. Its shape
//! follows the C surface of a native tensor library: handles go in and out as
//! [`RawHandle`]s, null means "absent" or "failed", and failures are recorded
//! in the [`ErrorChannel`] passed to each call. Implementations over FFI live
//! outside this crate; [`reference::ReferenceEngine`] is an in-process
//! implementation for tests and benchmarks.
//!
//! [`Engine`] is the cheap, cloneable handle the rest of the crate uses. Its
//! `invoke*` helpers create a channel per call and check it afterwards, which
//! is the only way wrappers talk to the engine.

pub mod channel;
pub mod descriptor;

#[cfg(feature = "test-utils")]
pub mod reference;

pub use channel::{ErrorChannel, NativeErrorKind, NativeFailure};
pub use descriptor::{
    ConvDescriptor, ConvPadding, LayerNormDescriptor, ModuleDescriptor, NormDescriptor,
    PaddingMode,
};

use crate::config::{ambient_defaults, EngineDefaults};
use crate::device::{DType, Device, DeviceType};
use crate::error::{BindingError, Result};
use crate::handle::RawHandle;
use crate::module::MigrationPath;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Entry points exposed by a native tensor engine.
///
/// Methods returning a [`RawHandle`] return null on failure and record the
/// failure in `status`. Getters may also return null with a clear channel to
/// signal an absent value. Methods without a failure-capable return value
/// report failures through `status` only. Release entry points are
/// destructors and cannot fail.
pub trait NativeEngine: Debug + Send + Sync {
    /// Engine name for identification.
    fn name(&self) -> &str;

    /// Whether the engine can move a whole module to `device_type` itself.
    fn supports_native_migration(&self, device_type: DeviceType) -> bool;

    /// Placement of freshly constructed modules.
    fn construction_location(&self) -> (Device, DType) {
        (Device::CPU, DType::Float32)
    }

    /// Tensor creation from host data in row-major order.
    fn tensor_from_data(
        &self,
        data: &[f64],
        shape: &[i64],
        dtype: DType,
        device: Device,
        status: &ErrorChannel,
    ) -> RawHandle;

    /// Shape of a tensor.
    fn tensor_shape(&self, tensor: RawHandle, status: &ErrorChannel) -> Option<Vec<i64>>;

    /// Element type of a tensor.
    fn tensor_dtype(&self, tensor: RawHandle, status: &ErrorChannel) -> Option<DType>;

    /// Device holding a tensor.
    fn tensor_device(&self, tensor: RawHandle, status: &ErrorChannel) -> Option<Device>;

    /// Copies the elements to the host in row-major order.
    fn tensor_data(&self, tensor: RawHandle, status: &ErrorChannel) -> Option<Vec<f64>>;

    /// Identity of the storage behind a handle; 0 on failure.
    fn tensor_storage_id(&self, tensor: RawHandle, status: &ErrorChannel) -> u64;

    /// Whether gradients are tracked for a tensor.
    fn tensor_requires_grad(&self, tensor: RawHandle, status: &ErrorChannel) -> bool;

    /// Enables or disables gradient tracking. Integral tensors reject `true`.
    fn tensor_set_requires_grad(&self, tensor: RawHandle, requires_grad: bool, status: &ErrorChannel);

    /// New reference to the same storage.
    fn tensor_alias(&self, tensor: RawHandle, status: &ErrorChannel) -> RawHandle;

    /// Converts to another device and/or dtype. Returns a new reference to the
    /// same storage when nothing changes.
    fn tensor_to(
        &self,
        tensor: RawHandle,
        device: Device,
        dtype: DType,
        status: &ErrorChannel,
    ) -> RawHandle;

    /// Drops one reference.
    fn tensor_release(&self, tensor: RawHandle);

    /// Builds a module. Returns the (primary, dispatch) pair, both null on failure.
    fn module_new(
        &self,
        descriptor: &ModuleDescriptor,
        status: &ErrorChannel,
    ) -> (RawHandle, RawHandle);

    /// Runs the module on `input`.
    fn module_forward(&self, module: RawHandle, input: RawHandle, status: &ErrorChannel) -> RawHandle;

    /// Reads a named slot. Null with a clear channel means the slot is empty.
    fn module_slot(&self, module: RawHandle, name: &str, status: &ErrorChannel) -> RawHandle;

    /// Assigns a named slot. A null `value` empties it.
    fn module_set_slot(&self, module: RawHandle, name: &str, value: RawHandle, status: &ErrorChannel);

    /// Resets running statistics in place.
    fn module_reset_running_stats(&self, module: RawHandle, status: &ErrorChannel);

    /// Moves every slot of the module to `device`/`dtype`.
    fn module_to(&self, module: RawHandle, device: Device, dtype: DType, status: &ErrorChannel);

    /// Destroys both handles of a module.
    fn module_release(&self, module: RawHandle, dispatch: RawHandle);

    /// Stateless convolution. `bias` may be null.
    #[allow(clippy::too_many_arguments)]
    fn conv_functional(
        &self,
        input: RawHandle,
        weight: RawHandle,
        bias: RawHandle,
        stride: &[i64],
        padding: &[i64],
        dilation: &[i64],
        groups: i64,
        status: &ErrorChannel,
    ) -> RawHandle;
}

/// Shared handle to a native engine plus its construction defaults.
#[derive(Clone)]
pub struct Engine {
    native: Arc<dyn NativeEngine>,
    defaults: EngineDefaults,
}

impl Engine {
    /// Wraps a native engine using the ambient defaults.
    pub fn new(native: Arc<dyn NativeEngine>) -> Self {
        Self::with_defaults(native, *ambient_defaults())
    }

    /// Wraps a native engine with explicit defaults.
    pub fn with_defaults(native: Arc<dyn NativeEngine>, defaults: EngineDefaults) -> Self {
        Self { native, defaults }
    }

    /// The underlying engine.
    pub fn native(&self) -> &dyn NativeEngine {
        self.native.as_ref()
    }

    /// Construction defaults.
    pub fn defaults(&self) -> &EngineDefaults {
        &self.defaults
    }

    /// Which migration path a move to `device` takes.
    pub fn migration_path(&self, device: Device) -> MigrationPath {
        if self.native.supports_native_migration(device.kind) {
            MigrationPath::Default
        } else {
            MigrationPath::ManualBackend
        }
    }

    /// Runs one native call inside a fresh error channel and checks it.
    pub fn invoke<T, F>(&self, call: F) -> Result<T>
    where
        F: FnOnce(&dyn NativeEngine, &ErrorChannel) -> T,
    {
        let status = ErrorChannel::new();
        let value = call(self.native(), &status);
        status.check()?;
        Ok(value)
    }

    /// Runs a native call that must produce a tensor handle.
    ///
    /// A handle returned together with a failure is released before the
    /// failure is surfaced.
    pub fn invoke_tensor<F>(&self, operation: &str, call: F) -> Result<RawHandle>
    where
        F: FnOnce(&dyn NativeEngine, &ErrorChannel) -> RawHandle,
    {
        self.invoke_optional_tensor(call)?
            .ok_or_else(|| BindingError::null_handle(operation))
    }

    /// Runs a native call whose null result means "absent".
    pub fn invoke_optional_tensor<F>(&self, call: F) -> Result<Option<RawHandle>>
    where
        F: FnOnce(&dyn NativeEngine, &ErrorChannel) -> RawHandle,
    {
        let status = ErrorChannel::new();
        let raw = call(self.native(), &status);
        if let Some(failure) = status.take() {
            if !raw.is_null() {
                self.native.tensor_release(raw);
            }
            return Err(failure.into());
        }
        Ok((!raw.is_null()).then_some(raw))
    }

    /// Runs a module constructor, releasing a half-built pair on failure.
    pub fn invoke_module_new<F>(&self, operation: &str, call: F) -> Result<(RawHandle, RawHandle)>
    where
        F: FnOnce(&dyn NativeEngine, &ErrorChannel) -> (RawHandle, RawHandle),
    {
        let status = ErrorChannel::new();
        let (primary, dispatch) = call(self.native(), &status);
        if let Some(failure) = status.take() {
            if !primary.is_null() {
                self.native.module_release(primary, dispatch);
            }
            return Err(failure.into());
        }
        if primary.is_null() {
            return Err(BindingError::null_handle(operation));
        }
        Ok((primary, dispatch))
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("native", &self.native.name())
            .field("defaults", &self.defaults)
            .finish()
    }
}
