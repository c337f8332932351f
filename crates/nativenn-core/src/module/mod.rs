//! The generic module wrapper.
//!
//! A [`Module`] owns the primary/dispatch handle pair of one native module and
//! a [`Registry`] mirroring its slots. Everything layer-specific (which slots
//! exist, how the native module is configured, which inputs are accepted) is
//! supplied by a [`ModuleKind`].
//!
//! All state changes of one module happen under its lock: a setter calls the
//! native setter and updates the registry before any other accessor on the
//! same module can run, and a failing native setter leaves the registry as it
//! was.

pub mod accessors;
pub mod migration;

pub use accessors::{AffineKind, RunningStatsKind};
pub use migration::MigrationPath;

use crate::device::{DType, Device};
use crate::engine::{Engine, ModuleDescriptor};
use crate::error::{BindingError, Result};
use crate::handle::{ModuleHandles, RawHandle};
use crate::parameter::Parameter;
use crate::registry::{Registry, RegistryEntry, SlotKind};
use crate::tensor::Tensor;
use parking_lot::Mutex;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::Arc;

/// Names of the slots shared by the built-in module kinds.
pub mod slot {
    /// Learnable weight
    pub const WEIGHT: &str = "weight";
    /// Learnable bias
    pub const BIAS: &str = "bias";
    /// Running mean of the normalized channels
    pub const RUNNING_MEAN: &str = "running_mean";
    /// Running variance of the normalized channels
    pub const RUNNING_VAR: &str = "running_var";
    /// Number of batches seen while tracking statistics
    pub const NUM_BATCHES_TRACKED: &str = "num_batches_tracked";
}

/// Static declaration of one module slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSpec {
    /// Slot name as known to the engine
    pub name: &'static str,
    /// Parameter or buffer
    pub kind: SlotKind,
    /// Whether the host may assign the slot
    pub writable: bool,
}

impl SlotSpec {
    /// A writable parameter slot.
    pub const fn parameter(name: &'static str) -> Self {
        Self {
            name,
            kind: SlotKind::Parameter,
            writable: true,
        }
    }

    /// A writable buffer slot.
    pub const fn buffer(name: &'static str) -> Self {
        Self {
            name,
            kind: SlotKind::Buffer,
            writable: true,
        }
    }

    /// A buffer the engine maintains and the host only reads.
    pub const fn read_only_buffer(name: &'static str) -> Self {
        Self {
            name,
            kind: SlotKind::Buffer,
            writable: false,
        }
    }
}

/// Capabilities of one kind of native module.
///
/// Implementors provide the configuration type, the slot declarations and
/// input validation. The native bindings default to the generic engine entry
/// points and only need overriding for kinds with dedicated entry points.
pub trait ModuleKind: Send + Sync + 'static {
    /// Construction options.
    type Config: Clone + Debug + Send + Sync;

    /// Display name, e.g. `Conv2d`.
    const NAME: &'static str;

    /// Every slot the native module exposes, parameters and buffers alike.
    const SLOTS: &'static [SlotSpec];

    /// Validates `config` and expands it into a native descriptor.
    fn descriptor(config: &Self::Config) -> Result<ModuleDescriptor>;

    /// Checks that `shape` is an acceptable forward input.
    fn check_input(config: &Self::Config, shape: &[i64]) -> Result<()>;

    /// Device and dtype requested by `config`.
    fn placement(config: &Self::Config) -> (Option<Device>, Option<DType>);

    /// Builds the native module.
    fn construct(engine: &Engine, descriptor: &ModuleDescriptor) -> Result<(RawHandle, RawHandle)> {
        engine.invoke_module_new("module_new", |native, status| native.module_new(descriptor, status))
    }

    /// Runs the native forward pass.
    fn forward(engine: &Engine, module: RawHandle, input: RawHandle) -> Result<RawHandle> {
        engine.invoke_tensor("module_forward", |native, status| {
            native.module_forward(module, input, status)
        })
    }

    /// Reads a slot; `None` when the slot is empty.
    fn get_slot(engine: &Engine, module: RawHandle, name: &str) -> Result<Option<RawHandle>> {
        engine.invoke_optional_tensor(|native, status| native.module_slot(module, name, status))
    }

    /// Assigns a slot; a null `value` empties it.
    fn set_slot(engine: &Engine, module: RawHandle, name: &str, value: RawHandle) -> Result<()> {
        engine.invoke(|native, status| native.module_set_slot(module, name, value, status))
    }

    /// Moves the whole module natively.
    fn migrate(engine: &Engine, module: RawHandle, device: Device, dtype: DType) -> Result<()> {
        engine.invoke(|native, status| native.module_to(module, device, dtype, status))
    }

    /// Resets running statistics natively.
    fn reset_running_stats(engine: &Engine, module: RawHandle) -> Result<()> {
        engine.invoke(|native, status| native.module_reset_running_stats(module, status))
    }
}

pub(crate) struct ModuleState {
    handles: ModuleHandles,
    registry: Registry,
    device: Device,
    dtype: DType,
}

/// A native module of kind `K`.
pub struct Module<K: ModuleKind> {
    engine: Engine,
    config: K::Config,
    state: Mutex<ModuleState>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: ModuleKind> Module<K> {
    /// Builds the native module described by `config` and moves it to the
    /// requested device and dtype (the engine defaults when unset).
    pub fn new(engine: &Engine, config: K::Config) -> Result<Self> {
        let descriptor = K::descriptor(&config)?;
        let (primary, dispatch) = K::construct(engine, &descriptor)?;
        let handles = ModuleHandles::adopt(engine.clone(), primary, dispatch);
        let (device, dtype) = engine.native().construction_location();

        let module = Self {
            engine: engine.clone(),
            config,
            state: Mutex::new(ModuleState {
                handles,
                registry: Registry::new(),
                device,
                dtype,
            }),
            _kind: PhantomData,
        };
        module.resync_registry(&mut module.state.lock())?;

        let (requested_device, requested_dtype) = K::placement(&module.config);
        let target_device = requested_device.unwrap_or(engine.defaults().device);
        let target_dtype = requested_dtype.unwrap_or(engine.defaults().dtype);
        if (target_device, target_dtype) != (device, dtype) {
            module.to(target_device, target_dtype)?;
        }

        tracing::debug!(
            module = K::NAME,
            family = descriptor.family(),
            device = %target_device,
            dtype = %target_dtype,
            "constructed module"
        );
        Ok(module)
    }

    /// Runs the module on `input`.
    ///
    /// The input is validated before the engine is called. The caller keeps
    /// ownership of `input`; the output is a new, independently owned tensor.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let input_raw = input.raw()?;
        let shape = input.shape()?;
        K::check_input(&self.config, &shape)?;

        let state = self.state.lock();
        let output = K::forward(&self.engine, state.handles.primary()?, input_raw)?;
        Ok(Tensor::from_raw(self.engine.clone(), output))
    }

    /// Reads a parameter slot. `Ok(None)` means the slot is empty.
    pub fn parameter(&self, name: &str) -> Result<Option<Parameter>> {
        let spec = Self::slot_spec(name, SlotKind::Parameter)?;
        let state = self.state.lock();
        Ok(self
            .read_slot(&state, spec)?
            .map(|raw| Parameter::from_raw(self.engine.clone(), raw)))
    }

    /// Assigns (or empties, with `None`) a parameter slot and registers it.
    pub fn set_parameter(&self, name: &str, value: Option<&Parameter>) -> Result<()> {
        let spec = Self::writable_slot_spec(name, SlotKind::Parameter)?;
        let value = value.map(|p| p.tensor().shallow_clone()).transpose()?;
        self.write_slot(&mut self.state.lock(), spec, value)
    }

    /// Reads a buffer slot. `Ok(None)` means the slot is empty.
    pub fn buffer(&self, name: &str) -> Result<Option<Tensor>> {
        let spec = Self::slot_spec(name, SlotKind::Buffer)?;
        let state = self.state.lock();
        Ok(self
            .read_slot(&state, spec)?
            .map(|raw| Tensor::from_raw(self.engine.clone(), raw)))
    }

    /// Assigns (or empties, with `None`) a buffer slot and registers it.
    pub fn set_buffer(&self, name: &str, value: Option<&Tensor>) -> Result<()> {
        let spec = Self::writable_slot_spec(name, SlotKind::Buffer)?;
        let value = value.map(Tensor::shallow_clone).transpose()?;
        self.write_slot(&mut self.state.lock(), spec, value)
    }

    /// Registered parameters in registration order.
    pub fn named_parameters(&self) -> Vec<(String, Arc<Parameter>)> {
        let state = self.state.lock();
        state
            .registry
            .parameters()
            .map(|(name, p)| (name.to_string(), Arc::clone(p)))
            .collect()
    }

    /// Registered buffers in registration order.
    pub fn named_buffers(&self) -> Vec<(String, Arc<Tensor>)> {
        let state = self.state.lock();
        state
            .registry
            .buffers()
            .map(|(name, t)| (name.to_string(), Arc::clone(t)))
            .collect()
    }

    /// A snapshot of the registry.
    pub fn registry(&self) -> Registry {
        self.state.lock().registry.clone()
    }

    /// Releases the native module and every registry entry. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if state.handles.release() {
            state.registry.clear();
            tracing::debug!(module = K::NAME, "disposed module");
        }
    }

    /// Whether the native module has been released.
    pub fn is_disposed(&self) -> bool {
        self.state.lock().handles.is_released()
    }

    /// Construction options.
    pub fn config(&self) -> &K::Config {
        &self.config
    }

    /// Device recorded by the last migration.
    pub fn device(&self) -> Device {
        self.state.lock().device
    }

    /// Dtype recorded by the last migration.
    pub fn dtype(&self) -> DType {
        self.state.lock().dtype
    }

    /// The engine the module lives in.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    fn slot_spec(name: &str, kind: SlotKind) -> Result<&'static SlotSpec> {
        let spec = K::SLOTS
            .iter()
            .find(|spec| spec.name == name)
            .ok_or_else(|| BindingError::unknown_slot(K::NAME, name))?;
        if spec.kind != kind {
            return Err(BindingError::SlotKindMismatch {
                module: K::NAME.to_string(),
                slot: name.to_string(),
                expected: spec.kind,
                actual: kind,
            });
        }
        Ok(spec)
    }

    fn writable_slot_spec(name: &str, kind: SlotKind) -> Result<&'static SlotSpec> {
        let spec = Self::slot_spec(name, kind)?;
        if !spec.writable {
            return Err(BindingError::ReadOnlySlot {
                module: K::NAME.to_string(),
                slot: name.to_string(),
            });
        }
        Ok(spec)
    }

    fn read_slot(&self, state: &ModuleState, spec: &SlotSpec) -> Result<Option<RawHandle>> {
        K::get_slot(&self.engine, state.handles.primary()?, spec.name)
    }

    /// Assigns a slot natively, then mirrors it into the registry.
    ///
    /// `value` becomes the registry's own reference. When the native setter
    /// fails, `value` is dropped and the registry is left untouched.
    pub(crate) fn write_slot(
        &self,
        state: &mut ModuleState,
        spec: &SlotSpec,
        value: Option<Tensor>,
    ) -> Result<()> {
        let primary = state.handles.primary()?;
        let raw = match &value {
            Some(tensor) => tensor.raw()?,
            None => RawHandle::NULL,
        };
        K::set_slot(&self.engine, primary, spec.name, raw)?;
        match spec.kind {
            SlotKind::Parameter => {
                state
                    .registry
                    .register_parameter(spec.name, value.map(Parameter::adopt));
            }
            SlotKind::Buffer => {
                state.registry.register_buffer(spec.name, value);
            }
        }
        Ok(())
    }

    /// Re-reads every declared slot from the engine into the registry.
    pub(crate) fn resync_registry(&self, state: &mut ModuleState) -> Result<()> {
        for spec in K::SLOTS {
            let entry = self.read_slot(state, spec)?.map(|raw| match spec.kind {
                SlotKind::Parameter => {
                    RegistryEntry::Parameter(Arc::new(Parameter::from_raw(self.engine.clone(), raw)))
                }
                SlotKind::Buffer => RegistryEntry::Buffer(Arc::new(Tensor::from_raw(self.engine.clone(), raw))),
            });
            state.registry.register(spec.name, entry);
        }
        Ok(())
    }
}

impl<K: ModuleKind> Debug for Module<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct(K::NAME)
            .field("config", &self.config)
            .field("device", &state.device)
            .field("dtype", &state.dtype)
            .field("slots", &state.registry.names().collect::<Vec<_>>())
            .field("disposed", &state.handles.is_released())
            .finish()
    }
}
