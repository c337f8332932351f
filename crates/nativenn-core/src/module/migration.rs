//! Device and dtype migration.
//!
//! A move takes one of two paths, chosen per call from the target device:
//!
//! - [`MigrationPath::Default`]: the engine moves the whole module itself.
//!   The engine may replace slot tensors while doing so, so the registry is
//!   re-read afterwards.
//! - [`MigrationPath::ManualBackend`]: the engine cannot move modules to the
//!   target backend. Every registered parameter, then every registered
//!   buffer, is converted on its own and assigned back through the slot
//!   setter. Empty slots stay empty.
//!
//! Manual migration is not atomic. If one slot fails, the slots converted
//! before it stay on the target device and the error is returned.

use super::{Module, ModuleKind, ModuleState};
use crate::device::{DType, Device, DeviceType};
use crate::error::Result;
use crate::registry::SlotKind;

/// How a module is moved to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationPath {
    /// The engine's own module migration
    Default,
    /// Slot-by-slot conversion through the slot setters
    ManualBackend,
}

impl<K: ModuleKind> Module<K> {
    /// Moves every slot to `device` and casts floating-point state to `dtype`.
    ///
    /// Integral buffers keep their dtype.
    pub fn to(&self, device: Device, dtype: DType) -> Result<()> {
        let mut state = self.state.lock();
        let path = self.engine.migration_path(device);
        tracing::debug!(module = K::NAME, %device, %dtype, ?path, "migrating module");
        match path {
            MigrationPath::Default => self.migrate_natively(&mut state, device, dtype),
            MigrationPath::ManualBackend => self.migrate_manually(&mut state, device, dtype),
        }
    }

    /// Moves to `device`, keeping the current dtype.
    pub fn to_device(&self, device: Device) -> Result<()> {
        let dtype = self.dtype();
        self.to(device, dtype)
    }

    /// Casts to `dtype`, keeping the current device.
    pub fn to_dtype(&self, dtype: DType) -> Result<()> {
        let device = self.device();
        self.to(device, dtype)
    }

    /// Moves to the device of type `device_type` with ordinal `index`.
    pub fn to_device_type(&self, device_type: DeviceType, index: Option<u32>) -> Result<()> {
        self.to_device(Device::new(device_type, index))
    }

    fn migrate_natively(&self, state: &mut ModuleState, device: Device, dtype: DType) -> Result<()> {
        K::migrate(&self.engine, state.handles.primary()?, device, dtype)?;
        self.resync_registry(state)?;
        Self::epilog(state, device, dtype);
        Ok(())
    }

    fn migrate_manually(&self, state: &mut ModuleState, device: Device, dtype: DType) -> Result<()> {
        state.handles.primary()?;
        for kind in [SlotKind::Parameter, SlotKind::Buffer] {
            for spec in K::SLOTS.iter().filter(|spec| spec.kind == kind) {
                let converted = {
                    let Some(entry) = state.registry.get(spec.name) else {
                        continue;
                    };
                    let current = entry.tensor();
                    let current_dtype = current.dtype()?;
                    let target = if current_dtype.is_floating_point() {
                        dtype
                    } else {
                        current_dtype
                    };
                    current.to(device, target)?
                };
                let value = match kind {
                    SlotKind::Parameter => converted.into_parameter()?.into_tensor(),
                    SlotKind::Buffer => converted,
                };
                tracing::trace!(module = K::NAME, slot = spec.name, %device, "migrated slot");
                self.write_slot(state, spec, Some(value))?;
            }
        }
        Self::epilog(state, device, dtype);
        Ok(())
    }

    fn epilog(state: &mut ModuleState, device: Device, dtype: DType) {
        state.device = device;
        state.dtype = dtype;
    }
}
