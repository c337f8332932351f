//! In-process reference engine.
//!
//! [`ReferenceEngine`] implements the [`NativeEngine`] boundary with handle
//! tables instead of a native library. It keeps the bookkeeping a real engine
//! keeps (handle identity, shared storages, module slots, dtype casting and
//! device tags) and produces shape-correct forward outputs:
//!
//! - convolutions return the output shape filled with the bias of each
//!   output channel (zero without bias),
//! - normalization layers return a copy of the input and advance
//!   `num_batches_tracked` when they track running statistics.
//!
//! Tests drive failure paths through [`ReferenceEngine::fail_on`] and
//! [`ReferenceEngine::fail_after`], and observe leaks and double releases
//! through the counters.

use super::{ErrorChannel, NativeEngine, NativeErrorKind};
use super::descriptor::{
    ConvDescriptor, ConvPadding, LayerNormDescriptor, ModuleDescriptor, NormDescriptor,
};
use crate::device::{DType, Device, DeviceType};
use crate::handle::RawHandle;
use crate::module::slot;
use dashmap::DashMap;
use nalgebra::DVector;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

const DEFAULT_SEED: u64 = 0x5EED;

/// Largest finite half-precision value.
const F16_MAX: f64 = 65504.0;

#[derive(Debug, Clone)]
struct Storage {
    id: u64,
    data: DVector<f64>,
    shape: Vec<i64>,
    dtype: DType,
    device: Device,
    requires_grad: bool,
}

type SharedStorage = Arc<RwLock<Storage>>;

#[derive(Debug)]
struct NativeModule {
    descriptor: ModuleDescriptor,
    dispatch: usize,
    slots: Vec<(&'static str, Option<SharedStorage>)>,
}

impl NativeModule {
    fn slot(&self, name: &str) -> Option<&Option<SharedStorage>> {
        self.slots.iter().find(|(n, _)| *n == name).map(|(_, s)| s)
    }

    fn slot_mut(&mut self, name: &str) -> Option<&mut Option<SharedStorage>> {
        self.slots.iter_mut().find(|(n, _)| *n == name).map(|(_, s)| s)
    }
}

#[derive(Debug)]
struct Fault {
    operation: String,
    skip: usize,
    late: bool,
    kind: NativeErrorKind,
    message: String,
}

/// How an entry point proceeds after fault injection was consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Proceed,
    FailNow,
    FailLate,
}

/// Handle-table implementation of [`NativeEngine`] for tests and benchmarks.
#[derive(Debug)]
pub struct ReferenceEngine {
    next_handle: AtomicUsize,
    next_storage: AtomicU64,
    tensors: DashMap<usize, SharedStorage>,
    modules: DashMap<usize, NativeModule>,
    calls: DashMap<&'static str, usize>,
    double_releases: AtomicUsize,
    manual_devices: HashSet<DeviceType>,
    rng: Mutex<StdRng>,
    faults: Mutex<Vec<Fault>>,
}

impl ReferenceEngine {
    /// Creates an engine that migrates DirectML modules manually.
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    /// Creates an engine with a fixed initialization seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            next_handle: AtomicUsize::new(1),
            next_storage: AtomicU64::new(1),
            tensors: DashMap::new(),
            modules: DashMap::new(),
            calls: DashMap::new(),
            double_releases: AtomicUsize::new(0),
            manual_devices: HashSet::from([DeviceType::DirectMl]),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            faults: Mutex::new(Vec::new()),
        }
    }

    /// Adds a device type whose modules must be migrated slot by slot.
    pub fn with_manual_backend(mut self, device_type: DeviceType) -> Self {
        self.manual_devices.insert(device_type);
        self
    }

    /// Replaces the set of manually migrated device types.
    pub fn with_manual_backends<I>(mut self, device_types: I) -> Self
    where
        I: IntoIterator<Item = DeviceType>,
    {
        self.manual_devices = device_types.into_iter().collect();
        self
    }

    /// Makes the call to `operation` after `skip` successful ones fail
    /// without side effects.
    pub fn fail_on<S1, S2>(&self, operation: S1, skip: usize, kind: NativeErrorKind, message: S2)
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        self.push_fault(operation.into(), skip, false, kind, message.into());
    }

    /// Like [`fail_on`](Self::fail_on), but the call completes its work
    /// (including returning a live handle) before reporting the failure.
    pub fn fail_after<S1, S2>(&self, operation: S1, skip: usize, kind: NativeErrorKind, message: S2)
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        self.push_fault(operation.into(), skip, true, kind, message.into());
    }

    /// Removes every pending fault.
    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Number of live tensor handles.
    pub fn live_tensors(&self) -> usize {
        self.tensors.len()
    }

    /// Number of live modules.
    pub fn live_modules(&self) -> usize {
        self.modules.len()
    }

    /// Number of release calls on handles that were not live.
    pub fn double_releases(&self) -> usize {
        self.double_releases.load(Ordering::Relaxed)
    }

    /// Number of calls made to `operation`.
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.get(operation).map_or(0, |count| *count)
    }

    /// Number of calls made to any entry point.
    pub fn total_calls(&self) -> usize {
        self.calls.iter().map(|entry| *entry.value()).sum()
    }

    fn push_fault(&self, operation: String, skip: usize, late: bool, kind: NativeErrorKind, message: String) {
        self.faults.lock().push(Fault {
            operation,
            skip,
            late,
            kind,
            message,
        });
    }

    fn count(&self, operation: &'static str) {
        *self.calls.entry(operation).or_insert(0) += 1;
    }

    /// Counts the call and consults the pending faults for `operation`.
    fn enter(&self, operation: &'static str, status: &ErrorChannel) -> Gate {
        self.count(operation);
        let mut faults = self.faults.lock();
        let Some(index) = faults.iter().position(|f| f.operation == operation) else {
            return Gate::Proceed;
        };
        if faults[index].skip > 0 {
            faults[index].skip -= 1;
            return Gate::Proceed;
        }
        let fault = faults.remove(index);
        status.record(fault.kind, fault.message);
        if fault.late {
            Gate::FailLate
        } else {
            Gate::FailNow
        }
    }

    fn next_handle(&self) -> usize {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn new_storage(
        &self,
        data: DVector<f64>,
        shape: Vec<i64>,
        dtype: DType,
        device: Device,
        requires_grad: bool,
    ) -> SharedStorage {
        Arc::new(RwLock::new(Storage {
            id: self.next_storage.fetch_add(1, Ordering::Relaxed),
            data,
            shape,
            dtype,
            device,
            requires_grad,
        }))
    }

    fn insert_tensor(&self, storage: SharedStorage) -> RawHandle {
        let id = self.next_handle();
        self.tensors.insert(id, storage);
        RawHandle::from_raw(id)
    }

    fn storage(&self, tensor: RawHandle, status: &ErrorChannel) -> Option<SharedStorage> {
        if tensor.is_null() {
            status.record(NativeErrorKind::InvalidHandle, "null tensor handle");
            return None;
        }
        let found = self.tensors.get(&tensor.as_raw()).map(|entry| Arc::clone(entry.value()));
        if found.is_none() {
            status.record(
                NativeErrorKind::InvalidHandle,
                format!("unknown tensor handle {tensor}"),
            );
        }
        found
    }

    fn check_module(&self, module: RawHandle, status: &ErrorChannel) -> bool {
        if self.modules.contains_key(&module.as_raw()) {
            true
        } else {
            status.record(
                NativeErrorKind::InvalidHandle,
                format!("unknown module handle {module}"),
            );
            false
        }
    }

    /// Converts `storage` to a new storage at `device`/`dtype`.
    fn convert(&self, storage: &Storage, device: Device, dtype: DType) -> Result<Storage, String> {
        let data = cast_all(&storage.data, dtype)?;
        Ok(Storage {
            id: self.next_storage.fetch_add(1, Ordering::Relaxed),
            data,
            shape: storage.shape.clone(),
            dtype,
            device,
            requires_grad: storage.requires_grad && dtype.is_floating_point(),
        })
    }

    fn uniform(&self, len: usize, bound: f64) -> DVector<f64> {
        let mut rng = self.rng.lock();
        DVector::from_fn(len, |_, _| rng.gen_range(-bound..=bound))
    }

    fn allocate_slots(
        &self,
        descriptor: &ModuleDescriptor,
    ) -> Result<Vec<(&'static str, Option<SharedStorage>)>, String> {
        let (device, dtype) = self.construction_location();
        let make = |values: DVector<f64>, shape: Vec<i64>, requires_grad: bool| -> Result<SharedStorage, String> {
            let data = cast_all(&values, dtype)?;
            Ok(self.new_storage(data, shape, dtype, device, requires_grad))
        };

        match descriptor {
            ModuleDescriptor::Conv(conv) => {
                validate_conv(conv)?;
                let fan_in = conv.in_channels / conv.groups * conv.kernel_size.iter().product::<i64>();
                let bound = 1.0 / (fan_in as f64).sqrt();
                let mut weight_shape = vec![conv.out_channels, conv.in_channels / conv.groups];
                weight_shape.extend_from_slice(&conv.kernel_size);
                let weight_len = numel(&weight_shape);
                let weight = make(self.uniform(weight_len, bound), weight_shape, true)?;
                let bias = if conv.bias {
                    let len = numel(&[conv.out_channels]);
                    Some(make(self.uniform(len, bound), vec![conv.out_channels], true)?)
                } else {
                    None
                };
                Ok(vec![(slot::WEIGHT, Some(weight)), (slot::BIAS, bias)])
            }
            ModuleDescriptor::BatchNorm(norm) | ModuleDescriptor::InstanceNorm(norm) => {
                validate_norm(norm)?;
                let c = norm.num_features;
                let n = numel(&[c]);
                let mut slots = Vec::with_capacity(5);
                if norm.affine {
                    slots.push((slot::WEIGHT, Some(make(DVector::from_element(n, 1.0), vec![c], true)?)));
                    slots.push((slot::BIAS, Some(make(DVector::zeros(n), vec![c], true)?)));
                } else {
                    slots.push((slot::WEIGHT, None));
                    slots.push((slot::BIAS, None));
                }
                if norm.track_running_stats {
                    slots.push((slot::RUNNING_MEAN, Some(make(DVector::zeros(n), vec![c], false)?)));
                    slots.push((slot::RUNNING_VAR, Some(make(DVector::from_element(n, 1.0), vec![c], false)?)));
                    let count = self.new_storage(DVector::zeros(1), Vec::new(), DType::Int64, device, false);
                    slots.push((slot::NUM_BATCHES_TRACKED, Some(count)));
                } else {
                    slots.push((slot::RUNNING_MEAN, None));
                    slots.push((slot::RUNNING_VAR, None));
                    slots.push((slot::NUM_BATCHES_TRACKED, None));
                }
                Ok(slots)
            }
            ModuleDescriptor::LayerNorm(layer) => {
                validate_layer_norm(layer)?;
                let shape = layer.normalized_shape.clone();
                let n = numel(&shape);
                if layer.elementwise_affine {
                    Ok(vec![
                        (slot::WEIGHT, Some(make(DVector::from_element(n, 1.0), shape.clone(), true)?)),
                        (slot::BIAS, Some(make(DVector::zeros(n), shape, true)?)),
                    ])
                } else {
                    Ok(vec![(slot::WEIGHT, None), (slot::BIAS, None)])
                }
            }
        }
    }

    /// Fails with `DeviceMismatch` if a floating slot is not colocated with `input`.
    fn check_colocated(module: &NativeModule, input: &Storage) -> Result<(), String> {
        for (name, storage) in &module.slots {
            let Some(storage) = storage else { continue };
            let storage = storage.read();
            if !storage.dtype.is_floating_point() {
                continue;
            }
            if storage.device != input.device || storage.dtype != input.dtype {
                return Err(format!(
                    "expected input on {} with dtype {} (slot `{name}`), got {} with dtype {}",
                    storage.device, storage.dtype, input.device, input.dtype
                ));
            }
        }
        Ok(())
    }
}

impl Default for ReferenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeEngine for ReferenceEngine {
    fn name(&self) -> &str {
        "reference"
    }

    fn supports_native_migration(&self, device_type: DeviceType) -> bool {
        !self.manual_devices.contains(&device_type)
    }

    fn tensor_from_data(
        &self,
        data: &[f64],
        shape: &[i64],
        dtype: DType,
        device: Device,
        status: &ErrorChannel,
    ) -> RawHandle {
        if self.enter("tensor_from_data", status) == Gate::FailNow {
            return RawHandle::NULL;
        }
        if shape.iter().any(|&d| d < 0) || numel(shape) != data.len() {
            status.record(
                NativeErrorKind::InvalidArgument,
                format!("{} values do not fill shape {shape:?}", data.len()),
            );
            return RawHandle::NULL;
        }
        match cast_all(&DVector::from_column_slice(data), dtype) {
            Ok(values) => {
                let storage = self.new_storage(values, shape.to_vec(), dtype, device, false);
                self.insert_tensor(storage)
            }
            Err(message) => {
                status.record(NativeErrorKind::InvalidArgument, message);
                RawHandle::NULL
            }
        }
    }

    fn tensor_shape(&self, tensor: RawHandle, status: &ErrorChannel) -> Option<Vec<i64>> {
        if self.enter("tensor_shape", status) == Gate::FailNow {
            return None;
        }
        self.storage(tensor, status).map(|s| s.read().shape.clone())
    }

    fn tensor_dtype(&self, tensor: RawHandle, status: &ErrorChannel) -> Option<DType> {
        if self.enter("tensor_dtype", status) == Gate::FailNow {
            return None;
        }
        self.storage(tensor, status).map(|s| s.read().dtype)
    }

    fn tensor_device(&self, tensor: RawHandle, status: &ErrorChannel) -> Option<Device> {
        if self.enter("tensor_device", status) == Gate::FailNow {
            return None;
        }
        self.storage(tensor, status).map(|s| s.read().device)
    }

    fn tensor_data(&self, tensor: RawHandle, status: &ErrorChannel) -> Option<Vec<f64>> {
        if self.enter("tensor_data", status) == Gate::FailNow {
            return None;
        }
        self.storage(tensor, status)
            .map(|s| s.read().data.iter().copied().collect())
    }

    fn tensor_storage_id(&self, tensor: RawHandle, status: &ErrorChannel) -> u64 {
        if self.enter("tensor_storage_id", status) == Gate::FailNow {
            return 0;
        }
        self.storage(tensor, status).map_or(0, |s| s.read().id)
    }

    fn tensor_requires_grad(&self, tensor: RawHandle, status: &ErrorChannel) -> bool {
        if self.enter("tensor_requires_grad", status) == Gate::FailNow {
            return false;
        }
        self.storage(tensor, status)
            .is_some_and(|s| s.read().requires_grad)
    }

    fn tensor_set_requires_grad(&self, tensor: RawHandle, requires_grad: bool, status: &ErrorChannel) {
        if self.enter("tensor_set_requires_grad", status) == Gate::FailNow {
            return;
        }
        let Some(storage) = self.storage(tensor, status) else { return };
        let mut storage = storage.write();
        if requires_grad && !storage.dtype.is_floating_point() {
            status.record(
                NativeErrorKind::InvalidArgument,
                format!("only floating point tensors can require gradients, got {}", storage.dtype),
            );
            return;
        }
        storage.requires_grad = requires_grad;
    }

    fn tensor_alias(&self, tensor: RawHandle, status: &ErrorChannel) -> RawHandle {
        if self.enter("tensor_alias", status) == Gate::FailNow {
            return RawHandle::NULL;
        }
        self.storage(tensor, status)
            .map_or(RawHandle::NULL, |s| self.insert_tensor(s))
    }

    fn tensor_to(&self, tensor: RawHandle, device: Device, dtype: DType, status: &ErrorChannel) -> RawHandle {
        if self.enter("tensor_to", status) == Gate::FailNow {
            return RawHandle::NULL;
        }
        let Some(shared) = self.storage(tensor, status) else {
            return RawHandle::NULL;
        };
        let converted = {
            let storage = shared.read();
            if storage.device == device && storage.dtype == dtype {
                None
            } else {
                Some(self.convert(&storage, device, dtype))
            }
        };
        match converted {
            None => self.insert_tensor(shared),
            Some(Ok(storage)) => self.insert_tensor(Arc::new(RwLock::new(storage))),
            Some(Err(message)) => {
                status.record(NativeErrorKind::InvalidArgument, message);
                RawHandle::NULL
            }
        }
    }

    fn tensor_release(&self, tensor: RawHandle) {
        self.count("tensor_release");
        if self.tensors.remove(&tensor.as_raw()).is_none() {
            self.double_releases.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn module_new(&self, descriptor: &ModuleDescriptor, status: &ErrorChannel) -> (RawHandle, RawHandle) {
        if self.enter("module_new", status) == Gate::FailNow {
            return (RawHandle::NULL, RawHandle::NULL);
        }
        let slots = match self.allocate_slots(descriptor) {
            Ok(slots) => slots,
            Err(message) => {
                status.record(NativeErrorKind::InvalidArgument, message);
                return (RawHandle::NULL, RawHandle::NULL);
            }
        };
        let primary = self.next_handle();
        let dispatch = self.next_handle();
        self.modules.insert(
            primary,
            NativeModule {
                descriptor: descriptor.clone(),
                dispatch,
                slots,
            },
        );
        (RawHandle::from_raw(primary), RawHandle::from_raw(dispatch))
    }

    fn module_forward(&self, module: RawHandle, input: RawHandle, status: &ErrorChannel) -> RawHandle {
        if self.enter("module_forward", status) == Gate::FailNow {
            return RawHandle::NULL;
        }
        let Some(input) = self.storage(input, status) else {
            return RawHandle::NULL;
        };
        let Some(native) = self.modules.get(&module.as_raw()) else {
            status.record(NativeErrorKind::InvalidHandle, format!("unknown module handle {module}"));
            return RawHandle::NULL;
        };
        let input = input.read().clone();
        if let Err(message) = Self::check_colocated(&native, &input) {
            status.record(NativeErrorKind::DeviceMismatch, message);
            return RawHandle::NULL;
        }

        let output = match &native.descriptor {
            ModuleDescriptor::Conv(conv) => {
                let bias = native.slot(slot::BIAS).and_then(Option::as_ref);
                conv_output(&input, conv.spatial_dims, conv.out_channels, bias, |dims| {
                    conv_spatial_shape(dims, &conv.kernel_size, &conv.stride, &conv.padding, &conv.dilation)
                })
                .and_then(|(shape, data)| {
                    if input_channels(&input.shape, conv.spatial_dims) == conv.in_channels {
                        Ok((shape, data))
                    } else {
                        Err(format!(
                            "expected {} input channels, got input of shape {:?}",
                            conv.in_channels, input.shape
                        ))
                    }
                })
            }
            ModuleDescriptor::BatchNorm(norm) => {
                norm_output(&input, norm, 1).inspect(|_| advance_batch_count(&native))
            }
            ModuleDescriptor::InstanceNorm(norm) => {
                let channel_axis = usize::from(input.shape.len() > norm.spatial_dims + 1);
                norm_output(&input, norm, channel_axis).inspect(|_| advance_batch_count(&native))
            }
            ModuleDescriptor::LayerNorm(layer) => {
                let shape = &layer.normalized_shape;
                if input.shape.ends_with(shape) {
                    Ok((input.shape.clone(), input.data.clone()))
                } else {
                    Err(format!("input shape {:?} does not end with {shape:?}", input.shape))
                }
            }
        };
        drop(native);

        match output {
            Ok((shape, data)) => {
                let storage = self.new_storage(data, shape, input.dtype, input.device, false);
                self.insert_tensor(storage)
            }
            Err(message) => {
                status.record(NativeErrorKind::InvalidArgument, message);
                RawHandle::NULL
            }
        }
    }

    fn module_slot(&self, module: RawHandle, name: &str, status: &ErrorChannel) -> RawHandle {
        if self.enter("module_slot", status) == Gate::FailNow {
            return RawHandle::NULL;
        }
        let Some(native) = self.modules.get(&module.as_raw()) else {
            status.record(NativeErrorKind::InvalidHandle, format!("unknown module handle {module}"));
            return RawHandle::NULL;
        };
        let storage = match native.slot(name) {
            Some(storage) => storage.clone(),
            None => {
                status.record(
                    NativeErrorKind::InvalidArgument,
                    format!("{} module has no slot `{name}`", native.descriptor.family()),
                );
                return RawHandle::NULL;
            }
        };
        drop(native);
        storage.map_or(RawHandle::NULL, |s| self.insert_tensor(s))
    }

    fn module_set_slot(&self, module: RawHandle, name: &str, value: RawHandle, status: &ErrorChannel) {
        if self.enter("module_set_slot", status) == Gate::FailNow {
            return;
        }
        let value = if value.is_null() {
            None
        } else {
            match self.storage(value, status) {
                Some(storage) => Some(storage),
                None => return,
            }
        };
        let Some(mut native) = self.modules.get_mut(&module.as_raw()) else {
            status.record(NativeErrorKind::InvalidHandle, format!("unknown module handle {module}"));
            return;
        };
        let family = native.descriptor.family();
        match native.slot_mut(name) {
            Some(slot) => *slot = value,
            None => status.record(
                NativeErrorKind::InvalidArgument,
                format!("{family} module has no slot `{name}`"),
            ),
        }
    }

    fn module_reset_running_stats(&self, module: RawHandle, status: &ErrorChannel) {
        if self.enter("module_reset_running_stats", status) == Gate::FailNow {
            return;
        }
        let Some(native) = self.modules.get(&module.as_raw()) else {
            status.record(NativeErrorKind::InvalidHandle, format!("unknown module handle {module}"));
            return;
        };
        if !matches!(
            native.descriptor,
            ModuleDescriptor::BatchNorm(_) | ModuleDescriptor::InstanceNorm(_)
        ) {
            status.record(
                NativeErrorKind::Unsupported,
                format!("{} module has no running statistics", native.descriptor.family()),
            );
            return;
        }
        let resets = [
            (slot::RUNNING_MEAN, 0.0),
            (slot::RUNNING_VAR, 1.0),
            (slot::NUM_BATCHES_TRACKED, 0.0),
        ];
        for (name, value) in resets {
            if let Some(Some(storage)) = native.slot(name) {
                storage.write().data.fill(value);
            }
        }
    }

    fn module_to(&self, module: RawHandle, device: Device, dtype: DType, status: &ErrorChannel) {
        if self.enter("module_to", status) == Gate::FailNow {
            return;
        }
        if self.manual_devices.contains(&device.kind) {
            status.record(
                NativeErrorKind::Unsupported,
                format!("modules cannot be moved to {device} natively"),
            );
            return;
        }
        if !self.check_module(module, status) {
            return;
        }
        let Some(mut native) = self.modules.get_mut(&module.as_raw()) else { return };
        for (_, slot) in &mut native.slots {
            let Some(shared) = slot else { continue };
            let converted = {
                let storage = shared.read();
                let target = if storage.dtype.is_floating_point() { dtype } else { storage.dtype };
                if storage.device == device && storage.dtype == target {
                    continue;
                }
                self.convert(&storage, device, target)
            };
            match converted {
                Ok(storage) => *slot = Some(Arc::new(RwLock::new(storage))),
                Err(message) => {
                    status.record(NativeErrorKind::InvalidArgument, message);
                    return;
                }
            }
        }
    }

    fn module_release(&self, module: RawHandle, dispatch: RawHandle) {
        self.count("module_release");
        match self.modules.remove(&module.as_raw()) {
            Some((_, native)) => {
                debug_assert_eq!(native.dispatch, dispatch.as_raw(), "mismatched dispatch handle");
            }
            None => {
                self.double_releases.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

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
    ) -> RawHandle {
        if self.enter("conv_functional", status) == Gate::FailNow {
            return RawHandle::NULL;
        }
        let Some(input) = self.storage(input, status) else {
            return RawHandle::NULL;
        };
        let Some(weight) = self.storage(weight, status) else {
            return RawHandle::NULL;
        };
        let bias = if bias.is_null() {
            None
        } else {
            match self.storage(bias, status) {
                Some(bias) => Some(bias),
                None => return RawHandle::NULL,
            }
        };
        let input = input.read().clone();
        let weight = weight.read().clone();

        let result = functional_output(&input, &weight, bias.as_ref(), stride, padding, dilation, groups);
        match result {
            Ok((shape, data)) => {
                let storage = self.new_storage(data, shape, input.dtype, input.device, false);
                self.insert_tensor(storage)
            }
            Err((kind, message)) => {
                status.record(kind, message);
                RawHandle::NULL
            }
        }
    }
}

fn numel(shape: &[i64]) -> usize {
    shape
        .iter()
        .map(|&d| usize::try_from(d).unwrap_or(0))
        .product()
}

/// Rounds `value` to the nearest representable value of `dtype`.
fn cast(value: f64, dtype: DType) -> Option<f64> {
    match dtype {
        DType::Float64 => Some(value),
        DType::Float32 => num_traits::cast::<f64, f32>(value).map(f64::from),
        DType::BFloat16 => {
            let single = num_traits::cast::<f64, f32>(value)?;
            Some(f64::from(f32::from_bits(single.to_bits() & 0xFFFF_0000)))
        }
        DType::Float16 => {
            if value.is_finite() && value.abs() > F16_MAX {
                return None;
            }
            let single = num_traits::cast::<f64, f32>(value)?;
            Some(f64::from(f32::from_bits(single.to_bits() & 0xFFFF_E000)))
        }
        DType::Bool => Some(if value == 0.0 { 0.0 } else { 1.0 }),
        DType::UInt8 => num_traits::cast::<f64, u8>(value).map(f64::from),
        DType::Int8 => num_traits::cast::<f64, i8>(value).map(f64::from),
        DType::Int16 => num_traits::cast::<f64, i16>(value).map(f64::from),
        DType::Int32 => num_traits::cast::<f64, i32>(value).map(f64::from),
        DType::Int64 => num_traits::cast::<f64, i64>(value).map(|v| v as f64),
    }
}

fn cast_all(values: &DVector<f64>, dtype: DType) -> Result<DVector<f64>, String> {
    let cast_values = values
        .iter()
        .map(|&v| cast(v, dtype).ok_or_else(|| format!("value {v} is not representable as {dtype}")))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DVector::from_vec(cast_values))
}

fn validate_conv(conv: &ConvDescriptor) -> Result<(), String> {
    let d = conv.spatial_dims;
    if !(1..=3).contains(&d) {
        return Err(format!("unsupported convolution dimensionality {d}"));
    }
    if conv.in_channels <= 0 || conv.out_channels <= 0 || conv.groups <= 0 {
        return Err("channel counts and groups must be positive".to_string());
    }
    if conv.in_channels % conv.groups != 0 || conv.out_channels % conv.groups != 0 {
        return Err(format!("channel counts must be divisible by groups ({})", conv.groups));
    }
    for (name, values) in [
        ("kernel_size", &conv.kernel_size),
        ("stride", &conv.stride),
        ("dilation", &conv.dilation),
    ] {
        if values.len() != d || values.iter().any(|&v| v <= 0) {
            return Err(format!("{name} must hold {d} positive values, got {values:?}"));
        }
    }
    match &conv.padding {
        ConvPadding::Explicit(p) if p.len() != d || p.iter().any(|&v| v < 0) => {
            Err(format!("padding must hold {d} non-negative values, got {p:?}"))
        }
        ConvPadding::Same if conv.stride.iter().any(|&s| s != 1) => {
            Err("padding='same' is not supported for strided convolutions".to_string())
        }
        _ => Ok(()),
    }
}

fn validate_norm(norm: &NormDescriptor) -> Result<(), String> {
    if norm.num_features <= 0 {
        return Err(format!("num_features must be positive, got {}", norm.num_features));
    }
    if !(1..=3).contains(&norm.spatial_dims) {
        return Err(format!("unsupported normalization dimensionality {}", norm.spatial_dims));
    }
    Ok(())
}

fn validate_layer_norm(layer: &LayerNormDescriptor) -> Result<(), String> {
    if layer.normalized_shape.is_empty() || layer.normalized_shape.iter().any(|&d| d <= 0) {
        return Err(format!(
            "normalized_shape must be non-empty and positive, got {:?}",
            layer.normalized_shape
        ));
    }
    Ok(())
}

/// Channel count of an (optionally batched) convolution input.
fn input_channels(shape: &[i64], spatial_dims: usize) -> i64 {
    let axis = usize::from(shape.len() > spatial_dims + 1);
    shape.get(axis).copied().unwrap_or(0)
}

fn conv_spatial_shape(
    dims: &[i64],
    kernel: &[i64],
    stride: &[i64],
    padding: &ConvPadding,
    dilation: &[i64],
) -> Result<Vec<i64>, String> {
    dims.iter()
        .enumerate()
        .map(|(i, &len)| {
            let pad = match padding {
                ConvPadding::Same => return Ok(len),
                ConvPadding::Valid => 0,
                ConvPadding::Explicit(p) => p[i],
            };
            output_length(len, kernel[i], stride[i], pad, dilation[i])
        })
        .collect()
}

fn output_length(len: i64, kernel: i64, stride: i64, pad: i64, dilation: i64) -> Result<i64, String> {
    let span = len + 2 * pad - dilation * (kernel - 1) - 1;
    if span < 0 {
        return Err(format!(
            "input length {len} is smaller than the dilated kernel ({kernel} x {dilation})"
        ));
    }
    Ok(span / stride + 1)
}

/// Output of a convolution filled with the per-channel bias.
fn conv_output<F>(
    input: &Storage,
    spatial_dims: usize,
    out_channels: i64,
    bias: Option<&SharedStorage>,
    spatial: F,
) -> Result<(Vec<i64>, DVector<f64>), String>
where
    F: FnOnce(&[i64]) -> Result<Vec<i64>, String>,
{
    let rank = input.shape.len();
    if rank != spatial_dims + 1 && rank != spatial_dims + 2 {
        return Err(format!(
            "expected {}D or {}D input, got shape {:?}",
            spatial_dims + 1,
            spatial_dims + 2,
            input.shape
        ));
    }
    let batched = rank == spatial_dims + 2;
    let out_spatial = spatial(&input.shape[rank - spatial_dims..])?;
    let bias: Vec<f64> = bias.map_or_else(Vec::new, |b| b.read().data.iter().copied().collect());

    let mut shape = Vec::with_capacity(rank);
    let batch = if batched {
        shape.push(input.shape[0]);
        numel(&input.shape[..1])
    } else {
        1
    };
    shape.push(out_channels);
    shape.extend_from_slice(&out_spatial);

    let plane = numel(&out_spatial);
    let channels = numel(&[out_channels]);
    let mut data = Vec::with_capacity(batch * channels * plane);
    for _ in 0..batch {
        for c in 0..channels {
            let value = bias.get(c).copied().unwrap_or(0.0);
            data.extend(std::iter::repeat(value).take(plane));
        }
    }
    Ok((shape, DVector::from_vec(data)))
}

fn norm_output(input: &Storage, norm: &NormDescriptor, channel_axis: usize) -> Result<(Vec<i64>, DVector<f64>), String> {
    let has_channel_state = norm.affine || norm.track_running_stats;
    let channels = input.shape.get(channel_axis).copied().unwrap_or(0);
    if has_channel_state && channels != norm.num_features {
        return Err(format!(
            "expected {} channels, got input of shape {:?}",
            norm.num_features, input.shape
        ));
    }
    Ok((input.shape.clone(), input.data.clone()))
}

fn advance_batch_count(module: &NativeModule) {
    if let Some(Some(count)) = module.slot(slot::NUM_BATCHES_TRACKED) {
        count.write().data.add_scalar_mut(1.0);
    }
}

/// Broadcasts a one-element option to every spatial dimension.
fn per_dim(values: &[i64], dims: usize, name: &str) -> Result<Vec<i64>, String> {
    match values.len() {
        1 => Ok(vec![values[0]; dims]),
        n if n == dims => Ok(values.to_vec()),
        n => Err(format!("{name} must have 1 or {dims} values, got {n}")),
    }
}

type Failure = (NativeErrorKind, String);

fn functional_output(
    input: &Storage,
    weight: &Storage,
    bias: Option<&SharedStorage>,
    stride: &[i64],
    padding: &[i64],
    dilation: &[i64],
    groups: i64,
) -> Result<(Vec<i64>, DVector<f64>), Failure> {
    let invalid = |message: String| (NativeErrorKind::InvalidArgument, message);
    if weight.shape.len() < 3 {
        return Err(invalid(format!("weight must have rank 3 to 5, got {:?}", weight.shape)));
    }
    let dims = weight.shape.len() - 2;
    if weight.device != input.device || weight.dtype != input.dtype {
        return Err((
            NativeErrorKind::DeviceMismatch,
            format!(
                "input is on {}/{} but weight is on {}/{}",
                input.device, input.dtype, weight.device, weight.dtype
            ),
        ));
    }
    if groups <= 0 || weight.shape[0] % groups != 0 {
        return Err(invalid(format!("invalid groups {groups} for weight {:?}", weight.shape)));
    }
    let stride = per_dim(stride, dims, "stride").map_err(invalid)?;
    let padding = per_dim(padding, dims, "padding").map_err(invalid)?;
    let dilation = per_dim(dilation, dims, "dilation").map_err(invalid)?;
    if input_channels(&input.shape, dims) != weight.shape[1] * groups {
        return Err(invalid(format!(
            "expected {} input channels, got input of shape {:?}",
            weight.shape[1] * groups,
            input.shape
        )));
    }
    let kernel = weight.shape[2..].to_vec();
    conv_output(input, dims, weight.shape[0], bias, |spatial| {
        conv_spatial_shape(spatial, &kernel, &stride, &ConvPadding::Explicit(padding), &dilation)
    })
    .map_err(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn conv2d(bias: bool) -> ModuleDescriptor {
        ModuleDescriptor::Conv(ConvDescriptor {
            spatial_dims: 2,
            in_channels: 2,
            out_channels: 4,
            kernel_size: vec![3, 3],
            stride: vec![1, 1],
            padding: ConvPadding::Explicit(vec![0, 0]),
            dilation: vec![1, 1],
            padding_mode: Default::default(),
            groups: 1,
            bias,
        })
    }

    fn batch_norm(track: bool) -> ModuleDescriptor {
        ModuleDescriptor::BatchNorm(NormDescriptor {
            spatial_dims: 2,
            num_features: 3,
            eps: 1e-5,
            momentum: 0.1,
            affine: true,
            track_running_stats: track,
        })
    }

    fn tensor(engine: &ReferenceEngine, data: &[f64], shape: &[i64]) -> RawHandle {
        let status = ErrorChannel::new();
        let raw = engine.tensor_from_data(data, shape, DType::Float32, Device::CPU, &status);
        assert!(status.is_clear());
        raw
    }

    #[test]
    fn test_cast_rounding() {
        assert_eq!(cast(1.5, DType::Int32), Some(1.0));
        assert_eq!(cast(-1.5, DType::Int64), Some(-1.0));
        assert_eq!(cast(300.0, DType::UInt8), None);
        assert_eq!(cast(f64::NAN, DType::Int16), None);
        assert_eq!(cast(70000.0, DType::Float16), None);
        assert_eq!(cast(2.0, DType::Bool), Some(1.0));
        assert_relative_eq!(cast(0.1, DType::Float32).unwrap(), f64::from(0.1_f32));
        assert_relative_eq!(cast(1.0, DType::BFloat16).unwrap(), 1.0);
    }

    #[test]
    fn test_alias_shares_storage() {
        let engine = ReferenceEngine::new();
        let status = ErrorChannel::new();
        let a = tensor(&engine, &[1.0, 2.0], &[2]);
        let b = engine.tensor_alias(a, &status);

        assert_ne!(a, b);
        assert_eq!(
            engine.tensor_storage_id(a, &status),
            engine.tensor_storage_id(b, &status)
        );
        engine.tensor_release(a);
        assert_eq!(engine.tensor_data(b, &status), Some(vec![1.0, 2.0]));
        engine.tensor_release(b);
        engine.tensor_release(b);
        assert_eq!(engine.live_tensors(), 0);
        assert_eq!(engine.double_releases(), 1);
    }

    #[test]
    fn test_conv_slots_and_forward_shape() {
        let engine = ReferenceEngine::new();
        let status = ErrorChannel::new();
        let (module, dispatch) = engine.module_new(&conv2d(true), &status);
        assert!(status.is_clear());

        let weight = engine.module_slot(module, slot::WEIGHT, &status);
        assert_eq!(engine.tensor_shape(weight, &status), Some(vec![4, 2, 3, 3]));
        let bound = 1.0 / 18f64.sqrt();
        let values = engine.tensor_data(weight, &status).unwrap();
        assert!(values.iter().all(|v| v.abs() <= bound + 1e-6));

        let input = tensor(&engine, &vec![0.5; 2 * 2 * 5 * 6], &[2, 2, 5, 6]);
        let output = engine.module_forward(module, input, &status);
        assert!(status.is_clear());
        assert_eq!(engine.tensor_shape(output, &status), Some(vec![2, 4, 3, 4]));

        for raw in [weight, input, output] {
            engine.tensor_release(raw);
        }
        engine.module_release(module, dispatch);
        assert_eq!(engine.live_tensors(), 0);
        assert_eq!(engine.live_modules(), 0);
    }

    #[test]
    fn test_absent_bias_reads_null_without_failure() {
        let engine = ReferenceEngine::new();
        let status = ErrorChannel::new();
        let (module, dispatch) = engine.module_new(&conv2d(false), &status);

        let bias = engine.module_slot(module, slot::BIAS, &status);
        assert!(bias.is_null());
        assert!(status.is_clear());

        let missing = engine.module_slot(module, slot::RUNNING_MEAN, &status);
        assert!(missing.is_null());
        assert_eq!(status.take().map(|f| f.kind), Some(NativeErrorKind::InvalidArgument));
        engine.module_release(module, dispatch);
    }

    #[test]
    fn test_forward_tracks_batches_and_reset() {
        let engine = ReferenceEngine::new();
        let status = ErrorChannel::new();
        let (module, dispatch) = engine.module_new(&batch_norm(true), &status);
        let input = tensor(&engine, &vec![1.0; 2 * 3 * 2 * 2], &[2, 3, 2, 2]);

        for _ in 0..3 {
            let out = engine.module_forward(module, input, &status);
            assert!(status.is_clear());
            engine.tensor_release(out);
        }
        let count = engine.module_slot(module, slot::NUM_BATCHES_TRACKED, &status);
        assert_eq!(engine.tensor_data(count, &status), Some(vec![3.0]));
        assert_eq!(engine.tensor_dtype(count, &status), Some(DType::Int64));

        engine.module_reset_running_stats(module, &status);
        assert!(status.is_clear());
        assert_eq!(engine.tensor_data(count, &status), Some(vec![0.0]));

        engine.tensor_release(count);
        engine.tensor_release(input);
        engine.module_release(module, dispatch);
    }

    #[test]
    fn test_module_to_keeps_integral_buffers() {
        let engine = ReferenceEngine::new();
        let status = ErrorChannel::new();
        let (module, dispatch) = engine.module_new(&batch_norm(true), &status);

        engine.module_to(module, Device::cuda(0), DType::Float64, &status);
        assert!(status.is_clear());
        let mean = engine.module_slot(module, slot::RUNNING_MEAN, &status);
        let count = engine.module_slot(module, slot::NUM_BATCHES_TRACKED, &status);
        assert_eq!(engine.tensor_dtype(mean, &status), Some(DType::Float64));
        assert_eq!(engine.tensor_device(count, &status), Some(Device::cuda(0)));
        assert_eq!(engine.tensor_dtype(count, &status), Some(DType::Int64));

        engine.module_to(module, Device::directml(0), DType::Float64, &status);
        assert_eq!(status.take().map(|f| f.kind), Some(NativeErrorKind::Unsupported));

        engine.tensor_release(mean);
        engine.tensor_release(count);
        engine.module_release(module, dispatch);
    }

    #[test]
    fn test_fault_injection_skips_then_fails() {
        let engine = ReferenceEngine::new();
        engine.fail_on("tensor_alias", 1, NativeErrorKind::Runtime, "injected");
        let status = ErrorChannel::new();
        let a = tensor(&engine, &[1.0], &[1]);

        let first = engine.tensor_alias(a, &status);
        assert!(!first.is_null());
        assert!(status.is_clear());

        let second = engine.tensor_alias(a, &status);
        assert!(second.is_null());
        assert_eq!(status.take().map(|f| f.message), Some("injected".to_string()));
        assert_eq!(engine.calls("tensor_alias"), 2);
    }

    #[test]
    fn test_late_fault_returns_live_handle() {
        let engine = ReferenceEngine::new();
        engine.fail_after("tensor_alias", 0, NativeErrorKind::Runtime, "late");
        let status = ErrorChannel::new();
        let a = tensor(&engine, &[1.0], &[1]);

        let alias = engine.tensor_alias(a, &status);
        assert!(!alias.is_null());
        assert!(!status.is_clear());
        assert_eq!(engine.live_tensors(), 2);
    }

    #[test]
    fn test_forward_rejects_mismatched_device() {
        let engine = ReferenceEngine::new();
        let status = ErrorChannel::new();
        let (module, dispatch) = engine.module_new(&conv2d(true), &status);
        let input = engine.tensor_from_data(&[0.0; 2 * 3 * 3], &[2, 3, 3], DType::Float64, Device::CPU, &status);

        let output = engine.module_forward(module, input, &status);
        assert!(output.is_null());
        assert_eq!(status.take().map(|f| f.kind), Some(NativeErrorKind::DeviceMismatch));
        engine.tensor_release(input);
        engine.module_release(module, dispatch);
    }

    #[test]
    fn test_functional_conv_shape() {
        let engine = ReferenceEngine::new();
        let status = ErrorChannel::new();
        let input = tensor(&engine, &vec![1.0; 3 * 10], &[1, 3, 10]);
        let weight = tensor(&engine, &vec![0.1; 6 * 3 * 3], &[6, 3, 3]);
        let bias = tensor(&engine, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[6]);

        let out = engine.conv_functional(input, weight, bias, &[2], &[1], &[1], 1, &status);
        assert!(status.is_clear());
        assert_eq!(engine.tensor_shape(out, &status), Some(vec![1, 6, 5]));
        let data = engine.tensor_data(out, &status).unwrap();
        assert_eq!(&data[..5], &[1.0; 5]);
        assert_eq!(&data[25..], &[6.0; 5]);
    }
}
