//! Helpers for tests and benchmarks built on the reference engine.

use crate::config::EngineDefaults;
use crate::engine::reference::ReferenceEngine;
use crate::engine::Engine;
use crate::module::{Module, ModuleKind};
use crate::registry::SlotKind;
use std::sync::Arc;

/// A fresh reference engine and an [`Engine`] using the fallback defaults
/// (`cpu`, `float32`) regardless of the environment.
pub fn reference_engine() -> (Arc<ReferenceEngine>, Engine) {
    reference_engine_with(ReferenceEngine::new())
}

/// Wraps a configured reference engine the same way as [`reference_engine`].
pub fn reference_engine_with(native: ReferenceEngine) -> (Arc<ReferenceEngine>, Engine) {
    let native = Arc::new(native);
    let engine = Engine::with_defaults(native.clone(), EngineDefaults::default());
    (native, engine)
}

/// Compares every declared slot of `module` with its registry entry.
///
/// Returns a description of the first disagreement in presence, kind or
/// storage identity, or `None` when the registry mirrors the engine.
pub fn registry_disagreement<K: ModuleKind>(module: &Module<K>) -> Option<String> {
    let registry = module.registry();
    for spec in K::SLOTS {
        let native = match spec.kind {
            SlotKind::Parameter => module.parameter(spec.name).map(|p| p.map(|p| p.into_tensor())),
            SlotKind::Buffer => module.buffer(spec.name),
        };
        let native = match native {
            Ok(native) => native,
            Err(err) => return Some(format!("reading `{}` failed: {err}", spec.name)),
        };
        let registered = registry.get(spec.name);
        match (native, registered) {
            (None, None) => {}
            (Some(_), None) => return Some(format!("`{}` is set natively but not registered", spec.name)),
            (None, Some(_)) => return Some(format!("`{}` is registered but empty natively", spec.name)),
            (Some(native), Some(entry)) => {
                if entry.kind() != spec.kind {
                    return Some(format!("`{}` is registered as a {}", spec.name, entry.kind()));
                }
                let ids = native.storage_id().and_then(|a| Ok((a, entry.tensor().storage_id()?)));
                match ids {
                    Ok((a, b)) if a == b => {}
                    Ok((a, b)) => {
                        return Some(format!("`{}` storage differs: native {a}, registered {b}", spec.name))
                    }
                    Err(err) => return Some(format!("comparing `{}` failed: {err}", spec.name)),
                }
            }
        }
    }
    None
}

/// Panics when the registry of `module` does not mirror the engine.
#[track_caller]
pub fn assert_registry_agrees<K: ModuleKind>(module: &Module<K>) {
    if let Some(problem) = registry_disagreement(module) {
        panic!("{} registry out of sync: {problem}", K::NAME);
    }
}
