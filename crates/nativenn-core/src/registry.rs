//! Per-module parameter and buffer registry.
//!
//! The registry is the managed mirror of a module's native slots. Each entry
//! owns its own native reference, so dropping or replacing an entry releases
//! that reference while aliases held elsewhere (for example a tensor the host
//! passed to a setter) stay valid.

use crate::parameter::Parameter;
use crate::tensor::Tensor;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Kind of state a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SlotKind {
    /// Trainable parameter
    Parameter,
    /// Non-trainable buffer
    Buffer,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parameter => f.write_str("parameter"),
            Self::Buffer => f.write_str("buffer"),
        }
    }
}

/// One registered value.
#[derive(Debug, Clone)]
pub enum RegistryEntry {
    /// A trainable parameter
    Parameter(Arc<Parameter>),
    /// A buffer
    Buffer(Arc<Tensor>),
}

impl RegistryEntry {
    /// Kind of the entry.
    pub fn kind(&self) -> SlotKind {
        match self {
            Self::Parameter(_) => SlotKind::Parameter,
            Self::Buffer(_) => SlotKind::Buffer,
        }
    }

    /// The registered tensor, regardless of kind.
    pub fn tensor(&self) -> &Tensor {
        match self {
            Self::Parameter(p) => p.tensor(),
            Self::Buffer(t) => t,
        }
    }
}

/// Insertion-ordered map from slot name to registered value.
///
/// Modules hold a handful of slots, so a vector keeps iteration order
/// deterministic without a second index.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Vec<(String, RegistryEntry)>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers, replaces or removes (`None`) an entry.
    ///
    /// A replaced entry keeps its position. Returns the previous entry.
    pub fn register(&mut self, name: &str, entry: Option<RegistryEntry>) -> Option<RegistryEntry> {
        let position = self.entries.iter().position(|(n, _)| n == name);
        match (position, entry) {
            (Some(i), Some(entry)) => Some(std::mem::replace(&mut self.entries[i].1, entry)),
            (Some(i), None) => Some(self.entries.remove(i).1),
            (None, Some(entry)) => {
                self.entries.push((name.to_string(), entry));
                None
            }
            (None, None) => None,
        }
    }

    /// Registers or removes a parameter.
    pub fn register_parameter(
        &mut self,
        name: &str,
        parameter: Option<Parameter>,
    ) -> Option<RegistryEntry> {
        self.register(name, parameter.map(|p| RegistryEntry::Parameter(Arc::new(p))))
    }

    /// Registers or removes a buffer.
    pub fn register_buffer(&mut self, name: &str, buffer: Option<Tensor>) -> Option<RegistryEntry> {
        self.register(name, buffer.map(|t| RegistryEntry::Buffer(Arc::new(t))))
    }

    /// Looks up an entry.
    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, e)| e)
    }

    /// Looks up a parameter entry.
    pub fn parameter(&self, name: &str) -> Option<&Arc<Parameter>> {
        match self.get(name) {
            Some(RegistryEntry::Parameter(p)) => Some(p),
            _ => None,
        }
    }

    /// Looks up a buffer entry.
    pub fn buffer(&self, name: &str) -> Option<&Arc<Tensor>> {
        match self.get(name) {
            Some(RegistryEntry::Buffer(t)) => Some(t),
            _ => None,
        }
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entry is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// All entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RegistryEntry)> {
        self.entries.iter().map(|(n, e)| (n.as_str(), e))
    }

    /// Parameters in insertion order.
    pub fn parameters(&self) -> impl Iterator<Item = (&str, &Arc<Parameter>)> {
        self.iter().filter_map(|(n, e)| match e {
            RegistryEntry::Parameter(p) => Some((n, p)),
            RegistryEntry::Buffer(_) => None,
        })
    }

    /// Buffers in insertion order.
    pub fn buffers(&self) -> impl Iterator<Item = (&str, &Arc<Tensor>)> {
        self.iter().filter_map(|(n, e)| match e {
            RegistryEntry::Buffer(t) => Some((n, t)),
            RegistryEntry::Parameter(_) => None,
        })
    }

    /// Drops every entry, releasing the references the registry owns.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
