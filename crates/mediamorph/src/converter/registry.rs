//! The process-wide converter registry.
//!
//! The registry is owned by the supervisor and passed to collaborators as
//! an `Arc`; there is no global state. Reads dominate, so entries sit
//! behind an `RwLock`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use log::debug;

use super::{ConvertError, Converter, ConverterInfo};

#[derive(Default)]
struct Inner {
    /// Registration order; `find` iterates in this order.
    order: Vec<String>,
    converters: HashMap<String, Arc<dyn Converter>>,
    disabled: HashSet<String>,
}

/// Mapping from converter name to converter, with an enable/disable flag
/// per entry.
#[derive(Default)]
pub struct ConverterRegistry {
    inner: RwLock<Inner>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a converter. Re-registering a name replaces the previous
    /// entry but keeps its position and enabled state.
    pub fn register(&self, converter: Arc<dyn Converter>) {
        let name = converter.name();
        let mut inner = self.write();

        if !inner.converters.contains_key(&name) {
            inner.order.push(name.clone());
        }
        debug!("registered converter {name}");
        inner.converters.insert(name, converter);
    }

    /// Removes a converter entirely. Returns whether it was present.
    pub fn remove(&self, name: &str) -> bool {
        let mut inner = self.write();
        inner.order.retain(|n| n != name);
        inner.disabled.remove(name);
        inner.converters.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Converter>> {
        self.read().converters.get(name).cloned()
    }

    /// Snapshot of all entries in registration order.
    pub fn list_info(&self) -> Vec<ConverterInfo> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|name| {
                inner.converters.get(name).map(|c| ConverterInfo {
                    name: name.clone(),
                    target_format: c.target_format(),
                    enabled: !inner.disabled.contains(name),
                })
            })
            .collect()
    }

    /// Returns the first enabled converter that claims the file.
    ///
    /// Iteration follows registration order, which makes selection
    /// deterministic within a process.
    pub fn find(&self, src: &Path, mime: Option<&str>) -> Result<Arc<dyn Converter>, ConvertError> {
        let inner = self.read();

        for name in &inner.order {
            if inner.disabled.contains(name) {
                continue;
            }
            if let Some(converter) = inner.converters.get(name) {
                if converter.can_convert(src, mime) {
                    return Ok(Arc::clone(converter));
                }
            }
        }

        Err(ConvertError::NoConverter(src.to_path_buf()))
    }

    pub fn enable(&self, name: &str) -> Result<(), ConvertError> {
        let mut inner = self.write();
        if !inner.converters.contains_key(name) {
            return Err(ConvertError::UnknownConverter(name.to_string()));
        }
        inner.disabled.remove(name);
        Ok(())
    }

    pub fn disable(&self, name: &str) -> Result<(), ConvertError> {
        let mut inner = self.write();
        if !inner.converters.contains_key(name) {
            return Err(ConvertError::UnknownConverter(name.to_string()));
        }
        inner.disabled.insert(name.to_string());
        Ok(())
    }

    pub fn is_enabled(&self, name: &str) -> Result<bool, ConvertError> {
        let inner = self.read();
        if !inner.converters.contains_key(name) {
            return Err(ConvertError::UnknownConverter(name.to_string()));
        }
        Ok(!inner.disabled.contains(name))
    }

    pub fn len(&self) -> usize {
        self.read().converters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
