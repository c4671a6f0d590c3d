//! Collector registry.
//!
//! An explicitly constructed, process-wide mapping of collector name to
//! [`Collector`] and group path to its member collectors. Populated once at
//! startup and read-only thereafter; the owner wraps it in an `Arc` before
//! handing it to the scheduler or CLI.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::collector::Collector;

/// Registry lookup and registration errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A collector with this name is already registered.
    #[error("collector already registered: {0}")]
    Duplicate(String),

    /// Collector name is empty or not a hierarchical path.
    #[error("invalid collector name: {0:?}")]
    InvalidName(String),

    /// No collector registered under this name.
    #[error("collector not found: {0}")]
    NotFound(String),

    /// No collector group registered under this path.
    #[error("collector group not found: {0}")]
    GroupNotFound(String),
}

/// Container for registered collectors.
#[derive(Debug, Default)]
pub struct Registry {
    collectors: HashMap<String, Arc<Collector>>,
    groups: HashMap<String, Vec<Arc<Collector>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collector under its hierarchical name.
    ///
    /// The group path is the name minus its last segment, so registering
    /// `/linux/performance/iostat` adds it to group `/linux/performance`.
    ///
    /// # Errors
    /// Returns [`RegistryError::Duplicate`] when the name is taken and
    /// [`RegistryError::InvalidName`] for empty or non-hierarchical names.
    /// Callers treat either as fatal at startup.
    pub fn add(&mut self, collector: Collector) -> Result<(), RegistryError> {
        let name = collector.name().to_string();
        if name.is_empty() || !name.starts_with('/') {
            return Err(RegistryError::InvalidName(name));
        }
        if self.collectors.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        let collector = Arc::new(collector);
        let group = match name.rfind('/') {
            Some(idx) => name[..idx].to_string(),
            None => String::new(),
        };
        self.groups
            .entry(group)
            .or_default()
            .push(Arc::clone(&collector));
        self.collectors.insert(name, collector);
        Ok(())
    }

    /// Fetch the collector registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<Collector>, RegistryError> {
        self.collectors
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Fetch all collectors registered under the group path `name`.
    pub fn group(&self, name: &str) -> Result<Vec<Arc<Collector>>, RegistryError> {
        self.groups
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::GroupNotFound(name.to_string()))
    }

    /// Names of all registered collectors, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collectors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered collectors.
    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }
}
