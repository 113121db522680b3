//! Named store formats.
//!
//! A repository keeps several stores side by side, each tuned for one kind of content. A
//! [`FormatRegistry`] maps the name of each kind to the [`StoreFactory`] that creates and opens
//! stores for it.

use crate::config::{IndexTolerance, StoreConfig};
use crate::error::{Error, Result};
use crate::store::GroupCompressStore;
use std::collections::BTreeMap;
use std::path::Path;

/// Creates and opens stores with one fixed set of settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreFactory {
    graph: bool,
    delta: bool,
    key_length: usize,
    tolerance: IndexTolerance,
}

impl StoreFactory {
    /// Make a factory for stores that fail on any index inconsistency.
    pub fn new(graph: bool, delta: bool, key_length: usize) -> Self {
        Self {
            graph,
            delta,
            key_length,
            tolerance: IndexTolerance::Fatal,
        }
    }

    pub fn tolerance(mut self, tolerance: IndexTolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// The configuration given to every store this factory makes. Settings the factory doesn't
    /// fix are left at their defaults.
    pub fn config(&self) -> StoreConfig {
        StoreConfig::new()
            .graph(self.graph)
            .delta(self.delta)
            .key_length(self.key_length)
            .tolerance(self.tolerance)
    }

    pub fn create(&self, root: impl AsRef<Path>) -> Result<GroupCompressStore> {
        GroupCompressStore::create(root, self.config())
    }

    pub fn open(&self, root: impl AsRef<Path>) -> Result<GroupCompressStore> {
        GroupCompressStore::open(root, self.config())
    }
}

/// A set of store factories, looked up by name.
#[derive(Clone, Debug, Default)]
pub struct FormatRegistry {
    factories: BTreeMap<String, StoreFactory>,
}

impl FormatRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the usual repository content kinds:
    ///
    /// | Name        | Graph | Delta | Key parts | Tolerance |
    /// | ----------- | ----- | ----- | --------- | --------- |
    /// | revisions   | yes   | no    | 1         | fatal     |
    /// | inventories | yes   | yes   | 1         | tolerant  |
    /// | texts       | yes   | yes   | 2         | tolerant  |
    /// | signatures  | no    | no    | 1         | tolerant  |
    /// | chk-bytes   | no    | yes   | 1         | tolerant  |
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let tolerant = IndexTolerance::Tolerant;
        registry.register("revisions", StoreFactory::new(true, false, 1));
        registry.register(
            "inventories",
            StoreFactory::new(true, true, 1).tolerance(tolerant),
        );
        registry.register("texts", StoreFactory::new(true, true, 2).tolerance(tolerant));
        registry.register(
            "signatures",
            StoreFactory::new(false, false, 1).tolerance(tolerant),
        );
        registry.register(
            "chk-bytes",
            StoreFactory::new(false, true, 1).tolerance(tolerant),
        );
        registry
    }

    /// Register a factory, returning whatever was registered under that name before.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: StoreFactory,
    ) -> Option<StoreFactory> {
        self.factories.insert(name.into(), factory)
    }

    pub fn get(&self, name: &str) -> Result<&StoreFactory> {
        self.factories
            .get(name)
            .ok_or_else(|| Error::UnknownFormat(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}
