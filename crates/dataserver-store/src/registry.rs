//! Registries of user modules (queries, hooks, post-processors).
//!
//! Each registry maps a module id to the active implementation. Writers swap
//! the whole map RCU-style, so a reader either sees the map before a reload or
//! the one after it.

use arc_swap::ArcSwap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::{LogicalFile, Result, Store};

pub struct ModuleRegistry<T: ?Sized> {
    modules: ArcSwap<BTreeMap<String, Arc<T>>>,
}

impl<T: ?Sized> Default for ModuleRegistry<T> {
    fn default() -> Self {
        Self {
            modules: ArcSwap::from_pointee(BTreeMap::new()),
        }
    }
}

impl<T: ?Sized> ModuleRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a module; returns the previous implementation.
    pub fn register(&self, id: impl Into<String>, module: Arc<T>) -> Option<Arc<T>> {
        let id = id.into();
        let previous = self.get(&id);
        self.modules.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.insert(id.clone(), module.clone());
            next
        });
        previous
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<T>> {
        let previous = self.get(id)?;
        self.modules.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.remove(id);
            next
        });
        Some(previous)
    }

    /// Installs a complete module set in one swap.
    pub fn replace_all(&self, modules: BTreeMap<String, Arc<T>>) {
        self.modules.store(Arc::new(modules));
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.modules.load().get(id).cloned()
    }

    /// The map as of this call, ordered by id. Later swaps do not affect it.
    pub fn snapshot(&self) -> Arc<BTreeMap<String, Arc<T>>> {
        self.modules.load_full()
    }

    pub fn ids(&self) -> Vec<String> {
        self.modules.load().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.modules.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.load().is_empty()
    }
}

/// Hook module invoked by the update pipeline. Every method defaults to a pass-through.
pub trait Hook: Send + Sync {
    /// Rewrites parsed content before it becomes a [`LogicalFile`].
    fn on_process_file(&self, _path: &str, content: Value) -> Result<Value> {
        Ok(content)
    }

    /// Runs after `file` was added to the staged store.
    fn on_store_add(&self, _data_dir: &Path, _file: &LogicalFile, _store: &mut Store) -> Result<()> {
        Ok(())
    }

    /// Runs after `path` was removed from the staged store.
    fn on_store_remove(&self, _path: &str, _store: &mut Store) -> Result<()> {
        Ok(())
    }
}

/// Post-processor module, invoked after every hook at the same points.
pub trait PostProcessor: Send + Sync {
    fn process_file(&self, _path: &str, content: Value) -> Result<Value> {
        Ok(content)
    }

    fn store_add(&self, _data_dir: &Path, _file: &LogicalFile, _store: &mut Store) -> Result<()> {
        Ok(())
    }

    fn store_remove(&self, _path: &str, _store: &mut Store) -> Result<()> {
        Ok(())
    }
}
