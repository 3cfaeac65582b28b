//! Tag-based dependency graph.
//!
//! A dependent tag declares the tags it relies on. Invalidation is split in
//! two steps: [`DependencyTagGraph::invalidate_tags`] only accumulates, and
//! [`DependencyTagGraph::track_invalidated_filepaths`] computes the affected
//! dependents from the *current* edges. The second step must run before an
//! update cycle rewrites the edges, otherwise the pre-update relations are lost.

use crate::{Cache, InvalidationConfig, PropagationDepth, Result, TagIdentity};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives every batch of tags passed to `invalidate_tags`.
pub trait InvalidationListener: Send + Sync {
    fn on_invalidation(&self, tags: &[String]) -> Result<()>;
}

/// Edge sets are never stored empty, in either direction.
#[derive(Debug, Default)]
struct TagEdges {
    /// tag -> tags it depends on
    forward: HashMap<String, HashSet<String>>,
    /// depended-on tag -> dependents
    reverse: HashMap<String, HashSet<String>>,
}

impl TagEdges {
    fn insert(&mut self, tag: &str, depends_on: &str) {
        self.forward
            .entry(tag.to_string())
            .or_default()
            .insert(depends_on.to_string());
        self.reverse
            .entry(depends_on.to_string())
            .or_default()
            .insert(tag.to_string());
    }

    fn remove(&mut self, tag: &str, depends_on: &str) {
        if let Some(set) = self.forward.get_mut(tag) {
            set.remove(depends_on);
            if set.is_empty() {
                self.forward.remove(tag);
            }
        }
        if let Some(set) = self.reverse.get_mut(depends_on) {
            set.remove(tag);
            if set.is_empty() {
                self.reverse.remove(depends_on);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagGraphStats {
    pub dependent_tags: usize,
    pub edges: usize,
    pub invalidated_tags: usize,
}

pub struct DependencyTagGraph {
    policy: InvalidationConfig,
    edges: RwLock<TagEdges>,
    invalidated: Mutex<HashSet<String>>,
    snapshot: RwLock<Vec<String>>,
    listeners: RwLock<Vec<Arc<dyn InvalidationListener>>>,
}

impl Default for DependencyTagGraph {
    fn default() -> Self {
        Self::new(InvalidationConfig::default())
    }
}

impl DependencyTagGraph {
    pub fn new(policy: InvalidationConfig) -> Self {
        Self {
            policy,
            edges: RwLock::new(TagEdges::default()),
            invalidated: Mutex::new(HashSet::new()),
            snapshot: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn policy(&self) -> &InvalidationConfig {
        &self.policy
    }

    pub fn add_listener(&self, listener: Arc<dyn InvalidationListener>) {
        self.listeners.write().push(listener);
    }

    /// Unions `depends_on` into the edge set of `tag`. Idempotent.
    pub fn set_dependency<I, S>(&self, tag: &str, depends_on: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut edges = self.edges.write();
        for dep in depends_on {
            edges.insert(tag, dep.as_ref());
        }
    }

    /// Removes the given members; the tag entry disappears with its last member.
    pub fn delete_dependency<I, S>(&self, tag: &str, depends_on: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut edges = self.edges.write();
        for dep in depends_on {
            edges.remove(tag, dep.as_ref());
        }
    }

    /// Makes the edge set of `tag` exactly `depends_on`.
    pub fn replace_dependencies(&self, tag: &str, depends_on: &BTreeSet<String>) {
        let mut edges = self.edges.write();
        let stale: Vec<String> = edges
            .forward
            .get(tag)
            .map(|set| set.iter().filter(|d| !depends_on.contains(*d)).cloned().collect())
            .unwrap_or_default();
        for dep in stale {
            edges.remove(tag, &dep);
        }
        for dep in depends_on {
            edges.insert(tag, dep);
        }
    }

    /// Drops every edge owned by `tag`.
    pub fn remove_tag(&self, tag: &str) {
        let mut edges = self.edges.write();
        let owned: Vec<String> = edges
            .forward
            .get(tag)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for dep in owned {
            edges.remove(tag, &dep);
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.edges.read().forward.contains_key(tag)
    }

    pub fn dependencies_of(&self, tag: &str) -> BTreeSet<String> {
        self.edges
            .read()
            .forward
            .get(tag)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, tag: &str) -> BTreeSet<String> {
        self.edges
            .read()
            .reverse
            .get(tag)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Accumulates tags into the invalidated set; no graph walk happens here.
    pub fn invalidate_tags<I, S>(&self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        if tags.is_empty() {
            return;
        }
        self.invalidated.lock().extend(tags.iter().cloned());
        debug!("Invalidated {} tags", tags.len());

        for listener in self.listeners.read().iter() {
            if let Err(e) = listener.on_invalidation(&tags) {
                warn!("Invalidation listener failed: {:?}", e);
            }
        }
    }

    pub fn invalidated_tags(&self) -> BTreeSet<String> {
        self.invalidated.lock().iter().cloned().collect()
    }

    /// Snapshots the dependents of the invalidated set, reporting every tag.
    pub fn track_invalidated_filepaths(&self) -> Vec<String> {
        self.track_invalidated_filepaths_with(|_| true)
    }

    /// Snapshots the dependents of the invalidated set. `is_filepath` is
    /// consulted only under [`TagIdentity::StoreFiles`].
    pub fn track_invalidated_filepaths_with(&self, is_filepath: impl Fn(&str) -> bool) -> Vec<String> {
        let seeds: Vec<String> = self.invalidated.lock().iter().cloned().collect();
        let edges = self.edges.read();

        let mut affected: BTreeSet<String> = BTreeSet::new();
        let mut visited: HashSet<String> = seeds.iter().cloned().collect();
        let mut queue: VecDeque<String> = seeds.into_iter().collect();

        while let Some(tag) = queue.pop_front() {
            let Some(dependents) = edges.reverse.get(&tag) else {
                continue;
            };
            for dependent in dependents {
                affected.insert(dependent.clone());
                if self.policy.propagation == PropagationDepth::Transitive
                    && visited.insert(dependent.clone())
                {
                    queue.push_back(dependent.clone());
                }
            }
        }
        drop(edges);

        let result: Vec<String> = affected
            .into_iter()
            .filter(|tag| match self.policy.tag_identity {
                TagIdentity::Any => true,
                TagIdentity::StoreFiles => is_filepath(tag),
            })
            .collect();
        *self.snapshot.write() = result.clone();
        result
    }

    /// The snapshot taken by the last `track_invalidated_filepaths` call.
    pub fn get_invalidated_filepaths(&self) -> Vec<String> {
        self.snapshot.read().clone()
    }

    /// Clears the invalidated set once a checkpoint consumed it.
    pub fn reset_invalidated_tags(&self) {
        self.invalidated.lock().clear();
    }

    /// Drops every edge, the invalidated set and the snapshot.
    pub fn clear(&self) {
        *self.edges.write() = TagEdges::default();
        self.invalidated.lock().clear();
        self.snapshot.write().clear();
    }

    pub fn stats(&self) -> TagGraphStats {
        let edges = self.edges.read();
        TagGraphStats {
            dependent_tags: edges.forward.len(),
            edges: edges.forward.values().map(|s| s.len()).sum(),
            invalidated_tags: self.invalidated.lock().len(),
        }
    }
}

/// Evicts cache entries keyed by an invalidated tag, and resets bins named after one.
pub struct CacheInvalidationListener<V: Clone = serde_json::Value> {
    cache: Arc<Cache<V>>,
    keyed_bins: Vec<String>,
}

impl<V: Clone + Send + Sync> CacheInvalidationListener<V> {
    pub fn new(cache: Arc<Cache<V>>, keyed_bins: Vec<String>) -> Self {
        Self { cache, keyed_bins }
    }
}

impl<V: Clone + Send + Sync> InvalidationListener for CacheInvalidationListener<V> {
    fn on_invalidation(&self, tags: &[String]) -> Result<()> {
        for tag in tags {
            if self.cache.has_bin(tag) {
                self.cache.reset(tag);
            }
            for bin in &self.keyed_bins {
                self.cache.bin(bin).delete(tag);
            }
        }
        Ok(())
    }
}
