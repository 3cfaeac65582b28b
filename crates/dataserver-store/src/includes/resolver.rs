use once_cell::sync::OnceCell;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{mount_alias, mount_entity, navigate, Include, IncludeSite};
use crate::{Cache, QueryInvocation, QueryRunner, Store, RESOLVED_BIN};

/// Resolves static includes eagerly and installs deferred queries for dynamic ones.
pub struct IncludeResolver {
    cache: Arc<Cache>,
    runner: Arc<QueryRunner>,
}

/// Outcome of resolving one file's static includes.
struct Resolved {
    content: Value,
    /// False when an include cycle cut resolution short somewhere below.
    complete: bool,
}

impl IncludeResolver {
    pub fn new(cache: Arc<Cache>, runner: Arc<QueryRunner>) -> Self {
        Self { cache, runner }
    }

    /// The resolved view of `path`, or `None` if the store has no such file.
    ///
    /// Callers must hold the store's read section while this runs, so the
    /// memoised content cannot race with a commit evicting it.
    pub fn resolve(&self, store: &Arc<Store>, path: &str) -> Option<ResolvedDocument> {
        let file = store.get(path)?;
        let content = self
            .resolve_static(store, path, &mut HashSet::new())
            .map(|r| r.content)
            .unwrap_or_else(|| file.content.clone());

        let deferred = reachable_queries(store, path, &mut HashSet::new())
            .into_values()
            .map(|(site, invocation)| DeferredQuery {
                site,
                invocation,
                value: OnceCell::new(),
            })
            .collect();

        Some(ResolvedDocument {
            path: path.to_string(),
            content,
            deferred,
            store: store.clone(),
            runner: self.runner.clone(),
        })
    }

    fn resolve_static(
        &self,
        store: &Store,
        path: &str,
        visiting: &mut HashSet<String>,
    ) -> Option<Resolved> {
        let bin = self.cache.bin(RESOLVED_BIN);
        if let Some(content) = bin.get(path) {
            return Some(Resolved {
                content,
                complete: true,
            });
        }
        let file = store.get(path)?;
        if !visiting.insert(path.to_string()) {
            warn!("Include cycle through {}, leaving reference unresolved", path);
            return None;
        }

        let mut content = file.content.clone();
        let mut complete = true;
        let includes = store.includes().declared(path);

        // Entity includes replace whole nodes, so they go after the aliases
        // mounted inside those nodes.
        let aliases = includes.iter().filter(|i| matches!(i, Include::Alias { .. }));
        let entities = includes.iter().filter(|i| matches!(i, Include::Entity { .. }));

        for include in aliases.chain(entities) {
            let Some(target) = include.target() else {
                continue;
            };
            if visiting.contains(target) {
                warn!("Include cycle: {} -> {}", path, target);
                complete = false;
                continue;
            }
            let Some(resolved) = self.resolve_static(store, target, visiting) else {
                warn!(
                    "Include target {} of {} ({}) not found, leaving it unresolved",
                    target,
                    path,
                    include.site().dotted()
                );
                continue;
            };
            complete &= resolved.complete;

            let mounted = match include {
                Include::Entity { site, .. } => match navigate(&resolved.content, &["data", "content"]) {
                    Some(entity) => mount_entity(&mut content, site, entity.clone()),
                    None => {
                        warn!("Entity include target {} has no data.content", target);
                        continue;
                    }
                },
                Include::Alias { site, .. } => mount_alias(&mut content, site, resolved.content),
                Include::Query { .. } => continue,
            };
            match mounted {
                Ok(true) => debug!("Mounted {} into {}", target, path),
                Ok(false) => debug!("Include {} of {} already mounted", target, path),
                Err(e) => warn!("Could not mount {} into {}: {}", target, path, e),
            }
        }

        visiting.remove(path);
        if complete {
            bin.set(path, content.clone());
        }
        Some(Resolved { content, complete })
    }
}

/// Query includes of `path` and of everything it statically includes, with
/// each site expressed in `path`'s own coordinates. Keyed by dotted site.
///
/// Sites that end up under a node replaced by an entity include simply fail
/// to mount later, like the host's own keys there.
fn reachable_queries(
    store: &Store,
    path: &str,
    visiting: &mut HashSet<String>,
) -> BTreeMap<String, (IncludeSite, QueryInvocation)> {
    let mut found = BTreeMap::new();
    if !visiting.insert(path.to_string()) {
        return found;
    }
    let includes = store.includes().declared(path);
    for include in includes {
        if let Include::Query { site, invocation } = include {
            found.insert(site.dotted(), (site.clone(), invocation.clone()));
        }
    }

    let aliases = includes.iter().filter(|i| matches!(i, Include::Alias { .. }));
    let entities = includes.iter().filter(|i| matches!(i, Include::Entity { .. }));
    for include in aliases.chain(entities) {
        let Some(target) = include.target() else {
            continue;
        };
        if visiting.contains(target) || !store.contains(target) {
            continue;
        }
        for (nested, invocation) in reachable_queries(store, target, visiting).into_values() {
            let site = match include {
                Include::Alias { site, .. } => Some(nested.rebased(&site.alias_path())),
                Include::Entity { site, .. } => nested
                    .strip_prefix(&["data", "content"])
                    .map(|inner| inner.rebased(&site.parent)),
                Include::Query { .. } => None,
            };
            if let Some(site) = site {
                found.insert(site.dotted(), (site, invocation));
            }
        }
    }
    visiting.remove(path);
    found
}

/// A query mounted into a document, evaluated at most once, on first read.
#[derive(Debug)]
pub struct DeferredQuery {
    site: IncludeSite,
    invocation: QueryInvocation,
    value: OnceCell<Value>,
}

impl DeferredQuery {
    pub fn site(&self) -> &IncludeSite {
        &self.site
    }

    pub fn invocation(&self) -> &QueryInvocation {
        &self.invocation
    }

    pub fn is_evaluated(&self) -> bool {
        self.value.get().is_some()
    }

    fn force(&self, store: &Store, runner: &QueryRunner) -> &Value {
        self.value.get_or_init(|| match runner.run(store, &self.invocation) {
            Ok(value) => value,
            Err(e) => {
                warn!("Query include {} failed: {}", self.invocation, e);
                Value::Null
            }
        })
    }
}

/// A document with its static includes applied and its query includes deferred.
///
/// Reading a field through [`field`](Self::field) evaluates only the queries
/// mounted on that path; serialising evaluates all of them.
pub struct ResolvedDocument {
    path: String,
    content: Value,
    deferred: Vec<DeferredQuery>,
    store: Arc<Store>,
    runner: Arc<QueryRunner>,
}

impl ResolvedDocument {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Content with static includes applied and query include keys still in place.
    pub fn static_content(&self) -> &Value {
        &self.content
    }

    pub fn deferred(&self) -> &[DeferredQuery] {
        &self.deferred
    }

    pub fn pending_queries(&self) -> usize {
        self.deferred.iter().filter(|d| !d.is_evaluated()).count()
    }

    /// Value at a dotted path, evaluating the queries mounted on or below it.
    pub fn field(&self, dotted: &str) -> Option<Value> {
        let wanted: Vec<&str> = dotted.split('.').filter(|s| !s.is_empty()).collect();
        let mut view = self.content.clone();
        for deferred in &self.deferred {
            let mount = deferred.site.alias_path();
            let overlaps = wanted.iter().zip(mount.iter()).all(|(a, b)| a == b);
            if overlaps {
                self.mount(&mut view, deferred);
            }
        }
        navigate(&view, &wanted).cloned()
    }

    /// Fully evaluated content.
    pub fn to_value(&self) -> Value {
        let mut view = self.content.clone();
        for deferred in &self.deferred {
            self.mount(&mut view, deferred);
        }
        view
    }

    fn mount(&self, view: &mut Value, deferred: &DeferredQuery) {
        let value = deferred.force(&self.store, &self.runner).clone();
        if let Err(e) = mount_alias(view, &deferred.site, value) {
            debug!("Query include {} not mounted in {}: {}", deferred.invocation, self.path, e);
        }
    }
}

impl std::fmt::Debug for ResolvedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedDocument")
            .field("path", &self.path)
            .field("content", &self.content)
            .field("deferred", &self.deferred)
            .finish()
    }
}

impl Serialize for ResolvedDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}
