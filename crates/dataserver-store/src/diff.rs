//! Diff engine: which logical files changed since the last checkpoint.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::{DependencyTagGraph, Diff, QueryRunner, Store, UniqueId};
use dataserver_core::{LogOperation, OperationLog};

/// Everything a diff is computed against. Borrowed for one `get_diff` call.
pub struct DiffSources<'a> {
    pub store: &'a Store,
    pub log: &'a OperationLog,
    pub runner: &'a QueryRunner,
    pub tags: &'a DependencyTagGraph,
}

#[derive(Debug, Default)]
struct DiffState {
    /// Checkpoint time, milliseconds since the epoch.
    since: i64,
    /// Log head at the checkpoint; the next log window starts after it.
    since_id: Option<UniqueId>,
    /// Last operation per path, fed at mutation time.
    tracked: BTreeMap<String, (LogOperation, UniqueId)>,
    /// Query invocation -> result fingerprint as of the checkpoint.
    baseline: HashMap<String, String>,
    /// Fingerprints observed by the latest `get_diff`; they replace the
    /// baseline on reset. `None` until a diff has been computed.
    observed: Option<HashMap<String, String>>,
}

pub struct DiffEngine {
    state: Mutex<DiffState>,
}

impl Default for DiffEngine {
    fn default() -> Self {
        Self::new(0, None)
    }
}

impl DiffEngine {
    pub fn new(since: i64, since_id: Option<UniqueId>) -> Self {
        Self {
            state: Mutex::new(DiffState {
                since,
                since_id,
                ..DiffState::default()
            }),
        }
    }

    pub fn since(&self) -> i64 {
        self.state.lock().since
    }

    pub fn since_id(&self) -> Option<UniqueId> {
        self.state.lock().since_id.clone()
    }

    /// Records a mutation. Must be called by the cycle that performs it.
    pub fn track_changed_file(&self, path: &str, operation: LogOperation, unique_id: UniqueId) {
        self.state
            .lock()
            .tracked
            .insert(path.to_string(), (operation, unique_id));
    }

    pub fn tracked(&self) -> BTreeMap<String, LogOperation> {
        self.state
            .lock()
            .tracked
            .iter()
            .map(|(path, (op, _))| (path.clone(), *op))
            .collect()
    }

    /// Updated and deleted files since the checkpoint.
    ///
    /// `incremental` reads the in-memory tracker; otherwise the file-level
    /// changes come from the operation log window `(since_id, head]`. Both
    /// are then widened with invalidated files, include ancestors and hosts
    /// of queries whose result changed.
    pub fn get_diff(&self, incremental: bool, sources: &DiffSources<'_>) -> Diff {
        let mut state = self.state.lock();
        let until = sources.log.last_unique_id();

        let changes: BTreeMap<String, LogOperation> = if incremental {
            state
                .tracked
                .iter()
                .map(|(path, (op, _))| (path.clone(), *op))
                .collect()
        } else {
            sources
                .log
                .scan(state.since_id.as_ref(), until.as_ref())
                .into_iter()
                .map(|entry| (entry.relative_path, entry.operation))
                .collect()
        };

        let mut diff = Diff {
            since: state.since,
            until,
            ..Diff::default()
        };
        for (path, operation) in changes {
            // The store reflects the last operation on each path.
            if sources.store.contains(&path) {
                diff.mark_updated(path);
            } else {
                if operation == LogOperation::Write {
                    debug!("{} was written but is no longer stored", path);
                }
                diff.mark_deleted(path);
            }
        }

        for path in sources.tags.get_invalidated_filepaths() {
            if sources.store.contains(&path) {
                diff.mark_updated(path);
            }
        }

        for host in self.changed_query_hosts(&mut state, sources) {
            if !diff.deleted.contains(&host) {
                diff.updated.insert(host);
            }
        }

        // Includers embed what they include, so they change with it.
        let changed: Vec<String> = diff.updated.iter().chain(diff.deleted.iter()).cloned().collect();
        for path in changed {
            for ancestor in sources.store.includes().ancestors_of(&path) {
                if sources.store.contains(&ancestor) && !diff.deleted.contains(&ancestor) {
                    diff.updated.insert(ancestor);
                }
            }
        }

        debug!(
            "Diff since {}: {} updated, {} deleted",
            diff.since,
            diff.updated.len(),
            diff.deleted.len()
        );
        diff
    }

    /// Re-executes every mounted query and returns the stored hosts of those
    /// whose result differs from the checkpoint baseline.
    fn changed_query_hosts(&self, state: &mut DiffState, sources: &DiffSources<'_>) -> BTreeSet<String> {
        let index = sources.store.includes();
        let mut hosts = BTreeSet::new();
        let mut observed = HashMap::new();

        for invocation in index.invocations() {
            let value = match sources.runner.execute(sources.store, &invocation) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Skipping query {} in diff: {}", invocation, e);
                    continue;
                }
            };
            let key = invocation.to_string();
            let print = fingerprint(&value);
            observed.insert(key.clone(), print.clone());

            match state.baseline.get(&key) {
                None => {
                    state.baseline.insert(key, print);
                }
                Some(previous) if *previous != print => {
                    hosts.extend(
                        index
                            .hosts_of(&invocation)
                            .into_iter()
                            .filter(|h| sources.store.contains(h)),
                    );
                }
                Some(_) => {}
            }
        }
        state.observed = Some(observed);
        hosts
    }

    /// Moves the checkpoint to `since`/`until`. Call only once the artifact
    /// built from the diff is durable.
    ///
    /// Tracked changes logged after `until` survive, so windows chain exactly.
    pub fn reset_diff(&self, since: i64, until: Option<UniqueId>) {
        let mut state = self.state.lock();
        match &until {
            Some(bound) => state.tracked.retain(|_, (_, id)| &*id > bound),
            None => state.tracked.clear(),
        }
        // Invocations no longer mounted anywhere drop out of the baseline.
        if let Some(observed) = state.observed.take() {
            state.baseline = observed;
        }
        state.since = since;
        state.since_id = until;
        debug!("Diff checkpoint moved to {} ({:?})", since, state.since_id);
    }
}

fn fingerprint(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cache, LogicalFile, ModuleRegistry, Query};
    use parking_lot::RwLock;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Settable(RwLock<Value>);

    impl Query for Settable {
        fn execute(&self, _store: &Store, _args: &BTreeMap<String, String>) -> crate::Result<Value> {
            Ok(self.0.read().clone())
        }
    }

    struct Fixture {
        _dir: TempDir,
        log: OperationLog,
        runner: QueryRunner,
        tags: DependencyTagGraph,
        query: Arc<Settable>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let log = OperationLog::open(dir.path().join("operations.log")).unwrap();
        let queries: Arc<ModuleRegistry<dyn Query>> = Arc::new(ModuleRegistry::new());
        let query = Arc::new(Settable(RwLock::new(json!([1]))));
        queries.register("latest", query.clone());
        Fixture {
            _dir: dir,
            log,
            runner: QueryRunner::new(queries, Arc::new(Cache::new())),
            tags: DependencyTagGraph::default(),
            query,
        }
    }

    fn put(store: &mut Store, path: &str, content: Value) {
        store.insert(LogicalFile::from_content(path, b"{}", content, "--"));
    }

    #[test]
    fn last_operation_on_a_path_wins() {
        let fx = fixture();
        let engine = DiffEngine::default();
        let mut store = Store::new();
        put(&mut store, "b.json", json!({}));

        for (op, path) in [
            (LogOperation::Write, "a.json"),
            (LogOperation::Delete, "a.json"),
            (LogOperation::Delete, "b.json"),
            (LogOperation::Write, "b.json"),
        ] {
            let id = fx.log.append(op, "id", "label", path).unwrap();
            engine.track_changed_file(path, op, id);
        }

        let sources = DiffSources {
            store: &store,
            log: &fx.log,
            runner: &fx.runner,
            tags: &fx.tags,
        };
        for incremental in [true, false] {
            let diff = engine.get_diff(incremental, &sources);
            assert_eq!(diff.updated, BTreeSet::from(["b.json".to_string()]));
            assert_eq!(diff.deleted, BTreeSet::from(["a.json".to_string()]));
            assert_eq!(diff.until, fx.log.last_unique_id());
        }
    }

    #[test]
    fn include_ancestors_are_updated() {
        let fx = fixture();
        let engine = DiffEngine::default();
        let mut store = Store::new();
        put(&mut store, "page.json", json!({"data": {"menuInclude": "menu.json"}}));
        put(&mut store, "menu.json", json!({"linkInclude": "link.json"}));
        put(&mut store, "link.json", json!({}));

        let id = fx.log.append(LogOperation::Write, "link", "Link", "link.json").unwrap();
        engine.track_changed_file("link.json", LogOperation::Write, id);

        let diff = engine.get_diff(
            true,
            &DiffSources {
                store: &store,
                log: &fx.log,
                runner: &fx.runner,
                tags: &fx.tags,
            },
        );
        assert_eq!(
            diff.updated,
            BTreeSet::from([
                "link.json".to_string(),
                "menu.json".to_string(),
                "page.json".to_string()
            ])
        );
    }

    #[test]
    fn changed_query_results_mark_hosts() {
        let fx = fixture();
        let engine = DiffEngine::default();
        let mut store = Store::new();
        put(&mut store, "page.json", json!({"latestQueryInclude": "latest?limit=2"}));
        let sources = DiffSources {
            store: &store,
            log: &fx.log,
            runner: &fx.runner,
            tags: &fx.tags,
        };

        assert!(engine.get_diff(true, &sources).is_empty());
        assert!(engine.get_diff(true, &sources).is_empty());

        *fx.query.0.write() = json!([1, 2]);
        let diff = engine.get_diff(true, &sources);
        assert_eq!(diff.updated, BTreeSet::from(["page.json".to_string()]));

        engine.reset_diff(10, fx.log.last_unique_id());
        assert!(engine.get_diff(true, &sources).is_empty());
        assert_eq!(engine.since(), 10);
    }

    #[test]
    fn includers_of_query_hosts_are_updated() {
        let fx = fixture();
        let engine = DiffEngine::default();
        let mut store = Store::new();
        put(&mut store, "page.json", json!({"data": {"menuInclude": "menu.json"}}));
        put(&mut store, "menu.json", json!({"latestQueryInclude": "latest"}));
        let sources = DiffSources {
            store: &store,
            log: &fx.log,
            runner: &fx.runner,
            tags: &fx.tags,
        };

        assert!(engine.get_diff(true, &sources).is_empty());
        *fx.query.0.write() = json!([1, 2, 3]);
        let diff = engine.get_diff(true, &sources);
        assert_eq!(
            diff.updated,
            BTreeSet::from(["menu.json".to_string(), "page.json".to_string()])
        );
    }

    #[test]
    fn unmounted_queries_leave_the_baseline_on_reset() {
        let fx = fixture();
        let engine = DiffEngine::default();
        let mut store = Store::new();
        put(&mut store, "page.json", json!({"latestQueryInclude": "latest?limit=2"}));
        {
            let sources = DiffSources {
                store: &store,
                log: &fx.log,
                runner: &fx.runner,
                tags: &fx.tags,
            };
            engine.get_diff(true, &sources);
        }
        engine.reset_diff(1, None);
        assert!(engine.state.lock().baseline.contains_key("latest?limit=2"));

        store.remove("page.json");
        let sources = DiffSources {
            store: &store,
            log: &fx.log,
            runner: &fx.runner,
            tags: &fx.tags,
        };
        engine.get_diff(true, &sources);
        engine.reset_diff(2, None);
        assert!(engine.state.lock().baseline.is_empty());

        // A reset without a diff in between keeps the baseline.
        put(&mut store, "page.json", json!({"latestQueryInclude": "latest?limit=2"}));
        let sources = DiffSources {
            store: &store,
            log: &fx.log,
            runner: &fx.runner,
            tags: &fx.tags,
        };
        engine.get_diff(true, &sources);
        engine.reset_diff(3, None);
        engine.reset_diff(4, None);
        assert_eq!(engine.state.lock().baseline.len(), 1);
    }

    #[test]
    fn invalidated_filepaths_join_the_diff() {
        let fx = fixture();
        let engine = DiffEngine::default();
        let mut store = Store::new();
        put(&mut store, "page.json", json!({}));
        fx.tags.set_dependency("page.json", ["entity/5"]);
        fx.tags.set_dependency("virtual", ["entity/5"]);
        fx.tags.invalidate_tags(["entity/5"]);
        fx.tags.track_invalidated_filepaths();

        let diff = engine.get_diff(
            false,
            &DiffSources {
                store: &store,
                log: &fx.log,
                runner: &fx.runner,
                tags: &fx.tags,
            },
        );
        assert_eq!(diff.updated, BTreeSet::from(["page.json".to_string()]));
    }

    #[test]
    fn reset_keeps_changes_logged_after_the_bound() {
        let fx = fixture();
        let engine = DiffEngine::default();
        let mut store = Store::new();
        put(&mut store, "a.json", json!({}));
        put(&mut store, "b.json", json!({}));

        let first = fx.log.append(LogOperation::Write, "a", "A", "a.json").unwrap();
        engine.track_changed_file("a.json", LogOperation::Write, first.clone());
        let second = fx.log.append(LogOperation::Write, "b", "B", "b.json").unwrap();
        engine.track_changed_file("b.json", LogOperation::Write, second);

        engine.reset_diff(1, Some(first));
        let sources = DiffSources {
            store: &store,
            log: &fx.log,
            runner: &fx.runner,
            tags: &fx.tags,
        };
        for incremental in [true, false] {
            let diff = engine.get_diff(incremental, &sources);
            assert_eq!(diff.updated, BTreeSet::from(["b.json".to_string()]));
        }
    }
}
