//! The `DataServer` facade: owns the store snapshot and drives update cycles.
//!
//! One writer at a time: every cycle holds `writer` from the invalidation
//! snapshot to the commit. Readers clone the current `Arc<Store>` and never
//! observe a half-applied cycle.

use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::{
    Cache, ChangeEvent, DataServerConfig, DataServerError, DependencyTagGraph, Diff, DiffEngine,
    DiffSources, Dump, DumpManager, Hook, IncludeResolver, LogicalFile, ModuleRegistry,
    PostProcessor, Query, QueryRunner, ResolvedDocument, Result, Store, SubsetOptions, UniqueId,
    QUERY_BIN, RESOLVED_BIN,
};
use dataserver_cache::CacheInvalidationListener;
use dataserver_core::{
    normalize_relative_path, relative_to, DataDirWatcher, LogEntry, LogOperation, LogRecord,
    OperationLog,
};

const EVENT_CAPACITY: usize = 64;

/// Outcome of one update cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Log ids assigned to the cycle's mutations, in order.
    pub unique_ids: Vec<UniqueId>,
    pub updated: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
    /// Files excluded from the cycle, with the reason.
    pub failed: Vec<(String, String)>,
    /// Dependents of the invalidated tags, snapshotted before the store changed.
    pub invalidated: Vec<String>,
}

impl UpdateReport {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Stops the watcher and the apply loop started by [`DataServer::spawn_watcher`].
pub struct WatcherHandle {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.threads {
            if handle.join().is_err() {
                error!("watcher thread panicked");
            }
        }
    }
}

pub struct DataServer {
    config: DataServerConfig,
    /// Work dir relative to the data dir, when nested inside it.
    work_prefix: Option<String>,
    state: RwLock<Arc<Store>>,
    writer: Mutex<()>,
    log: OperationLog,
    tags: Arc<DependencyTagGraph>,
    cache: Arc<Cache>,
    queries: Arc<ModuleRegistry<dyn Query>>,
    hooks: Arc<ModuleRegistry<dyn Hook>>,
    post_processors: Arc<ModuleRegistry<dyn PostProcessor>>,
    runner: Arc<QueryRunner>,
    resolver: IncludeResolver,
    diff: DiffEngine,
    dumps: DumpManager,
    events: broadcast::Sender<UpdateReport>,
}

impl DataServer {
    /// Validates the configuration and opens the durable state under `work_dir`.
    /// The store starts empty; call [`load`](Self::load) to ingest `data_dir`.
    pub fn open(config: DataServerConfig) -> Result<Self> {
        config.validate()?;

        let log = OperationLog::open(config.log_path())?;
        let dumps = DumpManager::from_config(&config);
        let diff = match dumps.latest() {
            Some(dump) => {
                let since = dump.unique_id.timestamp_millis().unwrap_or(dump.since);
                info!("Restored diff checkpoint from dump {}", dump.unique_id);
                DiffEngine::new(since, dump.until)
            }
            None => DiffEngine::default(),
        };

        let cache: Arc<Cache> = Arc::new(Cache::new());
        let tags = Arc::new(DependencyTagGraph::new(config.invalidation.clone()));
        tags.add_listener(Arc::new(CacheInvalidationListener::new(
            cache.clone(),
            vec![RESOLVED_BIN.to_string()],
        )));

        let queries: Arc<ModuleRegistry<dyn Query>> = Arc::new(ModuleRegistry::new());
        let runner = Arc::new(QueryRunner::new(queries.clone(), cache.clone()));
        let resolver = IncludeResolver::new(cache.clone(), runner.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let work_prefix = relative_to(&config.data_dir, &config.work_dir);

        info!(
            "DataServer opened (data: {:?}, work: {:?}, mode: {})",
            config.data_dir, config.work_dir, config.run_mode
        );
        Ok(Self {
            config,
            work_prefix,
            state: RwLock::new(Arc::new(Store::new())),
            writer: Mutex::new(()),
            log,
            tags,
            cache,
            queries,
            hooks: Arc::new(ModuleRegistry::new()),
            post_processors: Arc::new(ModuleRegistry::new()),
            runner,
            resolver,
            diff,
            dumps,
            events,
        })
    }

    pub fn config(&self) -> &DataServerConfig {
        &self.config
    }

    pub fn queries(&self) -> &Arc<ModuleRegistry<dyn Query>> {
        &self.queries
    }

    pub fn hooks(&self) -> &Arc<ModuleRegistry<dyn Hook>> {
        &self.hooks
    }

    pub fn post_processors(&self) -> &Arc<ModuleRegistry<dyn PostProcessor>> {
        &self.post_processors
    }

    pub fn tag_graph(&self) -> &Arc<DependencyTagGraph> {
        &self.tags
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn operation_log(&self) -> &OperationLog {
        &self.log
    }

    pub fn dumps(&self) -> &DumpManager {
        &self.dumps
    }

    pub fn diff_engine(&self) -> &DiffEngine {
        &self.diff
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateReport> {
        self.events.subscribe()
    }

    /// Ingests every tracked file under `data_dir`. Initial loads are not logged.
    pub fn load(&self) -> Result<usize> {
        let _writer = self.writer.lock();
        self.rebuild()
    }

    /// Drops the graph and every cache bin, then loads `data_dir` again.
    pub fn reload(&self) -> Result<usize> {
        let _writer = self.writer.lock();
        self.tags.clear();
        self.cache.reset_all();
        self.rebuild()
    }

    fn rebuild(&self) -> Result<usize> {
        let previous = self.snapshot();
        let mut staged = Store::new();
        let mut failed = 0usize;

        let walker = WalkDir::new(&self.config.data_dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !e.file_type().is_dir() || self.is_data_dir(e.path()));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(path) = relative_to(&self.config.data_dir, entry.path()) else {
                continue;
            };
            if !self.tracks(&path) {
                continue;
            }
            if let Err(e) = self.stage_write(&mut staged, &path) {
                warn!("Skipping {}: {}", path, e);
                failed += 1;
            }
        }
        staged.advance_generation(previous.generation());
        let staged = Arc::new(staged);
        let loaded = staged.len();

        let mut guard = self.state.write();
        for path in previous.paths() {
            self.tags.remove_tag(path);
        }
        for path in staged.paths() {
            self.sync_tags(&staged, path);
        }
        self.cache.reset(RESOLVED_BIN);
        self.cache.reset(QUERY_BIN);
        *guard = staged;
        drop(guard);

        info!("Loaded {} files from {:?} ({} failed)", loaded, self.config.data_dir, failed);
        Ok(loaded)
    }

    /// Current snapshot. Stays valid, and unchanged, across later cycles.
    pub fn snapshot(&self) -> Arc<Store> {
        self.state.read().clone()
    }

    /// Resolved view of a stored file.
    pub fn get(&self, path: &str) -> Option<ResolvedDocument> {
        let path = normalize_relative_path(path);
        let guard = self.state.read();
        self.resolver.resolve(&guard, &path)
    }

    /// The stored file as parsed, without include resolution.
    pub fn get_file(&self, path: &str) -> Option<Arc<LogicalFile>> {
        self.state.read().get(&normalize_relative_path(path)).cloned()
    }

    pub fn subset(&self, options: &SubsetOptions) -> Vec<String> {
        self.state
            .read()
            .subset(options, &self.config.store.file_extension)
    }

    /// Marks external content tags stale and refreshes the invalidated
    /// filepath snapshot. Returns that snapshot.
    pub fn invalidate_tags<I, S>(&self, tags: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _writer = self.writer.lock();
        self.tags.invalidate_tags(tags);
        self.track_invalidated(&self.snapshot())
    }

    fn track_invalidated(&self, store: &Store) -> Vec<String> {
        self.tags
            .track_invalidated_filepaths_with(|tag| store.contains(tag))
    }

    /// Runs one update cycle over `events`.
    ///
    /// The affected-file snapshot is taken before anything changes. Mutations
    /// are staged on a copy of the store, logged in one batch and committed
    /// in one exclusive section. A file whose hooks fail is left out of the
    /// cycle; a log failure aborts the cycle with the previous state intact.
    pub fn apply(&self, events: Vec<ChangeEvent>) -> Result<UpdateReport> {
        let _writer = self.writer.lock();

        let mut pending: BTreeMap<String, LogOperation> = BTreeMap::new();
        for event in events {
            let path = normalize_relative_path(event.path());
            if path.is_empty() || !self.tracks(&path) {
                debug!("Ignoring change to {:?}", event.path());
                continue;
            }
            pending.insert(path, event.operation());
        }
        let mut report = UpdateReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        let current = self.snapshot();
        self.tags.invalidate_tags(pending.keys().cloned());
        report.invalidated = self.track_invalidated(&current);

        let mut staged = (*current).clone();
        let mut records = Vec::new();
        let mut applied = Vec::new();
        for (path, operation) in pending {
            let operation = match operation {
                LogOperation::Write if !self.config.data_dir.join(&path).is_file() => {
                    debug!("{} vanished before it was read, treating as deleted", path);
                    LogOperation::Delete
                }
                op => op,
            };
            let outcome = match operation {
                LogOperation::Write => self.stage_write(&mut staged, &path).map(Some),
                LogOperation::Delete => self.stage_delete(&mut staged, &path),
            };
            match outcome {
                Ok(Some(file)) => {
                    records.push(LogRecord::new(operation, file.id.clone(), label_of(&file), path.clone()));
                    applied.push((path, operation));
                }
                Ok(None) => debug!("{} is not stored, nothing to delete", path),
                Err(e) => {
                    warn!("Excluding {} from this cycle: {}", path, e);
                    report.failed.push((path, e.to_string()));
                }
            }
        }
        if records.is_empty() {
            return Ok(report);
        }

        let entries = self.log.append_batch(records)?;
        staged.advance_generation(current.generation());
        self.commit(&current, Arc::new(staged), &applied, &entries);

        report.unique_ids = entries.into_iter().map(|e| e.unique_id).collect();
        for (path, operation) in applied {
            match operation {
                LogOperation::Write => report.updated.insert(path),
                LogOperation::Delete => report.deleted.insert(path),
            };
        }
        info!(
            "Update cycle committed: {} updated, {} deleted, {} failed, {} invalidated",
            report.updated.len(),
            report.deleted.len(),
            report.failed.len(),
            report.invalidated.len()
        );
        if self.events.send(report.clone()).is_err() {
            debug!("No update subscribers");
        }
        Ok(report)
    }

    fn commit(
        &self,
        previous: &Store,
        staged: Arc<Store>,
        applied: &[(String, LogOperation)],
        entries: &[LogEntry],
    ) {
        let mut guard = self.state.write();
        for ((path, operation), entry) in applied.iter().zip(entries) {
            match operation {
                LogOperation::Write => self.sync_tags(&staged, path),
                LogOperation::Delete => self.tags.remove_tag(path),
            }
            self.diff
                .track_changed_file(path, *operation, entry.unique_id.clone());
        }

        let resolved = self.cache.bin(RESOLVED_BIN);
        for (path, _) in applied {
            resolved.delete(path);
            let ancestors = previous
                .includes()
                .ancestors_of(path)
                .into_iter()
                .chain(staged.includes().ancestors_of(path));
            for ancestor in ancestors {
                resolved.delete(&ancestor);
            }
        }
        self.cache.reset(QUERY_BIN);
        *guard = staged;
    }

    /// Declares `path -> {metadata tags, static include targets}`.
    fn sync_tags(&self, store: &Store, path: &str) {
        let Some(file) = store.get(path) else {
            self.tags.remove_tag(path);
            return;
        };
        let mut depends_on = file.metadata.tags.clone();
        depends_on.extend(store.includes().static_targets(path));
        self.tags.replace_dependencies(path, &depends_on);
    }

    fn stage_write(&self, staged: &mut Store, path: &str) -> Result<Arc<LogicalFile>> {
        let raw = fs::read(self.config.data_dir.join(path))?;
        let separator = &self.config.store.variant_separator;
        let parsed = LogicalFile::parse(path, &raw, separator)?;

        let hooks = self.hooks.snapshot();
        let processors = self.post_processors.snapshot();
        let file = if hooks.is_empty() && processors.is_empty() {
            parsed
        } else {
            let mut content = parsed.content;
            for (id, hook) in hooks.iter() {
                content = hook
                    .on_process_file(path, content)
                    .map_err(|e| DataServerError::module(id, path, e))?;
            }
            for (id, processor) in processors.iter() {
                content = processor
                    .process_file(path, content)
                    .map_err(|e| DataServerError::module(id, path, e))?;
            }
            // Metadata and includes are re-derived from the processed content.
            LogicalFile::from_content(path, &raw, content, separator)
        };
        let file = Arc::new(file);
        let previous = staged.insert_arc(file.clone());
        if let Err(e) = self.run_add_modules(staged, &file) {
            staged.restore(path, previous);
            return Err(e);
        }
        debug!("Staged {}", path);
        Ok(file)
    }

    fn run_add_modules(&self, staged: &mut Store, file: &LogicalFile) -> Result<()> {
        let data_dir = self.config.data_dir.as_path();
        for (id, hook) in self.hooks.snapshot().iter() {
            hook.on_store_add(data_dir, file, staged)
                .map_err(|e| DataServerError::module(id, &file.path, e))?;
        }
        for (id, processor) in self.post_processors.snapshot().iter() {
            processor
                .store_add(data_dir, file, staged)
                .map_err(|e| DataServerError::module(id, &file.path, e))?;
        }
        Ok(())
    }

    fn stage_delete(&self, staged: &mut Store, path: &str) -> Result<Option<Arc<LogicalFile>>> {
        let Some(previous) = staged.remove(path) else {
            return Ok(None);
        };
        let removed = self.run_remove_modules(staged, path);
        match removed {
            Ok(()) => {
                debug!("Staged removal of {}", path);
                Ok(Some(previous))
            }
            Err(e) => {
                staged.restore(path, Some(previous));
                Err(e)
            }
        }
    }

    fn run_remove_modules(&self, staged: &mut Store, path: &str) -> Result<()> {
        for (id, hook) in self.hooks.snapshot().iter() {
            hook.on_store_remove(path, staged)
                .map_err(|e| DataServerError::module(id, path, e))?;
        }
        for (id, processor) in self.post_processors.snapshot().iter() {
            processor
                .store_remove(path, staged)
                .map_err(|e| DataServerError::module(id, path, e))?;
        }
        Ok(())
    }

    /// Changes since the last checkpoint.
    pub fn get_diff(&self, incremental: bool) -> Diff {
        let store = self.snapshot();
        self.diff.get_diff(
            incremental,
            &DiffSources {
                store: &store,
                log: &self.log,
                runner: &self.runner,
                tags: &self.tags,
            },
        )
    }

    pub fn reset_diff(&self, since: i64, until: Option<UniqueId>) {
        self.diff.reset_diff(since, until);
    }

    /// Dumps the current diff, records it in the ledger and only then moves
    /// the checkpoint. On failure the diff is untouched and the call can be retried.
    pub fn dump_and_checkpoint(&self) -> Result<Dump> {
        let _writer = self.writer.lock();
        let diff = self.get_diff(false);

        let dump = self.dumps.dump(&diff, |path| {
            let doc = self
                .get(path)
                .ok_or_else(|| DataServerError::FileNotFound(path.to_string()))?;
            Ok(serde_json::to_vec_pretty(&doc)?)
        })?;
        if let Err(e) = self.dumps.store_dump_metadata(&dump) {
            let dir = self.dumps.dump_path(&dump.unique_id);
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                warn!("Could not remove unrecorded dump {:?}: {}", dir, cleanup);
            }
            return Err(e);
        }

        let since = dump
            .unique_id
            .timestamp_millis()
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        self.diff.reset_diff(since, diff.until.clone());
        self.tags.reset_invalidated_tags();
        self.track_invalidated(&self.snapshot());
        info!("Checkpoint moved to dump {}", dump.unique_id);
        Ok(dump)
    }

    /// Applies change events one batch at a time until the channel closes.
    /// Events already queued when a cycle starts join that cycle.
    pub fn run_event_loop(&self, rx: Receiver<ChangeEvent>) -> Result<()> {
        while let Ok(first) = rx.recv() {
            let mut batch = vec![first];
            batch.extend(rx.try_iter());
            match self.apply(batch) {
                Ok(report) => debug!("Applied watcher batch: {:?}", report),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!("Update cycle failed: {}", e),
            }
        }
        debug!("Change event channel closed");
        Ok(())
    }

    /// Starts the file watcher and an apply loop feeding it into update cycles.
    /// Returns `None` when the watcher is disabled for this run mode.
    pub fn spawn_watcher(self: &Arc<Self>) -> Result<Option<WatcherHandle>> {
        if !self.config.watcher_enabled()? {
            info!("File watcher disabled");
            return Ok(None);
        }
        let watcher = DataDirWatcher::new(
            self.config.data_dir.clone(),
            self.config.store.file_extension.clone(),
        )
        .with_debounce(Duration::from_millis(self.config.watcher.debounce_ms));
        let stop = watcher.stop_handle();
        let (tx, rx) = crossbeam_channel::unbounded();

        let watch_thread = thread::Builder::new()
            .name("dataserver-watch".into())
            .spawn(move || {
                if let Err(e) = watcher.watch(tx) {
                    error!("File watcher stopped: {}", e);
                }
            })?;
        let server = Arc::clone(self);
        let apply_thread = thread::Builder::new()
            .name("dataserver-apply".into())
            .spawn(move || {
                if let Err(e) = server.run_event_loop(rx) {
                    error!("Apply loop stopped: {}", e);
                }
            })?;

        info!("Watching {:?}", self.config.data_dir);
        Ok(Some(WatcherHandle {
            stop,
            threads: vec![watch_thread, apply_thread],
        }))
    }

    fn is_data_dir(&self, dir: &Path) -> bool {
        match (&self.work_prefix, relative_to(&self.config.data_dir, dir)) {
            (Some(work), Some(rel)) => rel != *work && !rel.starts_with(&format!("{}/", work)),
            _ => true,
        }
    }

    fn tracks(&self, path: &str) -> bool {
        let ext_matches = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e == self.config.store.file_extension);
        let in_work_dir = self
            .work_prefix
            .as_ref()
            .map_or(false, |work| path == work || path.starts_with(&format!("{}/", work)));
        ext_matches && !in_work_dir
    }
}

/// Human-readable label recorded in the operation log.
fn label_of(file: &LogicalFile) -> String {
    ["/metadata/label", "/data/title", "/data/label", "/title"]
        .iter()
        .find_map(|pointer| file.content.pointer(pointer).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| file.id.clone())
}
