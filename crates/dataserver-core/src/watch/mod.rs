use crate::{relative_to, ChangeEvent, DataServerError, Result};
use crossbeam_channel::Sender as CbSender;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Recursive watcher over the data directory with debouncing and
/// extension filtering. Paths are emitted relative to the root.
pub struct DataDirWatcher {
    root: PathBuf,
    extension: String,
    debounce: Duration,
    stop: Arc<AtomicBool>,
}

/// Latest raw event kind seen for a path inside one debounce window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Created,
    Modified,
    Removed,
}

impl DataDirWatcher {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
            debounce: Duration::from_millis(35),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_debounce(mut self, d: Duration) -> Self {
        self.debounce = d;
        self
    }

    /// Handle that ends a running [`watch`](Self::watch) loop at its next tick.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    fn should_track(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|s| s.to_str())
            .map_or(false, |ext| ext == self.extension)
    }

    /// Blocking watch loop. Emits debounced events to `tx` until stopped or disconnected.
    pub fn watch(&self, tx: CbSender<ChangeEvent>) -> Result<()> {
        let (raw_tx, raw_rx) = std::sync::mpsc::channel::<notify::Result<Event>>();
        let mut watcher: RecommendedWatcher = Watcher::new(raw_tx, notify::Config::default())?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;

        let mut buf: HashMap<PathBuf, (PendingKind, Instant)> = HashMap::new();

        while !self.stop.load(Ordering::Relaxed) {
            match raw_rx.recv_timeout(self.debounce) {
                Ok(Ok(event)) => {
                    let Some(kind) = classify(&event.kind) else {
                        continue;
                    };
                    for path in event.paths.iter().filter(|p| self.should_track(p)) {
                        let kind = merge_kinds(buf.get(path).map(|(k, _)| *k), kind);
                        buf.insert(path.clone(), (kind, Instant::now()));
                    }
                }
                Ok(Err(e)) => {
                    error!("watcher error: {:?}", e);
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    warn!("file watcher disconnected");
                    break;
                }
            }

            let now = Instant::now();
            let ready: Vec<(PathBuf, PendingKind)> = buf
                .iter()
                .filter(|(_, (_, t))| now.duration_since(*t) >= self.debounce)
                .map(|(p, (k, _))| (p.clone(), *k))
                .collect();
            for (path, kind) in ready {
                buf.remove(&path);
                if let Some(event) = self.to_change_event(&path, kind) {
                    debug!("watcher emitting {:?}", event);
                    tx.send(event)
                        .map_err(|e| DataServerError::Channel(e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    fn to_change_event(&self, path: &Path, kind: PendingKind) -> Option<ChangeEvent> {
        let rel = relative_to(&self.root, path)?;
        // The file may have vanished since a create/modify was queued.
        let event = match kind {
            PendingKind::Removed => ChangeEvent::Deleted(rel),
            _ if !path.exists() => ChangeEvent::Deleted(rel),
            PendingKind::Created => ChangeEvent::Created(rel),
            PendingKind::Modified => ChangeEvent::Modified(rel),
        };
        Some(event)
    }
}

fn classify(kind: &EventKind) -> Option<PendingKind> {
    match kind {
        EventKind::Create(_) => Some(PendingKind::Created),
        EventKind::Modify(_) => Some(PendingKind::Modified),
        EventKind::Remove(_) => Some(PendingKind::Removed),
        _ => None,
    }
}

/// Coalesces two events on one path within a debounce window.
fn merge_kinds(previous: Option<PendingKind>, next: PendingKind) -> PendingKind {
    match (previous, next) {
        (Some(PendingKind::Created), PendingKind::Modified) => PendingKind::Created,
        (Some(PendingKind::Removed), PendingKind::Created) => PendingKind::Modified,
        (_, next) => next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn create_then_modify_stays_created() {
        assert_eq!(
            merge_kinds(Some(PendingKind::Created), PendingKind::Modified),
            PendingKind::Created
        );
        assert_eq!(
            merge_kinds(Some(PendingKind::Removed), PendingKind::Created),
            PendingKind::Modified
        );
        assert_eq!(
            merge_kinds(Some(PendingKind::Modified), PendingKind::Removed),
            PendingKind::Removed
        );
    }

    #[test]
    fn only_configured_extension_is_tracked() {
        let watcher = DataDirWatcher::new("/data", "json");
        assert!(watcher.should_track(Path::new("/data/en/a.json")));
        assert!(!watcher.should_track(Path::new("/data/en/a.json.swp")));
        assert!(!watcher.should_track(Path::new("/data/en/README")));
    }

    #[test]
    fn vanished_files_become_deletions() {
        let dir = TempDir::new().unwrap();
        let watcher = DataDirWatcher::new(dir.path(), "json");
        let present = dir.path().join("en/a.json");
        fs::create_dir_all(present.parent().unwrap()).unwrap();
        fs::write(&present, "{}").unwrap();

        assert_eq!(
            watcher.to_change_event(&present, PendingKind::Modified),
            Some(ChangeEvent::Modified("en/a.json".into()))
        );
        assert_eq!(
            watcher.to_change_event(&dir.path().join("en/gone.json"), PendingKind::Created),
            Some(ChangeEvent::Deleted("en/gone.json".into()))
        );
        assert_eq!(
            watcher.to_change_event(Path::new("/elsewhere/x.json"), PendingKind::Created),
            None
        );
    }
}
