//! Materialised diffs and the dump ledger.
//!
//! A dump directory is written under a temporary name and renamed into place,
//! then its record is appended to the ledger. Downstream consumers read the
//! ledger, acknowledge what they applied, and entries up to the slowest
//! consumer's acknowledgement are pruned together with their directories.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::{DataServerConfig, DataServerError, Diff, Dump, Result, UniqueId};
use dataserver_core::UniqueIdGenerator;

const TMP_DIR: &str = ".tmp";

pub struct DumpManager {
    dump_dir: PathBuf,
    ledger_path: PathBuf,
    consumers_path: PathBuf,
    ids: UniqueIdGenerator,
    /// Held for every read-modify-write of the ledger or consumer file.
    lock: Mutex<()>,
}

impl DumpManager {
    pub fn new(
        dump_dir: impl Into<PathBuf>,
        ledger_path: impl Into<PathBuf>,
        consumers_path: impl Into<PathBuf>,
    ) -> Self {
        let ledger_path = ledger_path.into();
        let newest = read_ledger(&ledger_path)
            .into_iter()
            .map(|d| d.unique_id)
            .max();
        Self {
            dump_dir: dump_dir.into(),
            consumers_path: consumers_path.into(),
            ids: UniqueIdGenerator::resume_after(newest.as_ref()),
            ledger_path,
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &DataServerConfig) -> Self {
        Self::new(config.dump_dir(), config.ledger_path(), config.consumers_path())
    }

    /// Directory holding the files of dump `id`.
    pub fn dump_path(&self, id: &UniqueId) -> PathBuf {
        self.dump_dir.join(dir_name(id))
    }

    /// Writes every updated file of `diff` using `render` and returns the
    /// dump record. Nothing is left on disk when any file fails.
    pub fn dump<F>(&self, diff: &Diff, mut render: F) -> Result<Dump>
    where
        F: FnMut(&str) -> Result<Vec<u8>>,
    {
        let unique_id = self.ids.next();
        let final_dir = self.dump_path(&unique_id);
        let tmp_dir = self.dump_dir.join(TMP_DIR).join(dir_name(&unique_id));

        let written = write_tree(diff, &tmp_dir, &final_dir, &mut render);

        let updated = match written {
            Ok(updated) => updated,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&tmp_dir) {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!("Could not remove partial dump {:?}: {}", tmp_dir, cleanup);
                    }
                }
                return Err(DataServerError::Persistence(format!(
                    "dump {} failed: {}",
                    unique_id, e
                )));
            }
        };

        info!(
            "Dump {} written: {} updated, {} deleted",
            unique_id,
            updated.len(),
            diff.deleted.len()
        );
        Ok(Dump {
            unique_id,
            since: diff.since,
            until: diff.until.clone(),
            updated,
            deleted: diff.deleted.clone(),
        })
    }

    /// Appends `dump` to the ledger. A missing or corrupt ledger starts a new history.
    pub fn store_dump_metadata(&self, dump: &Dump) -> Result<()> {
        let _guard = self.lock.lock();
        let mut ledger = read_ledger(&self.ledger_path);
        ledger.push(dump.clone());
        ledger.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        write_json_atomic(&self.ledger_path, &ledger)
            .map_err(|e| DataServerError::Persistence(format!("ledger write failed: {}", e)))?;
        debug!("Ledger now holds {} dumps", ledger.len());
        Ok(())
    }

    /// Ledger entries, oldest first.
    pub fn ledger(&self) -> Vec<Dump> {
        let _guard = self.lock.lock();
        read_ledger(&self.ledger_path)
    }

    pub fn latest(&self) -> Option<Dump> {
        self.ledger().into_iter().last()
    }

    pub fn get_current_dump_unique_id(&self) -> Option<UniqueId> {
        self.latest().map(|d| d.unique_id)
    }

    /// Prunes every entry with an id up to and including `unique_id`, and
    /// deletes their dump directories. Returns the pruned entries.
    pub fn remove_dump_data_older_than(&self, unique_id: &UniqueId) -> Result<Vec<Dump>> {
        let _guard = self.lock.lock();
        self.remove_locked(unique_id)
    }

    fn remove_locked(&self, unique_id: &UniqueId) -> Result<Vec<Dump>> {
        let (removed, kept): (Vec<Dump>, Vec<Dump>) = read_ledger(&self.ledger_path)
            .into_iter()
            .partition(|d| &d.unique_id <= unique_id);
        if removed.is_empty() {
            return Ok(removed);
        }
        write_json_atomic(&self.ledger_path, &kept)
            .map_err(|e| DataServerError::Persistence(format!("ledger write failed: {}", e)))?;

        for dump in &removed {
            let dir = self.dump_path(&dump.unique_id);
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove dump directory {:?}: {}", dir, e),
            }
        }
        info!("Pruned {} dumps up to {}", removed.len(), unique_id);
        Ok(removed)
    }

    /// Records that `consumer` applied every dump up to `unique_id`.
    /// Acknowledgements never move backwards.
    pub fn acknowledge(&self, consumer: &str, unique_id: &UniqueId) -> Result<()> {
        let _guard = self.lock.lock();
        let mut consumers: BTreeMap<String, UniqueId> = read_json_or_default(&self.consumers_path);
        let entry = consumers
            .entry(consumer.to_string())
            .or_insert_with(|| unique_id.clone());
        if &*entry < unique_id {
            *entry = unique_id.clone();
        }
        write_json_atomic(&self.consumers_path, &consumers)
            .map_err(|e| DataServerError::Persistence(format!("consumer file write failed: {}", e)))
    }

    pub fn acknowledged(&self) -> BTreeMap<String, UniqueId> {
        let _guard = self.lock.lock();
        read_json_or_default(&self.consumers_path)
    }

    /// Dumps `consumer` has not acknowledged yet, oldest first.
    pub fn pending_for(&self, consumer: &str) -> Vec<Dump> {
        let _guard = self.lock.lock();
        let consumers: BTreeMap<String, UniqueId> = read_json_or_default(&self.consumers_path);
        let acked = consumers.get(consumer);
        read_ledger(&self.ledger_path)
            .into_iter()
            .filter(|d| acked.map_or(true, |a| &d.unique_id > a))
            .collect()
    }

    /// Prunes up to the lowest acknowledgement across consumers. Returns that id.
    pub fn prune_acknowledged(&self) -> Result<Option<UniqueId>> {
        let _guard = self.lock.lock();
        let consumers: BTreeMap<String, UniqueId> = read_json_or_default(&self.consumers_path);
        let Some(slowest) = consumers.values().min().cloned() else {
            return Ok(None);
        };
        self.remove_locked(&slowest)?;
        Ok(Some(slowest))
    }
}

/// Writes the rendered files below `tmp_dir`, then moves the tree to `final_dir`.
fn write_tree<F>(
    diff: &Diff,
    tmp_dir: &Path,
    final_dir: &Path,
    render: &mut F,
) -> Result<BTreeMap<String, String>>
where
    F: FnMut(&str) -> Result<Vec<u8>>,
{
    if tmp_dir.exists() {
        fs::remove_dir_all(tmp_dir)?;
    }
    fs::create_dir_all(tmp_dir)?;
    let mut updated = BTreeMap::new();
    for path in &diff.updated {
        let relative = checked_relative(path)?;
        let bytes = render(path)?;
        let target = tmp_dir.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        write_synced(&target, &bytes)?;
        updated.insert(
            path.clone(),
            final_dir.join(relative).to_string_lossy().into_owned(),
        );
    }
    fs::rename(tmp_dir, final_dir)?;
    Ok(updated)
}

/// Writes and fsyncs one dumped file, so the directory rename publishes durable content.
fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Dump directory name; colons are not portable in file names.
fn dir_name(id: &UniqueId) -> String {
    id.as_str().replace(':', "-")
}

fn checked_relative(path: &str) -> Result<&Path> {
    let relative = Path::new(path);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, std::path::Component::Normal(_)));
    if escapes || path.is_empty() {
        return Err(DataServerError::Persistence(format!(
            "'{}' is not a plain relative path",
            path
        )));
    }
    Ok(relative)
}

fn read_ledger(path: &Path) -> Vec<Dump> {
    read_json_or_default(path)
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            warn!("Could not read {:?} ({}), starting empty", path, e);
            return T::default();
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("Corrupt {:?} ({}), starting empty", path, e);
            T::default()
        }
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    let mut file = File::create(&tmp_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
