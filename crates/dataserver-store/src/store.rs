use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{Include, IncludeIndex, LogicalFile};

/// Which variants a [`Store::subset`] call returns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VariantFilter {
    /// Only files without a variant key.
    #[default]
    Base,
    Named(String),
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsetOptions {
    /// Directory prefix relative to the data root; `None` is the root.
    pub dir: Option<String>,
    pub recursive: bool,
    /// Defaults to the configured store extension.
    pub ext: Option<String>,
    pub variant: VariantFilter,
}

impl Default for SubsetOptions {
    fn default() -> Self {
        Self {
            dir: None,
            recursive: true,
            ext: None,
            variant: VariantFilter::Base,
        }
    }
}

impl SubsetOptions {
    pub fn in_dir(dir: impl Into<String>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn non_recursive(mut self) -> Self {
        self.recursive = false;
        self
    }

    pub fn with_ext(mut self, ext: impl Into<String>) -> Self {
        self.ext = Some(ext.into());
        self
    }

    pub fn with_variant(mut self, variant: VariantFilter) -> Self {
        self.variant = variant;
        self
    }

    fn matches(&self, file: &LogicalFile, default_ext: &str) -> bool {
        let ext = self.ext.as_deref().unwrap_or(default_ext);
        if file.extension() != Some(ext) {
            return false;
        }

        let dir = self
            .dir
            .as_deref()
            .map(|d| d.trim_matches('/'))
            .unwrap_or("");
        let file_dir = file.dir();
        let in_dir = if self.recursive {
            dir.is_empty()
                || file_dir == dir
                || file_dir
                    .strip_prefix(dir)
                    .map_or(false, |rest| rest.starts_with('/'))
        } else {
            file_dir == dir
        };
        if !in_dir {
            return false;
        }

        match &self.variant {
            VariantFilter::Base => file.variant.is_none(),
            VariantFilter::Named(v) => file.variant.as_deref() == Some(v.as_str()),
            VariantFilter::Any => true,
        }
    }
}

/// Snapshot of every logical file plus the include index derived from them.
///
/// A `Store` is never mutated while readers hold it: update cycles clone it,
/// stage their changes on the clone and swap it in.
#[derive(Debug, Clone, Default)]
pub struct Store {
    files: BTreeMap<String, Arc<LogicalFile>>,
    includes: IncludeIndex,
    generation: u64,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incremented by every committed update cycle.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn advance_generation(&mut self, previous: u64) {
        self.generation = previous + 1;
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&Arc<LogicalFile>> {
        self.files.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.files.keys()
    }

    pub fn files(&self) -> impl Iterator<Item = &Arc<LogicalFile>> {
        self.files.values()
    }

    pub fn includes(&self) -> &IncludeIndex {
        &self.includes
    }

    /// Replaces the file at its path wholesale and re-indexes its includes.
    pub fn insert(&mut self, file: LogicalFile) -> Option<Arc<LogicalFile>> {
        self.insert_arc(Arc::new(file))
    }

    pub fn insert_arc(&mut self, file: Arc<LogicalFile>) -> Option<Arc<LogicalFile>> {
        self.includes
            .set_file(&file.path, Include::collect(&file.content, &file.metadata));
        self.files.insert(file.path.clone(), file)
    }

    pub fn remove(&mut self, path: &str) -> Option<Arc<LogicalFile>> {
        let removed = self.files.remove(path)?;
        self.includes.remove_file(path);
        Some(removed)
    }

    /// Puts `previous` back at `path`, or removes `path` when there was none.
    pub(crate) fn restore(&mut self, path: &str, previous: Option<Arc<LogicalFile>>) {
        match previous {
            Some(file) => {
                self.insert_arc(file);
            }
            None => {
                self.remove(path);
            }
        }
    }

    /// Relative paths matching `options`, sorted lexically.
    pub fn subset(&self, options: &SubsetOptions, default_ext: &str) -> Vec<String> {
        self.files
            .values()
            .filter(|f| options.matches(f, default_ext))
            .map(|f| f.path.clone())
            .collect()
    }
}
