use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::{DataServerError, Result, UniqueId};

/// Kind of mutation recorded in the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOperation {
    Write,
    Delete,
}

impl fmt::Display for LogOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogOperation::Write => write!(f, "write"),
            LogOperation::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for LogOperation {
    type Err = DataServerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "write" => Ok(LogOperation::Write),
            "delete" => Ok(LogOperation::Delete),
            other => Err(DataServerError::Log(format!("unknown operation '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEvent {
    Created(String),  // relative path
    Modified(String), // relative path
    Deleted(String),  // relative path
}

impl ChangeEvent {
    pub fn path(&self) -> &str {
        match self {
            ChangeEvent::Created(p) | ChangeEvent::Modified(p) | ChangeEvent::Deleted(p) => p,
        }
    }

    pub fn operation(&self) -> LogOperation {
        match self {
            ChangeEvent::Deleted(_) => LogOperation::Delete,
            _ => LogOperation::Write,
        }
    }
}

/// Include and tag declarations found under a file's `metadata` section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMetadata {
    /// dotted path -> target relative path
    pub static_includes: BTreeMap<String, String>,
    /// dotted path -> `queryId?k=v` invocation
    pub dynamic_includes: BTreeMap<String, String>,
    /// External content identifiers this file depends on.
    pub tags: BTreeSet<String>,
}

impl FileMetadata {
    pub fn from_content(content: &Value) -> Self {
        let mut meta = FileMetadata::default();
        let Some(metadata) = content.get("metadata") else {
            return meta;
        };

        if let Some(includes) = metadata.get("includes") {
            meta.static_includes = string_map(includes.get("static"));
            meta.dynamic_includes = string_map(includes.get("dynamic"));
        }
        if let Some(Value::Array(tags)) = metadata.get("tags") {
            meta.tags = tags
                .iter()
                .filter_map(|t| t.as_str())
                .map(str::to_string)
                .collect();
        }
        meta
    }

    pub fn static_targets(&self) -> BTreeSet<String> {
        self.static_includes
            .values()
            .map(|t| normalize_relative_path(t))
            .collect()
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    match value {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
        _ => BTreeMap::new(),
    }
}

/// A unit of stored content, keyed by its path relative to the data directory.
#[derive(Debug, Clone)]
pub struct LogicalFile {
    pub path: String,
    /// File stem without the variant suffix.
    pub id: String,
    pub variant: Option<String>,
    pub raw: Arc<[u8]>,
    pub content: Value,
    pub metadata: FileMetadata,
}

impl LogicalFile {
    pub fn parse(path: &str, raw: &[u8], variant_separator: &str) -> Result<Self> {
        let content: Value = serde_json::from_slice(raw)
            .map_err(|e| DataServerError::Parse(format!("{}: {}", path, e)))?;
        Ok(Self::from_content(path, raw, content, variant_separator))
    }

    /// Builds a file from already-parsed (possibly hook-processed) content.
    pub fn from_content(path: &str, raw: &[u8], content: Value, variant_separator: &str) -> Self {
        let path = normalize_relative_path(path);
        let (id, variant) = split_variant(&path, variant_separator);
        let metadata = FileMetadata::from_content(&content);
        Self {
            path,
            id,
            variant,
            raw: Arc::from(raw),
            content,
            metadata,
        }
    }

    pub fn dir(&self) -> &str {
        self.path.rsplit_once('/').map(|(d, _)| d).unwrap_or("")
    }

    pub fn extension(&self) -> Option<&str> {
        let name = self.path.rsplit('/').next().unwrap_or(&self.path);
        name.rsplit_once('.').map(|(_, ext)| ext)
    }
}

/// Splits `dir/id--variant.ext` into `("id", Some("variant"))`.
pub fn split_variant(path: &str, separator: &str) -> (String, Option<String>) {
    let name = path.rsplit('/').next().unwrap_or(path);
    let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
    match stem.split_once(separator) {
        Some((id, variant)) if !id.is_empty() && !variant.is_empty() => {
            (id.to_string(), Some(variant.to_string()))
        }
        _ => (stem.to_string(), None),
    }
}

/// Canonical form of a relative path: forward slashes, no leading `./` or `/`, no empty segments.
pub fn normalize_relative_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Relative path of `path` under `root`, if it lives there.
pub fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let rel = rel.to_str()?;
    let rel = normalize_relative_path(rel);
    (!rel.is_empty()).then_some(rel)
}

/// Updated and deleted logical files since a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    /// Checkpoint timestamp in milliseconds since the epoch.
    pub since: i64,
    /// Log head the diff was computed against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<UniqueId>,
    pub updated: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn mark_updated(&mut self, path: impl Into<String>) {
        let path = path.into();
        self.deleted.remove(&path);
        self.updated.insert(path);
    }

    pub fn mark_deleted(&mut self, path: impl Into<String>) {
        let path = path.into();
        self.updated.remove(&path);
        self.deleted.insert(path);
    }
}

/// A materialised diff; also the record type of the dump ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dump {
    pub unique_id: UniqueId,
    pub since: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<UniqueId>,
    /// relative path -> dumped file path
    pub updated: BTreeMap<String, String>,
    pub deleted: BTreeSet<String>,
}
