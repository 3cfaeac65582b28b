//! Cross-document includes.
//!
//! A document references other documents through keys ending in `Include`,
//! either inline (`"authorEntityInclude": "en/user/1.json"`) or declared under
//! `metadata.includes`. Each reference is classified once into an [`Include`]
//! when the file enters the store; resolution never looks at key suffixes again.

mod index;
mod resolver;

pub use index::IncludeIndex;
pub use resolver::{DeferredQuery, IncludeResolver, ResolvedDocument};

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

use crate::{DataServerError, QueryInvocation, Result};
use dataserver_core::{normalize_relative_path, FileMetadata};

const INCLUDE_SUFFIX: &str = "include";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncludeKind {
    Config,
    Entity,
    Locale,
    /// Any other `...Include` key.
    Custom,
    Query,
}

impl IncludeKind {
    /// Classifies a key by its suffix, ignoring case. `None` for non-include keys.
    pub fn from_key(key: &str) -> Option<Self> {
        let lower = key.to_ascii_lowercase();
        let stem = lower.strip_suffix(INCLUDE_SUFFIX)?;
        if stem.is_empty() {
            return None;
        }
        let kind = if stem.ends_with("query") {
            IncludeKind::Query
        } else if stem.ends_with("entity") {
            IncludeKind::Entity
        } else if stem.ends_with("config") {
            IncludeKind::Config
        } else if stem.ends_with("locale") {
            IncludeKind::Locale
        } else {
            IncludeKind::Custom
        };
        Some(kind)
    }
}

/// Where an include key lives inside its host document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IncludeSite {
    /// Object path from the document root to the object holding `key`.
    pub parent: Vec<String>,
    pub key: String,
}

impl IncludeSite {
    /// Parses `data.content.fooInclude`.
    pub fn parse(dotted: &str) -> Result<Self> {
        let mut segments: Vec<String> = dotted.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(DataServerError::Resolution(format!(
                "malformed include path '{}'",
                dotted
            )));
        }
        let key = segments.pop().unwrap_or_default();
        if IncludeKind::from_key(&key).is_none() {
            return Err(DataServerError::Resolution(format!(
                "'{}' does not name an include key",
                dotted
            )));
        }
        Ok(Self {
            parent: segments,
            key,
        })
    }

    /// The key with its trailing `Include` removed: `localeInclude` -> `locale`.
    pub fn alias(&self) -> &str {
        let end = self.key.len().saturating_sub(INCLUDE_SUFFIX.len());
        self.key.get(..end).unwrap_or(&self.key)
    }

    /// Path of the mounted value.
    pub fn alias_path(&self) -> Vec<&str> {
        self.parent
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.alias()))
            .collect()
    }

    /// The same site seen from a document that mounts this one at `prefix`.
    pub fn rebased<S: AsRef<str>>(&self, prefix: &[S]) -> Self {
        Self {
            parent: prefix
                .iter()
                .map(|s| s.as_ref().to_string())
                .chain(self.parent.iter().cloned())
                .collect(),
            key: self.key.clone(),
        }
    }

    /// The site relative to `prefix`, or `None` when it lies outside it.
    pub fn strip_prefix(&self, prefix: &[&str]) -> Option<Self> {
        if self.parent.len() < prefix.len()
            || !self.parent.iter().zip(prefix).all(|(a, b)| a == b)
        {
            return None;
        }
        Some(Self {
            parent: self.parent[prefix.len()..].to_vec(),
            key: self.key.clone(),
        })
    }

    pub fn dotted(&self) -> String {
        let mut parts: Vec<&str> = self.parent.iter().map(String::as_str).collect();
        parts.push(&self.key);
        parts.join(".")
    }
}

/// A classified include, carrying what its resolver needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Include {
    /// Config, locale and custom includes: mount the target under the alias key.
    Alias {
        kind: IncludeKind,
        site: IncludeSite,
        target: String,
    },
    /// Replace the include key's parent with the target's `data.content`.
    Entity { site: IncludeSite, target: String },
    /// Evaluated lazily, on first read of the mounted field.
    Query {
        site: IncludeSite,
        invocation: QueryInvocation,
    },
}

impl Include {
    pub fn site(&self) -> &IncludeSite {
        match self {
            Include::Alias { site, .. } | Include::Entity { site, .. } | Include::Query { site, .. } => {
                site
            }
        }
    }

    /// Target path of a static include.
    pub fn target(&self) -> Option<&str> {
        match self {
            Include::Alias { target, .. } | Include::Entity { target, .. } => Some(target),
            Include::Query { .. } => None,
        }
    }

    fn classify(dotted: &str, reference: &str, dynamic: bool) -> Result<Self> {
        let site = IncludeSite::parse(dotted)?;
        let kind = IncludeKind::from_key(&site.key).unwrap_or(IncludeKind::Custom);
        if dynamic || kind == IncludeKind::Query {
            return Ok(Include::Query {
                invocation: reference.parse()?,
                site,
            });
        }
        let target = normalize_relative_path(reference);
        if target.is_empty() {
            return Err(DataServerError::Resolution(format!(
                "include '{}' has an empty target",
                dotted
            )));
        }
        Ok(match kind {
            IncludeKind::Entity => Include::Entity { site, target },
            kind => Include::Alias { kind, site, target },
        })
    }

    /// Every include of a document: inline include keys plus `metadata.includes`
    /// declarations, the latter winning on the same path. Ordered by path.
    pub fn collect(content: &Value, metadata: &FileMetadata) -> Vec<Include> {
        let mut declared: BTreeMap<String, (String, bool)> = BTreeMap::new();
        if let Value::Object(root) = content {
            for (key, value) in root.iter().filter(|(k, _)| k.as_str() != "metadata") {
                discover_inline(key.clone(), key, value, &mut declared);
            }
        }
        for (path, target) in &metadata.static_includes {
            declared.insert(path.clone(), (target.clone(), false));
        }
        for (path, invocation) in &metadata.dynamic_includes {
            declared.insert(path.clone(), (invocation.clone(), true));
        }

        declared
            .into_iter()
            .filter_map(|(path, (reference, dynamic))| {
                match Include::classify(&path, &reference, dynamic) {
                    Ok(include) => Some(include),
                    Err(e) => {
                        warn!("Skipping include '{}': {}", path, e);
                        None
                    }
                }
            })
            .collect()
    }
}

fn discover_inline(
    path: String,
    key: &str,
    value: &Value,
    out: &mut BTreeMap<String, (String, bool)>,
) {
    match value {
        Value::String(reference) => {
            if let Some(kind) = IncludeKind::from_key(key) {
                out.insert(path, (reference.clone(), kind == IncludeKind::Query));
            }
        }
        Value::Object(map) => {
            for (child, v) in map {
                discover_inline(format!("{}.{}", path, child), child, v, out);
            }
        }
        _ => {}
    }
}

fn child_mut<'a>(value: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match value {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    }
}

/// Safe navigation: `None` as soon as a segment is missing.
fn navigate_mut<'a, S: AsRef<str>>(root: &'a mut Value, path: &[S]) -> Option<&'a mut Value> {
    path.iter()
        .try_fold(root, |node, segment| child_mut(node, segment.as_ref()))
}

pub(crate) fn navigate<'a, S: AsRef<str>>(root: &'a Value, path: &[S]) -> Option<&'a Value> {
    path.iter().try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment.as_ref()),
        Value::Array(items) => segment
            .as_ref()
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i)),
        _ => None,
    })
}

fn parent_object<'a>(doc: &'a mut Value, site: &IncludeSite) -> Result<&'a mut Map<String, Value>> {
    navigate_mut(doc, &site.parent)
        .and_then(Value::as_object_mut)
        .ok_or_else(|| {
            DataServerError::Resolution(format!("mount path of '{}' does not resolve", site.dotted()))
        })
}

/// Writes `value` under the alias key and deletes the include key.
///
/// Returns `Ok(false)` when the include key is already gone, so applying the
/// same include twice leaves the document as the first application did.
pub fn mount_alias(doc: &mut Value, site: &IncludeSite, value: Value) -> Result<bool> {
    let parent = parent_object(doc, site)?;
    if parent.remove(&site.key).is_none() {
        return Ok(false);
    }
    parent.insert(site.alias().to_string(), value);
    Ok(true)
}

/// Replaces the object holding the include key with `value`, one level above
/// the key itself. `data.entityInclude` rewrites `data`.
pub fn mount_entity(doc: &mut Value, site: &IncludeSite, value: Value) -> Result<bool> {
    let Some((parent_key, grandparent_path)) = site.parent.split_last() else {
        return Err(DataServerError::Resolution(format!(
            "entity include '{}' sits at the document root",
            site.key
        )));
    };
    let slot = navigate_mut(doc, grandparent_path)
        .and_then(|grandparent| child_mut(grandparent, parent_key))
        .ok_or_else(|| {
            DataServerError::Resolution(format!("mount path of '{}' does not resolve", site.dotted()))
        })?;
    if slot.get(site.key.as_str()).is_none() {
        return Ok(false);
    }
    *slot = value;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn site(dotted: &str) -> IncludeSite {
        IncludeSite::parse(dotted).unwrap()
    }

    #[test]
    fn kinds_are_matched_case_insensitively() {
        assert_eq!(IncludeKind::from_key("siteConfigInclude"), Some(IncludeKind::Config));
        assert_eq!(IncludeKind::from_key("AUTHORENTITYINCLUDE"), Some(IncludeKind::Entity));
        assert_eq!(IncludeKind::from_key("localeInclude"), Some(IncludeKind::Locale));
        assert_eq!(IncludeKind::from_key("menuCustomInclude"), Some(IncludeKind::Custom));
        assert_eq!(IncludeKind::from_key("fooInclude"), Some(IncludeKind::Custom));
        assert_eq!(IncludeKind::from_key("latestQueryInclude"), Some(IncludeKind::Query));
        assert_eq!(IncludeKind::from_key("include"), None);
        assert_eq!(IncludeKind::from_key("title"), None);
    }

    #[test]
    fn sites_move_between_mount_points() {
        let nested = site("data.content.latestQueryInclude");
        let relative = nested.strip_prefix(&["data", "content"]).unwrap();
        assert_eq!(relative.dotted(), "latestQueryInclude");
        assert_eq!(relative.rebased(&["data", "menu"]).dotted(), "data.menu.latestQueryInclude");
        assert!(nested.strip_prefix(&["data", "other"]).is_none());
        assert!(site("xInclude").strip_prefix(&["data"]).is_none());
    }

    #[test]
    fn site_alias_strips_include_suffix() {
        assert_eq!(site("data.localeInclude").alias(), "locale");
        assert_eq!(site("data.content.fooInclude").alias_path(), vec!["data", "content", "foo"]);
        assert!(IncludeSite::parse("data..fooInclude").is_err());
        assert!(IncludeSite::parse("data.title").is_err());
    }

    #[test]
    fn alias_mount_is_idempotent() {
        let mut doc = json!({"data": {"fooInclude": "t.json", "other": 1}});
        let s = site("data.fooInclude");
        assert!(mount_alias(&mut doc, &s, json!({"v": "T"})).unwrap());
        assert_eq!(doc, json!({"data": {"foo": {"v": "T"}, "other": 1}}));

        let before = doc.clone();
        assert!(!mount_alias(&mut doc, &s, json!({"v": "T"})).unwrap());
        assert_eq!(doc, before);
    }

    #[test]
    fn missing_mount_path_leaves_document_untouched() {
        let mut doc = json!({"data": 5});
        let before = doc.clone();
        let err = mount_alias(&mut doc, &site("data.content.fooInclude"), json!(1)).unwrap_err();
        assert!(matches!(err, DataServerError::Resolution(_)));
        assert_eq!(doc, before);
    }

    #[test]
    fn entity_mount_replaces_parent() {
        let mut doc = json!({"data": {"entityInclude": "target/1"}});
        assert!(mount_entity(&mut doc, &site("data.entityInclude"), json!({"title": "X"})).unwrap());
        assert_eq!(doc, json!({"data": {"title": "X"}}));

        assert!(mount_entity(&mut doc, &site("entityInclude"), json!({})).is_err());
    }

    #[test]
    fn entity_mount_navigates_arrays() {
        let mut doc = json!({"items": [{"entityInclude": "a"}, {"entityInclude": "b"}]});
        mount_entity(&mut doc, &site("items.1.entityInclude"), json!({"id": "b"})).unwrap();
        assert_eq!(doc, json!({"items": [{"entityInclude": "a"}, {"id": "b"}]}));
    }

    #[test]
    fn collect_merges_inline_and_declared_includes() {
        let content = json!({
            "data": {
                "authorEntityInclude": "./en/user/1.json",
                "content": {"latestQueryInclude": "latest?limit=3", "count": 3}
            },
            "metadata": {
                "includes": {
                    "static": {"data.localeInclude": "en/locale.json"},
                    "dynamic": {"data.menuInclude": "menu"}
                }
            }
        });
        let metadata = FileMetadata::from_content(&content);
        let includes = Include::collect(&content, &metadata);
        assert_eq!(includes.len(), 4);

        assert!(includes.contains(&Include::Entity {
            site: site("data.authorEntityInclude"),
            target: "en/user/1.json".into(),
        }));
        assert!(includes.contains(&Include::Alias {
            kind: IncludeKind::Locale,
            site: site("data.localeInclude"),
            target: "en/locale.json".into(),
        }));
        assert!(includes.contains(&Include::Query {
            site: site("data.content.latestQueryInclude"),
            invocation: "latest?limit=3".parse().unwrap(),
        }));
        assert!(includes.contains(&Include::Query {
            site: site("data.menuInclude"),
            invocation: QueryInvocation::new("menu"),
        }));
    }
}
