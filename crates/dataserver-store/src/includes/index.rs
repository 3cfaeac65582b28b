use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::Include;
use crate::QueryInvocation;

#[derive(Debug, Clone)]
struct InvocationHosts {
    invocation: QueryInvocation,
    hosts: BTreeSet<String>,
}

/// Reverse index over the includes of every stored file.
///
/// `parents` answers "who embeds this file" for static includes; `invocations`
/// answers "who mounts this query call" for dynamic ones. Sets are removed
/// with their last member.
#[derive(Debug, Clone, Default)]
pub struct IncludeIndex {
    declared: HashMap<String, Arc<[Include]>>,
    /// target -> hosts including it
    parents: HashMap<String, BTreeSet<String>>,
    /// canonical invocation -> hosts mounting it
    invocations: HashMap<String, InvocationHosts>,
}

impl IncludeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the indexed includes of `path`.
    pub fn set_file(&mut self, path: &str, includes: Vec<Include>) {
        self.remove_file(path);
        if includes.is_empty() {
            return;
        }
        for include in &includes {
            match include {
                Include::Alias { target, .. } | Include::Entity { target, .. } => {
                    self.parents
                        .entry(target.clone())
                        .or_default()
                        .insert(path.to_string());
                }
                Include::Query { invocation, .. } => {
                    self.invocations
                        .entry(invocation.to_string())
                        .or_insert_with(|| InvocationHosts {
                            invocation: invocation.clone(),
                            hosts: BTreeSet::new(),
                        })
                        .hosts
                        .insert(path.to_string());
                }
            }
        }
        self.declared.insert(path.to_string(), includes.into());
    }

    pub fn remove_file(&mut self, path: &str) {
        let Some(includes) = self.declared.remove(path) else {
            return;
        };
        for include in includes.iter() {
            match include {
                Include::Alias { target, .. } | Include::Entity { target, .. } => {
                    if let Some(hosts) = self.parents.get_mut(target) {
                        hosts.remove(path);
                        if hosts.is_empty() {
                            self.parents.remove(target);
                        }
                    }
                }
                Include::Query { invocation, .. } => {
                    let key = invocation.to_string();
                    if let Some(entry) = self.invocations.get_mut(&key) {
                        entry.hosts.remove(path);
                        if entry.hosts.is_empty() {
                            self.invocations.remove(&key);
                        }
                    }
                }
            }
        }
    }

    pub fn declared(&self, path: &str) -> &[Include] {
        self.declared.get(path).map(|d| &d[..]).unwrap_or(&[])
    }

    pub fn static_targets(&self, path: &str) -> BTreeSet<String> {
        self.declared(path)
            .iter()
            .filter_map(|i| i.target().map(str::to_string))
            .collect()
    }

    /// Files that include `path` directly.
    pub fn parents_of(&self, path: &str) -> BTreeSet<String> {
        self.parents.get(path).cloned().unwrap_or_default()
    }

    /// Files that include `path` directly or through other includes. Never
    /// contains `path` itself, even on a cycle.
    pub fn ancestors_of(&self, path: &str) -> BTreeSet<String> {
        let mut seen: HashSet<&str> = HashSet::from([path]);
        let mut queue: VecDeque<&str> = VecDeque::from([path]);
        let mut ancestors = BTreeSet::new();

        while let Some(current) = queue.pop_front() {
            let Some(hosts) = self.parents.get(current) else {
                continue;
            };
            for host in hosts {
                if seen.insert(host.as_str()) {
                    ancestors.insert(host.clone());
                    queue.push_back(host.as_str());
                }
            }
        }
        ancestors
    }

    pub fn hosts_of(&self, invocation: &QueryInvocation) -> BTreeSet<String> {
        self.invocations
            .get(&invocation.to_string())
            .map(|e| e.hosts.clone())
            .unwrap_or_default()
    }

    /// Every distinct query call mounted somewhere in the store, sorted.
    pub fn invocations(&self) -> Vec<QueryInvocation> {
        let mut all: Vec<QueryInvocation> =
            self.invocations.values().map(|e| e.invocation.clone()).collect();
        all.sort();
        all
    }
}
