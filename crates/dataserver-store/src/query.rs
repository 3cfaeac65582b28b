use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::{Cache, DataServerError, ModuleRegistry, Result, Store, QUERY_BIN};

/// A user query module. Queries read the store snapshot they are given and
/// must not depend on anything else for their result.
pub trait Query: Send + Sync {
    fn execute(&self, store: &Store, args: &BTreeMap<String, String>) -> Result<Value>;
}

/// A parsed `queryId?k=v&k2=v2` reference. Arguments are kept sorted, so two
/// spellings of the same call share one canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryInvocation {
    pub query_id: String,
    pub args: BTreeMap<String, String>,
}

impl QueryInvocation {
    pub fn new(query_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            args: BTreeMap::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

impl FromStr for QueryInvocation {
    type Err = DataServerError;

    fn from_str(s: &str) -> Result<Self> {
        let (id, query) = s.trim().split_once('?').unwrap_or((s.trim(), ""));
        if id.is_empty() {
            return Err(DataServerError::Resolution(format!(
                "query reference '{}' has no query id",
                s
            )));
        }
        let args = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();
        Ok(Self {
            query_id: id.to_string(),
            args,
        })
    }
}

impl fmt::Display for QueryInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.query_id)?;
        for (i, (k, v)) in self.args.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, k, v)?;
        }
        Ok(())
    }
}

/// Executes registered queries, memoising results per store generation.
pub struct QueryRunner {
    queries: Arc<ModuleRegistry<dyn Query>>,
    cache: Arc<Cache>,
}

impl QueryRunner {
    pub fn new(queries: Arc<ModuleRegistry<dyn Query>>, cache: Arc<Cache>) -> Self {
        Self { queries, cache }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry<dyn Query>> {
        &self.queries
    }

    /// Cached result for this snapshot, executing the query on a miss.
    pub fn run(&self, store: &Store, invocation: &QueryInvocation) -> Result<Value> {
        let key = format!("{}:{}", store.generation(), invocation);
        self.cache
            .bin(QUERY_BIN)
            .get_or_insert_with(&key, || self.execute(store, invocation))
    }

    /// Executes the query without consulting or filling the cache.
    pub fn execute(&self, store: &Store, invocation: &QueryInvocation) -> Result<Value> {
        let query = self.queries.get(&invocation.query_id).ok_or_else(|| {
            DataServerError::Resolution(format!("unknown query '{}'", invocation.query_id))
        })?;
        debug!("Executing query {}", invocation);
        query
            .execute(store, &invocation.args)
            .map_err(|e| DataServerError::module(&invocation.query_id, invocation.to_string(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountFiles(AtomicUsize);

    impl Query for CountFiles {
        fn execute(&self, store: &Store, args: &BTreeMap<String, String>) -> Result<Value> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"count": store.len(), "args": args.len()}))
        }
    }

    #[test]
    fn invocation_parses_into_canonical_form() {
        let inv: QueryInvocation = "latest?limit=3&lang=en".parse().unwrap();
        assert_eq!(inv.query_id, "latest");
        assert_eq!(inv.args["limit"], "3");
        assert_eq!(inv.to_string(), "latest?lang=en&limit=3");

        let bare: QueryInvocation = "menu".parse().unwrap();
        assert_eq!(bare.to_string(), "menu");
        assert_eq!(bare, QueryInvocation::new("menu"));

        assert!("?limit=3".parse::<QueryInvocation>().is_err());
    }

    #[test]
    fn runner_memoises_per_generation() {
        let registry: Arc<ModuleRegistry<dyn Query>> = Arc::new(ModuleRegistry::new());
        let query = Arc::new(CountFiles(AtomicUsize::new(0)));
        registry.register("count", query.clone());
        let runner = QueryRunner::new(registry, Arc::new(Cache::new()));

        let mut store = Store::new();
        let inv = QueryInvocation::new("count").with_arg("x", "1");
        assert_eq!(runner.run(&store, &inv).unwrap(), json!({"count": 0, "args": 1}));
        runner.run(&store, &inv).unwrap();
        assert_eq!(query.0.load(Ordering::SeqCst), 1);

        store.advance_generation(store.generation());
        runner.run(&store, &inv).unwrap();
        assert_eq!(query.0.load(Ordering::SeqCst), 2);

        runner.execute(&store, &inv).unwrap();
        assert_eq!(query.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unknown_query_is_a_resolution_error() {
        let runner = QueryRunner::new(Arc::new(ModuleRegistry::new()), Arc::new(Cache::new()));
        let err = runner
            .run(&Store::new(), &QueryInvocation::new("missing"))
            .unwrap_err();
        assert!(matches!(err, DataServerError::Resolution(_)));
    }
}
