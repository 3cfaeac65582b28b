pub mod diff;
pub mod dump;
pub mod includes;
pub mod query;
pub mod registry;
pub mod server;
pub mod store;

pub use diff::*;
pub use dump::*;
pub use includes::*;
pub use query::*;
pub use registry::*;
pub use server::*;
pub use store::*;

pub use dataserver_cache::{Cache, DependencyTagGraph};
pub use dataserver_core::{
    ChangeEvent, DataServerConfig, DataServerError, Diff, Dump, LogicalFile, Result, UniqueId,
};

/// Cache bin holding statically resolved documents, keyed by relative path.
pub const RESOLVED_BIN: &str = "resolved";
/// Cache bin holding query results for the current snapshot.
pub const QUERY_BIN: &str = "query";
