pub mod cache;
pub mod invalidation;

pub use cache::*;
pub use invalidation::*;

// Re-export common types for convenience
pub use dataserver_core::{DataServerError, InvalidationConfig, PropagationDepth, Result, TagIdentity};
