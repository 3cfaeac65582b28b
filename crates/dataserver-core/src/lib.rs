pub mod config;
pub mod error;
pub mod logging;
pub mod oplog;
pub mod types;
pub mod unique_id;
pub mod watch;

pub use config::*;
pub use error::*;
pub use logging::*;
pub use oplog::*;
pub use types::*;
pub use unique_id::*;
pub use watch::*;
