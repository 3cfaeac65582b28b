use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Log error: {0}")]
    Log(String),

    #[error("Module '{module}' failed on '{file}': {reason}")]
    Module {
        module: String,
        file: String,
        reason: String,
    },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl DataServerError {
    pub fn module(
        module: impl Into<String>,
        file: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::Module {
            module: module.into(),
            file: file.into(),
            reason: reason.to_string(),
        }
    }

    /// Configuration errors are never recovered from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, DataServerError>;
