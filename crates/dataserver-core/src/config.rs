use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context;
use config as cfg;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{DataServerError, Result};

/// Process run mode. `prod` disables the watcher unless explicitly enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Dev,
    Prod,
}

impl FromStr for RunMode {
    type Err = DataServerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "dev" | "development" => Ok(RunMode::Dev),
            "prod" | "production" => Ok(RunMode::Prod),
            other => Err(DataServerError::Configuration(format!(
                "invalid run mode '{}', expected 'dev' or 'prod'",
                other
            ))),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Dev => write!(f, "dev"),
            RunMode::Prod => write!(f, "prod"),
        }
    }
}

/// How far an invalidated tag propagates through the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PropagationDepth {
    /// Only tags that directly depend on an invalidated tag.
    #[default]
    SingleHop,
    /// Dependents of dependents, until a fixed point is reached.
    Transitive,
}

/// Which dependent tags are reported by `get_invalidated_filepaths`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TagIdentity {
    /// Every dependent tag, whatever it names.
    #[default]
    Any,
    /// Only tags naming a logical file currently held by the store.
    StoreFiles,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "StoreConfig::default_file_extension")]
    pub file_extension: String,
    #[serde(default = "StoreConfig::default_variant_separator")]
    pub variant_separator: String,
}

impl StoreConfig {
    fn default_file_extension() -> String {
        "json".to_string()
    }

    fn default_variant_separator() -> String {
        "--".to_string()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            file_extension: Self::default_file_extension(),
            variant_separator: Self::default_variant_separator(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InvalidationConfig {
    #[serde(default)]
    pub propagation: PropagationDepth,
    #[serde(default)]
    pub tag_identity: TagIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// `None` follows the run mode: on in dev, off in prod.
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default = "WatcherConfig::default_debounce_ms")]
    pub debounce_ms: u64,
}

impl WatcherConfig {
    fn default_debounce_ms() -> u64 {
        35
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            debounce_ms: Self::default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

/// Top-level configuration for a data server instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataServerConfig {
    /// Root of the exported JSON tree.
    pub data_dir: PathBuf,
    /// Operation log, dumps and the dump ledger live here.
    pub work_dir: PathBuf,
    #[serde(default = "DataServerConfig::default_run_mode")]
    pub run_mode: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub invalidation: InvalidationConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DataServerConfig {
    fn default_run_mode() -> String {
        env::var("DATASERVER_RUN_MODE").unwrap_or_else(|_| "dev".to_string())
    }

    pub fn new(data_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            work_dir: work_dir.into(),
            run_mode: "dev".to_string(),
            store: StoreConfig::default(),
            invalidation: InvalidationConfig::default(),
            watcher: WatcherConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Layered load: `default.*`, `{env}.*`, `local.toml`, then `DATASERVER__*` variables.
    pub fn load_from_sources(config_dir: &Path, env_name: &str) -> Result<Self> {
        let build = || -> anyhow::Result<Self> {
            let settings = cfg::Config::builder()
                .add_source(cfg::File::from(config_dir.join("default.toml")).required(false))
                .add_source(cfg::File::from(config_dir.join("default.json")).required(false))
                .add_source(
                    cfg::File::from(config_dir.join(format!("{}.toml", env_name)))
                        .required(false),
                )
                .add_source(
                    cfg::File::from(config_dir.join(format!("{}.json", env_name)))
                        .required(false),
                )
                .add_source(cfg::File::from(config_dir.join("local.toml")).required(false))
                .add_source(cfg::Environment::with_prefix("DATASERVER").separator("__"))
                .build()
                .context("building configuration")?
                .try_deserialize()
                .context("deserializing configuration")?;
            Ok(settings)
        };

        let loaded = build().map_err(|e| DataServerError::Configuration(format!("{:#}", e)))?;
        info!("Loaded configuration from {:?} ({})", config_dir, env_name);
        Ok(loaded)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| DataServerError::Configuration(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            DataServerError::Configuration(format!("reading config {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DataServerError::Configuration(e.to_string()))
    }

    pub fn run_mode(&self) -> Result<RunMode> {
        self.run_mode.parse()
    }

    pub fn watcher_enabled(&self) -> Result<bool> {
        Ok(match self.watcher.enabled {
            Some(enabled) => enabled,
            None => self.run_mode()? == RunMode::Dev,
        })
    }

    pub fn log_path(&self) -> PathBuf {
        self.work_dir.join("log").join("operations.log")
    }

    pub fn dump_dir(&self) -> PathBuf {
        self.work_dir.join("dumps")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.work_dir.join("dump-ledger.json")
    }

    pub fn consumers_path(&self) -> PathBuf {
        self.work_dir.join("dump-consumers.json")
    }

    /// Checks every startup invariant and prepares the work directory.
    pub fn validate(&self) -> Result<()> {
        self.run_mode()?;

        if !self.data_dir.is_dir() {
            return Err(DataServerError::Configuration(format!(
                "data_dir {:?} does not exist or is not a directory",
                self.data_dir
            )));
        }
        fs::read_dir(&self.data_dir).map_err(|e| {
            DataServerError::Configuration(format!("data_dir {:?} is not readable: {}", self.data_dir, e))
        })?;

        if self.store.file_extension.trim().is_empty() {
            return Err(DataServerError::Configuration(
                "store.file_extension cannot be empty".into(),
            ));
        }
        if self.store.file_extension.starts_with('.') {
            return Err(DataServerError::Configuration(
                "store.file_extension must not start with '.'".into(),
            ));
        }
        if self.store.variant_separator.is_empty() {
            return Err(DataServerError::Configuration(
                "store.variant_separator cannot be empty".into(),
            ));
        }
        if self.watcher.debounce_ms == 0 {
            return Err(DataServerError::Configuration(
                "watcher.debounce_ms must be > 0".into(),
            ));
        }

        self.ensure_writable(&self.work_dir)?;
        for dir in [self.dump_dir(), self.work_dir.join("log")] {
            self.ensure_writable(&dir)?;
        }
        Ok(())
    }

    fn ensure_writable(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| {
            DataServerError::Configuration(format!("cannot create {:?}: {}", dir, e))
        })?;
        let marker = dir.join(".write-check");
        fs::write(&marker, b"").map_err(|e| {
            DataServerError::Configuration(format!("{:?} is not writable: {}", dir, e))
        })?;
        let _ = fs::remove_file(&marker);
        debug!("Directory {:?} is writable", dir);
        Ok(())
    }
}
