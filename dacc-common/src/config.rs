//! Configuration loading
//!
//! Each setting is resolved in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing or malformed config file is logged and never stops the service.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Environment variable overriding the database path
pub const ENV_DATABASE: &str = "DACC_DATABASE";

/// Environment variable overriding the HTTP listen address
pub const ENV_LISTEN_ADDR: &str = "DACC_LISTEN_ADDR";

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 3600;
const DEFAULT_LOG_LEVEL: &str = "info";

/// Contents of `config.toml`; every key is optional
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TomlConfig {
    pub database_path: Option<PathBuf>,
    pub listen_addr: Option<String>,
    /// Seconds between scheduled aggregation passes, 0 disables the scheduler
    pub scheduler_interval_secs: Option<u64>,
    pub log_level: Option<String>,
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_file: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub listen_addr: Option<String>,
}

/// Fully resolved service configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub database_path: PathBuf,
    pub listen_addr: String,
    pub scheduler_interval_secs: u64,
    pub log_level: String,
}

impl ServiceConfig {
    /// Resolve every setting from overrides, environment, file and defaults
    pub fn resolve(overrides: &ConfigOverrides) -> Self {
        let file = load_toml_config(overrides.config_file.as_deref()).unwrap_or_default();

        let database_path = overrides
            .database_path
            .clone()
            .or_else(|| std::env::var(ENV_DATABASE).ok().map(PathBuf::from))
            .or(file.database_path)
            .unwrap_or_else(default_database_path);

        let listen_addr = overrides
            .listen_addr
            .clone()
            .or_else(|| std::env::var(ENV_LISTEN_ADDR).ok())
            .or(file.listen_addr)
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());

        Self {
            database_path,
            listen_addr,
            scheduler_interval_secs: file
                .scheduler_interval_secs
                .unwrap_or(DEFAULT_SCHEDULER_INTERVAL_SECS),
            log_level: file.log_level.unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        }
    }
}

/// Parse a TOML config file
pub fn load_toml_file(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Invalid config file {}: {}", path.display(), e)))
}

/// Load the explicit config file, or the first platform config file found
fn load_toml_config(explicit: Option<&Path>) -> Option<TomlConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => find_config_file()?,
    };

    match load_toml_file(&path) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!("Ignoring config file {}: {}", path.display(), e);
            None
        }
    }
}

/// Default configuration file location for the platform
///
/// Linux looks in `~/.config/dacc/config.toml`, then `/etc/dacc/config.toml`.
fn find_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("dacc").join("config.toml"));
    if let Some(path) = user_config.filter(|p| p.exists()) {
        return Some(path);
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/dacc/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// OS-dependent default database location
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("dacc"))
        .unwrap_or_else(|| PathBuf::from("./dacc_data"))
        .join("dacc.db")
}
