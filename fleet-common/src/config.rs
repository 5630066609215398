//! Bootstrap configuration and root folder resolution
//!
//! Only bootstrap concerns live here (where the database is, what port to
//! listen on, where the provider is). Runtime tuning lives in the database
//! `settings` table and is loaded by the service.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "FLEET_ROOT_FOLDER";

/// Database file name inside the root folder
pub const DATABASE_FILE: &str = "fleet.db";

/// Bootstrap configuration loaded from TOML
///
/// Changes require a restart.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TomlConfig {
    /// Folder holding the database (optional)
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Interface to bind
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub provider: ProviderConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Upstream telemetry provider connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_url")]
    pub base_url: String,

    /// Hard timeout for every upstream HTTP call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_port() -> u16 {
    5760
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_provider_url() -> String {
    "http://127.0.0.1:8082/api".to_string()
}

fn default_request_timeout_secs() -> u64 {
    15
}

impl TomlConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Load bootstrap configuration
    ///
    /// A missing file is not fatal: defaults are returned and a warning is
    /// logged. A file that exists but does not parse is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(default_config_path) {
            Some(p) => p,
            None => {
                warn!("No config file location available, using built-in defaults");
                return Ok(Self::with_defaults());
            }
        };

        if !path.exists() {
            warn!("Config file {} not found, using built-in defaults", path.display());
            return Ok(Self::with_defaults());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded TOML configuration from {}", path.display());
        Ok(config)
    }

    /// Configuration with every field at its built-in default
    pub fn with_defaults() -> Self {
        Self {
            root_folder: None,
            port: default_port(),
            bind_address: default_bind_address(),
            logging: LoggingConfig::default(),
            provider: ProviderConfig::default(),
        }
    }
}

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. `FLEET_ROOT_FOLDER` environment variable
/// 3. TOML `root_folder`
/// 4. OS-dependent default
pub fn resolve_root_folder(cli_arg: Option<&Path>, toml_config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &toml_config.root_folder {
        return path.clone();
    }

    get_default_root_folder()
}

/// Create the root folder if missing and return the database path inside it
pub fn prepare_root_folder(root_folder: &Path) -> Result<PathBuf> {
    if !root_folder.exists() {
        std::fs::create_dir_all(root_folder)?;
        info!("Created root folder: {}", root_folder.display());
    }
    Ok(root_folder.join(DATABASE_FILE))
}

/// Default configuration file path for the platform
fn default_config_path() -> Option<PathBuf> {
    if cfg!(target_os = "linux") {
        let user_config = dirs::config_dir().map(|d| d.join("fleet").join("fleet-sync.toml"));
        if let Some(path) = &user_config {
            if path.exists() {
                return user_config;
            }
        }
        let system_config = PathBuf::from("/etc/fleet/fleet-sync.toml");
        if system_config.exists() {
            return Some(system_config);
        }
        user_config
    } else {
        dirs::config_dir().map(|d| d.join("fleet").join("fleet-sync.toml"))
    }
}

/// OS-dependent default root folder
pub fn get_default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("fleet"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/fleet"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("fleet"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/fleet"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("fleet"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\fleet"))
    } else {
        PathBuf::from("./fleet_data")
    }
}
