//! Configuration management
//!
//! This module handles loading, validation, and management of the Loom configuration.
//! Configuration is stored in TOML format at ~/.loom/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Data directory and log level
//! - **connectors**: Connector install directory, network allow-list, HTTP settings
//! - **orchestrator**: Dispatch limits and workflow context formatting
//!
//! # Path Expansion
//!
//! `~` in `core.data_dir` and `connectors.dir` is expanded to the user's home
//! directory, and both directories are created on load if missing.
//!
//! # Examples
//!
//! ```no_run
//! use loom_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Connectors: {:?}", config.connectors.dir);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    pub core: CoreConfig,

    /// Connector package settings
    #[serde(default)]
    pub connectors: ConnectorsConfig,

    /// Dispatch settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Data directory path holding the database (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Connector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorsConfig {
    /// Directory connector packages are installed into (supports ~ expansion)
    #[serde(default = "default_connectors_dir")]
    pub dir: PathBuf,

    /// Hosts connector modules may reach over HTTP ("*" for any)
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,

    /// User agent for release and asset downloads
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Timeout for a single release or asset request
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
}

impl Default for ConnectorsConfig {
    fn default() -> Self {
        Self {
            dir: default_connectors_dir(),
            allowed_hosts: default_allowed_hosts(),
            user_agent: default_user_agent(),
            download_timeout_secs: default_download_timeout(),
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on connector calls executing at once (unset = unlimited)
    #[serde(default)]
    pub max_concurrent_calls: Option<usize>,

    /// Inserted between a workflow step's context and the next chain's prompts
    #[serde(default = "default_context_separator")]
    pub workflow_context_separator: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: None,
            workflow_context_separator: default_context_separator(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.loom")
}

fn default_connectors_dir() -> PathBuf {
    PathBuf::from("~/.loom/connectors")
}

fn default_allowed_hosts() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_user_agent() -> String {
    concat!("loom/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_download_timeout() -> u64 {
    60
}

fn default_context_separator() -> String {
    "\n\n".to_string()
}

impl Config {
    /// Load configuration from the default location (~/.loom/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let default_config = Self::default_config();

        // Write the unexpanded form so the file stays portable
        let toml_string = toml::to_string_pretty(&default_config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = default_config;
        config.validate_and_process()?;
        Ok(config)
    }

    /// Get the default configuration file path (~/.loom/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".loom").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig {
                data_dir: default_data_dir(),
                log_level: default_log_level(),
            },
            connectors: ConnectorsConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }

    /// Configuration rooted at `dir`, used by tests and portable installs
    pub fn rooted_at(dir: &Path) -> Self {
        let mut config = Self::default_config();
        config.core.data_dir = dir.to_path_buf();
        config.connectors.dir = dir.join("connectors");
        config
    }

    /// Path of the SQLite database
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join("loom.db")
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates the log level and orchestrator limits
    /// - Expands ~ in paths
    /// - Creates the data and connector directories
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.orchestrator.max_concurrent_calls == Some(0) {
            return Err(EngineError::Config(
                "max_concurrent_calls must be at least 1 when set".to_string(),
            ));
        }

        if self.connectors.download_timeout_secs == 0 {
            return Err(EngineError::Config(
                "download_timeout_secs must be greater than 0".to_string(),
            ));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        self.connectors.dir = expand_path(&self.connectors.dir)?;

        for dir in [&self.core.data_dir, &self.connectors.dir] {
            if !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| {
                    EngineError::Config(format!("Failed to create directory {:?}: {}", dir, e))
                })?;
            }
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_creation() {
        let config = Config::default_config();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.connectors.allowed_hosts, vec!["*"]);
        assert!(config.orchestrator.max_concurrent_calls.is_none());
        assert_eq!(config.orchestrator.workflow_context_separator, "\n\n");
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let expanded = expand_path(&PathBuf::from("~/test")).unwrap();
        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        assert_eq!(expand_path(&path).unwrap(), path);
    }

    #[test]
    fn test_load_minimal_file_fills_defaults() {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path().join("data");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            format!(
                "[core]\ndata_dir = {:?}\nlog_level = \"debug\"\n\n[connectors]\ndir = {:?}\n",
                data_dir,
                temp.path().join("plugins")
            ),
        )
        .unwrap();

        let config = Config::load_from_path(&config_path).unwrap();
        assert_eq!(config.core.log_level, "debug");
        assert_eq!(config.connectors.download_timeout_secs, 60);
        assert!(data_dir.is_dir());
        assert!(temp.path().join("plugins").is_dir());
        assert_eq!(config.database_path(), data_dir.join("loom.db"));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            format!("[core]\ndata_dir = {:?}\nlog_level = \"loud\"\n", temp.path()),
        )
        .unwrap();

        let err = Config::load_from_path(&config_path).unwrap_err();
        assert!(err.to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            format!(
                "[core]\ndata_dir = {:?}\n\n[orchestrator]\nmax_concurrent_calls = 0\n",
                temp.path()
            ),
        )
        .unwrap();

        assert!(Config::load_from_path(&config_path).is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default_config();
        let toml_string = toml::to_string(&config).unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config.core.log_level, deserialized.core.log_level);
        assert_eq!(config.connectors.dir, deserialized.connectors.dir);
    }
}
