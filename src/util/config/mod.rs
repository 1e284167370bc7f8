//! phasetask configuration
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. CLI arguments
//! 2. Environment variables (PHASETASK_WORKERS, PHASETASK_TIME_SCALE, PHASETASK_LOG)
//! 3. Config file (.ron or .json)
//! 4. User-level (~/.config/phasetask/config.ron)
//! 5. Default values
//! ```
//!
//! # Usage
//!
//! ```rust
//! use phasetask::util::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::default().with_env_overrides().unwrap();
//! assert!(config.pool.num_workers >= 1);
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::diagnostics::UnobservedFailurePolicy;
use crate::runtime::pool::PoolConfig;
use crate::runtime::scheduler::SchedulerConfig;
use crate::util::logger::LogLevel;

/// Environment variable overriding the worker count.
pub const ENV_WORKERS: &str = "PHASETASK_WORKERS";
/// Environment variable overriding the initial time scale.
pub const ENV_TIME_SCALE: &str = "PHASETASK_TIME_SCALE";
/// Environment variable overriding the log level.
pub const ENV_LOG: &str = "PHASETASK_LOG";

/// Complete runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Phase scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Worker pool settings
    #[serde(default)]
    pub pool: PoolConfig,
    /// Failure diagnostics
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Diagnostics configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiagnosticsConfig {
    /// What happens to failures of detached tasks nobody observed
    #[serde(default)]
    pub unobserved_failure: UnobservedFailurePolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum level
    #[serde(default = "default_level")]
    pub level: LogLevel,
}

fn default_level() -> LogLevel {
    LogLevel::Info
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

/// Configuration file format, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// `.ron`, the format written by default.
    Ron,
    /// `.json`
    Json,
}

impl ConfigFormat {
    /// Detect the format of `path`.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("ron") => Ok(ConfigFormat::Ron),
            Some("json") => Ok(ConfigFormat::Json),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

impl RuntimeConfig {
    /// Parse configuration text.
    pub fn parse(
        content: &str,
        format: ConfigFormat,
    ) -> Result<Self, ConfigError> {
        match format {
            ConfigFormat::Ron => ron::from_str(content).map_err(|e| ConfigError::Ron(e.to_string())),
            ConfigFormat::Json => serde_json::from_str(content).map_err(ConfigError::Json),
        }
    }

    /// Render configuration text.
    pub fn render(
        &self,
        format: ConfigFormat,
    ) -> Result<String, ConfigError> {
        match format {
            ConfigFormat::Ron => ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Ron(e.to_string())),
            ConfigFormat::Json => serde_json::to_string_pretty(self).map_err(ConfigError::Json),
        }
    }

    /// Apply environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up through `lookup`.
    pub fn with_overrides<F>(
        mut self,
        lookup: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_WORKERS) {
            self.pool.num_workers = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidOverride(ENV_WORKERS, value))?;
        }
        if let Some(value) = lookup(ENV_TIME_SCALE) {
            match parse_time_scale(&value) {
                Some(scale) => self.scheduler.initial_time_scale = scale,
                None => return Err(ConfigError::InvalidOverride(ENV_TIME_SCALE, value)),
            }
        }
        if let Some(value) = lookup(ENV_LOG) {
            self.logging.level = value
                .parse()
                .map_err(|_| ConfigError::InvalidOverride(ENV_LOG, value))?;
        }
        Ok(self)
    }
}

/// Parse a time scale, rejecting values the frame clock cannot apply.
pub fn parse_time_scale(value: &str) -> Option<f32> {
    value.trim().parse::<f32>().ok().filter(|scale| scale.is_finite())
}

/// Get the user config directory
pub fn get_config_dir() -> Option<PathBuf> {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config).join("phasetask"));
    }

    if let Ok(home) = std::env::var("HOME") {
        return Some(PathBuf::from(home).join(".config").join("phasetask"));
    }

    // On Windows, try %APPDATA%
    if let Ok(appdata) = std::env::var("APPDATA") {
        return Some(PathBuf::from(appdata).join("phasetask"));
    }

    None
}

/// Get the user config file path (~/.config/phasetask/config.ron)
pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.ron"))
}

/// Load configuration from a `.ron` or `.json` file
pub fn load_config(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let format = ConfigFormat::from_path(path)?;
    let content = fs::read_to_string(path)?;
    RuntimeConfig::parse(&content, format)
}

/// Load user-level configuration
/// Returns default config if file doesn't exist
pub fn load_user_config() -> Result<RuntimeConfig, ConfigError> {
    match get_config_path() {
        Some(path) if path.exists() => load_config(&path),
        _ => Ok(RuntimeConfig::default()),
    }
}

/// Resolve the effective configuration: `path` if given, otherwise the
/// user-level file, then environment overrides.
pub fn resolve_config(path: Option<&Path>) -> Result<RuntimeConfig, ConfigError> {
    let config = match path {
        Some(path) => load_config(path)?,
        None => load_user_config()?,
    };
    config.with_env_overrides()
}

/// Save configuration to a `.ron` or `.json` file
pub fn save_config(
    config: &RuntimeConfig,
    path: &Path,
) -> Result<(), ConfigError> {
    let format = ConfigFormat::from_path(path)?;
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)?;
        }
    }
    fs::write(path, config.render(format)?)?;
    Ok(())
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing the config file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// RON text could not be parsed or rendered.
    #[error("Config parse error: {0}")]
    Ron(String),
    /// JSON text could not be parsed or rendered.
    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),
    /// The file extension is neither `.ron` nor `.json`.
    #[error("Unsupported config format: {}", .0.display())]
    UnsupportedFormat(PathBuf),
    /// An environment override held an unusable value, named by variable.
    #[error("Invalid value for {0}: {1:?}")]
    InvalidOverride(&'static str, String),
}
