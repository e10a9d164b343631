//! Configuration management for filemgr.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/filemgr/config.toml`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::files::archive::{
    ArchiveLimits, DEFAULT_MAX_FILES, DEFAULT_MAX_RATIO, DEFAULT_MAX_TOTAL_SIZE,
    DEFAULT_MAX_UPLOAD_SIZE,
};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_upload_size must be greater than 0, got {0}")]
    InvalidMaxUploadSize(u64),

    #[error("max_filename_length must be between 1 and 4096, got {0}")]
    InvalidMaxFilenameLength(usize),

    #[error("max_total_size must be greater than 0, got {0}")]
    InvalidMaxTotalSize(u64),

    #[error("max_ratio must be greater than 0, got {0}")]
    InvalidMaxRatio(u64),

    #[error("max_files must be greater than 0, got {0}")]
    InvalidMaxFiles(usize),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound accepted for `max_filename_length`.
const MAX_FILENAME_LENGTH_CEILING: usize = 4096;

/// Main configuration structure for filemgr.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General configuration.
    pub general: GeneralConfig,

    /// Storage root and per-file limits.
    pub storage: StorageConfig,

    /// Zip archive limits.
    pub archive: ArchiveConfig,
}

/// General configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory for the record database and the login session.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory all file operations are confined to.
    pub root: PathBuf,

    /// Maximum size of a file read or written, in bytes (default: 20MB).
    pub max_upload_size: u64,

    /// Maximum length of a single path component, in characters.
    pub max_filename_length: usize,
}

/// Archive configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Maximum total extracted size in bytes (default: 200MB).
    pub max_total_size: u64,

    /// Maximum compression ratio of a single entry.
    pub max_ratio: u64,

    /// Maximum number of entries.
    pub max_files: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "warn".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_data_dir().join("storage"),
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            max_filename_length: 255,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_total_size: DEFAULT_MAX_TOTAL_SIZE,
            max_ratio: DEFAULT_MAX_RATIO,
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("filemgr")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("filemgr")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - FILEMGR_STORAGE_ROOT: Override the storage root
    /// - FILEMGR_DATA_DIR: Override the data directory
    /// - FILEMGR_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Returns the names of the variables that were applied. Overrides are
    /// read before logging is configured, so the caller reports them.
    pub fn apply_env_overrides(&mut self) -> Vec<&'static str> {
        let mut applied = Vec::new();

        if let Some(root) = env_override("FILEMGR_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(root);
            applied.push("FILEMGR_STORAGE_ROOT");
        }

        if let Some(dir) = env_override("FILEMGR_DATA_DIR") {
            self.general.data_dir = PathBuf::from(dir);
            applied.push("FILEMGR_DATA_DIR");
        }

        if let Some(level) = env_override("FILEMGR_LOG_LEVEL") {
            self.general.log_level = level;
            applied.push("FILEMGR_LOG_LEVEL");
        }

        applied
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.max_upload_size == 0 {
            return Err(ConfigError::InvalidMaxUploadSize(self.storage.max_upload_size));
        }

        let name_len = self.storage.max_filename_length;
        if name_len == 0 || name_len > MAX_FILENAME_LENGTH_CEILING {
            return Err(ConfigError::InvalidMaxFilenameLength(name_len));
        }

        if self.archive.max_total_size == 0 {
            return Err(ConfigError::InvalidMaxTotalSize(self.archive.max_total_size));
        }

        if self.archive.max_ratio == 0 {
            return Err(ConfigError::InvalidMaxRatio(self.archive.max_ratio));
        }

        if self.archive.max_files == 0 {
            return Err(ConfigError::InvalidMaxFiles(self.archive.max_files));
        }

        let level = self.general.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.general.log_level.clone()));
        }

        Ok(())
    }

    /// Limits applied by the file manager.
    pub fn limits(&self) -> ArchiveLimits {
        ArchiveLimits {
            max_files: self.archive.max_files,
            max_ratio: self.archive.max_ratio,
            max_total_size: self.archive.max_total_size,
            max_upload_size: self.storage.max_upload_size,
        }
    }

    /// Location of the record database.
    pub fn database_path(&self) -> PathBuf {
        self.general.data_dir.join("filemgr.db")
    }

    /// Location of the login session file.
    pub fn session_path(&self) -> PathBuf {
        self.general.data_dir.join("session.json")
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    ///
    /// The default path is `~/.config/filemgr/config.toml`.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        // Atomic write: temp file in the same directory, then rename
        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
        temp.write_all(contents.as_bytes())
            .and_then(|()| temp.as_file().sync_all())
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        temp.persist(path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Non-empty value of an environment variable.
fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
