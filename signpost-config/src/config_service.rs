// ConfigService - High-level configuration service

use crate::{ConfigManager, FileFormat, Result};
use serde::de::DeserializeOwned;
use std::path::PathBuf;

/// High-level configuration service.
///
/// Cheap to clone; clones share the same underlying values.
#[derive(Clone, Default)]
pub struct ConfigService {
    manager: ConfigManager,
}

impl ConfigService {
    /// Create a new, empty configuration service
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from an existing manager
    pub fn from_manager(manager: ConfigManager) -> Self {
        Self { manager }
    }

    /// Builder for creating configured service
    pub fn builder() -> ConfigServiceBuilder {
        ConfigServiceBuilder::new()
    }

    /// Get configuration value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.manager.get(key)
    }

    /// Get configuration value if present
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.manager.get_opt(key)
    }

    /// Get configuration value with default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.manager.get_or(key, default)
    }

    /// Get string value
    pub fn get_string(&self, key: &str) -> Result<String> {
        self.manager.get_string(key)
    }

    /// Get integer value
    pub fn get_int(&self, key: &str) -> Result<i64> {
        self.manager.get_int(key)
    }

    /// Get boolean value
    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.manager.get_bool(key)
    }

    /// Set a value, overriding every loaded source
    pub fn set<T: serde::Serialize>(&self, key: &str, value: T) -> Result<()> {
        self.manager.set(key, value)
    }

    /// Check if key exists
    pub fn has(&self, key: &str) -> bool {
        self.manager.has(key)
    }

    /// Get underlying manager
    pub fn manager(&self) -> &ConfigManager {
        &self.manager
    }
}

/// Builder for ConfigService.
///
/// Sources are applied in a fixed order regardless of call order: config
/// files, then the `.env` file, then process environment variables. Each
/// source overrides the keys set by the previous ones.
#[derive(Default)]
pub struct ConfigServiceBuilder {
    manager: ConfigManager,
    load_env: bool,
    load_dotenv: bool,
    dotenv_path: Option<PathBuf>,
    config_files: Vec<(PathBuf, Option<FileFormat>)>,
    optional_files: Vec<PathBuf>,
}

impl ConfigServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set environment variable prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.manager = ConfigManager::with_prefix(prefix);
        self
    }

    /// Enable loading from environment variables
    pub fn load_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    /// Enable loading from .env file
    pub fn load_dotenv(mut self, path: Option<PathBuf>) -> Self {
        self.load_dotenv = true;
        self.dotenv_path = path;
        self
    }

    /// Add configuration file to load
    pub fn add_file(mut self, path: impl Into<PathBuf>, format: FileFormat) -> Self {
        self.config_files.push((path.into(), Some(format)));
        self
    }

    /// Add configuration file, format detected from the extension
    pub fn add_file_auto(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_files.push((path.into(), None));
        self
    }

    /// Add configuration file that is skipped when it does not exist
    pub fn add_optional_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.optional_files.push(path.into());
        self
    }

    /// Build the configuration service
    pub fn build(self) -> Result<ConfigService> {
        for path in &self.optional_files {
            if path.exists() {
                self.manager.load_file_auto(path)?;
            }
        }

        for (path, format) in &self.config_files {
            match format {
                Some(format) => self.manager.load_file(path, *format)?,
                None => self.manager.load_file_auto(path)?,
            }
        }

        if self.load_dotenv {
            self.manager.load_dotenv(self.dotenv_path.as_deref())?;
        }

        if self.load_env {
            self.manager.load_env()?;
        }

        Ok(ConfigService::from_manager(self.manager))
    }
}
