//! Configuration management for signpost.
//!
//! Values are kept as a tree of `serde_json::Value` and addressed with dotted
//! paths (`discovery.ttl`). Sources are layered: later loads override earlier
//! ones key by key, so a builder that loads files first and the environment
//! second lets `SIGNPOST_DISCOVERY__TTL=45` win over `discovery.ttl = 30` in a
//! TOML file.
//!
//! ```rust,ignore
//! use signpost_config::{ConfigService, FileFormat};
//!
//! let config = ConfigService::builder()
//!     .with_prefix("SIGNPOST")
//!     .add_file("config/config.toml", FileFormat::Toml)
//!     .load_env()
//!     .build()?;
//!
//! let ttl: i64 = config.get_or("discovery.ttl", 30);
//! ```

pub mod config_service;
pub mod env;
pub mod error;
pub mod loader;
pub mod validation;

pub use config_service::{ConfigService, ConfigServiceBuilder};
pub use env::EnvLoader;
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat};
pub use validation::{ConfigValidator, Validate};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Main configuration manager
#[derive(Clone, Default)]
pub struct ConfigManager {
    config: Arc<RwLock<Map<String, Value>>>,
    env_prefix: Option<String>,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with environment variable prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            config: Arc::default(),
            env_prefix: Some(prefix.into()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Map<String, Value>> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Map<String, Value>> {
        self.config.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load configuration from environment variables
    pub fn load_env(&self) -> Result<()> {
        let loader = EnvLoader::new(self.env_prefix.clone());
        let env_vars = loader.load()?;

        let mut config = self.write();
        for (path, value) in env_vars {
            insert_path(&mut config, &path, Value::String(value));
        }

        Ok(())
    }

    /// Load configuration from .env file
    pub fn load_dotenv(&self, path: Option<&Path>) -> Result<()> {
        if let Some(path) = path {
            dotenvy::from_path(path).map_err(|e| ConfigError::LoadError(e.to_string()))?;
        } else {
            dotenvy::dotenv().ok(); // Ignore if .env doesn't exist
        }
        self.load_env()
    }

    /// Load configuration from file
    pub fn load_file(&self, path: impl AsRef<Path>, format: FileFormat) -> Result<()> {
        let loader = ConfigLoader::new(format);
        let data = loader.load_file(path)?;
        self.merge_value(data)
    }

    /// Load configuration from a file, picking the format from its extension
    pub fn load_file_auto(&self, path: impl AsRef<Path>) -> Result<()> {
        let loader = ConfigLoader::auto(path.as_ref())?;
        let data = loader.load_file(path)?;
        self.merge_value(data)
    }

    /// Merge a JSON object into the configuration tree
    pub fn merge_value(&self, data: Value) -> Result<()> {
        match data {
            Value::Object(map) => {
                deep_merge(&mut self.write(), map);
                Ok(())
            }
            other => Err(ConfigError::ParseError(format!(
                "configuration root must be an object, got {}",
                other
            ))),
        }
    }

    /// Set a configuration value
    pub fn set<T: serde::Serialize>(&self, key: &str, value: T) -> Result<()> {
        let json_value = serde_json::to_value(value)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;

        insert_path(&mut self.write(), key, json_value);

        Ok(())
    }

    /// Get a configuration value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.get_opt(key)?
            .ok_or_else(|| ConfigError::KeyNotFound(key.to_string()))
    }

    /// Get a configuration value if present.
    ///
    /// A present value that cannot be converted to `T` is an error, not `None`.
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let config = self.read();
        let Some(value) = lookup(&config, key) else {
            return Ok(None);
        };

        convert(key, value).map(Some)
    }

    /// Get a configuration value with default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Get a string value
    pub fn get_string(&self, key: &str) -> Result<String> {
        self.get(key)
    }

    /// Get an integer value
    pub fn get_int(&self, key: &str) -> Result<i64> {
        self.get(key)
    }

    /// Get a boolean value
    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.get(key)
    }

    /// Check if a key exists
    pub fn has(&self, key: &str) -> bool {
        lookup(&self.read(), key).is_some()
    }

    /// All leaf keys as dotted paths, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        collect_leaf_paths(&self.read(), "", &mut keys);
        keys.sort();
        keys
    }

    /// Merge configuration from another manager
    pub fn merge(&self, other: &ConfigManager) -> Result<()> {
        let other_config = other.read().clone();
        deep_merge(&mut self.write(), other_config);
        Ok(())
    }

    /// Deserialize the subtree at `key` and validate it
    pub fn load_validated<T: DeserializeOwned + Validate>(&self, key: &str) -> Result<T> {
        let validated: T = self.get(key)?;
        validated.validate()?;
        Ok(validated)
    }
}

/// Convert a stored value, re-reading strings as JSON scalars so values that
/// came from the environment (`"30"`, `"true"`) deserialize as numbers/bools.
fn convert<T: DeserializeOwned>(key: &str, value: &Value) -> Result<T> {
    match serde_json::from_value(value.clone()) {
        Ok(v) => Ok(v),
        Err(first) => {
            if let Value::String(raw) = value
                && let Ok(reparsed) = serde_json::from_str::<Value>(raw.trim())
                && let Ok(v) = serde_json::from_value(reparsed)
            {
                return Ok(v);
            }
            Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: first.to_string(),
            })
        }
    }
}

fn lookup<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = root.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn insert_path(root: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return;
    };

    let mut current = root;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert(last.to_string(), value);
}

fn deep_merge(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

fn collect_leaf_paths(map: &Map<String, Value>, prefix: &str, out: &mut Vec<String>) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Object(child) => collect_leaf_paths(child, &path, out),
            _ => out.push(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let manager = ConfigManager::new();
        manager.set("test_key", "test_value").unwrap();

        let value: String = manager.get("test_key").unwrap();
        assert_eq!(value, "test_value");
    }

    #[test]
    fn test_dotted_paths() {
        let manager = ConfigManager::new();
        manager.set("discovery.ttl", 30).unwrap();
        manager.set("discovery.etcd.hosts", "http://localhost:2379").unwrap();

        assert_eq!(manager.get_int("discovery.ttl").unwrap(), 30);
        assert_eq!(
            manager.get_string("discovery.etcd.hosts").unwrap(),
            "http://localhost:2379"
        );
        assert!(manager.has("discovery.etcd"));
        assert_eq!(
            manager.keys(),
            vec!["discovery.etcd.hosts".to_string(), "discovery.ttl".to_string()]
        );
    }

    #[test]
    fn test_get_or_default() {
        let manager = ConfigManager::new();

        let value: String = manager.get_or("missing_key", "default_value".to_string());
        assert_eq!(value, "default_value");
    }

    #[test]
    fn test_get_opt_distinguishes_missing_and_invalid() {
        let manager = ConfigManager::new();
        manager.set("discovery.ttl", "soon").unwrap();

        assert!(manager.get_opt::<i64>("discovery.missing").unwrap().is_none());
        assert!(matches!(
            manager.get_opt::<i64>("discovery.ttl"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_string_values_are_coerced() {
        let manager = ConfigManager::new();
        manager.set("discovery.ttl", "45").unwrap();
        manager.set("discovery.singleton", "true").unwrap();

        assert_eq!(manager.get_int("discovery.ttl").unwrap(), 45);
        assert!(manager.get_bool("discovery.singleton").unwrap());
        assert_eq!(manager.get_string("discovery.ttl").unwrap(), "45");
    }

    #[test]
    fn test_merge_overrides_leaves_only() {
        let base = ConfigManager::new();
        base.set("discovery.ttl", 30).unwrap();
        base.set("discovery.ping_interval", 20).unwrap();

        let overlay = ConfigManager::new();
        overlay.set("discovery.ttl", 60).unwrap();

        base.merge(&overlay).unwrap();
        assert_eq!(base.get_int("discovery.ttl").unwrap(), 60);
        assert_eq!(base.get_int("discovery.ping_interval").unwrap(), 20);
    }

    #[test]
    fn test_merge_value_rejects_non_object() {
        let manager = ConfigManager::new();
        assert!(manager.merge_value(serde_json::json!([1, 2])).is_err());
    }
}
