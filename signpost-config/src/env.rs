// Environment variable loading

use crate::{ConfigError, Result};
use std::collections::HashMap;
use std::env;

/// Environment variable loader.
///
/// With prefix `SIGNPOST`, `SIGNPOST_DISCOVERY__PING_INTERVAL` is loaded as
/// `discovery.ping_interval`: the prefix is stripped, the rest lowercased and
/// `__` becomes the path separator.
pub struct EnvLoader {
    prefix: Option<String>,
}

impl EnvLoader {
    /// Create a new environment loader
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    /// Load all matching environment variables, keyed by dotted path
    pub fn load(&self) -> Result<HashMap<String, String>> {
        Ok(self.collect(env::vars()))
    }

    fn collect(&self, vars: impl IntoIterator<Item = (String, String)>) -> HashMap<String, String> {
        let mut config = HashMap::new();

        for (key, value) in vars {
            let stripped = match &self.prefix {
                Some(prefix) => match key.strip_prefix(prefix.as_str()) {
                    Some(rest) if rest.starts_with('_') => rest.trim_start_matches('_'),
                    _ => continue,
                },
                None => key.as_str(),
            };
            if stripped.is_empty() {
                continue;
            }
            config.insert(Self::to_path(stripped), value);
        }

        config
    }

    fn to_path(name: &str) -> String {
        name.to_lowercase().replace("__", ".")
    }

    fn to_var_name(&self, key: &str) -> String {
        let name = key.replace('.', "__").to_uppercase();
        match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix, name),
            None => name,
        }
    }

    /// Load a specific environment variable by dotted path
    pub fn load_var(&self, key: &str) -> Result<String> {
        env::var(self.to_var_name(key)).map_err(ConfigError::EnvError)
    }

    /// Load with default value
    pub fn load_var_or(&self, key: &str, default: &str) -> String {
        self.load_var(key).unwrap_or_else(|_| default.to_string())
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(None)
    }
}
