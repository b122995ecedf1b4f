//! The coordination-store capability consumed by registration and discovery

use crate::error::RegistryError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// Key-value store with TTL leases over hierarchical `/`-separated keys.
///
/// Keys are absolute (`/environments/dev/...`). Implementations normalize a
/// missing leading slash.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Write `key`. With a TTL the key (and, for a directory, everything below
    /// it) disappears unless refreshed in time.
    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        directory: bool,
    ) -> Result<(), RegistryError>;

    /// Extend the lease of an existing key without changing its value.
    /// Fails with [`RegistryError::KeyNotFound`] when the key has lapsed.
    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), RegistryError>;

    /// Read everything under `prefix` (`recursive`) or only its direct
    /// children. A missing prefix yields an empty tree.
    async fn get(&self, prefix: &str, recursive: bool) -> Result<RegistryTree, RegistryError>;

    /// Remove `key` and everything below it.
    async fn delete(&self, key: &str) -> Result<(), RegistryError>;

    /// Short backend name used in logs
    fn name(&self) -> &'static str;
}

/// Ordered snapshot of registry keys. Directories carry no value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryTree {
    nodes: BTreeMap<String, Option<String>>,
}

impl RegistryTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.nodes.insert(normalize_key(&key.into()), Some(value.into()));
    }

    pub fn insert_dir(&mut self, key: impl Into<String>) {
        self.nodes.insert(normalize_key(&key.into()), None);
    }

    /// Value stored at `key`, `None` for directories and missing keys
    pub fn value(&self, key: &str) -> Option<&str> {
        self.nodes.get(&normalize_key(key))?.as_deref()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(&normalize_key(key))
    }

    /// Every node in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.nodes.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Value nodes only, in key order
    pub fn values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.nodes
            .iter()
            .filter_map(|(k, v)| v.as_deref().map(|v| (k.as_str(), v)))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Collapse a recursive listing to the direct children of `prefix`.
    /// Deeper keys surface as their child directory; `prefix` itself is kept
    /// when it holds a value.
    pub(crate) fn children_of(self, prefix: &str) -> RegistryTree {
        let prefix = normalize_key(prefix);
        let mut children = RegistryTree::new();

        for (key, value) in self.nodes {
            if key == prefix {
                if value.is_some() {
                    children.nodes.insert(key, value);
                }
                continue;
            }
            if !is_descendant(&key, &prefix) {
                continue;
            }

            let rest = key[prefix.len()..].trim_start_matches('/');
            match rest.split_once('/') {
                None => {
                    children.nodes.insert(key, value);
                }
                Some((child, _)) => {
                    let child_key = normalize_key(&format!("{}/{}", prefix, child));
                    children.nodes.entry(child_key).or_insert(None);
                }
            }
        }

        children
    }
}

impl FromIterator<(String, Option<String>)> for RegistryTree {
    fn from_iter<I: IntoIterator<Item = (String, Option<String>)>>(iter: I) -> Self {
        Self {
            nodes: iter
                .into_iter()
                .map(|(k, v)| (normalize_key(&k), v))
                .collect(),
        }
    }
}

/// `/a//b/` and `a/b` both become `/a/b`; the root is `/`.
pub fn normalize_key(key: &str) -> String {
    let joined = key
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    format!("/{}", joined)
}

/// Whether `key` lies strictly below `prefix` (both normalized)
pub(crate) fn is_descendant(key: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return key != "/";
    }
    key.len() > prefix.len() && key.starts_with(prefix) && key.as_bytes()[prefix.len()] == b'/'
}

/// Builders for the key layout shared with the sibling discovery libraries.
pub mod keys {
    /// `/environments/{env}/services/{name}/`
    pub fn service_prefix(environment: &str, name: &str) -> String {
        format!("/environments/{}/services/{}/", environment, name)
    }

    /// `/environments/{env}/services/{name}/{version}/instances/`
    pub fn instances_prefix(environment: &str, name: &str, version: &str) -> String {
        format!(
            "/environments/{}/services/{}/{}/instances/",
            environment, name, version
        )
    }

    /// `/environments/{env}/services/{name}/{version}/instances/{id}`
    pub fn instance(environment: &str, name: &str, version: &str, id: &str) -> String {
        format!(
            "/environments/{}/services/{}/{}/instances/{}",
            environment, name, version, id
        )
    }

    /// `/environments/{env}/services/{name}/{version}/instances/{id}/url`
    pub fn instance_url(environment: &str, name: &str, version: &str, id: &str) -> String {
        format!("{}/url", instance(environment, name, version, id))
    }

    /// `/environments/{env}/services/{name}/{version}/gatewayUrl`
    pub fn gateway_url(environment: &str, name: &str, version: &str) -> String {
        format!(
            "/environments/{}/services/{}/{}/gatewayUrl",
            environment, name, version
        )
    }

    pub const URL: &str = "url";
    pub const STATUS: &str = "status";
    pub const GATEWAY_URL: &str = "gatewayUrl";
    pub const INSTANCES: &str = "instances";
    pub const STATUS_DISABLED: &str = "disabled";
}
