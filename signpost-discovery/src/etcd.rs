//! etcd registry implementation (v2 keys API)
//!
//! The v2 keys API maps directly onto [`Registry`]: keys carry their own TTL,
//! directories expire together with their children and `refresh=true` extends
//! a lease without notifying watchers.

use crate::error::RegistryError;
use crate::registry::{Registry, RegistryTree, normalize_key};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

const ERROR_KEY_NOT_FOUND: u64 = 100;
const ERROR_NOT_A_FILE: u64 = 102;
const ERROR_NODE_EXIST: u64 = 105;

/// Default per-request timeout for registry calls
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// etcd registry client
pub struct EtcdRegistry {
    base_url: Url,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    key: Option<String>,
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u64,
    message: String,
}

impl EtcdRegistry {
    /// Create new etcd registry client
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use signpost_discovery::EtcdRegistry;
    ///
    /// let etcd = EtcdRegistry::new("http://localhost:2379")?;
    /// ```
    pub fn new(base_url: &str) -> Result<Self, RegistryError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a client whose requests give up after `timeout`
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, RegistryError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| RegistryError::InvalidAddress(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(RegistryError::InvalidAddress(base_url.to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self { base_url, client })
    }

    fn key_url(&self, key: &str) -> Result<Url, RegistryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RegistryError::InvalidAddress(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["v2", "keys"])
            .extend(key.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }

    async fn send_put(&self, key: &str, form: &[(&str, String)]) -> Result<(), (Option<u64>, RegistryError)> {
        let url = self.key_url(key).map_err(|e| (None, e))?;
        let response = self
            .client
            .put(url)
            .form(form)
            .send()
            .await
            .map_err(|e| (None, RegistryError::from(e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(read_error(key, response).await)
        }
    }
}

/// Decode an etcd error body into its error code and a [`RegistryError`]
async fn read_error(key: &str, response: reqwest::Response) -> (Option<u64>, RegistryError) {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();

    match serde_json::from_str::<EtcdErrorBody>(&body) {
        Ok(err) if err.error_code == ERROR_KEY_NOT_FOUND => {
            (Some(err.error_code), RegistryError::KeyNotFound(key.to_string()))
        }
        Ok(err) => (
            Some(err.error_code),
            RegistryError::Rejected {
                key: key.to_string(),
                reason: format!("{} (code {})", err.message, err.error_code),
            },
        ),
        Err(_) => (None, RegistryError::Status { status, body }),
    }
}

fn ttl_seconds(ttl: Duration) -> String {
    ttl.as_secs().max(1).to_string()
}

fn flatten(node: EtcdNode, tree: &mut RegistryTree) {
    if let Some(key) = node.key {
        if node.dir {
            tree.insert_dir(key);
        } else {
            tree.insert_value(key, node.value.unwrap_or_default());
        }
    }
    for child in node.nodes {
        flatten(child, tree);
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        directory: bool,
    ) -> Result<(), RegistryError> {
        let mut form: Vec<(&str, String)> = Vec::new();
        if directory {
            form.push(("dir", "true".to_string()));
        } else {
            form.push(("value", value.to_string()));
        }
        if let Some(ttl) = ttl {
            form.push(("ttl", ttl_seconds(ttl)));
        }

        match self.send_put(key, &form).await {
            Ok(()) => Ok(()),
            // Creating a directory that already exists: update its lease instead.
            Err((Some(ERROR_NOT_A_FILE | ERROR_NODE_EXIST), _)) if directory => {
                debug!(key = %key, "etcd directory exists, updating lease");
                form.push(("prevExist", "true".to_string()));
                self.send_put(key, &form).await.map_err(|(_, e)| e)
            }
            Err((_, e)) => Err(e),
        }
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), RegistryError> {
        let form = [
            ("refresh", "true".to_string()),
            ("prevExist", "true".to_string()),
            ("ttl", ttl_seconds(ttl)),
        ];
        self.send_put(key, &form).await.map_err(|(_, e)| e)
    }

    async fn get(&self, prefix: &str, recursive: bool) -> Result<RegistryTree, RegistryError> {
        let mut url = self.key_url(prefix)?;
        url.query_pairs_mut()
            .append_pair("recursive", if recursive { "true" } else { "false" });

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return match read_error(prefix, response).await {
                (_, RegistryError::KeyNotFound(_)) => Ok(RegistryTree::new()),
                (_, e) => Err(e),
            };
        }

        let etcd_response: EtcdResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;

        let mut tree = RegistryTree::new();
        if let Some(node) = etcd_response.node {
            flatten(node, &mut tree);
        }

        // The listed directory itself is not part of the result.
        let root = normalize_key(prefix);
        Ok(tree
            .iter()
            .filter(|(key, value)| *key != root || value.is_some())
            .map(|(key, value)| (key.to_string(), value.map(str::to_string)))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), RegistryError> {
        let mut url = self.key_url(key)?;
        url.query_pairs_mut().append_pair("recursive", "true");

        let response = self.client.delete(url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(read_error(key, response).await.1)
        }
    }

    fn name(&self) -> &'static str {
        "etcd"
    }
}
