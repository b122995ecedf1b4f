//! Consul registry implementation
//!
//! Consul KV has no per-key TTL, so leases are modelled with sessions: a put
//! with a TTL creates a session (`Behavior=delete`) and acquires the key with
//! it, and keys written below a leased key join the same session. When the
//! session is not renewed Consul invalidates it and deletes every key it holds.
//! Re-putting a leased key renews and reuses its live session, since Consul
//! refuses to let a second session acquire a held key.

use crate::error::RegistryError;
use crate::etcd::DEFAULT_REQUEST_TIMEOUT;
use crate::registry::{Registry, RegistryTree, is_descendant, normalize_key};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

/// Consul rejects session TTLs outside `[10s, 86400s]`.
const MIN_SESSION_TTL: Duration = Duration::from_secs(10);
const MAX_SESSION_TTL: Duration = Duration::from_secs(86_400);

/// Consul registry client
pub struct ConsulRegistry {
    base_url: Url,
    client: reqwest::Client,
    /// normalized key -> session holding it
    sessions: RwLock<HashMap<String, Lease>>,
}

#[derive(Debug, Clone)]
struct Lease {
    session: String,
    ttl: Duration,
}

#[derive(Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct ConsulKv {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

impl ConsulRegistry {
    /// Create new Consul registry client
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use signpost_discovery::ConsulRegistry;
    ///
    /// let consul = ConsulRegistry::new("http://localhost:8500")?;
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

        Ok(Self {
            base_url,
            client,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    fn api_url<'a>(
        &self,
        segments: impl IntoIterator<Item = &'a str>,
        trailing_slash: bool,
    ) -> Result<Url, RegistryError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| RegistryError::InvalidAddress(self.base_url.to_string()))?;
            path.pop_if_empty().push("v1");
            path.extend(segments.into_iter().filter(|s| !s.is_empty()));
            if trailing_slash {
                path.push("");
            }
        }
        Ok(url)
    }

    fn kv_url(&self, key: &str, directory: bool) -> Result<Url, RegistryError> {
        self.api_url(std::iter::once("kv").chain(key.split('/')), directory)
    }

    async fn create_session(&self, key: &str, ttl: Duration) -> Result<String, RegistryError> {
        let ttl = if ttl < MIN_SESSION_TTL {
            warn!(key = %key, ttl_secs = ttl.as_secs(), "Consul session TTL raised to the 10s minimum");
            MIN_SESSION_TTL
        } else {
            ttl.min(MAX_SESSION_TTL)
        };

        let url = self.api_url(["session", "create"], false)?;
        let payload = serde_json::json!({
            "Name": key,
            "TTL": format!("{}s", ttl.as_secs()),
            "Behavior": "delete",
            "LockDelay": "0s",
        });

        let response = self.client.put(url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let session: SessionCreated = response
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        debug!(key = %key, session = %session.id, "Created Consul session");
        Ok(session.id)
    }

    /// Session of `key` or of its closest leased ancestor
    async fn session_for(&self, key: &str) -> Option<String> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .filter(|(leased, _)| *leased == key || is_descendant(key, leased))
            .max_by_key(|(leased, _)| leased.len())
            .map(|(_, lease)| lease.session.clone())
    }

    /// `false` when Consul no longer knows the session
    async fn renew_session(&self, session: &str) -> Result<bool, RegistryError> {
        let url = self.api_url(["session", "renew", session], false)?;
        let response = self.client.put(url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(true)
    }

    /// Renew the session already leasing `key`, if it is still alive
    async fn renew_lease(&self, key: &str, ttl: Duration) -> Result<Option<String>, RegistryError> {
        let Some(lease) = self.sessions.read().await.get(key).cloned() else {
            return Ok(None);
        };
        if !self.renew_session(&lease.session).await? {
            self.sessions.write().await.remove(key);
            return Ok(None);
        }
        if lease.ttl != ttl {
            warn!(
                key = %key,
                ttl_secs = lease.ttl.as_secs(),
                "Consul session TTL is fixed at creation; keeping the existing lease"
            );
        }
        Ok(Some(lease.session))
    }

    async fn write_kv(
        &self,
        key: &str,
        value: &str,
        directory: bool,
        session: Option<&str>,
    ) -> Result<(), RegistryError> {
        let mut url = self.kv_url(key, directory)?;
        if let Some(session) = session {
            url.query_pairs_mut().append_pair("acquire", session);
        }
        let body = if directory { String::new() } else { value.to_string() };

        let response = self.client.put(url).body(body).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let written: bool = response
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        if written {
            Ok(())
        } else {
            Err(RegistryError::Rejected {
                key: key.to_string(),
                reason: "key is held by another session".to_string(),
            })
        }
    }

    async fn destroy_session(&self, session: &str) {
        let result = match self.api_url(["session", "destroy", session], false) {
            Ok(url) => self.client.put(url).send().await.map(|_| ()).map_err(RegistryError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(session = %session, error = %e, "Failed to destroy Consul session");
        }
    }
}

async fn status_error(response: reqwest::Response) -> RegistryError {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    RegistryError::Status { status, body }
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        directory: bool,
    ) -> Result<(), RegistryError> {
        let key = normalize_key(key);

        let Some(ttl) = ttl else {
            let session = self.session_for(&key).await;
            return self.write_kv(&key, value, directory, session.as_deref()).await;
        };

        if let Some(session) = self.renew_lease(&key, ttl).await? {
            return self.write_kv(&key, value, directory, Some(&session)).await;
        }

        let session = self.create_session(&key, ttl).await?;
        match self.write_kv(&key, value, directory, Some(&session)).await {
            Ok(()) => {
                self.sessions.write().await.insert(key, Lease { session, ttl });
                Ok(())
            }
            Err(e) => {
                self.destroy_session(&session).await;
                Err(e)
            }
        }
    }

    async fn refresh(&self, key: &str, _ttl: Duration) -> Result<(), RegistryError> {
        let key = normalize_key(key);
        let session = self
            .sessions
            .read()
            .await
            .get(&key)
            .map(|lease| lease.session.clone())
            .ok_or_else(|| RegistryError::KeyNotFound(key.clone()))?;

        if !self.renew_session(&session).await? {
            // Session already invalidated; its keys are gone.
            self.sessions.write().await.remove(&key);
            return Err(RegistryError::KeyNotFound(key));
        }
        Ok(())
    }

    async fn get(&self, prefix: &str, recursive: bool) -> Result<RegistryTree, RegistryError> {
        let root = normalize_key(prefix);
        let mut url = self.kv_url(&root, false)?;
        url.query_pairs_mut().append_pair("recurse", "true");

        let response = self.client.get(url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(RegistryTree::new());
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let entries: Vec<ConsulKv> = response
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;

        let mut tree = RegistryTree::new();
        for entry in entries {
            let key = normalize_key(&entry.key);
            // Consul prefixes are plain string prefixes: `foo` also lists `foobar`.
            if key != root && !is_descendant(&key, &root) {
                continue;
            }
            if entry.key.ends_with('/') {
                // The listed directory itself is not part of the result.
                if key != root {
                    tree.insert_dir(key);
                }
                continue;
            }

            let value = match entry.value {
                Some(encoded) => {
                    let bytes = general_purpose::STANDARD
                        .decode(encoded)
                        .map_err(|e| RegistryError::Decode(e.to_string()))?;
                    String::from_utf8(bytes).map_err(|e| RegistryError::Decode(e.to_string()))?
                }
                None => String::new(),
            };
            tree.insert_value(key, value);
        }

        if recursive {
            Ok(tree)
        } else {
            Ok(tree.children_of(&root))
        }
    }

    async fn delete(&self, key: &str) -> Result<(), RegistryError> {
        let key = normalize_key(key);
        let mut url = self.kv_url(&key, false)?;
        url.query_pairs_mut().append_pair("recurse", "true");

        let response = self.client.delete(url).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let released: Vec<String> = {
            let mut sessions = self.sessions.write().await;
            let keys: Vec<String> = sessions
                .keys()
                .filter(|leased| **leased == key || is_descendant(leased, &key))
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|k| sessions.remove(k))
                .map(|lease| lease.session)
                .collect()
        };
        for session in released {
            self.destroy_session(&session).await;
        }

        info!(key = %key, "Deleted key from Consul");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "consul"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const INSTANCE_KEY: &str = "/environments/dev/services/foo/1.0.0/instances/a";
    const URL_KEY: &str = "/environments/dev/services/foo/1.0.0/instances/a/url";

    #[test]
    fn test_consul_registry_creation() {
        assert!(ConsulRegistry::new("http://localhost:8500").is_ok());
        assert!(ConsulRegistry::new("not a url").is_err());
    }

    #[test]
    fn test_kv_url() {
        let consul = ConsulRegistry::new("http://localhost:8500").unwrap();
        assert_eq!(
            consul.kv_url(INSTANCE_KEY, true).unwrap().as_str(),
            "http://localhost:8500/v1/kv/environments/dev/services/foo/1.0.0/instances/a/"
        );
    }

    #[tokio::test]
    async fn test_leased_directory_shares_session_with_children() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/create"))
            .and(body_partial_json(serde_json::json!({"TTL": "30s", "Behavior": "delete"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ID": "sess-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/environments/dev/services/foo/1.0.0/instances/a/"))
            .and(query_param("acquire", "sess-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/environments/dev/services/foo/1.0.0/instances/a/url"))
            .and(query_param("acquire", "sess-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/renew/sess-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"ID": "sess-1"}])))
            .expect(1)
            .mount(&server)
            .await;

        let consul = ConsulRegistry::new(&server.uri()).unwrap();
        consul
            .put(INSTANCE_KEY, "", Some(Duration::from_secs(30)), true)
            .await
            .unwrap();
        consul.put(URL_KEY, "http://10.0.0.4:8080", None, false).await.unwrap();
        consul.refresh(INSTANCE_KEY, Duration::from_secs(30)).await.unwrap();
    }

    #[tokio::test]
    async fn test_reput_renews_the_live_session() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ID": "sess-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/renew/sess-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"ID": "sess-1"}])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/environments/dev/services/foo/1.0.0/instances/a/"))
            .and(query_param("acquire", "sess-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/destroy/sess-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(0)
            .mount(&server)
            .await;

        let consul = ConsulRegistry::new(&server.uri()).unwrap();
        for _ in 0..2 {
            consul
                .put(INSTANCE_KEY, "", Some(Duration::from_secs(30)), true)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_reput_after_lapse_takes_a_new_session() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ID": "sess-1"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ID": "sess-2"})))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/renew/sess-1"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Session id not found"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/environments/dev/services/foo/1.0.0/instances/a/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path_regex("^/v1/session/destroy/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(0)
            .mount(&server)
            .await;

        let consul = ConsulRegistry::new(&server.uri()).unwrap();
        for _ in 0..2 {
            consul
                .put(INSTANCE_KEY, "", Some(Duration::from_secs(30)), true)
                .await
                .unwrap();
        }

        let acquired: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path().starts_with("/v1/kv/"))
            .filter_map(|r| {
                r.url
                    .query_pairs()
                    .find(|(k, _)| k == "acquire")
                    .map(|(_, v)| v.into_owned())
            })
            .collect();
        assert_eq!(acquired, vec!["sess-1", "sess-2"]);
    }

    #[tokio::test]
    async fn test_rejected_acquire_destroys_the_new_session() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ID": "sess-1"})))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/environments/dev/services/foo/1.0.0/instances/a/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("false"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/session/destroy/sess-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(1)
            .mount(&server)
            .await;

        let consul = ConsulRegistry::new(&server.uri()).unwrap();
        let result = consul
            .put(INSTANCE_KEY, "", Some(Duration::from_secs(30)), true)
            .await;
        assert!(matches!(result, Err(RegistryError::Rejected { .. })));
        assert!(matches!(
            consul.refresh(INSTANCE_KEY, Duration::from_secs(30)).await,
            Err(RegistryError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_without_session_is_not_found() {
        let consul = ConsulRegistry::new("http://localhost:8500").unwrap();
        let result = consul.refresh(INSTANCE_KEY, Duration::from_secs(30)).await;
        assert!(matches!(result, Err(RegistryError::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn test_get_decodes_values_and_filters_siblings() {
        let server = MockServer::start().await;
        let encode = |s: &str| general_purpose::STANDARD.encode(s);
        Mock::given(method("GET"))
            .and(path("/v1/kv/environments/dev/services/foo"))
            .and(query_param("recurse", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"Key": "environments/dev/services/foo/1.0.0/instances/a/", "Value": null},
                {"Key": "environments/dev/services/foo/1.0.0/instances/a/url", "Value": encode("http://10.0.0.4:8080")},
                {"Key": "environments/dev/services/foobar/1.0.0/instances/b/url", "Value": encode("http://other")}
            ])))
            .mount(&server)
            .await;

        let consul = ConsulRegistry::new(&server.uri()).unwrap();
        let tree = consul.get("/environments/dev/services/foo/", true).await.unwrap();

        assert_eq!(tree.len(), 2);
        assert_eq!(tree.value(URL_KEY), Some("http://10.0.0.4:8080"));
        assert!(tree.contains(INSTANCE_KEY));
    }

    #[tokio::test]
    async fn test_get_missing_prefix_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let consul = ConsulRegistry::new(&server.uri()).unwrap();
        assert!(consul.get("/environments/dev/services/none", true).await.unwrap().is_empty());
    }
}
