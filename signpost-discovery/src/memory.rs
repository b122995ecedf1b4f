//! In-memory registry (for testing/development)

use crate::error::RegistryError;
use crate::registry::{Registry, RegistryTree, is_descendant, normalize_key};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    /// `None` marks a directory
    value: Option<String>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory registry with lease expiry, driven by `tokio::time` so paused
/// test clocks expire keys deterministically.
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    entries: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl InMemoryRegistry {
    /// Create new in-memory registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every key
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Number of live keys (directories included)
    pub async fn len(&self) -> usize {
        let mut entries = self.entries.write().await;
        purge_expired(&mut entries, Instant::now());
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Drop expired keys together with everything below them.
fn purge_expired(entries: &mut BTreeMap<String, Entry>, now: Instant) {
    let expired: Vec<String> = entries
        .iter()
        .filter(|(_, entry)| entry.is_expired(now))
        .map(|(key, _)| key.clone())
        .collect();

    for key in expired {
        entries.retain(|k, _| k != &key && !is_descendant(k, &key));
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        directory: bool,
    ) -> Result<(), RegistryError> {
        let key = normalize_key(key);
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        purge_expired(&mut entries, now);

        if let Some(existing) = entries.get(&key)
            && existing.value.is_none() != directory
        {
            let reason = if directory { "not a directory" } else { "is a directory" };
            return Err(RegistryError::Rejected {
                key,
                reason: reason.to_string(),
            });
        }

        let entry = Entry {
            value: (!directory).then(|| value.to_string()),
            expires_at: ttl.map(|ttl| now + ttl),
        };
        entries.insert(key, entry);
        Ok(())
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), RegistryError> {
        let key = normalize_key(key);
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        purge_expired(&mut entries, now);

        let entry = entries
            .get_mut(&key)
            .ok_or_else(|| RegistryError::KeyNotFound(key.clone()))?;
        entry.expires_at = Some(now + ttl);
        Ok(())
    }

    async fn get(&self, prefix: &str, recursive: bool) -> Result<RegistryTree, RegistryError> {
        let prefix = normalize_key(prefix);
        let mut entries = self.entries.write().await;
        purge_expired(&mut entries, Instant::now());

        let mut tree = RegistryTree::new();
        if let Some(Entry { value: Some(value), .. }) = entries.get(&prefix) {
            tree.insert_value(prefix.clone(), value.clone());
        }

        for (key, entry) in entries.iter().filter(|(k, _)| is_descendant(k, &prefix)) {
            match &entry.value {
                Some(value) => tree.insert_value(key.clone(), value.clone()),
                None => tree.insert_dir(key.clone()),
            }
        }

        if recursive {
            Ok(tree)
        } else {
            Ok(tree.children_of(&prefix))
        }
    }

    async fn delete(&self, key: &str) -> Result<(), RegistryError> {
        let key = normalize_key(key);
        let mut entries = self.entries.write().await;
        purge_expired(&mut entries, Instant::now());

        let before = entries.len();
        entries.retain(|k, _| k != &key && !is_descendant(k, &key));
        if entries.len() == before {
            return Err(RegistryError::KeyNotFound(key));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
