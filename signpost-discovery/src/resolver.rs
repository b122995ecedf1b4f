//! Version-aware service resolution
//!
//! One discover call reads the whole service subtree, keeps the instances at
//! the highest version satisfying the requested constraint, and picks one of
//! them at random. Gateway URLs are read from the per-version `gatewayUrl`
//! key; instances whose `status` is `disabled` never take part.

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::registration::DEFAULT_ENVIRONMENT;
use crate::registry::{Registry, keys, normalize_key};
use crate::version::{ServiceVersion, VersionConstraint};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Which address of an instance the caller wants
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AccessType {
    /// The version's gateway URL, falling back to the instance URL
    #[default]
    Gateway,
    /// Always the instance URL
    Direct,
}

impl FromStr for AccessType {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gateway" => Ok(AccessType::Gateway),
            "direct" => Ok(AccessType::Direct),
            other => Err(DiscoveryError::InvalidConfiguration(format!(
                "unknown access type '{}' (expected 'gateway' or 'direct')",
                other
            ))),
        }
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessType::Gateway => f.write_str("gateway"),
            AccessType::Direct => f.write_str("direct"),
        }
    }
}

/// What to look up
#[derive(Debug, Clone, Default)]
pub struct DiscoverOptions {
    /// Logical service name
    pub value: String,
    /// Defaults to the resolver's environment
    pub environment: Option<String>,
    /// Version constraint, `*` when unset
    pub version: Option<String>,
    pub access_type: AccessType,
}

impl DiscoverOptions {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            value: service.into(),
            ..Self::default()
        }
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn version(mut self, constraint: impl Into<String>) -> Self {
        self.version = Some(constraint.into());
        self
    }

    pub fn access_type(mut self, access_type: AccessType) -> Self {
        self.access_type = access_type;
        self
    }
}

/// One registered instance as seen by a single discover call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredInstance {
    pub id: String,
    pub version: ServiceVersion,
    pub direct_url: Option<String>,
    pub gateway_url: Option<String>,
}

impl DiscoveredInstance {
    /// Address for `access_type`, if the instance has one
    pub fn address(&self, access_type: AccessType) -> Option<&str> {
        let gateway = match access_type {
            AccessType::Gateway => self.gateway_url.as_deref(),
            AccessType::Direct => None,
        };
        gateway.or(self.direct_url.as_deref())
    }
}

/// Result of a discover call
#[derive(Debug)]
pub struct DiscoveredAddress {
    pub address: String,
    /// Instance the address belongs to; `None` for a cached fallback
    pub instance: Option<DiscoveredInstance>,
    /// Set when the live lookup failed and a previously resolved address was
    /// returned instead
    pub fallback_cause: Option<DiscoveryError>,
}

impl DiscoveredAddress {
    pub fn is_fallback(&self) -> bool {
        self.fallback_cause.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueryKey {
    environment: String,
    service: String,
    constraint: String,
    access_type: AccessType,
}

/// Resolves service names to addresses against a registry
pub struct ServiceResolver {
    registry: Arc<dyn Registry>,
    default_environment: String,
    fallback_to_last_known: bool,
    last_known: RwLock<HashMap<QueryKey, String>>,
}

impl ServiceResolver {
    /// Resolver for the `dev` environment with the last-known fallback on
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            default_environment: DEFAULT_ENVIRONMENT.to_string(),
            fallback_to_last_known: true,
            last_known: RwLock::new(HashMap::new()),
        }
    }

    /// Environment used when a query does not name one
    pub fn with_default_environment(mut self, environment: impl Into<String>) -> Self {
        self.default_environment = environment.into();
        self
    }

    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_to_last_known = enabled;
        self
    }

    pub fn default_environment(&self) -> &str {
        &self.default_environment
    }

    /// Every enabled instance of `service` in `environment`, across versions.
    ///
    /// Instances with an unparsable version tag are skipped.
    pub async fn instances(
        &self,
        environment: &str,
        service: &str,
    ) -> DiscoveryResult<Vec<DiscoveredInstance>> {
        let prefix = normalize_key(&keys::service_prefix(environment, service));
        let tree = self.registry.get(&prefix, true).await?;

        #[derive(Default)]
        struct Draft<'a> {
            url: Option<&'a str>,
            disabled: bool,
        }

        // version tag -> instance id -> draft
        let mut drafts: BTreeMap<&str, BTreeMap<&str, Draft<'_>>> = BTreeMap::new();
        let mut gateways: HashMap<&str, &str> = HashMap::new();

        for (key, value) in tree.iter() {
            let Some(rest) = key.strip_prefix(prefix.as_str()) else {
                continue;
            };
            let segments: Vec<&str> = rest.trim_start_matches('/').split('/').collect();
            match segments.as_slice() {
                [tag, keys::GATEWAY_URL] => {
                    if let Some(url) = value {
                        gateways.insert(*tag, url);
                    }
                }
                [tag, keys::INSTANCES, id] => {
                    drafts.entry(*tag).or_default().entry(*id).or_default();
                }
                [tag, keys::INSTANCES, id, leaf] => {
                    let draft = drafts.entry(*tag).or_default().entry(*id).or_default();
                    match (*leaf, value) {
                        (keys::URL, Some(url)) => draft.url = Some(url),
                        (keys::STATUS, Some(status)) => {
                            draft.disabled = status == keys::STATUS_DISABLED
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        let mut instances = Vec::new();
        for (tag, ids) in drafts {
            let version = match ServiceVersion::parse(tag) {
                Ok(version) => version,
                Err(e) => {
                    warn!(service = %service, tag = %tag, error = %e, "Skipping instances with invalid version tag");
                    continue;
                }
            };
            let gateway_url = gateways.get(tag).map(|url| url.to_string());

            for (id, draft) in ids {
                if draft.disabled {
                    debug!(service = %service, instance = %id, "Skipping disabled instance");
                    continue;
                }
                instances.push(DiscoveredInstance {
                    id: id.to_string(),
                    version: version.clone(),
                    direct_url: draft.url.map(str::to_string),
                    gateway_url: gateway_url.clone(),
                });
            }
        }

        debug!(
            service = %service,
            environment = %environment,
            count = instances.len(),
            "Discovered service instances"
        );
        Ok(instances)
    }

    /// Resolve `options` to one address.
    ///
    /// # Errors
    ///
    /// A malformed version constraint or an empty service name always fails.
    /// Other failures return the last address resolved for the same query
    /// when the fallback is enabled and one is cached.
    pub async fn discover(&self, options: &DiscoverOptions) -> DiscoveryResult<DiscoveredAddress> {
        if options.value.trim().is_empty() {
            return Err(DiscoveryError::InvalidConfiguration(
                "service name is required".to_string(),
            ));
        }
        let constraint = match &options.version {
            Some(version) => VersionConstraint::parse(version)?,
            None => VersionConstraint::any(),
        };
        let environment = options
            .environment
            .as_deref()
            .map(str::trim)
            .filter(|env| !env.is_empty())
            .unwrap_or(self.default_environment.as_str())
            .to_string();

        let query = QueryKey {
            environment,
            service: options.value.clone(),
            constraint: constraint.as_str().to_string(),
            access_type: options.access_type,
        };

        match self.lookup(&query, &constraint).await {
            Ok((instance, address)) => {
                if self.fallback_to_last_known {
                    self.last_known
                        .write()
                        .await
                        .insert(query, address.clone());
                }
                Ok(DiscoveredAddress {
                    address,
                    instance: Some(instance),
                    fallback_cause: None,
                })
            }
            Err(e) => {
                if !self.fallback_to_last_known {
                    return Err(e);
                }
                let cached = self.last_known.read().await.get(&query).cloned();
                match cached {
                    Some(address) => {
                        warn!(
                            service = %query.service,
                            environment = %query.environment,
                            address = %address,
                            error = %e,
                            "Discovery failed, using last known address"
                        );
                        Ok(DiscoveredAddress {
                            address,
                            instance: None,
                            fallback_cause: Some(e),
                        })
                    }
                    None => Err(e),
                }
            }
        }
    }

    async fn lookup(
        &self,
        query: &QueryKey,
        constraint: &VersionConstraint,
    ) -> DiscoveryResult<(DiscoveredInstance, String)> {
        let instances = self.instances(&query.environment, &query.service).await?;
        let mut latest = constraint.select_latest(instances, |i| &i.version);

        if latest.is_empty() {
            return Err(DiscoveryError::NoMatchingVersion {
                service: query.service.clone(),
                constraint: constraint.to_string(),
            });
        }

        // An instance directory can exist briefly before its url key.
        let (mut usable, unusable): (Vec<_>, Vec<_>) = latest
            .into_iter()
            .partition(|i| i.address(query.access_type).is_some());
        if usable.is_empty() {
            let instance_id = unusable.into_iter().next().map(|i| i.id).unwrap_or_default();
            return Err(DiscoveryError::NoUsableAddress {
                service: query.service.clone(),
                instance_id,
            });
        }

        let index = rand::rng().random_range(0..usable.len());
        let instance = usable.swap_remove(index);
        let address = instance
            .address(query.access_type)
            .unwrap_or_default()
            .to_string();
        Ok((instance, address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRegistry;
    use std::collections::HashSet;

    async fn add_instance(registry: &InMemoryRegistry, version: &str, id: &str, url: &str) {
        registry
            .put(&keys::instance_url("dev", "customers", version, id), url, None, false)
            .await
            .unwrap();
    }

    fn resolver(registry: &InMemoryRegistry) -> ServiceResolver {
        ServiceResolver::new(Arc::new(registry.clone()))
    }

    #[tokio::test]
    async fn test_latest_matching_version_wins() {
        let registry = InMemoryRegistry::new();
        add_instance(&registry, "1.0.0", "a", "http://a").await;
        add_instance(&registry, "1.2.0", "b", "http://b").await;
        add_instance(&registry, "1.2.5", "c", "http://c").await;
        add_instance(&registry, "2.0.0", "d", "http://d").await;

        let resolver = resolver(&registry);
        for _ in 0..10 {
            let found = resolver
                .discover(&DiscoverOptions::new("customers").version("^1.0.0"))
                .await
                .unwrap();
            assert_eq!(found.address, "http://c");
            assert_eq!(found.instance.unwrap().version.to_string(), "1.2.5");
        }

        let found = resolver
            .discover(&DiscoverOptions::new("customers"))
            .await
            .unwrap();
        assert_eq!(found.address, "http://d");
    }

    #[tokio::test]
    async fn test_random_pick_reaches_every_instance() {
        let registry = InMemoryRegistry::new();
        add_instance(&registry, "1.0.0", "a", "http://a").await;
        add_instance(&registry, "1.0.0", "b", "http://b").await;

        let resolver = resolver(&registry);
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let found = resolver
                .discover(&DiscoverOptions::new("customers").version("*"))
                .await
                .unwrap();
            seen.insert(found.address);
        }
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_gateway_and_direct_access() {
        let registry = InMemoryRegistry::new();
        add_instance(&registry, "1.0.0", "a", "http://10.0.0.4:8080").await;
        registry
            .put(&keys::gateway_url("dev", "customers", "1.0.0"), "https://gw/customers", None, false)
            .await
            .unwrap();

        let resolver = resolver(&registry);
        let gateway = resolver
            .discover(&DiscoverOptions::new("customers"))
            .await
            .unwrap();
        assert_eq!(gateway.address, "https://gw/customers");

        let direct = resolver
            .discover(&DiscoverOptions::new("customers").access_type(AccessType::Direct))
            .await
            .unwrap();
        assert_eq!(direct.address, "http://10.0.0.4:8080");
    }

    #[tokio::test]
    async fn test_gateway_access_without_gateway_uses_direct_url() {
        let registry = InMemoryRegistry::new();
        add_instance(&registry, "1.0.0", "a", "http://10.0.0.4:8080").await;

        let found = resolver(&registry)
            .discover(&DiscoverOptions::new("customers").access_type(AccessType::Gateway))
            .await
            .unwrap();
        assert_eq!(found.address, "http://10.0.0.4:8080");
    }

    #[tokio::test]
    async fn test_instance_without_url() {
        let registry = InMemoryRegistry::new();
        registry
            .put(&keys::instance("dev", "customers", "1.0.0", "a"), "", None, true)
            .await
            .unwrap();

        let result = resolver(&registry)
            .discover(&DiscoverOptions::new("customers"))
            .await;
        assert!(matches!(
            result,
            Err(DiscoveryError::NoUsableAddress { instance_id, .. }) if instance_id == "a"
        ));
    }

    #[tokio::test]
    async fn test_instances_without_url_are_skipped() {
        let registry = InMemoryRegistry::new();
        add_instance(&registry, "1.0.0", "a", "http://a").await;
        registry
            .put(&keys::instance("dev", "customers", "1.0.0", "b"), "", None, true)
            .await
            .unwrap();

        let resolver = resolver(&registry);
        for access_type in [AccessType::Direct, AccessType::Gateway] {
            for _ in 0..50 {
                let found = resolver
                    .discover(&DiscoverOptions::new("customers").access_type(access_type))
                    .await
                    .unwrap();
                assert_eq!(found.address, "http://a");
                assert_eq!(found.instance.unwrap().id, "a");
            }
        }
    }

    #[tokio::test]
    async fn test_no_instances() {
        let registry = InMemoryRegistry::new();
        let result = resolver(&registry)
            .discover(&DiscoverOptions::new("customers").version("^1.0.0"))
            .await;
        assert!(matches!(result, Err(DiscoveryError::NoMatchingVersion { .. })));
    }

    #[tokio::test]
    async fn test_invalid_tags_are_skipped() {
        let registry = InMemoryRegistry::new();
        add_instance(&registry, "latest", "a", "http://a").await;
        add_instance(&registry, "1.0.0", "b", "http://b").await;

        let resolver = resolver(&registry);
        let instances = resolver.instances("dev", "customers").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "b");
    }

    #[tokio::test]
    async fn test_disabled_instances_are_excluded() {
        let registry = InMemoryRegistry::new();
        add_instance(&registry, "2.0.0", "a", "http://a").await;
        add_instance(&registry, "1.0.0", "b", "http://b").await;
        registry
            .put(
                &format!("{}/status", keys::instance("dev", "customers", "2.0.0", "a")),
                "disabled",
                None,
                false,
            )
            .await
            .unwrap();

        let found = resolver(&registry)
            .discover(&DiscoverOptions::new("customers"))
            .await
            .unwrap();
        assert_eq!(found.address, "http://b");
    }

    #[tokio::test]
    async fn test_malformed_constraint_never_falls_back() {
        let registry = InMemoryRegistry::new();
        let result = resolver(&registry)
            .discover(&DiscoverOptions::new("customers").version(">=one"))
            .await;
        assert!(matches!(result, Err(DiscoveryError::VersionParse { .. })));
    }

    #[tokio::test]
    async fn test_fallback_to_last_known_address() {
        let registry = InMemoryRegistry::new();
        add_instance(&registry, "1.0.0", "a", "http://a").await;

        let resolver = resolver(&registry);
        let options = DiscoverOptions::new("customers").version("^1.0.0");
        assert!(!resolver.discover(&options).await.unwrap().is_fallback());

        registry.clear().await;
        let found = resolver.discover(&options).await.unwrap();
        assert_eq!(found.address, "http://a");
        assert!(matches!(
            found.fallback_cause,
            Some(DiscoveryError::NoMatchingVersion { .. })
        ));

        // Different query key: nothing cached.
        let other = DiscoverOptions::new("customers").version("^2.0.0");
        assert!(resolver.discover(&other).await.is_err());
    }

    #[tokio::test]
    async fn test_fallback_disabled() {
        let registry = InMemoryRegistry::new();
        add_instance(&registry, "1.0.0", "a", "http://a").await;

        let resolver = resolver(&registry).with_fallback(false);
        let options = DiscoverOptions::new("customers");
        resolver.discover(&options).await.unwrap();

        registry.clear().await;
        assert!(resolver.discover(&options).await.is_err());
    }

    #[tokio::test]
    async fn test_default_environment() {
        let registry = InMemoryRegistry::new();
        registry
            .put(&keys::instance_url("prod", "customers", "1.0.0", "a"), "http://prod", None, false)
            .await
            .unwrap();

        let resolver = resolver(&registry).with_default_environment("prod");
        let found = resolver
            .discover(&DiscoverOptions::new("customers"))
            .await
            .unwrap();
        assert_eq!(found.address, "http://prod");
    }

    #[tokio::test]
    async fn test_blank_environment_uses_default() {
        let registry = InMemoryRegistry::new();
        add_instance(&registry, "1.0.0", "a", "http://a").await;

        let resolver = resolver(&registry);
        for environment in ["", "   "] {
            let found = resolver
                .discover(&DiscoverOptions::new("customers").environment(environment))
                .await
                .unwrap();
            assert_eq!(found.address, "http://a");
        }
        let found = resolver
            .discover(&DiscoverOptions::new("customers").environment(" dev "))
            .await
            .unwrap();
        assert_eq!(found.address, "http://a");
    }

    #[test]
    fn test_access_type_parsing() {
        assert_eq!("Gateway".parse::<AccessType>().unwrap(), AccessType::Gateway);
        assert_eq!("direct".parse::<AccessType>().unwrap(), AccessType::Direct);
        assert!("proxy".parse::<AccessType>().is_err());
        assert_eq!(AccessType::default(), AccessType::Gateway);
    }
}
