//! Discovery facade
//!
//! [`DiscoveryClient`] owns one registry handle and the configuration it was
//! built from, and exposes registration and discovery on top of them.

use crate::consul::ConsulRegistry;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::etcd::{DEFAULT_REQUEST_TIMEOUT, EtcdRegistry};
use crate::lifecycle::{RegistrationHandle, RegistrationLoop};
use crate::registration::{DEFAULT_ENVIRONMENT, RegisterOptions, Registration};
use crate::registry::Registry;
use crate::resolver::{DiscoverOptions, DiscoveredAddress, ServiceResolver};
use signpost_config::ConfigService;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const DEFAULT_ETCD_HOST: &str = "http://localhost:2379";
const DEFAULT_CONSUL_HOST: &str = "http://localhost:8500";

/// Registry backends selectable with `discovery.extension`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Etcd,
    Consul,
}

impl Backend {
    pub fn from_name(name: &str) -> DiscoveryResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "etcd" => Ok(Backend::Etcd),
            "consul" => Ok(Backend::Consul),
            other => Err(DiscoveryError::InvalidConfiguration(format!(
                "unknown discovery backend '{}' (expected 'etcd' or 'consul')",
                other
            ))),
        }
    }

    fn hosts_key(&self) -> &'static str {
        match self {
            Backend::Etcd => "discovery.etcd.hosts",
            Backend::Consul => "discovery.consul.hosts",
        }
    }

    fn default_host(&self) -> &'static str {
        match self {
            Backend::Etcd => DEFAULT_ETCD_HOST,
            Backend::Consul => DEFAULT_CONSUL_HOST,
        }
    }
}

/// Registers this service and discovers others through one registry
pub struct DiscoveryClient {
    registry: Arc<dyn Registry>,
    config: ConfigService,
    resolver: ServiceResolver,
}

impl DiscoveryClient {
    /// Client over `registry` with an empty configuration
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            resolver: ServiceResolver::new(Arc::clone(&registry)),
            registry,
            config: ConfigService::new(),
        }
    }

    /// Client over `registry`, reading defaults from `config`.
    ///
    /// # Errors
    ///
    /// Fails when `service.env` or `discovery.fallback_to_last_known` holds a
    /// value of the wrong type.
    pub fn with_config(registry: Arc<dyn Registry>, config: ConfigService) -> DiscoveryResult<Self> {
        let environment = config
            .get_opt::<String>("service.env")?
            .map(|env| env.trim().to_string())
            .filter(|env| !env.is_empty())
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());
        let fallback = config
            .get_opt::<bool>("discovery.fallback_to_last_known")?
            .unwrap_or(true);

        let resolver = ServiceResolver::new(Arc::clone(&registry))
            .with_default_environment(environment)
            .with_fallback(fallback);

        Ok(Self {
            registry,
            config,
            resolver,
        })
    }

    /// Build the registry named by `discovery.extension` (default `etcd`).
    ///
    /// The first host of the comma-separated `discovery.{backend}.hosts` list
    /// is used; `discovery.request_timeout_ms` bounds every registry request.
    pub fn from_config(config: ConfigService) -> DiscoveryResult<Self> {
        let backend = match config.get_opt::<String>("discovery.extension")? {
            Some(name) => Backend::from_name(&name)?,
            None => Backend::Etcd,
        };
        let hosts = config
            .get_opt::<String>(backend.hosts_key())?
            .unwrap_or_else(|| backend.default_host().to_string());
        let host = first_host(&hosts).ok_or_else(|| {
            DiscoveryError::InvalidConfiguration(format!("{} is empty", backend.hosts_key()))
        })?;
        let timeout = config
            .get_opt::<u64>("discovery.request_timeout_ms")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let registry: Arc<dyn Registry> = match backend {
            Backend::Etcd => Arc::new(EtcdRegistry::with_timeout(&host, timeout)?),
            Backend::Consul => Arc::new(ConsulRegistry::with_timeout(&host, timeout)?),
        };
        info!(registry = registry.name(), host = %host, "Discovery client created");

        Self::with_config(registry, config)
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn config(&self) -> &ConfigService {
        &self.config
    }

    pub fn resolver(&self) -> &ServiceResolver {
        &self.resolver
    }

    /// Start keeping this service registered.
    ///
    /// Spawns the registration loop on the current tokio runtime and returns
    /// immediately; the handle reports when the first registration succeeds.
    pub fn register_service(&self, options: RegisterOptions) -> DiscoveryResult<RegistrationHandle> {
        let registration = Registration::resolve(&self.config, options)?;
        Ok(RegistrationLoop::new(Arc::clone(&self.registry), registration).spawn())
    }

    /// Stop renewing and remove the instance key now
    pub async fn deregister_service(&self, handle: RegistrationHandle) -> DiscoveryResult<()> {
        handle.deregister().await
    }

    /// Resolve a service to one address
    pub async fn discover_service(
        &self,
        options: &DiscoverOptions,
    ) -> DiscoveryResult<DiscoveredAddress> {
        self.resolver.discover(options).await
    }
}

/// First entry of a comma-separated host list, with `http://` added when no
/// scheme is given.
fn first_host(hosts: &str) -> Option<String> {
    let host = hosts.split(',').map(str::trim).find(|h| !h.is_empty())?;
    if host.contains("://") {
        Some(host.to_string())
    } else {
        Some(format!("http://{}", host))
    }
}
