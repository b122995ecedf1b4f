//! Registration state of one service instance
//!
//! A [`Registration`] is resolved once from three layers, highest first:
//! call-time [`RegisterOptions`], the [`ConfigService`], then built-in
//! defaults. The instance id is generated here and stays stable for the
//! lifetime of the process.

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::registry::keys;
use crate::version::ServiceVersion;
use signpost_config::{ConfigService, ConfigValidator, Validate};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

pub const DEFAULT_ENVIRONMENT: &str = "dev";
pub const DEFAULT_VERSION: &str = "1.0.0";
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_START_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_millis(900_000);
pub const DEFAULT_HTTP_ADDRESS: &str = "localhost";
pub const DEFAULT_HTTP_PORT: u16 = 9000;

/// Name, environment and version of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub name: String,
    pub environment: String,
    pub version: ServiceVersion,
}

impl ServiceIdentity {
    pub fn new(
        name: impl Into<String>,
        environment: impl Into<String>,
        version: &str,
    ) -> DiscoveryResult<Self> {
        Ok(Self {
            name: name.into(),
            environment: environment.into(),
            version: ServiceVersion::parse(version)?,
        })
    }

    /// `/environments/{env}/services/{name}/{version}/instances/`
    pub fn instances_prefix(&self) -> String {
        keys::instances_prefix(&self.environment, &self.name, &self.version.to_string())
    }

    /// Directory key of one instance
    pub fn instance_key(&self, instance_id: &str) -> String {
        keys::instance(
            &self.environment,
            &self.name,
            &self.version.to_string(),
            instance_id,
        )
    }

    /// `url` key inside the instance directory
    pub fn url_key(&self, instance_id: &str) -> String {
        keys::instance_url(
            &self.environment,
            &self.name,
            &self.version.to_string(),
            instance_id,
        )
    }
}

/// Delays between failed registration attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub start_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            start_delay: DEFAULT_START_RETRY_DELAY,
            max_delay: DEFAULT_MAX_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            start: self.start_delay,
            max: self.max_delay,
            current: self.start_delay.min(self.max_delay),
        }
    }
}

/// Exponential backoff: every failure waits the current delay, then doubles it
/// up to the ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    start: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Delay to wait now; the following call returns twice as much (capped).
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Back to the start delay after a success
    pub fn reset(&mut self) {
        self.current = self.start.min(self.max);
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Call-time registration settings; unset fields fall back to configuration.
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub name: Option<String>,
    pub environment: Option<String>,
    pub version: Option<String>,
    pub target_url: Option<String>,
    pub ttl: Option<Duration>,
    pub ping_interval: Option<Duration>,
    pub singleton: Option<bool>,
    pub start_retry_delay: Option<Duration>,
    pub max_retry_delay: Option<Duration>,
    pub deregister_on_shutdown: Option<bool>,
}

impl RegisterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = Some(singleton);
        self
    }

    pub fn retry_delays(mut self, start: Duration, max: Duration) -> Self {
        self.start_retry_delay = Some(start);
        self.max_retry_delay = Some(max);
        self
    }

    pub fn deregister_on_shutdown(mut self, deregister: bool) -> Self {
        self.deregister_on_shutdown = Some(deregister);
        self
    }
}

/// One service instance's registration settings
#[derive(Debug, Clone)]
pub struct Registration {
    instance_id: String,
    identity: ServiceIdentity,
    target_url: String,
    ttl: Duration,
    ping_interval: Duration,
    singleton: bool,
    retry: RetryPolicy,
    deregister_on_shutdown: bool,
}

impl Registration {
    /// Resolve options over configuration over defaults.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` when no service name is available,
    /// `VersionParse` for a malformed version and `Config` when a value fails
    /// validation.
    pub fn resolve(config: &ConfigService, options: RegisterOptions) -> DiscoveryResult<Self> {
        let name = match non_empty(options.name) {
            Some(name) => name,
            None => non_empty(config.get_opt::<String>("service.name")?).ok_or_else(|| {
                DiscoveryError::InvalidConfiguration(
                    "service name is required (service.name)".to_string(),
                )
            })?,
        };
        let environment = match non_empty(options.environment) {
            Some(env) => env,
            None => non_empty(config.get_opt::<String>("service.env")?)
                .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
        };
        let version = match non_empty(options.version) {
            Some(version) => version,
            None => non_empty(config.get_opt::<String>("service.version")?)
                .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        };
        let target_url = match non_empty(options.target_url) {
            Some(url) => url,
            None => default_target_url(config)?,
        };

        let ttl = duration_option(options.ttl, config, "discovery.ttl", Duration::from_secs)?
            .unwrap_or(DEFAULT_TTL);
        let ping_interval = duration_option(
            options.ping_interval,
            config,
            "discovery.ping_interval",
            Duration::from_secs,
        )?
        .unwrap_or(DEFAULT_PING_INTERVAL);
        let start_delay = duration_option(
            options.start_retry_delay,
            config,
            "discovery.start_retry_delay_ms",
            Duration::from_millis,
        )?
        .unwrap_or(DEFAULT_START_RETRY_DELAY);
        let max_delay = duration_option(
            options.max_retry_delay,
            config,
            "discovery.max_retry_delay_ms",
            Duration::from_millis,
        )?
        .unwrap_or(DEFAULT_MAX_RETRY_DELAY);

        let singleton = match options.singleton {
            Some(singleton) => singleton,
            None => config.get_opt("discovery.singleton")?.unwrap_or(false),
        };
        let deregister_on_shutdown = match options.deregister_on_shutdown {
            Some(deregister) => deregister,
            None => config
                .get_opt("discovery.deregister_on_shutdown")?
                .unwrap_or(false),
        };

        let registration = Self {
            instance_id: Uuid::new_v4().to_string(),
            identity: ServiceIdentity::new(name, environment, &version)?,
            target_url,
            ttl,
            ping_interval,
            singleton,
            retry: RetryPolicy {
                start_delay,
                max_delay,
            },
            deregister_on_shutdown,
        };
        registration.validate()?;

        if registration.ping_interval >= registration.ttl {
            warn!(
                service = %registration.identity.name,
                ttl_secs = registration.ttl.as_secs(),
                ping_interval_secs = registration.ping_interval.as_secs(),
                "Ping interval is not shorter than the TTL; the lease may lapse between renewals"
            );
        }

        Ok(registration)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    pub fn singleton(&self) -> bool {
        self.singleton
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn deregister_on_shutdown(&self) -> bool {
        self.deregister_on_shutdown
    }

    /// Directory key holding this instance's lease
    pub fn instance_key(&self) -> String {
        self.identity.instance_key(&self.instance_id)
    }

    pub fn url_key(&self) -> String {
        self.identity.url_key(&self.instance_id)
    }
}

impl Validate for Registration {
    fn validate(&self) -> signpost_config::Result<()> {
        ConfigValidator::not_empty(&self.identity.name, "service.name")?;
        ConfigValidator::not_empty(&self.identity.environment, "service.env")?;
        ConfigValidator::is_url(&self.target_url, "target url")?;
        ConfigValidator::positive(self.ttl.as_millis(), "discovery.ttl")?;
        ConfigValidator::positive(self.ping_interval.as_millis(), "discovery.ping_interval")?;
        ConfigValidator::positive(self.retry.start_delay.as_millis(), "discovery.start_retry_delay_ms")?;
        if self.retry.max_delay < self.retry.start_delay {
            return Err(signpost_config::ConfigError::InvalidValue {
                key: "discovery.max_retry_delay_ms".to_string(),
                message: "must not be smaller than discovery.start_retry_delay_ms".to_string(),
            });
        }
        Ok(())
    }
}

/// Blank strings count as unset.
fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn duration_option(
    option: Option<Duration>,
    config: &ConfigService,
    key: &str,
    unit: fn(u64) -> Duration,
) -> DiscoveryResult<Option<Duration>> {
    if option.is_some() {
        return Ok(option);
    }
    Ok(config.get_opt::<u64>(key)?.map(unit))
}

/// `server.base_url`, else `http://{server.http.address}:{server.http.port}`
fn default_target_url(config: &ConfigService) -> DiscoveryResult<String> {
    if let Some(base_url) = non_empty(config.get_opt::<String>("server.base_url")?) {
        return Ok(base_url);
    }
    let address = non_empty(config.get_opt::<String>("server.http.address")?)
        .unwrap_or_else(|| DEFAULT_HTTP_ADDRESS.to_string());
    let port = config
        .get_opt::<u16>("server.http.port")?
        .unwrap_or(DEFAULT_HTTP_PORT);
    ConfigValidator::is_port(port, "server.http.port")?;
    Ok(format!("http://{}:{}", address, port))
}
