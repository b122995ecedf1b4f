//! Background registration loop
//!
//! ```text
//!   Unregistered --register ok--> Registered --refresh ok--> Registered
//!        ^   |                        |
//!        |   +--fail: backoff---+     |
//!        +------------------------+---+ refresh fail: backoff
//! ```
//!
//! Successes wait `ping_interval` before the next renewal and reset the
//! backoff. Failures wait the current backoff delay, which doubles up to the
//! configured ceiling. The loop only stops when its cancellation token fires.

use crate::error::{DiscoveryError, DiscoveryResult, RegistryError};
use crate::registration::{Registration, ServiceIdentity};
use crate::registry::{Registry, keys, normalize_key};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Enrollment state of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registered,
}

/// Whether another live, enabled instance of `identity` is registered.
///
/// `own_instance` is ignored so a singleton does not conflict with its own
/// earlier registration.
pub async fn is_service_registered(
    registry: &dyn Registry,
    identity: &ServiceIdentity,
    own_instance: &str,
) -> DiscoveryResult<bool> {
    let prefix = normalize_key(&identity.instances_prefix());
    let tree = registry.get(&prefix, true).await?;

    let mut urls = HashSet::new();
    let mut disabled = HashSet::new();
    for (key, value) in tree.values() {
        let Some(rest) = key.strip_prefix(prefix.as_str()) else {
            continue;
        };
        let mut segments = rest.trim_start_matches('/').split('/');
        match (segments.next(), segments.next(), segments.next()) {
            (Some(id), Some(keys::URL), None) => {
                urls.insert(id);
            }
            (Some(id), Some(keys::STATUS), None) if value == keys::STATUS_DISABLED => {
                disabled.insert(id);
            }
            _ => {}
        }
    }

    Ok(urls
        .iter()
        .any(|id| *id != own_instance && !disabled.contains(id)))
}

/// Drives one [`Registration`] against a registry until cancelled
pub struct RegistrationLoop {
    registry: Arc<dyn Registry>,
    registration: Arc<Registration>,
    state: watch::Sender<RegistrationState>,
    cancel: CancellationToken,
}

impl RegistrationLoop {
    pub fn new(registry: Arc<dyn Registry>, registration: Registration) -> Self {
        let (state, _) = watch::channel(RegistrationState::Unregistered);
        Self {
            registry,
            registration: Arc::new(registration),
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the loop when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Run the loop on its own tokio task
    pub fn spawn(self) -> RegistrationHandle {
        let registry = Arc::clone(&self.registry);
        let registration = Arc::clone(&self.registration);
        let state = self.state.subscribe();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(self.run());

        RegistrationHandle {
            registry,
            registration,
            state,
            cancel,
            task,
        }
    }

    /// Run the loop on the current task until cancelled
    pub async fn run(self) {
        let identity = self.registration.identity();
        let mut backoff = self.registration.retry_policy().backoff();

        info!(
            service = %identity.name,
            version = %identity.version,
            environment = %identity.environment,
            instance = %self.registration.instance_id(),
            registry = self.registry.name(),
            "Starting registration loop"
        );

        loop {
            let state = *self.state.borrow();
            let outcome = match state {
                RegistrationState::Unregistered => self.register().await,
                RegistrationState::Registered => self.refresh().await,
            };

            let delay = match outcome {
                Ok(()) => {
                    backoff.reset();
                    if state == RegistrationState::Unregistered {
                        info!(
                            service = %identity.name,
                            instance = %self.registration.instance_id(),
                            url = %self.registration.target_url(),
                            "Service registered"
                        );
                        self.state.send_replace(RegistrationState::Registered);
                    } else {
                        debug!(instance = %self.registration.instance_id(), "Registration renewed");
                    }
                    self.registration.ping_interval()
                }
                Err(e) => {
                    if state == RegistrationState::Registered {
                        self.state.send_replace(RegistrationState::Unregistered);
                    }
                    let delay = backoff.next_delay();
                    match &e {
                        DiscoveryError::AlreadyRegistered { .. } => warn!(
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Singleton service already registered, skipping registration"
                        ),
                        _ if state == RegistrationState::Registered => warn!(
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Failed to renew registration, registering again"
                        ),
                        _ => error!(
                            service = %identity.name,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Failed to register service"
                        ),
                    }
                    delay
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(instance = %self.registration.instance_id(), "Registration loop stopped");

        if self.registration.deregister_on_shutdown() {
            if let Err(e) = deregister(self.registry.as_ref(), &self.registration).await {
                warn!(error = %e, "Failed to deregister on shutdown");
            }
            self.state.send_replace(RegistrationState::Unregistered);
        }
    }

    async fn register(&self) -> DiscoveryResult<()> {
        let identity = self.registration.identity();
        let instance_id = self.registration.instance_id();

        if self.registration.singleton()
            && is_service_registered(self.registry.as_ref(), identity, instance_id).await?
        {
            return Err(DiscoveryError::AlreadyRegistered {
                service: identity.name.clone(),
                version: identity.version.to_string(),
                environment: identity.environment.clone(),
            });
        }

        self.registry
            .put(
                &self.registration.instance_key(),
                "",
                Some(self.registration.ttl()),
                true,
            )
            .await?;
        self.registry
            .put(
                &self.registration.url_key(),
                self.registration.target_url(),
                None,
                false,
            )
            .await?;
        Ok(())
    }

    async fn refresh(&self) -> DiscoveryResult<()> {
        self.registry
            .refresh(&self.registration.instance_key(), self.registration.ttl())
            .await?;
        Ok(())
    }
}

/// Delete the instance key; an already-lapsed key counts as removed.
async fn deregister(registry: &dyn Registry, registration: &Registration) -> DiscoveryResult<()> {
    match registry.delete(&registration.instance_key()).await {
        Ok(()) | Err(RegistryError::KeyNotFound(_)) => {
            info!(instance = %registration.instance_id(), "Service deregistered");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Control handle for a spawned [`RegistrationLoop`]
pub struct RegistrationHandle {
    registry: Arc<dyn Registry>,
    registration: Arc<Registration>,
    state: watch::Receiver<RegistrationState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RegistrationHandle {
    pub fn instance_id(&self) -> &str {
        self.registration.instance_id()
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    pub fn is_registered(&self) -> bool {
        self.state() == RegistrationState::Registered
    }

    /// Receiver that observes every state change
    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.state.clone()
    }

    /// Wait until the loop reports `Registered`. Returns `false` if the loop
    /// stopped first.
    pub async fn wait_registered(&self) -> bool {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == RegistrationState::Registered)
            .await
            .is_ok()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the loop and wait for it to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Registration task ended abnormally");
        }
    }

    /// Stop the loop, then delete the instance key right away instead of
    /// waiting for its lease to lapse.
    pub async fn deregister(self) -> DiscoveryResult<()> {
        let registry = Arc::clone(&self.registry);
        let registration = Arc::clone(&self.registration);
        self.shutdown().await;
        deregister(registry.as_ref(), &registration).await
    }
}
