// Signpost - client-side service discovery for Rust
//
// Registers a running service instance in a shared key-value registry (etcd
// or Consul), keeps its lease alive, and resolves other services by name and
// semantic-version constraint.

// Re-export discovery functionality
pub use signpost_discovery::*;

// Re-export configuration
pub use signpost_config;
pub use signpost_config::{ConfigService, ConfigServiceBuilder, FileFormat};

pub mod logging;

/// Prelude for common imports.
///
/// ```rust,ignore
/// use signpost::prelude::*;
/// ```
pub mod prelude {
    pub use signpost_config::{ConfigService, FileFormat};
    pub use signpost_discovery::{
        AccessType, DiscoverOptions, DiscoveredAddress, DiscoveryClient, DiscoveryError,
        InMemoryRegistry, RegisterOptions, Registry, RegistrationHandle, RegistrationState,
    };
}
