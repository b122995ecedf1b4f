//! Service registration and discovery for signpost
//!
//! This crate keeps a service instance registered in a shared key-value
//! registry (etcd or Consul) and resolves other services by name and version.
//!
//! ## Features
//!
//! - **Registration loop** - Lease renewal with exponential backoff on failure
//! - **Version-aware discovery** - `^`, `~`, wildcard and range constraints
//! - **Gateway or direct access** - Per-version gateway URLs
//! - **Last-known fallback** - Serve the previous address while the registry is unavailable
//! - **Multiple Backends** - etcd, Consul, or in-memory
//!
//! ## Quick Start
//!
//! ### In-Memory Registry (Testing)
//!
//! ```rust,ignore
//! use signpost_discovery::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = DiscoveryClient::new(Arc::new(InMemoryRegistry::new()));
//!
//!     // Keep this service registered
//!     let handle = client.register_service(
//!         RegisterOptions::new()
//!             .name("customers")
//!             .version("1.2.0")
//!             .target_url("http://10.0.0.4:8080"),
//!     )?;
//!     handle.wait_registered().await;
//!
//!     // Find the latest 1.x instance
//!     let found = client
//!         .discover_service(&DiscoverOptions::new("customers").version("^1.0.0"))
//!         .await?;
//!     println!("Found: {}", found.address);
//!
//!     client.deregister_service(handle).await?;
//!     Ok(())
//! }
//! ```
//!
//! ### From Configuration
//!
//! ```rust,ignore
//! use signpost_config::ConfigService;
//! use signpost_discovery::*;
//!
//! let config = ConfigService::builder()
//!     .with_prefix("SIGNPOST")
//!     .add_optional_file("config/config.toml")
//!     .load_env()
//!     .build()?;
//!
//! // discovery.extension = "consul", discovery.consul.hosts = "consul:8500"
//! let client = DiscoveryClient::from_config(config)?;
//! let handle = client.register_service(RegisterOptions::new())?;
//! ```

pub mod client;
pub mod consul;
pub mod error;
pub mod etcd;
pub mod lifecycle;
pub mod memory;
pub mod registration;
pub mod registry;
pub mod resolver;
pub mod version;

pub use client::{Backend, DiscoveryClient};
pub use consul::ConsulRegistry;
pub use error::{DiscoveryError, DiscoveryResult, RegistryError};
pub use etcd::EtcdRegistry;
pub use lifecycle::{
    RegistrationHandle, RegistrationLoop, RegistrationState, is_service_registered,
};
pub use memory::InMemoryRegistry;
pub use registration::{
    Backoff, RegisterOptions, Registration, RetryPolicy, ServiceIdentity,
};
pub use registry::{Registry, RegistryTree, keys};
pub use resolver::{
    AccessType, DiscoverOptions, DiscoveredAddress, DiscoveredInstance, ServiceResolver,
};
pub use version::{ServiceVersion, VersionConstraint};
