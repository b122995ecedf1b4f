//! Error types for registration and discovery

use signpost_config::ConfigError;
use thiserror::Error;

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Failures reported by a [`Registry`](crate::Registry) backend
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Registry responded with {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Failed to decode registry response: {0}")]
    Decode(String),

    #[error("Registry rejected the operation on {key}: {reason}")]
    Rejected { key: String, reason: String },

    #[error("Invalid registry address: {0}")]
    InvalidAddress(String),
}

/// Service registration and discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Invalid version '{input}': {reason}")]
    VersionParse { input: String, reason: String },

    #[error("No service found for {service} matching version '{constraint}'")]
    NoMatchingVersion { service: String, constraint: String },

    #[error("No usable address for instance {instance_id} of {service}")]
    NoUsableAddress { service: String, instance_id: String },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Service {service} {version} is already registered in {environment} (singleton)")]
    AlreadyRegistered {
        service: String,
        version: String,
        environment: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl DiscoveryError {
    pub(crate) fn version_parse(input: &str, reason: impl ToString) -> Self {
        DiscoveryError::VersionParse {
            input: input.to_string(),
            reason: reason.to_string(),
        }
    }
}
