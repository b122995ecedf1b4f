//! Integration tests for common signpost workflows.
//!
//! These tests verify that the most common use cases work correctly.

use signpost::prelude::*;
use signpost::{ConfigServiceBuilder, keys};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Helpers
// =============================================================================

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

// =============================================================================
// Registration + Discovery
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_register_from_config_file_and_discover() {
    let file = config_file(
        r#"
[service]
name = "customers"
env = "staging"
version = "1.4.2"

[server.http]
address = "10.0.0.4"
port = 8080

[discovery]
ttl = 30
ping_interval = 10
"#,
    );
    let config = ConfigServiceBuilder::new()
        .add_file_auto(file.path())
        .build()
        .unwrap();

    let registry = InMemoryRegistry::new();
    let client = DiscoveryClient::with_config(Arc::new(registry.clone()), config).unwrap();

    let handle = client.register_service(RegisterOptions::new()).unwrap();
    assert!(handle.wait_registered().await);

    let found = client
        .discover_service(&DiscoverOptions::new("customers").version("~1.4.0"))
        .await
        .unwrap();
    assert_eq!(found.address, "http://10.0.0.4:8080");
    assert!(!found.is_fallback());

    let tree = registry
        .get("/environments/staging/services/customers/", true)
        .await
        .unwrap();
    assert_eq!(
        tree.value(&keys::instance_url("staging", "customers", "1.4.2", handle.instance_id())),
        Some("http://10.0.0.4:8080")
    );

    client.deregister_service(handle).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rolling_upgrade_moves_traffic_to_new_version() {
    let registry = Arc::new(InMemoryRegistry::new());
    let client = DiscoveryClient::new(registry.clone());

    let old = client
        .register_service(
            RegisterOptions::new()
                .name("orders")
                .version("1.1.0")
                .target_url("http://orders-old:9000"),
        )
        .unwrap();
    assert!(old.wait_registered().await);

    let query = DiscoverOptions::new("orders")
        .version("^1.0.0")
        .access_type(AccessType::Direct);
    assert_eq!(
        client.discover_service(&query).await.unwrap().address,
        "http://orders-old:9000"
    );

    let new = client
        .register_service(
            RegisterOptions::new()
                .name("orders")
                .version("1.2.0")
                .target_url("http://orders-new:9000"),
        )
        .unwrap();
    assert!(new.wait_registered().await);

    for _ in 0..20 {
        assert_eq!(
            client.discover_service(&query).await.unwrap().address,
            "http://orders-new:9000"
        );
    }

    // A major bump is not picked up by a caret constraint.
    let next_major = client
        .register_service(
            RegisterOptions::new()
                .name("orders")
                .version("2.0.0")
                .target_url("http://orders-v2:9000"),
        )
        .unwrap();
    assert!(next_major.wait_registered().await);
    assert_eq!(
        client.discover_service(&query).await.unwrap().address,
        "http://orders-new:9000"
    );

    old.shutdown().await;
    new.shutdown().await;
    next_major.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lapsed_lease_falls_back_to_last_known_address() {
    let registry = InMemoryRegistry::new();
    let client = DiscoveryClient::new(Arc::new(registry.clone()));

    let handle = client
        .register_service(
            RegisterOptions::new()
                .name("billing")
                .target_url("http://billing:9000")
                .ttl(Duration::from_secs(30))
                .ping_interval(Duration::from_secs(20)),
        )
        .unwrap();
    assert!(handle.wait_registered().await);

    let query = DiscoverOptions::new("billing");
    assert_eq!(
        client.discover_service(&query).await.unwrap().address,
        "http://billing:9000"
    );

    // Stop renewing: the lease runs out and the instance disappears.
    handle.shutdown().await;
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(registry.is_empty().await);

    let found = client.discover_service(&query).await.unwrap();
    assert_eq!(found.address, "http://billing:9000");
    assert!(matches!(
        found.fallback_cause,
        Some(DiscoveryError::NoMatchingVersion { .. })
    ));
}

#[tokio::test]
async fn test_fallback_can_be_disabled_from_config() {
    let registry = InMemoryRegistry::new();
    registry
        .put(&keys::instance_url("dev", "search", "1.0.0", "a"), "http://search", None, false)
        .await
        .unwrap();

    let config = ConfigService::new();
    config.set("discovery.fallback_to_last_known", false).unwrap();
    let client = DiscoveryClient::with_config(Arc::new(registry.clone()), config).unwrap();

    let query = DiscoverOptions::new("search");
    client.discover_service(&query).await.unwrap();

    registry.clear().await;
    assert!(client.discover_service(&query).await.is_err());
}

#[tokio::test]
async fn test_registration_requires_service_name() {
    let client = DiscoveryClient::new(Arc::new(InMemoryRegistry::new()));
    assert!(matches!(
        client.register_service(RegisterOptions::new()),
        Err(DiscoveryError::InvalidConfiguration(_))
    ));
}

#[test]
fn test_client_from_config_builds_http_backend() {
    let file = config_file(
        r#"
[discovery]
extension = "etcd"
request_timeout_ms = 2000

[discovery.etcd]
hosts = "http://etcd-1:2379,http://etcd-2:2379"
"#,
    );
    let config = ConfigService::builder()
        .add_file_auto(file.path())
        .build()
        .unwrap();

    let client = DiscoveryClient::from_config(config).unwrap();
    assert_eq!(client.registry().name(), "etcd");
}
