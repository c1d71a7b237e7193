//! Relay requests through the application: retries and circuit breaking.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use ares_relay::config::AresConfig;
use ares_relay::lifecycle::{Ares, RequestError};
use ares_relay::relay::RelayError;
use ares_relay::resilience::CircuitState;
use ares_relay::transport::memory::MemoryMesh;
use ares_relay::transport::{AddressHash, MeshTransport};

mod common;

/// A relay node application and a client application on one mesh.
fn applications(client_config: impl FnOnce(&mut AresConfig)) -> (MemoryMesh, Ares, Ares) {
    let mesh = MemoryMesh::new();

    let node_transport: Arc<dyn MeshTransport> = Arc::new(mesh.node());
    let exit = node_transport.local_identity().hash();
    let mut node_config = AresConfig::default();
    node_config.destination_proxying = common::node_config(common::ASPECT);
    let node = Ares::new(node_config, Some(node_transport));
    node.init_features();

    let mut config = AresConfig::default();
    config.destination_proxying = common::client_config(&exit, common::ASPECT);
    client_config(&mut config);
    let client = Ares::new(config, Some(Arc::new(mesh.node())));
    client.init_features();

    (mesh, node, client)
}

#[tokio::test(start_paused = true)]
async fn test_transient_timeout_is_retried() {
    let (mesh, _node, client) = applications(|config| {
        config.request_retries.enabled = true;
        config.request_retries.default_max_retries = 3;
        config.request_retries.default_delay_seconds = 0.1;
        config.request_retries.default_jitter_max_seconds = 0.0;
    });
    let target = AddressHash::random();
    let calls = common::serve_after(&mesh, target, 1);

    let reply = client
        .request_via_proxy(&target.to_hex(), b"ping", None, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply, b"ping");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stats = client.retry_executor().unwrap().stats();
    assert_eq!(stats.executions, 1);
    assert_eq!(stats.successes_on_retry, 1);
}

#[tokio::test]
async fn test_breaker_opens_on_repeated_delivery_failure() {
    let (_mesh, _node, client) = applications(|config| {
        config.circuit_breaker.failure_threshold = 2;
        config.circuit_breaker.recovery_timeout_seconds = 60.0;
    });
    let target = AddressHash::random().to_hex();
    let timeout = Duration::from_secs(2);

    for _ in 0..2 {
        let err = client
            .request_via_proxy(&target, b"x", None, timeout)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RequestError::Failed {
                attempts: 1,
                source: RelayError::DeliveryFailure(_)
            }
        ));
    }

    let err = client
        .request_via_proxy(&target, b"x", None, timeout)
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::CircuitOpen(ref name) if name == "proxy:default"));
    assert_eq!(client.breakers().get("proxy:default").state(), CircuitState::Open);
}

#[tokio::test]
async fn test_status_reports_both_roles() {
    let (mesh, node, client) = applications(|_| {});
    let target = AddressHash::random();
    common::serve_echo(&mesh, target);

    client
        .request_via_proxy(&target.to_hex(), b"hi", Some(common::ALIAS), Duration::from_secs(2))
        .await
        .unwrap();

    let node_status = node.status();
    let proxy = node_status.proxy.unwrap();
    assert!(proxy.listening_on.is_some());
    assert_eq!(proxy.pending_requests, 0);

    let client_status = client.status();
    assert_eq!(client_status.active_features, 1);
    assert_eq!(client_status.proxy.unwrap().routes, vec![common::ALIAS.to_string()]);
    assert_eq!(client_status.circuit_breakers[0].name, "proxy:primary");
}
