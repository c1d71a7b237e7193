//! Shared utilities for integration tests: loopback mesh nodes, target
//! responders and relay instances in both roles.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ares_relay::config::{ProxyRouteConfig, ProxyingConfig};
use ares_relay::relay::ProxyRelay;
use ares_relay::transport::memory::MemoryMesh;
use ares_relay::transport::{AddressHash, MeshTransport};

pub const ALIAS: &str = "primary";
pub const ASPECT: &str = "default_proxy_service";

/// A relay node and a client routed through it, on one mesh.
pub struct RelayPair {
    pub mesh: MemoryMesh,
    pub node: ProxyRelay,
    pub client: ProxyRelay,
    pub exit: AddressHash,
}

pub fn node_config(aspect: &str) -> ProxyingConfig {
    ProxyingConfig {
        enabled: true,
        is_proxy_node: true,
        listen_on_aspect: aspect.to_string(),
        ..ProxyingConfig::default()
    }
}

pub fn client_config(exit: &AddressHash, aspect: &str) -> ProxyingConfig {
    ProxyingConfig {
        enabled: true,
        proxy_routes: vec![ProxyRouteConfig {
            alias: Some(ALIAS.to_string()),
            entry_destination_name: Some(format!("ares.proxy.{aspect}")),
            exit_node_identity_hash: Some(exit.to_hex()),
        }],
        ..ProxyingConfig::default()
    }
}

pub fn relay_pair() -> RelayPair {
    relay_pair_with(|exit| client_config(exit, ASPECT))
}

/// Like [`relay_pair`], with the client config built by `client`.
pub fn relay_pair_with(client: impl FnOnce(&AddressHash) -> ProxyingConfig) -> RelayPair {
    let mesh = MemoryMesh::new();
    let node_transport: Arc<dyn MeshTransport> = Arc::new(mesh.node());
    let exit = node_transport.local_identity().hash();
    let node = ProxyRelay::new(&node_config(ASPECT), Some(node_transport)).unwrap();

    let client_transport: Arc<dyn MeshTransport> = Arc::new(mesh.node());
    let client = ProxyRelay::new(&client(&exit), Some(client_transport)).unwrap();

    RelayPair {
        mesh,
        node,
        client,
        exit,
    }
}

/// Serve `target` with a responder that prefixes every payload with `re:`.
pub fn serve_echo(mesh: &MemoryMesh, target: AddressHash) {
    mesh.serve(target, |data| Some([b"re:".as_slice(), &data].concat()));
}

/// Serve `target`, staying silent for the first `silent` packets. Returns the call counter.
pub fn serve_after(mesh: &MemoryMesh, target: AddressHash, silent: u32) -> Arc<AtomicU32> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    mesh.serve(target, move |data| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        (n > silent).then_some(data)
    });
    calls
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
