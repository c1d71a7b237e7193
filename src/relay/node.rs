//! Relay-node role: accept client links and forward their requests.

use std::sync::{Arc, Weak};

use crate::observability::metrics::{self, PacketDirection};
use crate::relay::protocol::{ProtocolError, RelayMessage, RequestId, DELIVERY_FAILURE_CODE};
use crate::relay::{RelayError, RelayRole, RelayShared};
use crate::transport::{Direction, Link, LinkCallbacks, LinkId, ResponseHandler, TargetResponse};

/// Endpoint name prefix; the configured aspect is appended.
pub const LISTEN_PREFIX: &str = "ares.proxy";

/// Alias under which node-side packets are counted.
pub const NODE_METRIC_ALIAS: &str = "proxy_node_service";

/// Open the listening endpoint and store it, unless the role moved on meanwhile.
pub(crate) fn start_listening(shared: &Arc<RelayShared>) -> Result<(), RelayError> {
    let transport = shared
        .transport
        .as_ref()
        .ok_or(RelayError::TransportUnavailable)?;
    let name = format!("{LISTEN_PREFIX}.{}", shared.state().listen_aspect);
    let endpoint = transport.endpoint(&transport.local_identity(), Direction::In, &name)?;

    let weak = Arc::downgrade(shared);
    let listener = transport.listen(
        &endpoint,
        Arc::new(move |link: Arc<dyn Link>| match weak.upgrade() {
            Some(shared) => accept_link(&shared, link),
            None => link.close(),
        }),
    )?;

    let stale = {
        let mut state = shared.state();
        if state.role == RelayRole::Node && state.listener.is_none() {
            state.listener = Some(listener);
            None
        } else {
            Some(listener)
        }
    };
    match stale {
        Some(listener) => listener.close(),
        None => tracing::info!(
            parent: &shared.span,
            endpoint = %endpoint.hash,
            name = %name,
            "Relay node listening"
        ),
    }
    Ok(())
}

fn accept_link(shared: &Arc<RelayShared>, link: Arc<dyn Link>) {
    let link_id = link.id();
    let weak_shared = Arc::downgrade(shared);
    let weak_link = Arc::downgrade(&link);
    link.set_callbacks(
        LinkCallbacks::new()
            .on_message({
                let weak_shared = weak_shared.clone();
                move |data| {
                    if let (Some(shared), Some(link)) = (weak_shared.upgrade(), weak_link.upgrade()) {
                        handle_request(&shared, &link, data);
                    }
                }
            })
            .on_closed(move |id| {
                if let Some(shared) = weak_shared.upgrade() {
                    link_closed(&shared, id);
                }
            }),
    );

    let count = {
        let mut state = shared.state();
        if state.role != RelayRole::Node {
            None
        } else {
            state.links.insert(link_id, link.clone());
            Some(state.links.len())
        }
    };
    match count {
        Some(count) => {
            tracing::info!(parent: &shared.span, link_id = %link_id, active = count, "Client link accepted");
            metrics::set_active_proxy_clients(count);
        }
        None => link.close(),
    }
}

fn handle_request(shared: &Arc<RelayShared>, link: &Arc<dyn Link>, data: Vec<u8>) {
    let version = shared.state().protocol_version.clone();

    let message = match RelayMessage::decode(&data) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(parent: &shared.span, link_id = %link.id(), error = %e, "Undecodable relay request");
            reply_error(shared, link, &version, None, &e.to_string());
            return;
        }
    };
    let request = match message.validate_request(&version) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(
                parent: &shared.span,
                link_id = %link.id(),
                request_id = ?message.request_id,
                error = %e,
                "Relay request rejected"
            );
            reply_error(shared, link, &version, message.request_id, &e.to_string());
            return;
        }
    };

    let request_id = request.id;
    if request.expects_response() {
        let duplicate = {
            let mut state = shared.state();
            if state.pending.contains_key(&request_id) {
                true
            } else {
                state.pending.insert(request_id, link.clone());
                false
            }
        };
        if duplicate {
            let e = ProtocolError::DuplicateRequestId(request_id);
            tracing::warn!(parent: &shared.span, request_id = %request_id, "Duplicate request id");
            reply_error(shared, link, &version, Some(request_id.to_hex()), &e.to_string());
            return;
        }
    }

    let on_response = request.expects_response().then(|| {
        let weak: Weak<RelayShared> = Arc::downgrade(shared);
        Box::new(move |response: TargetResponse| {
            if let Some(shared) = weak.upgrade() {
                forward_response(&shared, request_id, response);
            }
        }) as ResponseHandler
    });

    let sent = match shared.transport.as_ref() {
        Some(transport) => transport
            .send_packet(&request.target, request.payload, on_response)
            .map_err(RelayError::from),
        None => Err(RelayError::TransportUnavailable),
    };

    match sent {
        Ok(()) => {
            metrics::record_proxied_packet(NODE_METRIC_ALIAS, PacketDirection::SentToTarget);
            tracing::info!(
                parent: &shared.span,
                request_id = %request_id,
                target = %request.target.short(),
                kind = ?request.kind,
                "Request forwarded to target"
            );
        }
        Err(e) => {
            tracing::error!(
                parent: &shared.span,
                request_id = %request_id,
                target = %request.target.short(),
                error = %e,
                "Failed to send to target"
            );
            shared.state().pending.remove(&request_id);
            let code = format!("{DELIVERY_FAILURE_CODE}: {e}");
            reply_error(shared, link, &version, Some(request_id.to_hex()), &code);
        }
    }
}

fn forward_response(shared: &Arc<RelayShared>, request_id: RequestId, response: TargetResponse) {
    let (link, version) = {
        let mut state = shared.state();
        (state.pending.remove(&request_id), state.protocol_version.clone())
    };
    let Some(link) = link else {
        tracing::warn!(parent: &shared.span, request_id = %request_id, "Response with no pending request dropped");
        return;
    };
    if !link.is_active() {
        tracing::warn!(
            parent: &shared.span,
            request_id = %request_id,
            link_id = %link.id(),
            "Originating link gone; response dropped"
        );
        return;
    }

    let message = RelayMessage::response(&version, request_id, response.source, &response.data);
    let sent = message
        .encode()
        .map_err(RelayError::from)
        .and_then(|bytes| link.send(&bytes).map_err(RelayError::from));
    match sent {
        Ok(()) => {
            metrics::record_proxied_packet(NODE_METRIC_ALIAS, PacketDirection::ResponseToClient);
            tracing::info!(
                parent: &shared.span,
                request_id = %request_id,
                bytes = response.data.len(),
                "Response relayed to client"
            );
        }
        Err(e) => {
            tracing::error!(parent: &shared.span, request_id = %request_id, error = %e, "Failed to relay response");
            let code = format!("{DELIVERY_FAILURE_CODE}: {e}");
            reply_error(shared, &link, &version, Some(request_id.to_hex()), &code);
        }
    }
}

fn link_closed(shared: &Arc<RelayShared>, link_id: LinkId) {
    let (removed, dropped, active) = {
        let mut state = shared.state();
        let removed = state.links.remove(&link_id).is_some();
        let before = state.pending.len();
        state.pending.retain(|_, link| link.id() != link_id);
        (removed, before - state.pending.len(), state.links.len())
    };
    if removed {
        tracing::info!(
            parent: &shared.span,
            link_id = %link_id,
            dropped_requests = dropped,
            active,
            "Client link closed"
        );
        metrics::set_active_proxy_clients(active);
    }
}

/// Best-effort in-band error; failures are only logged.
fn reply_error(
    shared: &RelayShared,
    link: &Arc<dyn Link>,
    version: &str,
    request_id: Option<String>,
    code: &str,
) {
    if !link.is_active() {
        tracing::debug!(parent: &shared.span, link_id = %link.id(), error = code, "Link inactive; error not sent");
        return;
    }
    let sent = RelayMessage::error(version, request_id, code)
        .encode()
        .map_err(RelayError::from)
        .and_then(|bytes| link.send(&bytes).map_err(RelayError::from));
    match sent {
        Ok(()) => metrics::record_proxied_packet(NODE_METRIC_ALIAS, PacketDirection::ErrorToClient),
        Err(e) => tracing::warn!(parent: &shared.span, link_id = %link.id(), error = %e, "Failed to send error response"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::{mpsc, oneshot};

    use super::*;
    use crate::config::ProxyingConfig;
    use crate::relay::protocol::{MessageKind, PROTOCOL_VERSION};
    use crate::relay::ProxyRelay;
    use crate::transport::memory::MemoryMesh;
    use crate::transport::{AddressHash, MeshTransport, TransportError};

    struct Harness {
        mesh: MemoryMesh,
        relay: ProxyRelay,
        link: Arc<dyn Link>,
        inbox: mpsc::UnboundedReceiver<RelayMessage>,
    }

    async fn harness() -> Harness {
        let mesh = MemoryMesh::new();
        let node: Arc<dyn MeshTransport> = Arc::new(mesh.node());
        let config = ProxyingConfig {
            is_proxy_node: true,
            ..ProxyingConfig::default()
        };
        let relay = ProxyRelay::new(&config, Some(node)).unwrap();
        let endpoint_in = relay.listen_endpoint().unwrap();

        let client = mesh.node();
        let endpoint = client
            .endpoint(&endpoint_in.identity, Direction::Out, &endpoint_in.name)
            .unwrap();
        let (tx, inbox) = mpsc::unbounded_channel();
        let (est_tx, est_rx) = oneshot::channel();
        let est_tx = Mutex::new(Some(est_tx));
        let link = client
            .open_link(
                &endpoint,
                LinkCallbacks::new()
                    .on_established(move |_| {
                        if let Some(tx) = est_tx.lock().unwrap().take() {
                            let _ = tx.send(());
                        }
                    })
                    .on_message(move |data| {
                        let _ = tx.send(RelayMessage::decode(&data).unwrap());
                    }),
            )
            .unwrap();
        est_rx.await.unwrap();

        Harness {
            mesh,
            relay,
            link,
            inbox,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn request(id: RequestId, target: AddressHash, payload: &[u8]) -> Vec<u8> {
        RelayMessage::request(PROTOCOL_VERSION, MessageKind::Request, id, &target, payload)
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_clears_pending() {
        let mut h = harness().await;
        let target = AddressHash::random();
        h.mesh.serve(target, |data| Some([b"re:".as_slice(), &data].concat()));

        let id = RequestId::random();
        h.link.send(&request(id, target, b"P")).unwrap();

        let reply = h.inbox.recv().await.unwrap();
        assert_eq!(reply.kind, Some(MessageKind::Response));
        assert_eq!(reply.request_id, Some(id.to_hex()));
        assert_eq!(reply.decode_payload().unwrap().unwrap(), b"re:P");
        assert_eq!(reply.source_destination_hash, Some(target.to_hex()));
        assert!(!h.relay.is_pending(&id));
        assert_eq!(h.relay.active_links(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_reports_in_band() {
        let mut h = harness().await;
        let id = RequestId::random();
        h.link.send(&request(id, AddressHash::random(), b"P")).unwrap();

        let reply = h.inbox.recv().await.unwrap();
        assert_eq!(reply.request_id, Some(id.to_hex()));
        assert!(reply.error.unwrap().starts_with("delivery_failure: "));
        assert_eq!(h.relay.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_rejections() {
        let mut h = harness().await;

        let mut msg = RelayMessage::request(
            "9.9",
            MessageKind::Request,
            RequestId::random(),
            &AddressHash::random(),
            b"x",
        );
        h.link.send(&msg.encode().unwrap()).unwrap();
        let reply = h.inbox.recv().await.unwrap();
        assert_eq!(reply.error.as_deref(), Some("incompatible_protocol_version"));

        msg.version = Some(PROTOCOL_VERSION.into());
        msg.target_destination_hash = None;
        h.link.send(&msg.encode().unwrap()).unwrap();
        let reply = h.inbox.recv().await.unwrap();
        assert_eq!(reply.error.as_deref(), Some("invalid_request_format"));
        assert_eq!(reply.request_id, msg.request_id);

        msg.target_destination_hash = Some("not-a-hash".into());
        h.link.send(&msg.encode().unwrap()).unwrap();
        let reply = h.inbox.recv().await.unwrap();
        assert_eq!(reply.error.as_deref(), Some("invalid_target_hash_format"));

        h.link.send(b"{not json").unwrap();
        let reply = h.inbox.recv().await.unwrap();
        assert!(reply.error.unwrap().starts_with("request_decode_error: "));
        assert!(reply.request_id.is_none());

        assert_eq!(h.relay.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected() {
        let mut h = harness().await;
        let target = AddressHash::random();
        h.mesh.serve(target, |_| None);

        let id = RequestId::random();
        h.link.send(&request(id, target, b"one")).unwrap();
        h.link.send(&request(id, target, b"two")).unwrap();

        let reply = h.inbox.recv().await.unwrap();
        assert_eq!(reply.error.as_deref(), Some("duplicate_request_id"));
        assert!(h.relay.is_pending(&id));
    }

    #[tokio::test]
    async fn test_oneway_is_not_tracked() {
        let h = harness().await;
        let target = AddressHash::random();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        h.mesh.serve(target, move |data| {
            let _ = seen_tx.send(data);
            Some(b"ignored".to_vec())
        });

        let id = RequestId::random();
        let msg = RelayMessage::request(PROTOCOL_VERSION, MessageKind::DataOneway, id, &target, b"fire");
        h.link.send(&msg.encode().unwrap()).unwrap();

        assert_eq!(seen_rx.recv().await.unwrap(), b"fire");
        assert_eq!(h.relay.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_link_close_drops_its_pending_requests() {
        let h = harness().await;
        let target = AddressHash::random();
        h.mesh.serve(target, |_| None);

        h.link.send(&request(RequestId::random(), target, b"a")).unwrap();
        h.link.send(&request(RequestId::random(), target, b"b")).unwrap();
        eventually(|| h.relay.pending_requests() == 2).await;

        h.link.close();
        eventually(|| h.relay.active_links() == 0).await;
        assert_eq!(h.relay.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_client_links() {
        let h = harness().await;
        eventually(|| h.relay.active_links() == 1).await;

        h.relay.shutdown();
        eventually(|| !h.link.is_active()).await;
        assert_eq!(h.relay.active_links(), 0);
        assert!(h.relay.listen_endpoint().is_none());
    }

    /// A client link whose liveness and next send outcome are set by the test.
    struct ScriptedLink {
        id: LinkId,
        active: AtomicBool,
        fail_next_send: AtomicBool,
        sent: Mutex<Vec<RelayMessage>>,
    }

    impl ScriptedLink {
        fn new(active: bool, fail_next_send: bool) -> Arc<Self> {
            Arc::new(Self {
                id: LinkId::new(),
                active: AtomicBool::new(active),
                fail_next_send: AtomicBool::new(fail_next_send),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<RelayMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Link for ScriptedLink {
        fn id(&self) -> LinkId {
            self.id
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        fn send(&self, data: &[u8]) -> Result<(), TransportError> {
            if self.fail_next_send.swap(false, Ordering::SeqCst) {
                return Err(TransportError::Other("send buffer full".into()));
            }
            self.sent.lock().unwrap().push(RelayMessage::decode(data).unwrap());
            Ok(())
        }

        fn close(&self) {
            self.active.store(false, Ordering::SeqCst);
        }

        fn set_callbacks(&self, _callbacks: LinkCallbacks) {}
    }

    fn target_response(data: &[u8]) -> TargetResponse {
        TargetResponse {
            data: data.to_vec(),
            source: None,
        }
    }

    #[tokio::test]
    async fn test_response_for_closed_link_is_dropped() {
        let h = harness().await;
        let link = ScriptedLink::new(false, false);
        let id = RequestId::random();
        h.relay.shared.state().pending.insert(id, link.clone());

        forward_response(&h.relay.shared, id, target_response(b"late"));

        assert!(link.sent().is_empty());
        assert!(!h.relay.is_pending(&id));
    }

    #[tokio::test]
    async fn test_failed_response_forward_reports_in_band() {
        let h = harness().await;
        let link = ScriptedLink::new(true, true);
        let id = RequestId::random();
        h.relay.shared.state().pending.insert(id, link.clone());

        forward_response(&h.relay.shared, id, target_response(b"data"));

        let sent = link.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].request_id, Some(id.to_hex()));
        assert!(sent[0].error.as_deref().unwrap().starts_with("delivery_failure: "));
        assert!(sent[0].payload.is_none());
        assert!(!h.relay.is_pending(&id));
    }
}
