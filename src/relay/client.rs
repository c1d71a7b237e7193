//! Client role: route table and sending through an exit node.

use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::Span;

use crate::config::ProxyRouteConfig;
use crate::observability::metrics::{self, PacketDirection};
use crate::relay::protocol::{MessageKind, RelayMessage, RequestId};
use crate::relay::{ProxyRelay, RelayError};
use crate::resilience::with_deadline;
use crate::transport::{AddressHash, Direction, Link, LinkCallbacks};

/// Receives the single outcome of a proxied request.
pub type ResponseCallback = Box<dyn FnOnce(Result<Vec<u8>, RelayError>) + Send>;

type CallbackSlot = Arc<Mutex<Option<ResponseCallback>>>;

/// A usable route through an exit node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    pub alias: String,
    pub entry_destination_name: String,
    pub exit_identity: AddressHash,
}

/// Keep the well-formed route entries; the rest are logged and skipped.
pub(crate) fn build_routes(configs: &[ProxyRouteConfig], span: &Span) -> Vec<ProxyRoute> {
    let present = |field: &Option<String>| field.as_deref().filter(|s| !s.is_empty()).map(str::to_string);

    let routes: Vec<ProxyRoute> = configs
        .iter()
        .enumerate()
        .filter_map(|(index, config)| {
            let (Some(alias), Some(entry), Some(exit)) = (
                present(&config.alias),
                present(&config.entry_destination_name),
                present(&config.exit_node_identity_hash),
            ) else {
                tracing::warn!(parent: span, index, "Proxy route incomplete; skipped");
                return None;
            };
            match AddressHash::parse_hex(&exit) {
                Ok(exit_identity) => Some(ProxyRoute {
                    alias,
                    entry_destination_name: entry,
                    exit_identity,
                }),
                Err(e) => {
                    tracing::warn!(parent: span, index, alias = %alias, error = %e, "Proxy route exit hash malformed; skipped");
                    None
                }
            }
        })
        .collect();

    tracing::info!(
        parent: span,
        configured = configs.len(),
        usable = routes.len(),
        "Proxy routes loaded"
    );
    routes
}

impl ProxyRelay {
    /// Send `payload` to `target` through the route named `alias` (or the first).
    ///
    /// With `on_response` the link stays open until the answer, an in-band
    /// error or a close is delivered to it, exactly once. Without it the
    /// request is fire-and-forget and the link is closed after sending.
    pub async fn send_via_proxy(
        &self,
        target: &str,
        payload: &[u8],
        alias: Option<&str>,
        on_response: Option<ResponseCallback>,
        timeout: Duration,
    ) -> Result<RequestId, RelayError> {
        self.open_and_send(target, payload, alias, on_response, timeout)
            .await
            .map(|(id, _)| id)
    }

    /// Send through the relay and wait up to `timeout` for the answer.
    pub async fn request(
        &self,
        target: &str,
        payload: &[u8],
        alias: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RelayError> {
        let (tx, rx) = oneshot::channel();
        let callback: ResponseCallback = Box::new(move |outcome: Result<Vec<u8>, RelayError>| {
            let _ = tx.send(outcome);
        });
        let (request_id, link) = self
            .open_and_send(target, payload, alias, Some(callback), timeout)
            .await?;

        match with_deadline("relay response", timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RelayError::LinkClosed),
            Err(_) => {
                tracing::warn!(parent: &self.shared.span, request_id = %request_id, "No relay response in time");
                link.close();
                Err(RelayError::Timeout(timeout))
            }
        }
    }

    async fn open_and_send(
        &self,
        target: &str,
        payload: &[u8],
        alias: Option<&str>,
        on_response: Option<ResponseCallback>,
        timeout: Duration,
    ) -> Result<(RequestId, Arc<dyn Link>), RelayError> {
        let span = &self.shared.span;
        let (route, version) = {
            let state = self.shared.state();
            let route = match alias {
                Some(alias) => state.routes.iter().find(|r| r.alias == alias),
                None => state.routes.first(),
            };
            (route.cloned(), state.protocol_version.clone())
        };
        let route = route.ok_or_else(|| RelayError::RouteNotFound(alias.map(str::to_string)))?;
        let target = AddressHash::parse_hex(target)
            .map_err(|_| RelayError::InvalidAddressFormat(target.to_string()))?;
        let transport = self
            .shared
            .transport
            .as_ref()
            .ok_or(RelayError::TransportUnavailable)?;

        let exit = match transport.recall_identity(&route.exit_identity) {
            Some(identity) => identity,
            None => {
                tracing::debug!(parent: span, exit = %route.exit_identity.short(), "Requesting exit identity");
                transport
                    .request_identity(&route.exit_identity, timeout / 2)
                    .await
                    .ok_or(RelayError::IdentityResolutionTimeout(route.exit_identity))?
            }
        };
        let endpoint = transport.endpoint(&exit, Direction::Out, &route.entry_destination_name)?;

        let request_id = RequestId::random();
        let expects_response = on_response.is_some();
        let slot: CallbackSlot = Arc::new(Mutex::new(None));
        let link_cell: Arc<OnceLock<Weak<dyn Link>>> = Arc::new(OnceLock::new());
        let (established_tx, established_rx) = oneshot::channel();
        let established_tx = Mutex::new(Some(established_tx));

        let callbacks = LinkCallbacks::new()
            .on_established(move |_| {
                if let Some(tx) = established_tx.lock().expect("establish mutex poisoned").take() {
                    let _ = tx.send(());
                }
            })
            .on_message({
                let slot = slot.clone();
                let link_cell = link_cell.clone();
                let span = span.clone();
                move |data| handle_response(&span, request_id, &slot, &link_cell, data)
            })
            .on_closed({
                let slot = slot.clone();
                move |_| {
                    if let Some(callback) = take_callback(&slot) {
                        callback(Err(RelayError::LinkClosed));
                    }
                }
            });

        let link = transport.open_link(&endpoint, callbacks)?;
        let _ = link_cell.set(Arc::downgrade(&link));

        match with_deadline("link establishment", timeout, established_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                link.close();
                return Err(RelayError::LinkClosed);
            }
            Err(_) => {
                tracing::warn!(
                    parent: span,
                    alias = %route.alias,
                    endpoint = %endpoint.hash.short(),
                    timeout_secs = timeout.as_secs_f64(),
                    "Link to exit node not established in time"
                );
                link.close();
                return Err(RelayError::LinkEstablishTimeout(route.entry_destination_name));
            }
        }

        let kind = if expects_response {
            MessageKind::Request
        } else {
            MessageKind::DataOneway
        };
        let bytes = match RelayMessage::request(&version, kind, request_id, &target, payload).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                link.close();
                return Err(e.into());
            }
        };

        *slot.lock().expect("response slot mutex poisoned") = on_response;
        if let Err(e) = link.send(&bytes) {
            // The caller sees the error; the callback must not fire as well.
            drop(take_callback(&slot));
            link.close();
            return Err(e.into());
        }

        metrics::record_proxied_packet(&route.alias, PacketDirection::SentToProxy);
        tracing::info!(
            parent: span,
            request_id = %request_id,
            alias = %route.alias,
            target = %target.short(),
            ?kind,
            "Request sent via proxy"
        );

        if !expects_response {
            link.close();
        }
        Ok((request_id, link))
    }
}

fn take_callback(slot: &CallbackSlot) -> Option<ResponseCallback> {
    slot.lock().expect("response slot mutex poisoned").take()
}

fn handle_response(
    span: &Span,
    expected: RequestId,
    slot: &CallbackSlot,
    link: &OnceLock<Weak<dyn Link>>,
    data: Vec<u8>,
) {
    let outcome = match RelayMessage::decode(&data) {
        Ok(message) => {
            if message.request_id.as_deref() != Some(expected.to_hex().as_str()) {
                tracing::warn!(
                    parent: span,
                    expected = %expected,
                    received = ?message.request_id,
                    "Response for another request ignored"
                );
                return;
            }
            interpret(message)
        }
        Err(e) => Err(RelayError::Decode(e.to_string())),
    };

    match take_callback(slot) {
        Some(callback) => {
            if let Err(e) = &outcome {
                tracing::warn!(parent: span, request_id = %expected, error = %e, "Proxied request failed");
            }
            callback(outcome);
        }
        None => tracing::debug!(parent: span, request_id = %expected, "Response arrived after completion"),
    }

    if let Some(link) = link.get().and_then(Weak::upgrade) {
        link.close();
    }
}

fn interpret(message: RelayMessage) -> Result<Vec<u8>, RelayError> {
    if let Some(error) = message.error {
        return Err(RelayError::from_wire(error));
    }
    match message.decode_payload() {
        Some(Ok(data)) => Ok(data),
        Some(Err(e)) => Err(RelayError::Decode(e.to_string())),
        None => Err(RelayError::Decode("empty proxy response".to_string())),
    }
}
