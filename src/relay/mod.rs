//! Destination proxying over the mesh.
//!
//! # Responsibilities
//! - Client role: keep a route table and send requests through an exit node
//! - Node role: listen on `ares.proxy.<aspect>`, forward requests to their
//!   targets and relay the answers back over the originating link
//! - Switch roles and re-listen on live config changes
//!
//! # Data Flow
//! ```text
//! client.rs  send_via_proxy → link to exit node → request message
//! node.rs    inbound link → validate → pending[request_id] = link
//!                → send_packet(target) → response → pending.pop → link.send
//! ```
//!
//! # Design Decisions
//! - One mutex guards role, routes, links and pending requests; it is held for
//!   map mutation only, never while calling into the transport
//! - Transport callbacks hold `Weak` references, so dropping the relay ends them
//! - Errors after a link exists travel in-band; earlier ones are returned

pub mod client;
pub mod node;
pub mod protocol;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::Span;

use crate::config::ProxyingConfig;
use crate::observability::metrics;
use crate::transport::{AddressHash, Endpoint, Link, LinkId, Listener, MeshTransport, TransportError};

pub use client::{ProxyRoute, ResponseCallback};
pub use protocol::{
    MessageKind, ProtocolError, RelayMessage, RequestId, ValidatedRequest, PROTOCOL_VERSION,
};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no mesh transport is bound")]
    TransportUnavailable,

    #[error("identity {0} could not be resolved")]
    IdentityResolutionTimeout(AddressHash),

    #[error("link to {0} was not established in time")]
    LinkEstablishTimeout(String),

    #[error("no proxy route matches {0:?}")]
    RouteNotFound(Option<String>),

    #[error("invalid destination address {0:?}")]
    InvalidAddressFormat(String),

    #[error("relay rejected the request format")]
    InvalidRequestFormat,

    #[error("relay speaks a different protocol version")]
    ProtocolVersionMismatch,

    #[error("delivery failed: {0}")]
    DeliveryFailure(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to encode relay message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("undecodable relay response: {0}")]
    Decode(String),

    #[error("relay reported: {0}")]
    Remote(String),

    #[error("link closed before a response arrived")]
    LinkClosed,

    #[error("no response within {0:?}")]
    Timeout(Duration),
}

impl RelayError {
    /// Failures a later attempt may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::IdentityResolutionTimeout(_)
                | RelayError::LinkEstablishTimeout(_)
                | RelayError::DeliveryFailure(_)
                | RelayError::LinkClosed
                | RelayError::Timeout(_)
                | RelayError::Transport(
                    TransportError::Unreachable(_) | TransportError::LinkInactive(_)
                )
        )
    }

    /// Map an in-band `error` field back to a local error.
    pub fn from_wire(code: String) -> Self {
        match code.as_str() {
            "incompatible_protocol_version" => RelayError::ProtocolVersionMismatch,
            "invalid_request_format" => RelayError::InvalidRequestFormat,
            "invalid_target_hash_format" => RelayError::InvalidAddressFormat(code.clone()),
            other => match other
                .strip_prefix(protocol::DELIVERY_FAILURE_CODE)
                .and_then(|rest| rest.strip_prefix(": "))
            {
                Some(detail) => RelayError::DeliveryFailure(detail.to_string()),
                None => RelayError::Remote(code),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayRole {
    Client,
    Node,
}

/// Snapshot for the admin endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub role: RelayRole,
    pub protocol_version: String,
    pub routes: Vec<String>,
    pub active_links: usize,
    pub pending_requests: usize,
    pub listening_on: Option<String>,
}

pub(crate) struct RelayState {
    pub(crate) role: RelayRole,
    pub(crate) protocol_version: String,
    pub(crate) listen_aspect: String,
    pub(crate) routes: Vec<ProxyRoute>,
    pub(crate) links: HashMap<LinkId, Arc<dyn Link>>,
    pub(crate) pending: HashMap<RequestId, Arc<dyn Link>>,
    pub(crate) listener: Option<Arc<dyn Listener>>,
}

impl RelayState {
    /// Detach everything the node role owns. Closing happens after the lock is released.
    fn take_node_resources(&mut self) -> NodeTeardown {
        self.pending.clear();
        NodeTeardown {
            listener: self.listener.take(),
            links: self.links.drain().map(|(_, link)| link).collect(),
        }
    }
}

#[derive(Default)]
struct NodeTeardown {
    listener: Option<Arc<dyn Listener>>,
    links: Vec<Arc<dyn Link>>,
}

impl NodeTeardown {
    fn close(self, span: &Span) {
        if let Some(listener) = self.listener {
            tracing::info!(parent: span, endpoint = %listener.endpoint().hash, "Relay listener closed");
            listener.close();
        }
        for link in self.links {
            link.close();
        }
    }
}

pub(crate) struct RelayShared {
    pub(crate) transport: Option<Arc<dyn MeshTransport>>,
    state: Mutex<RelayState>,
    pub(crate) span: Span,
}

impl RelayShared {
    pub(crate) fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().expect("relay state mutex poisoned")
    }
}

/// The proxy relay in whichever role the configuration selects.
#[derive(Clone)]
pub struct ProxyRelay {
    shared: Arc<RelayShared>,
}

impl ProxyRelay {
    pub fn new(
        config: &ProxyingConfig,
        transport: Option<Arc<dyn MeshTransport>>,
    ) -> Result<Self, RelayError> {
        let relay = Self {
            shared: Arc::new(RelayShared {
                transport,
                state: Mutex::new(RelayState {
                    role: RelayRole::Client,
                    protocol_version: config.proxy_protocol_version.clone(),
                    listen_aspect: config.listen_on_aspect.clone(),
                    routes: Vec::new(),
                    links: HashMap::new(),
                    pending: HashMap::new(),
                    listener: None,
                }),
                span: tracing::info_span!("proxy_relay"),
            }),
        };
        relay.apply_config(config)?;
        Ok(relay)
    }

    /// Apply a new configuration, switching role or re-listening as needed.
    ///
    /// A node that fails to listen keeps its role and retries on the next call.
    pub fn apply_config(&self, config: &ProxyingConfig) -> Result<(), RelayError> {
        let role = if config.is_proxy_node {
            RelayRole::Node
        } else {
            RelayRole::Client
        };

        let (teardown, listen, route_count) = {
            let mut state = self.shared.state();
            let previous = state.role;
            if previous != role {
                tracing::info!(parent: &self.shared.span, from = ?previous, to = ?role, "Relay role changed");
            }

            let mut teardown = NodeTeardown::default();
            let mut listen = false;
            match role {
                RelayRole::Client => {
                    if previous == RelayRole::Node {
                        teardown = state.take_node_resources();
                    }
                    state.routes = client::build_routes(&config.proxy_routes, &self.shared.span);
                }
                RelayRole::Node => {
                    state.routes.clear();
                    let aspect_changed = state.listen_aspect != config.listen_on_aspect;
                    if previous != RelayRole::Node || aspect_changed || state.listener.is_none() {
                        if aspect_changed && previous == RelayRole::Node {
                            tracing::info!(
                                parent: &self.shared.span,
                                from = %state.listen_aspect,
                                to = %config.listen_on_aspect,
                                "Listen aspect changed"
                            );
                        }
                        teardown = state.take_node_resources();
                        listen = true;
                    }
                }
            }

            state.role = role;
            state.protocol_version = config.proxy_protocol_version.clone();
            state.listen_aspect = config.listen_on_aspect.clone();
            (teardown, listen, state.routes.len())
        };

        teardown.close(&self.shared.span);
        metrics::set_active_proxy_routes(route_count);
        if listen {
            metrics::set_active_proxy_clients(0);
            node::start_listening(&self.shared)?;
        }
        Ok(())
    }

    /// Report link or route counts for the current role.
    pub fn periodic_check(&self) {
        let (role, links, routes) = {
            let state = self.shared.state();
            (state.role, state.links.len(), state.routes.len())
        };
        match role {
            RelayRole::Node => metrics::set_active_proxy_clients(links),
            RelayRole::Client => metrics::set_active_proxy_routes(routes),
        }
        tracing::debug!(parent: &self.shared.span, ?role, links, routes, "Relay periodic check");
    }

    /// Release every role resource. Safe to call more than once.
    pub fn shutdown(&self) {
        let teardown = {
            let mut state = self.shared.state();
            state.routes.clear();
            state.take_node_resources()
        };
        teardown.close(&self.shared.span);
        metrics::set_active_proxy_clients(0);
        metrics::set_active_proxy_routes(0);
        tracing::info!(parent: &self.shared.span, "Proxy relay shut down");
    }

    pub fn role(&self) -> RelayRole {
        self.shared.state().role
    }

    pub fn routes(&self) -> Vec<ProxyRoute> {
        self.shared.state().routes.clone()
    }

    pub fn active_links(&self) -> usize {
        self.shared.state().links.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.state().pending.len()
    }

    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.shared.state().pending.contains_key(id)
    }

    /// The endpoint a node accepts links on.
    pub fn listen_endpoint(&self) -> Option<Endpoint> {
        self.shared
            .state()
            .listener
            .as_ref()
            .map(|l| l.endpoint().clone())
    }

    pub fn status(&self) -> RelayStatus {
        let state = self.shared.state();
        RelayStatus {
            role: state.role,
            protocol_version: state.protocol_version.clone(),
            routes: state.routes.iter().map(|r| r.alias.clone()).collect(),
            active_links: state.links.len(),
            pending_requests: state.pending.len(),
            listening_on: state.listener.as_ref().map(|l| l.endpoint().hash.to_hex()),
        }
    }
}
