//! Mesh transport capability surface.
//!
//! # Data Flow
//! ```text
//! Relay / path selection
//!     → MeshTransport (identity resolution, endpoints, links, packets, paths)
//!     → Link callbacks (established / message / closed) fire on transport tasks
//!     → Response handlers fire once per answered packet
//! ```
//!
//! # Design Decisions
//! - The core never sees routing, crypto or framing; only this trait surface
//! - Callbacks are `Send + Sync` closures invoked from transport-owned tasks
//! - `memory` provides an in-process mesh for tests and loopback deployments

pub mod memory;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use types::{
    AddressError, AddressHash, Direction, Endpoint, Identity, LinkId, PathId, PathInfo,
    TargetResponse, TransportError, HASH_LEN,
};

/// Invoked with the link id when a link becomes established or closes.
pub type LinkEventHandler = Arc<dyn Fn(LinkId) + Send + Sync>;

/// Invoked with the raw bytes of every message received on a link.
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Invoked for every inbound link accepted by a listening endpoint.
pub type InboundLinkHandler = Arc<dyn Fn(Arc<dyn Link>) + Send + Sync>;

/// Invoked at most once with the reply to a one-shot packet.
pub type ResponseHandler = Box<dyn FnOnce(TargetResponse) + Send>;

/// Callback set attached to a link.
#[derive(Clone, Default)]
pub struct LinkCallbacks {
    pub established: Option<LinkEventHandler>,
    pub message: Option<MessageHandler>,
    pub closed: Option<LinkEventHandler>,
}

impl LinkCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_established(mut self, f: impl Fn(LinkId) + Send + Sync + 'static) -> Self {
        self.established = Some(Arc::new(f));
        self
    }

    pub fn on_message(mut self, f: impl Fn(Vec<u8>) + Send + Sync + 'static) -> Self {
        self.message = Some(Arc::new(f));
        self
    }

    pub fn on_closed(mut self, f: impl Fn(LinkId) + Send + Sync + 'static) -> Self {
        self.closed = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for LinkCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkCallbacks")
            .field("established", &self.established.is_some())
            .field("message", &self.message.is_some())
            .field("closed", &self.closed.is_some())
            .finish()
    }
}

/// A bidirectional connection to an endpoint.
pub trait Link: Send + Sync {
    fn id(&self) -> LinkId;

    /// True once established and until closed by either side.
    fn is_active(&self) -> bool;

    fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Close the link. Idempotent; fires `closed` on both sides once.
    fn close(&self);

    /// Replace the callbacks of this side of the link.
    fn set_callbacks(&self, callbacks: LinkCallbacks);
}

/// A listening (inbound) endpoint.
pub trait Listener: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    /// Stop accepting links. Idempotent.
    fn close(&self);
}

/// Everything the core requires from the mesh transport.
#[async_trait]
pub trait MeshTransport: Send + Sync + 'static {
    /// Identity of the local node.
    fn local_identity(&self) -> Identity;

    /// Look a peer identity up in the local cache.
    fn recall_identity(&self, hash: &AddressHash) -> Option<Identity>;

    /// Ask the network for a peer identity, giving up after `timeout`.
    async fn request_identity(&self, hash: &AddressHash, timeout: Duration) -> Option<Identity>;

    /// Derive an addressable endpoint from an identity and a dotted name.
    fn endpoint(
        &self,
        identity: &Identity,
        direction: Direction,
        name: &str,
    ) -> Result<Endpoint, TransportError>;

    /// Start accepting links on an inbound endpoint.
    fn listen(
        &self,
        endpoint: &Endpoint,
        on_link: InboundLinkHandler,
    ) -> Result<Arc<dyn Listener>, TransportError>;

    /// Begin establishing a link; `callbacks.established` fires on success.
    fn open_link(
        &self,
        endpoint: &Endpoint,
        callbacks: LinkCallbacks,
    ) -> Result<Arc<dyn Link>, TransportError>;

    /// Send a one-shot packet, optionally registering a response handler.
    fn send_packet(
        &self,
        destination: &AddressHash,
        payload: Vec<u8>,
        on_response: Option<ResponseHandler>,
    ) -> Result<(), TransportError>;

    /// Known candidate paths to a destination, in transport order.
    fn paths_to(&self, destination: &AddressHash) -> Vec<PathInfo>;

    /// Measure round-trip latency over a path.
    async fn probe_rtt(&self, path: &PathInfo, timeout: Duration) -> Option<Duration>;
}
