//! In-process loopback mesh.
//!
//! # Responsibilities
//! - Announce node identities and resolve them on request
//! - Derive endpoints, accept links, deliver link events in order
//! - Answer one-shot packets through registered responders
//! - Report configured candidate paths and probe latencies
//!
//! # Design Decisions
//! - Each link side owns an event queue drained by its own task, so per-link
//!   ordering holds and callbacks never run on the caller's stack
//! - A link to an endpoint nobody listens on stays pending forever
//! - Endpoint hashes are UUIDv5 of (identity hash, name)

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::transport::{
    AddressHash, Direction, Endpoint, Identity, InboundLinkHandler, Link, LinkCallbacks, LinkId,
    Listener, MeshTransport, PathId, PathInfo, ResponseHandler, TargetResponse, TransportError,
};

/// Answers a one-shot packet; `None` means no reply.
pub type Responder = Arc<dyn Fn(Vec<u8>) -> Option<Vec<u8>> + Send + Sync>;

const LINK_PENDING: u8 = 0;
const LINK_ACTIVE: u8 = 1;
const LINK_CLOSED: u8 = 2;

/// How often `request_identity` re-checks the announcement table.
const IDENTITY_POLL: Duration = Duration::from_millis(10);

struct ListenerEntry {
    serial: u64,
    handler: InboundLinkHandler,
}

#[derive(Default)]
struct MeshState {
    identities: HashSet<AddressHash>,
    listeners: HashMap<AddressHash, ListenerEntry>,
    responders: HashMap<AddressHash, Responder>,
    paths: HashMap<AddressHash, Vec<PathInfo>>,
    latencies: HashMap<PathId, Duration>,
}

#[derive(Default)]
struct MeshInner {
    state: Mutex<MeshState>,
    probes: AtomicUsize,
    listener_serial: AtomicU64,
}

/// A shared in-process network that hands out [`MemoryTransport`] nodes.
#[derive(Clone, Default)]
pub struct MemoryMesh {
    inner: Arc<MeshInner>,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MeshState> {
        self.inner.state.lock().expect("mesh state mutex poisoned")
    }

    /// Create a node with a fresh identity announced on the mesh.
    pub fn node(&self) -> MemoryTransport {
        self.node_with_identity(Identity::generate())
    }

    pub fn node_with_identity(&self, identity: Identity) -> MemoryTransport {
        self.announce(identity);
        MemoryTransport {
            mesh: self.clone(),
            identity,
            recalled: Mutex::new(HashSet::new()),
        }
    }

    /// Make an identity resolvable by every node.
    pub fn announce(&self, identity: Identity) {
        self.state().identities.insert(identity.hash());
    }

    /// Register a responder for one-shot packets sent to `destination`.
    pub fn serve<F>(&self, destination: AddressHash, responder: F)
    where
        F: Fn(Vec<u8>) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.state().responders.insert(destination, Arc::new(responder));
    }

    pub fn stop_serving(&self, destination: &AddressHash) {
        self.state().responders.remove(destination);
    }

    /// Set the candidate paths reported for `destination`.
    pub fn set_paths(&self, destination: AddressHash, paths: Vec<PathInfo>) {
        self.state().paths.insert(destination, paths);
    }

    /// Set the latency a probe over `path` reports.
    pub fn set_latency(&self, path: impl Into<PathId>, rtt: Duration) {
        self.state().latencies.insert(path.into(), rtt);
    }

    /// Number of RTT probes issued so far.
    pub fn probe_count(&self) -> usize {
        self.inner.probes.load(Ordering::Relaxed)
    }

    fn listener_for(&self, endpoint: &AddressHash) -> Option<InboundLinkHandler> {
        self.state().listeners.get(endpoint).map(|e| e.handler.clone())
    }
}

/// One node attached to a [`MemoryMesh`].
pub struct MemoryTransport {
    mesh: MemoryMesh,
    identity: Identity,
    recalled: Mutex<HashSet<AddressHash>>,
}

impl MemoryTransport {
    pub fn mesh(&self) -> &MemoryMesh {
        &self.mesh
    }

    fn remember(&self, hash: AddressHash) {
        self.recalled
            .lock()
            .expect("identity cache mutex poisoned")
            .insert(hash);
    }

    fn is_announced(&self, hash: &AddressHash) -> bool {
        self.mesh.state().identities.contains(hash)
    }
}

#[async_trait]
impl MeshTransport for MemoryTransport {
    fn local_identity(&self) -> Identity {
        self.identity
    }

    fn recall_identity(&self, hash: &AddressHash) -> Option<Identity> {
        if *hash == self.identity.hash() {
            return Some(self.identity);
        }
        let recalled = self.recalled.lock().expect("identity cache mutex poisoned");
        recalled.contains(hash).then(|| Identity::new(*hash))
    }

    async fn request_identity(&self, hash: &AddressHash, timeout: Duration) -> Option<Identity> {
        let found = tokio::time::timeout(timeout, async {
            loop {
                if self.is_announced(hash) {
                    return;
                }
                tokio::time::sleep(IDENTITY_POLL).await;
            }
        })
        .await;

        match found {
            Ok(()) => {
                self.remember(*hash);
                Some(Identity::new(*hash))
            }
            Err(_) => {
                tracing::debug!(identity = %hash.short(), "Identity request timed out");
                None
            }
        }
    }

    fn endpoint(
        &self,
        identity: &Identity,
        direction: Direction,
        name: &str,
    ) -> Result<Endpoint, TransportError> {
        if name.is_empty() || name.split('.').any(str::is_empty) {
            return Err(TransportError::InvalidEndpointName(name.to_string()));
        }
        let namespace = Uuid::from_bytes(*identity.hash().as_bytes());
        let derived = Uuid::new_v5(&namespace, name.as_bytes());
        Ok(Endpoint {
            hash: AddressHash::from_bytes(derived.into_bytes()),
            identity: *identity,
            direction,
            name: name.to_string(),
        })
    }

    fn listen(
        &self,
        endpoint: &Endpoint,
        on_link: InboundLinkHandler,
    ) -> Result<Arc<dyn Listener>, TransportError> {
        if endpoint.direction != Direction::In {
            return Err(TransportError::WrongDirection(endpoint.hash));
        }
        let serial = self.mesh.inner.listener_serial.fetch_add(1, Ordering::Relaxed);
        self.mesh.state().listeners.insert(
            endpoint.hash,
            ListenerEntry {
                serial,
                handler: on_link,
            },
        );
        tracing::debug!(endpoint = %endpoint.hash.short(), name = %endpoint.name, "Listening");
        Ok(Arc::new(MemoryListener {
            mesh: self.mesh.clone(),
            endpoint: endpoint.clone(),
            serial,
            closed: AtomicBool::new(false),
        }))
    }

    fn open_link(
        &self,
        endpoint: &Endpoint,
        callbacks: LinkCallbacks,
    ) -> Result<Arc<dyn Link>, TransportError> {
        if endpoint.direction != Direction::Out {
            return Err(TransportError::WrongDirection(endpoint.hash));
        }

        let id = LinkId::new();
        let status = Arc::new(AtomicU8::new(LINK_PENDING));
        let initiator = MemoryLink::spawn(id, status.clone(), callbacks);

        match self.mesh.listener_for(&endpoint.hash) {
            Some(on_link) => {
                let responder = MemoryLink::spawn(id, status.clone(), LinkCallbacks::default());
                responder.connect(initiator.local.clone());
                initiator.connect(responder.local.clone());
                status.store(LINK_ACTIVE, Ordering::SeqCst);

                // The accept handler runs on the responder's queue ahead of any
                // message the initiator sends after `established`.
                let accepted: Arc<dyn Link> = responder.clone();
                let _ = responder.local.send(LinkEvent::Accepted(on_link, accepted));
                let _ = initiator.local.send(LinkEvent::Established);
            }
            None => {
                tracing::debug!(endpoint = %endpoint.hash.short(), link_id = %id, "No listener; link stays pending");
            }
        }

        Ok(initiator)
    }

    fn send_packet(
        &self,
        destination: &AddressHash,
        payload: Vec<u8>,
        on_response: Option<ResponseHandler>,
    ) -> Result<(), TransportError> {
        let responder = self
            .mesh
            .state()
            .responders
            .get(destination)
            .cloned()
            .ok_or(TransportError::Unreachable(*destination))?;
        let source = *destination;

        tokio::spawn(async move {
            if let Some(reply) = responder(payload) {
                if let Some(on_response) = on_response {
                    on_response(TargetResponse {
                        data: reply,
                        source: Some(source),
                    });
                }
            }
        });
        Ok(())
    }

    fn paths_to(&self, destination: &AddressHash) -> Vec<PathInfo> {
        self.mesh
            .state()
            .paths
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }

    async fn probe_rtt(&self, path: &PathInfo, timeout: Duration) -> Option<Duration> {
        self.mesh.inner.probes.fetch_add(1, Ordering::Relaxed);
        let latency = self.mesh.state().latencies.get(&path.id).copied();
        match latency {
            Some(rtt) if rtt <= timeout => {
                tokio::time::sleep(rtt).await;
                Some(rtt)
            }
            Some(_) => {
                tokio::time::sleep(timeout).await;
                None
            }
            None => None,
        }
    }
}

struct MemoryListener {
    mesh: MemoryMesh,
    endpoint: Endpoint,
    serial: u64,
    closed: AtomicBool,
}

impl Listener for MemoryListener {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.mesh.state();
        if state
            .listeners
            .get(&self.endpoint.hash)
            .is_some_and(|e| e.serial == self.serial)
        {
            state.listeners.remove(&self.endpoint.hash);
        }
    }
}

enum LinkEvent {
    Accepted(InboundLinkHandler, Arc<dyn Link>),
    Established,
    Message(Vec<u8>),
    Closed,
}

type EventSender = mpsc::UnboundedSender<LinkEvent>;

/// One side of an in-memory link.
struct MemoryLink {
    id: LinkId,
    status: Arc<AtomicU8>,
    local: EventSender,
    remote: Mutex<Option<EventSender>>,
    callbacks: Arc<Mutex<LinkCallbacks>>,
}

impl MemoryLink {
    /// Create one side and its delivery task. The task keeps the side alive
    /// until `Closed` is delivered.
    fn spawn(id: LinkId, status: Arc<AtomicU8>, callbacks: LinkCallbacks) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            id,
            status,
            local: tx,
            remote: Mutex::new(None),
            callbacks: Arc::new(Mutex::new(callbacks)),
        });
        tokio::spawn(link.clone().deliver(rx));
        link
    }

    async fn deliver(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<LinkEvent>) {
        while let Some(event) = rx.recv().await {
            let current = self.callbacks.lock().expect("link callbacks mutex poisoned").clone();
            match event {
                LinkEvent::Accepted(on_link, link) => on_link(link),
                LinkEvent::Established => {
                    if let Some(cb) = current.established {
                        cb(self.id);
                    }
                }
                LinkEvent::Message(data) => {
                    if let Some(cb) = current.message {
                        cb(data);
                    }
                }
                LinkEvent::Closed => {
                    if let Some(cb) = current.closed {
                        cb(self.id);
                    }
                    break;
                }
            }
        }
        // Break reference cycles held by closures.
        *self.callbacks.lock().expect("link callbacks mutex poisoned") = LinkCallbacks::default();
    }

    fn connect(&self, remote: EventSender) {
        *self.remote.lock().expect("link peer mutex poisoned") = Some(remote);
    }
}

impl Link for MemoryLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn is_active(&self) -> bool {
        self.status.load(Ordering::SeqCst) == LINK_ACTIVE
    }

    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_active() {
            return Err(TransportError::LinkInactive(self.id));
        }
        let remote = self.remote.lock().expect("link peer mutex poisoned");
        remote
            .as_ref()
            .ok_or(TransportError::LinkInactive(self.id))?
            .send(LinkEvent::Message(data.to_vec()))
            .map_err(|_| TransportError::LinkInactive(self.id))
    }

    fn close(&self) {
        if self.status.swap(LINK_CLOSED, Ordering::SeqCst) == LINK_CLOSED {
            return;
        }
        let _ = self.local.send(LinkEvent::Closed);
        if let Some(remote) = self.remote.lock().expect("link peer mutex poisoned").as_ref() {
            let _ = remote.send(LinkEvent::Closed);
        }
    }

    fn set_callbacks(&self, callbacks: LinkCallbacks) {
        *self.callbacks.lock().expect("link callbacks mutex poisoned") = callbacks;
    }
}
