//! Address, identity, link and path types shared by transport users.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

/// Length in bytes of identity and destination hashes.
pub const HASH_LEN: usize = 16;

/// Malformed hash text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("expected {expected} lowercase hex characters, got {0:?}", expected = HASH_LEN * 2)]
    Malformed(String),
}

/// A truncated identity or destination hash, rendered as 32 lowercase hex chars.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressHash([u8; HASH_LEN]);

impl AddressHash {
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Check the textual format without decoding.
    pub fn is_well_formed(text: &str) -> bool {
        text.len() == HASH_LEN * 2
            && text.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    /// Parse strictly: exactly 32 lowercase hex characters.
    pub fn parse_hex(text: &str) -> Result<Self, AddressError> {
        if !Self::is_well_formed(text) {
            return Err(AddressError::Malformed(text.to_string()));
        }
        let mut bytes = [0u8; HASH_LEN];
        hex::decode_to_slice(text, &mut bytes)
            .map_err(|_| AddressError::Malformed(text.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl FromStr for AddressHash {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_hex(s)
    }
}

impl fmt::Display for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddressHash({})", self.to_hex())
    }
}

/// A peer identity known to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity {
    hash: AddressHash,
}

impl Identity {
    pub fn new(hash: AddressHash) -> Self {
        Self { hash }
    }

    pub fn generate() -> Self {
        Self::new(AddressHash::random())
    }

    pub fn hash(&self) -> AddressHash {
        self.hash
    }
}

/// Whether an endpoint accepts (In) or initiates (Out) traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// An addressable destination derived from an identity and a dotted name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub hash: AddressHash,
    pub identity: Identity,
    pub direction: Direction,
    pub name: String,
}

/// Unique identifier of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(Uuid);

impl LinkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Identifier of one candidate path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(pub String);

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PathId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PathId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A candidate route to a destination as reported by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct PathInfo {
    pub id: PathId,
    /// Hop count, when the topology reports it.
    pub hops: Option<u32>,
    /// Link quality cost (lower is better), when reported.
    pub quality: Option<f64>,
}

impl PathInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: PathId(id.into()),
            hops: None,
            quality: None,
        }
    }

    pub fn with_hops(mut self, hops: u32) -> Self {
        self.hops = Some(hops);
        self
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = Some(quality);
        self
    }
}

/// Reply delivered for a one-shot packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetResponse {
    pub data: Vec<u8>,
    pub source: Option<AddressHash>,
}

/// Errors reported by transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No route or responder for the destination.
    #[error("destination {0} unreachable")]
    Unreachable(AddressHash),

    /// The link is not (or no longer) established.
    #[error("link {0} is not active")]
    LinkInactive(LinkId),

    /// Endpoint name is empty or has empty components.
    #[error("invalid endpoint name {0:?}")]
    InvalidEndpointName(String),

    /// Operation requires a different endpoint direction.
    #[error("endpoint {0} has the wrong direction for this operation")]
    WrongDirection(AddressHash),

    #[error("transport error: {0}")]
    Other(String),
}
