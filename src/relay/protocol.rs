//! Relay wire messages.
//!
//! One JSON object per link send:
//!
//! | field | notes |
//! |---|---|
//! | `version` | must equal the node's configured protocol version |
//! | `type` | `request`, `data_oneway` or `response` |
//! | `request_id` | 16 lowercase hex chars, echoed in the response |
//! | `target_destination_hash` | 32 lowercase hex chars, required on requests |
//! | `payload` | base64 application bytes |
//! | `source_destination_hash` | on responses, when the transport reports it |
//! | `error` | on error responses, instead of `payload` |

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::AddressHash;

pub const PROTOCOL_VERSION: &str = "1.0";

/// Wire prefix of errors raised while delivering to or from the target.
pub const DELIVERY_FAILURE_CODE: &str = "delivery_failure";

/// Bytes in a request id.
pub const REQUEST_ID_LEN: usize = 8;

/// Correlates a response with its request.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId([u8; REQUEST_ID_LEN]);

impl RequestId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for RequestId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let well_formed = s.len() == REQUEST_ID_LEN * 2
            && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        let mut bytes = [0u8; REQUEST_ID_LEN];
        if !well_formed || hex::decode_to_slice(s, &mut bytes).is_err() {
            return Err(ProtocolError::InvalidRequestFormat);
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.to_hex())
    }
}

/// Rejections a relay node sends back in-band. `Display` is the wire code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("incompatible_protocol_version")]
    VersionMismatch { got: Option<String> },

    #[error("invalid_request_format")]
    InvalidRequestFormat,

    #[error("invalid_target_hash_format")]
    InvalidTargetHash(String),

    #[error("request_decode_error: {0}")]
    Decode(String),

    #[error("duplicate_request_id")]
    DuplicateRequestId(RequestId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    DataOneway,
    Response,
}

/// A relay message as it appears on the wire; every field is optional so
/// that malformed requests can still be answered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_destination_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_destination_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A request that passed every check on the relay node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    pub id: RequestId,
    /// `Request` or `DataOneway`.
    pub kind: MessageKind,
    pub target: AddressHash,
    pub payload: Vec<u8>,
}

impl ValidatedRequest {
    pub fn expects_response(&self) -> bool {
        self.kind == MessageKind::Request
    }
}

impl RelayMessage {
    pub fn request(
        version: &str,
        kind: MessageKind,
        id: RequestId,
        target: &AddressHash,
        payload: &[u8],
    ) -> Self {
        Self {
            version: Some(version.to_string()),
            kind: Some(kind),
            request_id: Some(id.to_hex()),
            target_destination_hash: Some(target.to_hex()),
            payload: Some(BASE64.encode(payload)),
            ..Self::default()
        }
    }

    pub fn response(version: &str, id: RequestId, source: Option<AddressHash>, data: &[u8]) -> Self {
        Self {
            version: Some(version.to_string()),
            kind: Some(MessageKind::Response),
            request_id: Some(id.to_hex()),
            source_destination_hash: source.map(|s| s.to_hex()),
            payload: Some(BASE64.encode(data)),
            ..Self::default()
        }
    }

    /// An error response; `request_id` is echoed verbatim when known.
    pub fn error(version: &str, request_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            version: Some(version.to_string()),
            kind: Some(MessageKind::Response),
            request_id,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Relay-node checks, in wire order: version, required fields, target format, payload.
    pub fn validate_request(&self, expected_version: &str) -> Result<ValidatedRequest, ProtocolError> {
        if self.version.as_deref() != Some(expected_version) {
            return Err(ProtocolError::VersionMismatch {
                got: self.version.clone(),
            });
        }

        let (Some(kind), Some(id), Some(target), Some(payload)) = (
            self.kind,
            self.request_id.as_deref(),
            self.target_destination_hash.as_deref(),
            self.payload.as_deref(),
        ) else {
            return Err(ProtocolError::InvalidRequestFormat);
        };
        if kind == MessageKind::Response {
            return Err(ProtocolError::InvalidRequestFormat);
        }
        let id: RequestId = id.parse()?;

        let target = AddressHash::parse_hex(target)
            .map_err(|_| ProtocolError::InvalidTargetHash(target.to_string()))?;

        let payload = BASE64
            .decode(payload)
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;

        Ok(ValidatedRequest {
            id,
            kind,
            target,
            payload,
        })
    }

    /// Decoded payload of a successful response.
    pub fn decode_payload(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        self.payload.as_deref().map(|p| BASE64.decode(p))
    }
}
