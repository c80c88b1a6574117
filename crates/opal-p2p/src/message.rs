//! Overlay packets and payload encoding.
//!
//! The pool exchanges two packet shapes with a transport: request packets,
//! which expect a correlated reply, and message packets, which are
//! fire-and-forget. Payloads are JSON bytes so that hosts can plug any
//! serde-modelled data through the pool without the pool interpreting it.

use crate::{P2pError, P2pResult};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Procedure names the pool itself issues.
pub mod procedures {
    /// Ask a remote for its advertised node info.
    pub const GET_NODE_INFO: &str = "getNodeInfo";
    /// Ask a remote for its known peer list.
    pub const GET_PEERS: &str = "getPeers";
}

/// Message event names the pool itself emits or interprets.
pub mod remote_events {
    /// A node info update pushed to or from a remote.
    pub const POST_NODE_INFO: &str = "postNodeInfo";
}

/// A request expecting a correlated reply.
#[derive(Debug, Clone)]
pub struct RequestPacket {
    /// Remote procedure name.
    pub procedure: String,
    /// JSON payload.
    pub data: Bytes,
}

impl RequestPacket {
    /// Create a request with an empty payload.
    pub fn new(procedure: impl Into<String>) -> Self {
        Self {
            procedure: procedure.into(),
            data: Bytes::new(),
        }
    }

    /// Create a request carrying a JSON payload.
    pub fn with_payload<T: Serialize>(procedure: impl Into<String>, payload: &T) -> P2pResult<Self> {
        Ok(Self {
            procedure: procedure.into(),
            data: encode_payload(payload)?,
        })
    }
}

/// A fire-and-forget message.
#[derive(Debug, Clone)]
pub struct MessagePacket {
    /// Event name.
    pub event: String,
    /// JSON payload.
    pub data: Bytes,
}

impl MessagePacket {
    /// Create a message with an empty payload.
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: Bytes::new(),
        }
    }

    /// Create a message carrying a JSON payload.
    pub fn with_payload<T: Serialize>(event: impl Into<String>, payload: &T) -> P2pResult<Self> {
        Ok(Self {
            event: event.into(),
            data: encode_payload(payload)?,
        })
    }
}

/// Encode a serde value into a JSON payload.
pub fn encode_payload<T: Serialize>(value: &T) -> P2pResult<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| P2pError::Serialization(e.to_string()))
}

/// Decode a JSON payload into a serde value.
pub fn decode_payload<T: DeserializeOwned>(data: &[u8]) -> P2pResult<T> {
    serde_json::from_slice(data).map_err(|e| P2pError::Serialization(e.to_string()))
}
