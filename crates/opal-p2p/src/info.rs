//! Peer and node identity types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique peer identifier: the canonical `"ip:port"` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create from an IP address and overlay port.
    pub fn new(ip_address: &str, ws_port: u16) -> Self {
        Self(format!("{}:{}", ip_address, ws_port))
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&PeerInfo> for PeerId {
    fn from(info: &PeerInfo) -> Self {
        PeerId::new(&info.ip_address, info.ws_port)
    }
}

/// Identity and advertised attributes of a remote node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// IP address of the remote.
    pub ip_address: String,
    /// Overlay port of the remote.
    pub ws_port: u16,
    /// Attributes learned from a successful status fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<PeerAttributes>,
}

impl PeerInfo {
    /// Create a bare peer info with no discovered attributes.
    pub fn new(ip_address: impl Into<String>, ws_port: u16) -> Self {
        Self {
            ip_address: ip_address.into(),
            ws_port,
            attributes: None,
        }
    }

    /// The canonical id for this peer.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from(self)
    }

    /// Merge a remote's advertised node info into the discovered attributes.
    pub fn apply_node_info(&mut self, node: &NodeInfo) {
        self.attributes = Some(PeerAttributes {
            version: Some(node.version.clone()),
            height: Some(node.height),
            broadhash: Some(node.broadhash.clone()),
            nonce: Some(node.nonce.clone()),
            os: Some(node.os.clone()),
            http_port: node.http_port,
            protocol_version: Some(node.protocol_version.clone()),
        });
    }
}

/// Attributes a remote advertises about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadhash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
}

/// The local node's advertised state, pushed to every peer on change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub version: String,
    pub height: u64,
    pub broadhash: String,
    pub nonce: String,
    pub os: String,
    pub ws_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    pub protocol_version: String,
}
