//! The typed event surface consumed by the host.
//!
//! Every per-peer lifecycle event is re-emitted by the pool on a single
//! channel, so the host subscribes exactly once. The set of kinds is closed:
//! no string-keyed listeners, every payload statically typed.

use crate::info::{PeerId, PeerInfo};
use crate::message::MessagePacket;
use crate::transport::IncomingRequest;

/// Events emitted by the pool and its peers.
#[derive(Debug)]
pub enum PoolEvent {
    /// A remote issued a request; answer through the carried responder.
    RequestReceived {
        peer_id: PeerId,
        request: IncomingRequest,
    },
    /// A remote delivered a fire-and-forget message.
    MessageReceived {
        peer_id: PeerId,
        message: MessagePacket,
    },
    /// An outbound dial completed.
    ConnectOutbound { peer_id: PeerId },
    /// An outbound dial failed or timed out before connecting.
    ConnectAbortOutbound { peer_id: PeerId },
    /// An outbound connection closed. The peer is already out of the map.
    CloseOutbound { peer_id: PeerId },
    /// An inbound connection closed. The peer is already out of the map.
    CloseInbound { peer_id: PeerId },
    /// A transport error on an outbound connection.
    OutboundSocketError { peer_id: PeerId, error: String },
    /// A transport error on an inbound connection.
    InboundSocketError { peer_id: PeerId, error: String },
    /// A remote pushed updated info about itself.
    UpdatedPeerInfo { peer_info: PeerInfo },
    /// A remote pushed an update the pool could not decode.
    FailedPeerInfoUpdate { peer_id: PeerId, error: String },
    /// A peer crossed the penalty threshold and was banned.
    BanPeer { peer_id: PeerId },
    /// A previously banned peer may reconnect.
    UnbanPeer { peer_id: PeerId },
    /// A status fetch produced detailed info for a peer.
    DiscoveredPeer { peer_info: PeerInfo },
    /// A status fetch or discovery probe failed.
    FailedToFetchPeerInfo { peer_id: PeerId, error: String },
    /// A node info push to a peer failed.
    FailedToPushNodeInfo { peer_id: PeerId, error: String },
    /// A broadcast send to a selected peer failed.
    FailedToSendMessage { peer_id: PeerId, error: String },
}
