//! # opal-p2p
//!
//! Peer pool for the Opal gossip overlay.
//!
//! This crate provides:
//! - Live peer connection management with inbound/outbound capacity limits
//! - Request/response and fire-and-forget messaging over opaque transports
//! - Periodic peer discovery and a bucketed new/tried peer directory
//! - Penalty accounting with temporary bans
//! - A single typed event stream consumed by the host node

pub mod directory;
pub mod discovery;
mod error;
mod event;
mod info;
mod message;
mod peer;
mod pool;
pub mod selectors;
mod transport;

pub use error::{P2pError, P2pResult};
pub use event::PoolEvent;
pub use info::{NodeInfo, PeerAttributes, PeerId, PeerInfo};
pub use message::{procedures, remote_events, MessagePacket, RequestPacket};
pub use peer::{Peer, PeerConfig, PeerKind, PeerState};
pub use pool::{PeerCounts, PeerPool, PoolConfig};
pub use selectors::{ConnectionSelector, RequestSelector, SendSelector};
pub use transport::{
    socket_pair, Dialer, IncomingRequest, SocketCommand, SocketEvent, SocketHandle,
    TransportEndpoint,
};

/// Maximum number of peer entries accepted from a single `getPeers` response.
pub const MAX_PEER_LIST_BATCH_SIZE: usize = 100;

/// Maximum number of connected peers probed per discovery round.
pub const MAX_PEER_DISCOVERY_PROBE_SAMPLE_SIZE: usize = 100;
