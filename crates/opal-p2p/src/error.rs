//! Peer pool error types.

use crate::info::PeerId;
use thiserror::Error;

/// Errors surfaced by the peer pool and its connections.
#[derive(Error, Debug)]
pub enum P2pError {
    /// No peer was available, or the destination peer is not in the pool.
    #[error("request failed: {0}")]
    RequestFail(String),

    /// A request exceeded the configured acknowledgement timeout.
    #[error("request timed out after {elapsed_ms} ms")]
    RequestTimeout { elapsed_ms: u64 },

    /// The destination peer is absent or its channel is not connected.
    #[error("send failed: {0}")]
    SendFail(String),

    /// An inbound peer with this id already exists.
    #[error("duplicate peer: {0}")]
    DuplicatePeer(PeerId),

    /// A penalty was applied against an unknown peer.
    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    /// The peer has an active ban.
    #[error("peer banned: {0}")]
    PeerBanned(PeerId),

    /// A node info push to a peer failed.
    #[error("node info push failed: {0}")]
    PushFail(String),

    /// A status fetch from a peer failed.
    #[error("status fetch failed: {0}")]
    FetchInfoFail(String),

    /// Payload serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for peer pool operations.
pub type P2pResult<T> = Result<T, P2pError>;
