//! Pluggable peer selection.
//!
//! The pool never decides which peers carry a send, answer a request, or
//! receive a dial; it delegates to three pure functions configured at
//! construction. The defaults sample uniformly at random. Callers may only
//! assume that the returned peers are a subset of the candidates, never an
//! ordering.

use crate::info::{NodeInfo, PeerInfo};
use crate::message::{MessagePacket, RequestPacket};
use rand::seq::SliceRandom;

/// Candidates for a broadcast send.
pub struct SendSelection<'a> {
    pub peers: &'a [PeerInfo],
    pub node_info: Option<&'a NodeInfo>,
    pub peer_limit: usize,
    pub message: Option<&'a MessagePacket>,
}

/// Candidates for a request.
pub struct RequestSelection<'a> {
    pub peers: &'a [PeerInfo],
    pub node_info: Option<&'a NodeInfo>,
    pub peer_limit: usize,
    pub request: Option<&'a RequestPacket>,
}

/// Candidates for new outbound connections.
pub struct ConnectionSelection<'a> {
    pub peers: &'a [PeerInfo],
    pub peer_limit: usize,
}

pub type SendSelector = fn(&SendSelection<'_>) -> Vec<PeerInfo>;
pub type RequestSelector = fn(&RequestSelection<'_>) -> Vec<PeerInfo>;
pub type ConnectionSelector = fn(&ConnectionSelection<'_>) -> Vec<PeerInfo>;

/// Default send selector: a uniform random sample up to the limit.
pub fn select_for_send(input: &SendSelection<'_>) -> Vec<PeerInfo> {
    sample(input.peers, input.peer_limit)
}

/// Default request selector: a uniform random sample up to the limit.
/// Returning an empty set is a legal outcome.
pub fn select_for_request(input: &RequestSelection<'_>) -> Vec<PeerInfo> {
    sample(input.peers, input.peer_limit)
}

/// Default connection selector: a uniform random sample up to the limit.
pub fn select_for_connection(input: &ConnectionSelection<'_>) -> Vec<PeerInfo> {
    sample(input.peers, input.peer_limit)
}

fn sample(peers: &[PeerInfo], limit: usize) -> Vec<PeerInfo> {
    let mut rng = rand::thread_rng();
    peers
        .choose_multiple(&mut rng, limit.min(peers.len()))
        .cloned()
        .collect()
}
