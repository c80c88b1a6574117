//! Peer discovery over connected peers.
//!
//! Discovery probes a sample of live peers for their peer lists, unions the
//! responses, and filters the result. It never fails as a whole: individual
//! probe failures are collected for the pool to report as events.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::debug;

use crate::info::{PeerId, PeerInfo};
use crate::message::{self, procedures, RequestPacket};
use crate::peer::Peer;
use crate::{P2pError, P2pResult, MAX_PEER_LIST_BATCH_SIZE};

/// How many peers are probed concurrently.
const PROBE_CONCURRENCY: usize = 10;

/// Result of one discovery round.
#[derive(Debug)]
pub struct DiscoveryOutcome {
    /// Deduplicated peers learned this round.
    pub discovered: Vec<PeerInfo>,
    /// Probes that failed, one entry per failed peer.
    pub failures: Vec<(PeerId, P2pError)>,
}

/// Probe each sampled peer for its peer list and union the responses.
///
/// Entries whose IP address is blacklisted are dropped; duplicates are
/// collapsed by peer id, keeping the first occurrence. Each response is
/// capped at [`MAX_PEER_LIST_BATCH_SIZE`] entries.
pub async fn discover_peers(
    sample: &[Arc<Peer>],
    blacklist: &HashSet<String>,
) -> DiscoveryOutcome {
    let probes: Vec<(PeerId, P2pResult<Vec<PeerInfo>>)> = stream::iter(sample.to_vec())
        .map(|peer| async move {
            let outcome = probe_peer(&peer).await;
            (peer.id().clone(), outcome)
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .collect()
        .await;

    let mut discovered = Vec::new();
    let mut failures = Vec::new();
    let mut seen: HashSet<PeerId> = HashSet::new();

    for (peer_id, outcome) in probes {
        match outcome {
            Ok(list) => {
                for info in list {
                    if blacklist.contains(&info.ip_address) {
                        continue;
                    }
                    if seen.insert(info.peer_id()) {
                        discovered.push(info);
                    }
                }
            }
            Err(error) => {
                debug!(peer = %peer_id, error = %error, "peer list probe failed");
                failures.push((peer_id, error));
            }
        }
    }

    debug!(
        probed = sample.len(),
        discovered = discovered.len(),
        failed = failures.len(),
        "discovery round complete"
    );
    DiscoveryOutcome {
        discovered,
        failures,
    }
}

async fn probe_peer(peer: &Peer) -> P2pResult<Vec<PeerInfo>> {
    let response = peer.request(RequestPacket::new(procedures::GET_PEERS)).await?;
    let mut list: Vec<PeerInfo> = message::decode_payload(&response)?;
    list.truncate(MAX_PEER_LIST_BATCH_SIZE);
    Ok(list)
}
