//! The peer pool: live-peer map, capacity limits, event fan-in, bans.
//!
//! The pool owns every live [`Peer`] and a single event loop task. All
//! per-peer events funnel through one fan-in channel; the loop maintains the
//! map (close events remove the peer before re-emission, connects trigger a
//! status fetch, bans schedule an unban) and forwards every event to the one
//! host subscriber.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::directory::{DirectoryConfig, PeerDirectory};
use crate::discovery;
use crate::event::PoolEvent;
use crate::info::{NodeInfo, PeerId, PeerInfo};
use crate::message::{MessagePacket, RequestPacket};
use crate::peer::{Peer, PeerConfig, PeerKind, PeerState};
use crate::selectors::{
    self, ConnectionSelection, ConnectionSelector, RequestSelection, RequestSelector,
    SendSelection, SendSelector,
};
use crate::transport::{Dialer, SocketHandle};
use crate::{P2pError, P2pResult, MAX_PEER_DISCOVERY_PROBE_SAMPLE_SIZE};

/// Host event channel capacity.
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Fan-in channel capacity.
const INTERNAL_CHANNEL_CAPACITY: usize = 1000;

/// Bounded fan-out for background pushes and status fetches.
const PUSH_CONCURRENCY: usize = 16;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Outbound dial timeout.
    pub connect_timeout: Duration,
    /// Request/response timeout.
    pub ack_timeout: Duration,
    /// Selector for broadcast sends.
    pub select_for_send: SendSelector,
    /// Selector for requests.
    pub select_for_request: RequestSelector,
    /// Selector for new outbound connections.
    pub select_for_connection: ConnectionSelector,
    /// Fan-out for `send`.
    pub send_peer_limit: usize,
    /// How long a ban lasts.
    pub peer_ban_time: Duration,
    /// Accumulated penalty that triggers a ban.
    pub ban_threshold: u32,
    /// Hard cap on outbound peers.
    pub max_outbound_connections: usize,
    /// Hard cap on inbound peers; exceeding evicts a random inbound.
    pub max_inbound_connections: usize,
    /// Period of the outbound-shuffle timer.
    pub outbound_eviction_interval: Duration,
    /// Peer directory sizing.
    pub directory: DirectoryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(10),
            select_for_send: selectors::select_for_send,
            select_for_request: selectors::select_for_request,
            select_for_connection: selectors::select_for_connection,
            send_peer_limit: 16,
            peer_ban_time: Duration::from_secs(86_400),
            ban_threshold: 100,
            max_outbound_connections: 20,
            max_inbound_connections: 100,
            outbound_eviction_interval: Duration::from_secs(30),
            directory: DirectoryConfig::default(),
        }
    }
}

impl PoolConfig {
    fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            connect_timeout: self.connect_timeout,
            ack_timeout: self.ack_timeout,
            ban_threshold: self.ban_threshold,
        }
    }
}

/// Live peer counts per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerCounts {
    pub inbound: usize,
    pub outbound: usize,
}

/// Manages every live connection of the node.
pub struct PeerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    node_info: RwLock<Option<NodeInfo>>,
    banned_until: DashMap<PeerId, Instant>,
    directory: Mutex<PeerDirectory>,
    dialer: Box<dyn Dialer>,
    internal_tx: mpsc::Sender<PoolEvent>,
    host_tx: mpsc::Sender<PoolEvent>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    shuffle: Mutex<Option<JoinHandle<()>>>,
    unban_timers: Mutex<HashMap<PeerId, JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerPool {
    /// Create the pool and its single event subscription. Must run inside a
    /// Tokio runtime; the event loop and the outbound-shuffle timer start
    /// immediately.
    pub fn new(config: PoolConfig, dialer: impl Dialer) -> (Self, mpsc::Receiver<PoolEvent>) {
        let (host_tx, host_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_CHANNEL_CAPACITY);

        let inner = Arc::new(PoolInner {
            directory: Mutex::new(PeerDirectory::new(config.directory.clone())),
            config,
            peers: RwLock::new(HashMap::new()),
            node_info: RwLock::new(None),
            banned_until: DashMap::new(),
            dialer: Box::new(dialer),
            internal_tx,
            host_tx,
            event_loop: Mutex::new(None),
            shuffle: Mutex::new(None),
            unban_timers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        });

        *inner.event_loop.lock() = Some(tokio::spawn(event_loop(
            Arc::clone(&inner),
            internal_rx,
        )));
        *inner.shuffle.lock() = Some(tokio::spawn(shuffle_loop(Arc::clone(&inner))));

        (Self { inner }, host_rx)
    }

    /// Store the local node info and push it to every current peer in the
    /// background. Per-peer failures become `FailedToPushNodeInfo` events.
    pub fn apply_node_info(&self, node_info: NodeInfo) {
        *self.inner.node_info.write() = Some(node_info.clone());

        let peers: Vec<Arc<Peer>> = self.inner.peers.read().values().cloned().collect();
        debug!(peers = peers.len(), "pushing node info to peers");

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            stream::iter(peers)
                .for_each_concurrent(PUSH_CONCURRENCY, |peer| {
                    let inner = Arc::clone(&inner);
                    let node_info = node_info.clone();
                    async move {
                        if let Err(e) = peer.apply_node_info(&node_info) {
                            inner
                                .emit(PoolEvent::FailedToPushNodeInfo {
                                    peer_id: peer.id().clone(),
                                    error: e.to_string(),
                                })
                                .await;
                        }
                    }
                })
                .await;
        });
        self.inner.track(handle);
    }

    /// The currently stored node info.
    pub fn node_info(&self) -> Option<NodeInfo> {
        self.inner.node_info.read().clone()
    }

    /// Request from one peer chosen by the request selector.
    pub async fn request(&self, packet: RequestPacket) -> P2pResult<Bytes> {
        let candidates = self.connected_peer_infos();
        let node_info = self.inner.node_info.read().clone();
        let selection = RequestSelection {
            peers: &candidates,
            node_info: node_info.as_ref(),
            peer_limit: 1,
            request: Some(&packet),
        };
        let selected = (self.inner.config.select_for_request)(&selection);
        let target = selected.first().ok_or_else(|| {
            P2pError::RequestFail("no peers found in peer selection".to_string())
        })?;
        self.request_from_peer(packet, &target.peer_id()).await
    }

    /// Request from a specific peer.
    pub async fn request_from_peer(
        &self,
        packet: RequestPacket,
        peer_id: &PeerId,
    ) -> P2pResult<Bytes> {
        let peer = self
            .inner
            .peers
            .read()
            .get(peer_id)
            .cloned()
            .ok_or_else(|| {
                P2pError::RequestFail(format!("peer {} is not in the pool", peer_id))
            })?;
        peer.request(packet).await
    }

    /// Broadcast a message to peers chosen by the send selector. Per-peer
    /// failures become `FailedToSendMessage` events, never errors.
    pub async fn send(&self, message: MessagePacket) {
        let candidates = self.connected_peer_infos();
        let node_info = self.inner.node_info.read().clone();
        let selection = SendSelection {
            peers: &candidates,
            node_info: node_info.as_ref(),
            peer_limit: self.inner.config.send_peer_limit,
            message: Some(&message),
        };
        let selected = (self.inner.config.select_for_send)(&selection);

        for target in selected {
            let peer_id = target.peer_id();
            if let Err(e) = self.send_to_peer(message.clone(), &peer_id) {
                self.inner
                    .emit(PoolEvent::FailedToSendMessage {
                        peer_id,
                        error: e.to_string(),
                    })
                    .await;
            }
        }
    }

    /// Send a message to a specific peer.
    pub fn send_to_peer(&self, message: MessagePacket, peer_id: &PeerId) -> P2pResult<()> {
        let peer = self
            .inner
            .peers
            .read()
            .get(peer_id)
            .cloned()
            .ok_or_else(|| P2pError::SendFail(format!("peer {} is not in the pool", peer_id)))?;
        peer.send(message)
    }

    /// Dial each seed as an outbound peer and fetch its status. Failed seeds
    /// emit `FailedToFetchPeerInfo` and are removed again; the returned list
    /// holds the successfully fetched peer infos.
    pub async fn fetch_status_and_create_peers(&self, seeds: &[PeerInfo]) -> Vec<PeerInfo> {
        let fetched: Vec<Option<PeerInfo>> = stream::iter(seeds.to_vec())
            .map(|seed| async move {
                let seed_id = seed.peer_id();
                let peer = match self.add_outbound_peer(seed, None).await {
                    Ok(peer) => peer,
                    Err(e) => {
                        self.inner
                            .emit(PoolEvent::FailedToFetchPeerInfo {
                                peer_id: seed_id,
                                error: e.to_string(),
                            })
                            .await;
                        return None;
                    }
                };
                match peer.fetch_status().await {
                    Ok(info) => {
                        self.inner.directory.lock().promote(info.clone());
                        Some(info)
                    }
                    Err(e) => {
                        self.inner
                            .emit(PoolEvent::FailedToFetchPeerInfo {
                                peer_id: seed_id.clone(),
                                error: e.to_string(),
                            })
                            .await;
                        self.remove_peer(&seed_id).await;
                        None
                    }
                }
            })
            .buffer_unordered(PUSH_CONCURRENCY)
            .collect()
            .await;

        fetched.into_iter().flatten().collect()
    }

    /// Run one discovery round: ensure outbound entries for the known peers,
    /// probe a random sample of the pool, file the results in the directory
    /// and refresh infos of peers already in the map.
    pub async fn run_discovery(
        &self,
        known_peers: &[PeerInfo],
        blacklist: &[String],
    ) -> Vec<PeerInfo> {
        for known in known_peers {
            let peer_id = known.peer_id();
            if self.has_peer(&peer_id) || self.inner.is_banned(&peer_id) {
                continue;
            }
            if let Err(e) = self.add_outbound_peer(known.clone(), None).await {
                debug!(peer = %peer_id, error = %e, "could not ensure outbound entry");
            }
        }

        let sample: Vec<Arc<Peer>> = {
            let mut all: Vec<Arc<Peer>> = self.inner.peers.read().values().cloned().collect();
            all.shuffle(&mut rand::thread_rng());
            all.truncate(MAX_PEER_DISCOVERY_PROBE_SAMPLE_SIZE);
            all
        };

        let blacklist = blacklist.iter().cloned().collect();
        let outcome = discovery::discover_peers(&sample, &blacklist).await;

        for (peer_id, error) in outcome.failures {
            self.inner
                .emit(PoolEvent::FailedToFetchPeerInfo {
                    peer_id,
                    error: error.to_string(),
                })
                .await;
        }

        {
            let mut directory = self.inner.directory.lock();
            for discovered in &outcome.discovered {
                directory.add_new(discovered.clone());
            }
        }
        {
            let peers = self.inner.peers.read();
            for discovered in &outcome.discovered {
                if let Some(peer) = peers.get(&discovered.peer_id()) {
                    peer.set_info(discovered.clone());
                }
            }
        }

        info!(discovered = outcome.discovered.len(), "discovery round finished");
        outcome.discovered
    }

    /// Open outbound connections towards selected fresh candidates, up to
    /// the free outbound capacity.
    pub async fn trigger_new_connections(&self, candidates: &[PeerInfo]) {
        let (free_slots, fresh) = {
            let peers = self.inner.peers.read();
            let outbound = peers
                .values()
                .filter(|p| p.kind() == PeerKind::Outbound)
                .count();
            let free = self
                .inner
                .config
                .max_outbound_connections
                .saturating_sub(outbound);
            let fresh: Vec<PeerInfo> = candidates
                .iter()
                .filter(|c| !peers.contains_key(&c.peer_id()))
                .filter(|c| !self.inner.is_banned(&c.peer_id()))
                .cloned()
                .collect();
            (free, fresh)
        };
        if free_slots == 0 || fresh.is_empty() {
            return;
        }

        let selection = ConnectionSelection {
            peers: &fresh,
            peer_limit: free_slots,
        };
        let selected = (self.inner.config.select_for_connection)(&selection);

        for candidate in selected.into_iter().take(free_slots) {
            if let Err(e) = self.add_outbound_peer(candidate, None).await {
                debug!(error = %e, "skipping connection candidate");
            }
        }
    }

    /// Directory-backed candidates for new connections: known peers that are
    /// neither live nor banned.
    pub fn peers_to_connect(&self, count: usize) -> Vec<PeerInfo> {
        let live: Vec<PeerId> = self.inner.peers.read().keys().cloned().collect();
        let mut candidates = self
            .inner
            .directory
            .lock()
            .candidates(count.saturating_add(live.len()));
        candidates.retain(|info| {
            let id = info.peer_id();
            !live.contains(&id) && !self.inner.is_banned(&id)
        });
        candidates.truncate(count);
        candidates
    }

    /// Accept an inbound socket. At capacity a random inbound peer is
    /// evicted first. A live peer with the same id is a `DuplicatePeer`
    /// error.
    pub async fn add_inbound_peer(
        &self,
        peer_info: PeerInfo,
        socket: SocketHandle,
    ) -> P2pResult<Arc<Peer>> {
        let peer_id = peer_info.peer_id();
        if self.inner.is_banned(&peer_id) {
            return Err(P2pError::PeerBanned(peer_id));
        }

        let (peer, evicted) = {
            let mut peers = self.inner.peers.write();
            if peers.contains_key(&peer_id) {
                return Err(P2pError::DuplicatePeer(peer_id));
            }

            let mut evicted = None;
            let inbound: Vec<PeerId> = peers
                .values()
                .filter(|p| p.kind() == PeerKind::Inbound)
                .map(|p| p.id().clone())
                .collect();
            if inbound.len() >= self.inner.config.max_inbound_connections {
                if let Some(victim) = inbound.choose(&mut rand::thread_rng()) {
                    evicted = peers.remove(victim);
                }
            }

            let peer = Peer::spawn(
                peer_info,
                PeerKind::Inbound,
                socket,
                self.inner.config.peer_config(),
                self.inner.internal_tx.clone(),
            );
            peers.insert(peer_id.clone(), Arc::clone(&peer));
            (peer, evicted)
        };

        if let Some(victim) = evicted {
            info!(peer = %victim.id(), "evicting inbound peer over capacity");
            victim.disconnect().await;
        }

        debug!(peer = %peer_id, "added inbound peer");
        Ok(peer)
    }

    /// Add (or refresh) an outbound peer. Re-adding an existing id updates
    /// its stored info and returns the live connection. Without a socket the
    /// pool dials through its configured dialer; the transport connects in
    /// the background.
    pub async fn add_outbound_peer(
        &self,
        peer_info: PeerInfo,
        socket: Option<SocketHandle>,
    ) -> P2pResult<Arc<Peer>> {
        let peer_id = peer_info.peer_id();
        if self.inner.is_banned(&peer_id) {
            return Err(P2pError::PeerBanned(peer_id));
        }

        let (peer, evicted) = {
            let mut peers = self.inner.peers.write();
            if let Some(existing) = peers.get(&peer_id) {
                existing.set_info(peer_info);
                return Ok(Arc::clone(existing));
            }

            let mut evicted = None;
            let outbound: Vec<PeerId> = peers
                .values()
                .filter(|p| p.kind() == PeerKind::Outbound)
                .map(|p| p.id().clone())
                .collect();
            if outbound.len() >= self.inner.config.max_outbound_connections {
                if let Some(victim) = outbound.choose(&mut rand::thread_rng()) {
                    evicted = peers.remove(victim);
                }
            }

            let socket = match socket {
                Some(socket) => socket,
                None => self.inner.dialer.dial(&peer_info),
            };
            let peer = Peer::spawn(
                peer_info,
                PeerKind::Outbound,
                socket,
                self.inner.config.peer_config(),
                self.inner.internal_tx.clone(),
            );
            peers.insert(peer_id.clone(), Arc::clone(&peer));
            (peer, evicted)
        };

        if let Some(victim) = evicted {
            info!(peer = %victim.id(), "evicting outbound peer over capacity");
            victim.disconnect().await;
        }

        debug!(peer = %peer_id, "added outbound peer");
        Ok(peer)
    }

    /// Disconnect and drop a peer. Returns false when the peer is unknown.
    pub async fn remove_peer(&self, peer_id: &PeerId) -> bool {
        let peer = self.inner.peers.write().remove(peer_id);
        match peer {
            Some(peer) => {
                peer.disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Apply a penalty to a live peer.
    pub async fn apply_penalty(&self, peer_id: &PeerId, weight: u32) -> P2pResult<()> {
        let peer = self
            .inner
            .peers
            .read()
            .get(peer_id)
            .cloned()
            .ok_or_else(|| P2pError::PeerNotFound(peer_id.clone()))?;
        peer.apply_penalty(weight).await;
        Ok(())
    }

    /// Live peers, optionally filtered by kind.
    pub fn get_peers(&self, kind: Option<PeerKind>) -> Vec<Arc<Peer>> {
        self.inner
            .peers
            .read()
            .values()
            .filter(|p| kind.map_or(true, |k| p.kind() == k))
            .cloned()
            .collect()
    }

    /// Look up a live peer.
    pub fn get_peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.inner.peers.read().get(peer_id).cloned()
    }

    /// True when the peer is live.
    pub fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.inner.peers.read().contains_key(peer_id)
    }

    /// Info snapshots of every live peer.
    pub fn get_all_peer_infos(&self) -> Vec<PeerInfo> {
        self.inner.peers.read().values().map(|p| p.info()).collect()
    }

    /// Live peer counts per kind.
    pub fn peer_counts(&self) -> PeerCounts {
        let peers = self.inner.peers.read();
        let inbound = peers
            .values()
            .filter(|p| p.kind() == PeerKind::Inbound)
            .count();
        PeerCounts {
            inbound,
            outbound: peers.len() - inbound,
        }
    }

    /// Cancel the shuffle timer and background tasks, then disconnect every
    /// peer. Socket teardown completion is best-effort.
    pub async fn remove_all_peers(&self) {
        if let Some(handle) = self.inner.shuffle.lock().take() {
            handle.abort();
        }
        for (_, handle) in self.inner.unban_timers.lock().drain() {
            handle.abort();
        }
        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }

        let peers: Vec<Arc<Peer>> = {
            let mut map = self.inner.peers.write();
            map.drain().map(|(_, peer)| peer).collect()
        };
        info!(peers = peers.len(), "disconnecting all peers");
        for peer in peers {
            peer.disconnect().await;
        }
    }

    fn connected_peer_infos(&self) -> Vec<PeerInfo> {
        self.inner
            .peers
            .read()
            .values()
            .filter(|p| p.state() == PeerState::Connected)
            .map(|p| p.info())
            .collect()
    }
}

impl Drop for PeerPool {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.event_loop.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.shuffle.lock().take() {
            handle.abort();
        }
        for (_, handle) in self.inner.unban_timers.lock().drain() {
            handle.abort();
        }
        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }
        for (_, peer) in self.inner.peers.write().drain() {
            peer.shutdown();
        }
    }
}

impl PoolInner {
    async fn emit(&self, event: PoolEvent) {
        if self.internal_tx.send(event).await.is_err() {
            debug!("pool event loop gone, dropping event");
        }
    }

    fn is_banned(&self, peer_id: &PeerId) -> bool {
        match self.banned_until.get(peer_id) {
            Some(deadline) if Instant::now() < *deadline => return true,
            Some(_) => {}
            None => return false,
        }
        self.banned_until.remove(peer_id);
        false
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }
}

/// Drains the fan-in channel: maintains the map, then re-emits to the host.
async fn event_loop(inner: Arc<PoolInner>, mut events: mpsc::Receiver<PoolEvent>) {
    while let Some(event) = events.recv().await {
        match &event {
            // The map stays authoritative: a closed peer leaves it before
            // the close event reaches the subscriber.
            PoolEvent::CloseOutbound { peer_id }
            | PoolEvent::CloseInbound { peer_id }
            | PoolEvent::ConnectAbortOutbound { peer_id } => {
                inner.peers.write().remove(peer_id);
            }
            PoolEvent::ConnectOutbound { peer_id } => {
                let peer = inner.peers.read().get(peer_id).cloned();
                if let Some(peer) = peer {
                    spawn_status_fetch(&inner, peer);
                }
            }
            PoolEvent::BanPeer { peer_id } => {
                schedule_unban(&inner, peer_id.clone());
            }
            _ => {}
        }

        if inner.host_tx.send(event).await.is_err() {
            // Host dropped its receiver; keep maintaining the map anyway.
            debug!("host event receiver closed");
        }
    }
}

/// Fetch a freshly connected peer's status in the background; success files
/// the peer in the tried tier and emits `DiscoveredPeer`.
fn spawn_status_fetch(inner: &Arc<PoolInner>, peer: Arc<Peer>) {
    let task_inner = Arc::clone(inner);
    let handle = tokio::spawn(async move {
        match peer.fetch_status().await {
            Ok(peer_info) => {
                task_inner.directory.lock().promote(peer_info.clone());
                task_inner
                    .emit(PoolEvent::DiscoveredPeer { peer_info })
                    .await;
            }
            Err(e) => {
                task_inner
                    .emit(PoolEvent::FailedToFetchPeerInfo {
                        peer_id: peer.id().clone(),
                        error: e.to_string(),
                    })
                    .await;
            }
        }
    });
    inner.track(handle);
}

/// Record the ban deadline and schedule the matching unban emission.
fn schedule_unban(inner: &Arc<PoolInner>, peer_id: PeerId) {
    let deadline = Instant::now() + inner.config.peer_ban_time;
    inner.banned_until.insert(peer_id.clone(), deadline);
    warn!(peer = %peer_id, until = ?deadline, "peer banned");

    let task_inner = Arc::clone(inner);
    let task_id = peer_id.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(task_inner.config.peer_ban_time).await;
        task_inner.banned_until.remove(&task_id);
        task_inner.unban_timers.lock().remove(&task_id);
        task_inner
            .emit(PoolEvent::UnbanPeer {
                peer_id: task_id.clone(),
            })
            .await;
    });
    if let Some(previous) = inner.unban_timers.lock().insert(peer_id, handle) {
        previous.abort();
    }
}

/// Periodically evict one random outbound peer so the outbound set rotates.
async fn shuffle_loop(inner: Arc<PoolInner>) {
    let mut interval = tokio::time::interval(inner.config.outbound_eviction_interval);
    interval.tick().await; // the first tick fires immediately
    loop {
        interval.tick().await;
        let victim = {
            let peers = inner.peers.read();
            let outbound: Vec<Arc<Peer>> = peers
                .values()
                .filter(|p| p.kind() == PeerKind::Outbound)
                .cloned()
                .collect();
            outbound.choose(&mut rand::thread_rng()).cloned()
        };
        if let Some(peer) = victim {
            debug!(peer = %peer.id(), "rotating out outbound peer");
            peer.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::PeerAttributes;
    use crate::message;
    use crate::message::remote_events;
    use crate::transport::{socket_pair, SocketCommand, SocketEvent, TransportEndpoint};
    use tokio::time::timeout as tokio_timeout;

    fn test_config() -> PoolConfig {
        PoolConfig {
            connect_timeout: Duration::from_millis(200),
            ack_timeout: Duration::from_millis(200),
            peer_ban_time: Duration::from_millis(50),
            outbound_eviction_interval: Duration::from_secs(3600),
            directory: DirectoryConfig {
                new_bucket_count: 16,
                tried_bucket_count: 8,
                bucket_size: 8,
                secret: 1,
            },
            ..PoolConfig::default()
        }
    }

    fn sample_node_info() -> NodeInfo {
        NodeInfo {
            version: "1.0.0".to_string(),
            height: 100,
            broadhash: "aa".to_string(),
            nonce: "n".to_string(),
            os: "linux".to_string(),
            ws_port: 5000,
            http_port: None,
            protocol_version: "1.1".to_string(),
        }
    }

    /// A dialer that never connects; its sockets close immediately.
    fn null_dialer() -> impl Dialer {
        |_: &PeerInfo| socket_pair().0
    }

    type EndpointStash = Arc<Mutex<Vec<TransportEndpoint>>>;

    /// A dialer that parks each dialed endpoint so tests can drive it.
    fn stash_dialer() -> (impl Dialer, EndpointStash) {
        let stash: EndpointStash = Arc::new(Mutex::new(Vec::new()));
        let dialer_stash = Arc::clone(&stash);
        let dialer = move |_: &PeerInfo| {
            let (handle, endpoint) = socket_pair();
            dialer_stash.lock().push(endpoint);
            handle
        };
        (dialer, stash)
    }

    /// Answer every request on the endpoint with the given encoder result.
    fn serve_requests<F>(mut endpoint: TransportEndpoint, respond: F)
    where
        F: Fn(&RequestPacket) -> Result<Bytes, String> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(command) = endpoint.commands.recv().await {
                if let SocketCommand::Request { packet, reply } = command {
                    let _ = reply.send(respond(&packet));
                }
            }
        });
    }

    #[tokio::test]
    async fn test_inbound_eviction_at_capacity() {
        let mut config = test_config();
        config.max_inbound_connections = 2;
        config.max_outbound_connections = 0;
        let (pool, mut events) = PeerPool::new(config, null_dialer());

        let mut endpoints = Vec::new();
        for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
            let (handle, endpoint) = socket_pair();
            endpoints.push(endpoint);
            pool.add_inbound_peer(PeerInfo::new(ip, 5000), handle)
                .await
                .unwrap();
        }

        assert_eq!(pool.peer_counts(), PeerCounts { inbound: 2, outbound: 0 });
        assert!(pool.has_peer(&PeerId::new("3.3.3.3", 5000)));
        let earlier = [PeerId::new("1.1.1.1", 5000), PeerId::new("2.2.2.2", 5000)];
        assert_eq!(earlier.iter().filter(|id| pool.has_peer(id)).count(), 1);

        let mut inbound_closes = 0;
        while let Ok(Some(event)) =
            tokio_timeout(Duration::from_millis(100), events.recv()).await
        {
            if matches!(event, PoolEvent::CloseInbound { .. }) {
                inbound_closes += 1;
            }
        }
        assert_eq!(inbound_closes, 1);
    }

    #[tokio::test]
    async fn test_discovery_returns_filtered_new_peers() {
        let (pool, _events) = PeerPool::new(test_config(), null_dialer());

        let probe_info = PeerInfo::new("10.0.0.1", 5000);
        let (handle, endpoint) = socket_pair();
        pool.add_inbound_peer(probe_info.clone(), handle)
            .await
            .unwrap();
        let response = vec![
            PeerInfo::new("10.0.0.2", 5000),
            PeerInfo::new("10.0.0.3", 5000),
        ];
        serve_requests(endpoint, move |_| {
            Ok(message::encode_payload(&response).unwrap())
        });

        let discovered = pool
            .run_discovery(&[probe_info], &["10.0.0.2".to_string()])
            .await;
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].peer_id().as_str(), "10.0.0.3:5000");

        // The directory learned the fresh peer.
        let candidates = pool.peers_to_connect(10);
        assert!(candidates
            .iter()
            .any(|p| p.peer_id().as_str() == "10.0.0.3:5000"));
    }

    #[tokio::test]
    async fn test_request_with_no_peers_fails() {
        let (pool, _events) = PeerPool::new(test_config(), null_dialer());

        let err = pool
            .request(RequestPacket::new("getBlocks"))
            .await
            .unwrap_err();
        match err {
            P2pError::RequestFail(msg) => assert_eq!(msg, "no peers found in peer selection"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_round_trip_through_pool() {
        let (pool, _events) = PeerPool::new(test_config(), null_dialer());

        let (handle, endpoint) = socket_pair();
        let info = PeerInfo::new("10.0.0.1", 5000);
        let peer_id = info.peer_id();
        pool.add_inbound_peer(info, handle).await.unwrap();
        serve_requests(endpoint, |packet| {
            assert_eq!(packet.procedure, "getBlocks");
            Ok(Bytes::from_static(b"[1,2]"))
        });

        let via_selector = pool.request(RequestPacket::new("getBlocks")).await.unwrap();
        assert_eq!(via_selector, Bytes::from_static(b"[1,2]"));

        let direct = pool
            .request_from_peer(RequestPacket::new("getBlocks"), &peer_id)
            .await
            .unwrap();
        assert_eq!(direct, Bytes::from_static(b"[1,2]"));

        let missing = pool
            .request_from_peer(RequestPacket::new("getBlocks"), &PeerId::new("9.9.9.9", 1))
            .await;
        assert!(matches!(missing, Err(P2pError::RequestFail(_))));
    }

    #[tokio::test]
    async fn test_ban_lifecycle() {
        let (pool, mut events) = PeerPool::new(test_config(), null_dialer());

        let (handle, _endpoint) = socket_pair();
        let info = PeerInfo::new("9.9.9.9", 5000);
        let peer_id = info.peer_id();
        pool.add_inbound_peer(info, handle).await.unwrap();

        let started = Instant::now();
        pool.apply_penalty(&peer_id, 150).await.unwrap();

        match events.recv().await.unwrap() {
            PoolEvent::BanPeer { peer_id: banned } => assert_eq!(banned, peer_id),
            other => panic!("unexpected event: {:?}", other),
        }
        match events.recv().await.unwrap() {
            PoolEvent::CloseInbound { peer_id: closed } => assert_eq!(closed, peer_id),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!pool.has_peer(&peer_id));

        match tokio_timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            PoolEvent::UnbanPeer { peer_id: unbanned } => {
                assert_eq!(unbanned, peer_id);
                assert!(started.elapsed() >= Duration::from_millis(50));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_penalty_against_unknown_peer() {
        let (pool, _events) = PeerPool::new(test_config(), null_dialer());
        let result = pool.apply_penalty(&PeerId::new("1.1.1.1", 5000), 10).await;
        assert!(matches!(result, Err(P2pError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_node_info_fanout_with_one_faulty_peer() {
        let (pool, mut events) = PeerPool::new(test_config(), null_dialer());

        let mut healthy = Vec::new();
        for ip in ["1.1.1.1", "2.2.2.2"] {
            let (handle, endpoint) = socket_pair();
            healthy.push(endpoint);
            pool.add_inbound_peer(PeerInfo::new(ip, 5000), handle)
                .await
                .unwrap();
        }

        // Faulty peer: the transport stopped consuming commands but the
        // connection is still up.
        let (handle, endpoint) = socket_pair();
        let TransportEndpoint {
            commands: faulty_commands,
            events: _faulty_events,
        } = endpoint;
        drop(faulty_commands);
        pool.add_inbound_peer(PeerInfo::new("3.3.3.3", 5000), handle)
            .await
            .unwrap();

        pool.apply_node_info(sample_node_info());

        match tokio_timeout(Duration::from_millis(500), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            PoolEvent::FailedToPushNodeInfo { peer_id, .. } => {
                assert_eq!(peer_id.as_str(), "3.3.3.3:5000");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(tokio_timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err());

        for endpoint in &mut healthy {
            match tokio_timeout(Duration::from_millis(100), endpoint.commands.recv())
                .await
                .unwrap()
                .unwrap()
            {
                SocketCommand::Send { packet } => {
                    assert_eq!(packet.event, remote_events::POST_NODE_INFO);
                }
                other => panic!("unexpected command: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_duplicate_outbound_updates_info_without_resubscribing() {
        let (dialer, stash) = stash_dialer();
        let mut config = test_config();
        config.connect_timeout = Duration::from_secs(5);
        let (pool, mut events) = PeerPool::new(config, dialer);

        let mut first = PeerInfo::new("1.2.3.4", 5000);
        first.attributes = Some(PeerAttributes {
            height: Some(10),
            ..Default::default()
        });
        let mut second = first.clone();
        second.attributes = Some(PeerAttributes {
            height: Some(20),
            ..Default::default()
        });
        let peer_id = first.peer_id();

        pool.add_outbound_peer(first, None).await.unwrap();
        pool.add_outbound_peer(second, None).await.unwrap();

        assert_eq!(pool.peer_counts(), PeerCounts { inbound: 0, outbound: 1 });
        let stored = pool.get_peer(&peer_id).unwrap().info();
        assert_eq!(stored.attributes.unwrap().height, Some(20));
        assert_eq!(stash.lock().len(), 1);

        // One synthetic emission must surface exactly once.
        let endpoint = stash.lock().pop().unwrap();
        let socket_events = endpoint.events.clone();
        serve_requests(endpoint, |_| {
            Ok(message::encode_payload(&sample_node_info()).unwrap())
        });
        socket_events.send(SocketEvent::Connected).await.unwrap();
        socket_events
            .send(SocketEvent::MessageReceived(MessagePacket::new("postBlock")))
            .await
            .unwrap();

        let mut message_events = 0;
        while let Ok(Some(event)) =
            tokio_timeout(Duration::from_millis(300), events.recv()).await
        {
            if matches!(event, PoolEvent::MessageReceived { .. }) {
                message_events += 1;
            }
        }
        assert_eq!(message_events, 1);
    }

    #[tokio::test]
    async fn test_connect_outbound_triggers_status_fetch() {
        let (dialer, stash) = stash_dialer();
        let mut config = test_config();
        config.connect_timeout = Duration::from_secs(5);
        let (pool, mut events) = PeerPool::new(config, dialer);

        pool.add_outbound_peer(PeerInfo::new("10.0.0.7", 5000), None)
            .await
            .unwrap();

        let endpoint = stash.lock().pop().unwrap();
        let socket_events = endpoint.events.clone();
        serve_requests(endpoint, |_| {
            Ok(message::encode_payload(&sample_node_info()).unwrap())
        });
        socket_events.send(SocketEvent::Connected).await.unwrap();

        assert!(matches!(
            events.recv().await,
            Some(PoolEvent::ConnectOutbound { .. })
        ));
        match tokio_timeout(Duration::from_millis(500), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            PoolEvent::DiscoveredPeer { peer_info } => {
                assert_eq!(peer_info.peer_id().as_str(), "10.0.0.7:5000");
                assert_eq!(peer_info.attributes.unwrap().height, Some(100));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_status_and_create_peers_filters_failures() {
        let (dialer, stash) = stash_dialer();
        let mut config = test_config();
        config.connect_timeout = Duration::from_secs(5);
        let (pool, mut events) = PeerPool::new(config, dialer);

        let seeds = [PeerInfo::new("10.0.1.1", 5000), PeerInfo::new("10.0.1.2", 5000)];

        // Serve status on every dialed endpoint for the first seed only; the
        // second seed's transport rejects the request.
        let stash_clone = Arc::clone(&stash);
        tokio::spawn(async move {
            loop {
                let endpoint = stash_clone.lock().pop();
                if let Some(endpoint) = endpoint {
                    let good = {
                        // Peek nothing: decide by how many endpoints were seen.
                        static SEEN: std::sync::atomic::AtomicUsize =
                            std::sync::atomic::AtomicUsize::new(0);
                        SEEN.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0
                    };
                    let socket_events = endpoint.events.clone();
                    serve_requests(endpoint, move |_| {
                        if good {
                            Ok(message::encode_payload(&sample_node_info()).unwrap())
                        } else {
                            Err("status unavailable".to_string())
                        }
                    });
                    let _ = socket_events.send(SocketEvent::Connected).await;
                } else {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        });

        let fetched = pool.fetch_status_and_create_peers(&seeds).await;
        assert_eq!(fetched.len(), 1);
        assert_eq!(pool.peer_counts().outbound, 1);

        let mut fetch_failures = 0;
        while let Ok(Some(event)) =
            tokio_timeout(Duration::from_millis(200), events.recv()).await
        {
            if matches!(event, PoolEvent::FailedToFetchPeerInfo { .. }) {
                fetch_failures += 1;
            }
        }
        assert!(fetch_failures >= 1);
    }

    #[tokio::test]
    async fn test_trigger_new_connections_respects_outbound_cap() {
        let (dialer, stash) = stash_dialer();
        let mut config = test_config();
        config.max_outbound_connections = 2;
        config.connect_timeout = Duration::from_secs(5);
        let (pool, _events) = PeerPool::new(config, dialer);

        let candidates: Vec<PeerInfo> = (1..=5)
            .map(|i| PeerInfo::new(format!("10.0.0.{}", i), 5000))
            .collect();
        pool.trigger_new_connections(&candidates).await;
        assert_eq!(pool.peer_counts().outbound, 2);

        let more: Vec<PeerInfo> = (6..=9)
            .map(|i| PeerInfo::new(format!("10.0.0.{}", i), 5000))
            .collect();
        pool.trigger_new_connections(&more).await;
        assert_eq!(pool.peer_counts().outbound, 2);

        drop(stash);
    }

    #[tokio::test]
    async fn test_duplicate_inbound_is_rejected() {
        let (pool, _events) = PeerPool::new(test_config(), null_dialer());

        let (first_handle, _first_endpoint) = socket_pair();
        let (second_handle, _second_endpoint) = socket_pair();
        let info = PeerInfo::new("5.5.5.5", 5000);

        pool.add_inbound_peer(info.clone(), first_handle).await.unwrap();
        let err = pool.add_inbound_peer(info, second_handle).await.unwrap_err();
        assert!(matches!(err, P2pError::DuplicatePeer(_)));
        assert_eq!(pool.peer_counts().inbound, 1);
    }

    #[tokio::test]
    async fn test_remove_peer_is_idempotent() {
        let (pool, _events) = PeerPool::new(test_config(), null_dialer());

        let (handle, _endpoint) = socket_pair();
        let info = PeerInfo::new("5.5.5.5", 5000);
        let peer_id = info.peer_id();
        pool.add_inbound_peer(info, handle).await.unwrap();

        assert!(pool.remove_peer(&peer_id).await);
        assert!(!pool.has_peer(&peer_id));
        assert!(!pool.remove_peer(&peer_id).await);
    }

    #[tokio::test]
    async fn test_readd_after_remove_dials_fresh() {
        let (dialer, stash) = stash_dialer();
        let mut config = test_config();
        config.connect_timeout = Duration::from_secs(5);
        let (pool, _events) = PeerPool::new(config, dialer);

        let info = PeerInfo::new("6.6.6.6", 5000);
        let peer_id = info.peer_id();

        pool.add_outbound_peer(info.clone(), None).await.unwrap();
        assert!(pool.remove_peer(&peer_id).await);
        pool.add_outbound_peer(info, None).await.unwrap();

        assert_eq!(stash.lock().len(), 2);
        assert!(pool.has_peer(&peer_id));
    }

    #[tokio::test]
    async fn test_send_fans_out_to_connected_peers() {
        let (pool, _events) = PeerPool::new(test_config(), null_dialer());

        let mut endpoints = Vec::new();
        for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
            let (handle, endpoint) = socket_pair();
            endpoints.push(endpoint);
            pool.add_inbound_peer(PeerInfo::new(ip, 5000), handle)
                .await
                .unwrap();
        }

        pool.send(MessagePacket::new("postTransactions")).await;

        for endpoint in &mut endpoints {
            match tokio_timeout(Duration::from_millis(100), endpoint.commands.recv())
                .await
                .unwrap()
                .unwrap()
            {
                SocketCommand::Send { packet } => assert_eq!(packet.event, "postTransactions"),
                other => panic!("unexpected command: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_send_to_missing_peer_fails() {
        let (pool, _events) = PeerPool::new(test_config(), null_dialer());
        let result = pool.send_to_peer(
            MessagePacket::new("postBlock"),
            &PeerId::new("8.8.8.8", 5000),
        );
        assert!(matches!(result, Err(P2pError::SendFail(_))));
    }

    #[tokio::test]
    async fn test_remove_all_peers_empties_the_pool() {
        let (pool, _events) = PeerPool::new(test_config(), null_dialer());

        let mut endpoints = Vec::new();
        for ip in ["1.1.1.1", "2.2.2.2"] {
            let (handle, endpoint) = socket_pair();
            endpoints.push(endpoint);
            pool.add_inbound_peer(PeerInfo::new(ip, 5000), handle)
                .await
                .unwrap();
        }

        pool.remove_all_peers().await;
        assert_eq!(pool.peer_counts(), PeerCounts::default());
        assert!(pool.get_all_peer_infos().is_empty());
    }

    #[tokio::test]
    async fn test_banned_peer_cannot_be_readded() {
        let (pool, mut events) = PeerPool::new(test_config(), null_dialer());

        let (handle, _endpoint) = socket_pair();
        let info = PeerInfo::new("7.7.7.7", 5000);
        let peer_id = info.peer_id();
        pool.add_inbound_peer(info.clone(), handle).await.unwrap();
        pool.apply_penalty(&peer_id, 200).await.unwrap();

        // Drain the ban and close events, then try to re-add.
        assert!(matches!(events.recv().await, Some(PoolEvent::BanPeer { .. })));
        assert!(matches!(
            events.recv().await,
            Some(PoolEvent::CloseInbound { .. })
        ));

        let (second_handle, _second_endpoint) = socket_pair();
        let err = pool
            .add_inbound_peer(info.clone(), second_handle)
            .await
            .unwrap_err();
        assert!(matches!(err, P2pError::PeerBanned(_)));
        let err = pool.add_outbound_peer(info, None).await.unwrap_err();
        assert!(matches!(err, P2pError::PeerBanned(_)));
    }
}
