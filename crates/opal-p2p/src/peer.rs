//! A single live connection to a remote peer.
//!
//! Each peer owns one opaque socket and one event-pump task. The pump
//! translates transport events into typed pool events, in order, onto the
//! pool's fan-in channel; tearing the peer down aborts the pump, so a
//! removed peer can never leak stale subscriptions.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::event::PoolEvent;
use crate::info::{NodeInfo, PeerId, PeerInfo};
use crate::message::{self, procedures, remote_events, MessagePacket, RequestPacket};
use crate::transport::{SocketCommand, SocketEvent, SocketHandle};
use crate::{P2pError, P2pResult};

/// Connection direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// The remote dialed us.
    Inbound,
    /// We dialed the remote.
    Outbound,
}

/// Peer connection state.
///
/// `Connecting -> Connected -> Closing -> Closed`, with `Banned` reachable
/// from any non-closed state. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Closing,
    Closed,
    Banned,
}

/// Per-connection configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Outbound dial timeout.
    pub connect_timeout: Duration,
    /// Request/response timeout.
    pub ack_timeout: Duration,
    /// Accumulated penalty that triggers a ban.
    pub ban_threshold: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(10),
            ban_threshold: 100,
        }
    }
}

/// One live duplex channel to one remote.
pub struct Peer {
    id: PeerId,
    kind: PeerKind,
    config: PeerConfig,
    info: RwLock<PeerInfo>,
    state: Mutex<PeerState>,
    penalty: AtomicU32,
    commands: mpsc::Sender<SocketCommand>,
    events_tx: mpsc::Sender<PoolEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Create the peer and start its event pump. Must run inside a Tokio
    /// runtime.
    pub(crate) fn spawn(
        info: PeerInfo,
        kind: PeerKind,
        socket: SocketHandle,
        config: PeerConfig,
        events_tx: mpsc::Sender<PoolEvent>,
    ) -> Arc<Self> {
        let SocketHandle { commands, events } = socket;
        let initial = match kind {
            PeerKind::Inbound => PeerState::Connected,
            PeerKind::Outbound => PeerState::Connecting,
        };
        let peer = Arc::new(Self {
            id: info.peer_id(),
            kind,
            config,
            info: RwLock::new(info),
            state: Mutex::new(initial),
            penalty: AtomicU32::new(0),
            commands,
            events_tx,
            pump: Mutex::new(None),
        });
        let handle = tokio::spawn(Self::pump_events(Arc::clone(&peer), events));
        *peer.pump.lock() = Some(handle);
        peer
    }

    /// The canonical peer id.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Connection direction.
    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    /// Current connection state.
    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    /// Snapshot of the stored peer info.
    pub fn info(&self) -> PeerInfo {
        self.info.read().clone()
    }

    /// Accumulated penalty.
    pub fn penalty(&self) -> u32 {
        self.penalty.load(Ordering::Relaxed)
    }

    pub(crate) fn set_info(&self, info: PeerInfo) {
        *self.info.write() = info;
    }

    /// Issue a request and await the correlated reply within the
    /// acknowledgement timeout. Concurrent requests are independent.
    pub async fn request(&self, packet: RequestPacket) -> P2pResult<Bytes> {
        match self.state() {
            PeerState::Connecting | PeerState::Connected => {}
            _ => {
                return Err(P2pError::RequestFail(format!(
                    "peer {} is not connected",
                    self.id
                )))
            }
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(SocketCommand::Request {
                packet,
                reply: reply_tx,
            })
            .await
            .map_err(|_| P2pError::RequestFail("socket channel closed".to_string()))?;

        match timeout(self.config.ack_timeout, reply_rx).await {
            Ok(Ok(Ok(data))) => Ok(data),
            Ok(Ok(Err(err))) => Err(P2pError::RequestFail(err)),
            Ok(Err(_)) => Err(P2pError::RequestFail(
                "response channel dropped".to_string(),
            )),
            Err(_) => Err(P2pError::RequestTimeout {
                elapsed_ms: self.config.ack_timeout.as_millis() as u64,
            }),
        }
    }

    /// Fire-and-forget message. Fails unless the channel is connected.
    pub fn send(&self, packet: MessagePacket) -> P2pResult<()> {
        if self.state() != PeerState::Connected {
            return Err(P2pError::SendFail(format!(
                "peer {} is not connected",
                self.id
            )));
        }
        self.commands
            .try_send(SocketCommand::Send { packet })
            .map_err(|e| P2pError::SendFail(e.to_string()))
    }

    /// Fetch the remote's advertised node info and merge it into the stored
    /// peer info.
    pub async fn fetch_status(&self) -> P2pResult<PeerInfo> {
        let response = self
            .request(RequestPacket::new(procedures::GET_NODE_INFO))
            .await
            .map_err(|e| P2pError::FetchInfoFail(e.to_string()))?;
        let node: NodeInfo = message::decode_payload(&response)
            .map_err(|e| P2pError::FetchInfoFail(e.to_string()))?;

        let updated = {
            let mut info = self.info.write();
            info.apply_node_info(&node);
            info.clone()
        };
        Ok(updated)
    }

    /// Push the local node's info to the remote.
    pub fn apply_node_info(&self, node_info: &NodeInfo) -> P2pResult<()> {
        let packet = MessagePacket {
            event: remote_events::POST_NODE_INFO.to_string(),
            data: message::encode_payload(node_info)
                .map_err(|e| P2pError::PushFail(e.to_string()))?,
        };
        self.commands
            .try_send(SocketCommand::Send { packet })
            .map_err(|e| P2pError::PushFail(e.to_string()))
    }

    /// Add penalty weight. Crossing the threshold bans and closes the peer.
    pub async fn apply_penalty(&self, weight: u32) {
        let total = self
            .penalty
            .fetch_add(weight, Ordering::SeqCst)
            .saturating_add(weight);
        debug!(peer = %self.id, weight, total, "applied penalty");
        if total >= self.config.ban_threshold {
            self.ban().await;
        }
    }

    /// Close the connection. Idempotent; emits the close event for the kind
    /// exactly once.
    pub async fn disconnect(&self) {
        if !self.begin_close() {
            return;
        }
        self.abort_pump();
        let _ = self.commands.try_send(SocketCommand::Close);
        self.set_closed();
        debug!(peer = %self.id, "disconnected peer");
        self.emit(self.close_event()).await;
    }

    /// Synchronous teardown with no close event, for pool drop paths.
    pub(crate) fn shutdown(&self) {
        if !self.begin_close() {
            return;
        }
        self.abort_pump();
        let _ = self.commands.try_send(SocketCommand::Close);
        self.set_closed();
    }

    async fn ban(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                PeerState::Banned | PeerState::Closing | PeerState::Closed => return,
                _ => *state = PeerState::Banned,
            }
        }
        warn!(peer = %self.id, penalty = self.penalty(), "banning peer");
        self.emit(PoolEvent::BanPeer {
            peer_id: self.id.clone(),
        })
        .await;

        if self.begin_close() {
            self.abort_pump();
            let _ = self.commands.try_send(SocketCommand::Close);
            self.set_closed();
            self.emit(self.close_event()).await;
        }
    }

    /// Claim the right to close. Returns false when already closing/closed.
    fn begin_close(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            PeerState::Closing | PeerState::Closed => false,
            _ => {
                *state = PeerState::Closing;
                true
            }
        }
    }

    fn set_closed(&self) {
        *self.state.lock() = PeerState::Closed;
    }

    fn abort_pump(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }

    fn close_event(&self) -> PoolEvent {
        match self.kind {
            PeerKind::Outbound => PoolEvent::CloseOutbound {
                peer_id: self.id.clone(),
            },
            PeerKind::Inbound => PoolEvent::CloseInbound {
                peer_id: self.id.clone(),
            },
        }
    }

    fn socket_error_event(&self, error: String) -> PoolEvent {
        match self.kind {
            PeerKind::Outbound => PoolEvent::OutboundSocketError {
                peer_id: self.id.clone(),
                error,
            },
            PeerKind::Inbound => PoolEvent::InboundSocketError {
                peer_id: self.id.clone(),
                error,
            },
        }
    }

    async fn emit(&self, event: PoolEvent) {
        if self.events_tx.send(event).await.is_err() {
            debug!(peer = %self.id, "pool event channel closed, dropping event");
        }
    }

    async fn pump_events(peer: Arc<Peer>, mut events: mpsc::Receiver<SocketEvent>) {
        if peer.kind == PeerKind::Outbound {
            let connected = matches!(
                timeout(peer.config.connect_timeout, events.recv()).await,
                Ok(Some(SocketEvent::Connected))
            );
            if connected {
                {
                    let mut state = peer.state.lock();
                    if *state != PeerState::Connecting {
                        return;
                    }
                    *state = PeerState::Connected;
                }
                debug!(peer = %peer.id, "outbound connection established");
                peer.emit(PoolEvent::ConnectOutbound {
                    peer_id: peer.id.clone(),
                })
                .await;
            } else {
                debug!(peer = %peer.id, "outbound connect aborted");
                peer.emit(PoolEvent::ConnectAbortOutbound {
                    peer_id: peer.id.clone(),
                })
                .await;
                if peer.begin_close() {
                    let _ = peer.commands.try_send(SocketCommand::Close);
                    peer.set_closed();
                }
                return;
            }
        }

        while let Some(event) = events.recv().await {
            match event {
                // Inbound handles are open on arrival; a late Connected from
                // the transport is a no-op.
                SocketEvent::Connected => {}
                SocketEvent::RequestReceived(request) => {
                    peer.emit(PoolEvent::RequestReceived {
                        peer_id: peer.id.clone(),
                        request,
                    })
                    .await;
                }
                SocketEvent::MessageReceived(packet) => {
                    if packet.event == remote_events::POST_NODE_INFO {
                        match message::decode_payload::<NodeInfo>(&packet.data) {
                            Ok(node) => {
                                let updated = {
                                    let mut info = peer.info.write();
                                    info.apply_node_info(&node);
                                    info.clone()
                                };
                                peer.emit(PoolEvent::UpdatedPeerInfo { peer_info: updated })
                                    .await;
                            }
                            Err(e) => {
                                peer.emit(PoolEvent::FailedPeerInfoUpdate {
                                    peer_id: peer.id.clone(),
                                    error: e.to_string(),
                                })
                                .await;
                            }
                        }
                    } else {
                        peer.emit(PoolEvent::MessageReceived {
                            peer_id: peer.id.clone(),
                            message: packet,
                        })
                        .await;
                    }
                }
                SocketEvent::Error(error) => {
                    warn!(peer = %peer.id, error = %error, "socket error");
                    peer.emit(peer.socket_error_event(error)).await;
                }
                SocketEvent::Closed => break,
            }
        }

        // Remote close, or the transport dropped its endpoint.
        if peer.begin_close() {
            peer.set_closed();
            debug!(peer = %peer.id, "connection closed by remote");
            peer.emit(peer.close_event()).await;
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("penalty", &self.penalty())
            .finish()
    }
}
