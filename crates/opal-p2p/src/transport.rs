//! The opaque socket abstraction between the pool and a concrete transport.
//!
//! The pool never touches a wire protocol. It drives each remote through a
//! [`SocketHandle`]: commands flow down to the transport, events flow back
//! up. A concrete transport (WebSocket, TCP framing, an in-memory channel in
//! tests) owns the matching [`TransportEndpoint`] and is responsible for:
//!
//! - emitting [`SocketEvent::Connected`] once an outbound channel is open
//!   (inbound handles are considered open on arrival),
//! - answering [`SocketCommand::Request`] through the carried reply sender,
//! - emitting [`SocketEvent::Closed`] when the underlying channel ends.

use crate::info::PeerInfo;
use crate::message::{MessagePacket, RequestPacket};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

/// Per-socket channel capacity.
const SOCKET_CHANNEL_CAPACITY: usize = 100;

/// Commands the pool sends down to the transport.
#[derive(Debug)]
pub enum SocketCommand {
    /// Issue a request and reply through the carried sender. The transport
    /// reports remote failures as an `Err` string.
    Request {
        packet: RequestPacket,
        reply: oneshot::Sender<Result<Bytes, String>>,
    },
    /// Deliver a fire-and-forget message.
    Send { packet: MessagePacket },
    /// Tear the channel down.
    Close,
}

/// Events the transport sends up to the pool.
#[derive(Debug)]
pub enum SocketEvent {
    /// The channel is open. Required for outbound sockets; ignored on
    /// inbound ones.
    Connected,
    /// The remote issued a request that must be answered.
    RequestReceived(IncomingRequest),
    /// The remote delivered a fire-and-forget message.
    MessageReceived(MessagePacket),
    /// A transport-level error. The channel may still be usable.
    Error(String),
    /// The channel ended. No further events follow.
    Closed,
}

/// A request from the remote, answered through [`IncomingRequest::respond`].
#[derive(Debug)]
pub struct IncomingRequest {
    /// Remote procedure name.
    pub procedure: String,
    /// JSON payload.
    pub data: Bytes,
    responder: oneshot::Sender<Bytes>,
}

impl IncomingRequest {
    /// Create a request plus the receiver the transport awaits the answer on.
    pub fn new(
        procedure: impl Into<String>,
        data: Bytes,
    ) -> (Self, oneshot::Receiver<Bytes>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                procedure: procedure.into(),
                data,
                responder: tx,
            },
            rx,
        )
    }

    /// Answer the request. Returns false if the transport has gone away.
    pub fn respond(self, data: Bytes) -> bool {
        self.responder.send(data).is_ok()
    }
}

/// The pool's half of a socket: command sender plus event receiver.
#[derive(Debug)]
pub struct SocketHandle {
    pub(crate) commands: mpsc::Sender<SocketCommand>,
    pub(crate) events: mpsc::Receiver<SocketEvent>,
}

/// The transport's half of a socket: command receiver plus event sender.
#[derive(Debug)]
pub struct TransportEndpoint {
    pub commands: mpsc::Receiver<SocketCommand>,
    pub events: mpsc::Sender<SocketEvent>,
}

/// Create a connected handle/endpoint pair.
pub fn socket_pair() -> (SocketHandle, TransportEndpoint) {
    let (command_tx, command_rx) = mpsc::channel(SOCKET_CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(SOCKET_CHANNEL_CAPACITY);
    (
        SocketHandle {
            commands: command_tx,
            events: event_rx,
        },
        TransportEndpoint {
            commands: command_rx,
            events: event_tx,
        },
    )
}

/// Opens outbound channels for the pool.
///
/// `dial` must not block: the concrete transport connects in the background
/// and reports the outcome through the handle's event stream.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, info: &PeerInfo) -> SocketHandle;
}

impl<F> Dialer for F
where
    F: Fn(&PeerInfo) -> SocketHandle + Send + Sync + 'static,
{
    fn dial(&self, info: &PeerInfo) -> SocketHandle {
        self(info)
    }
}
