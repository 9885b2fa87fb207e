//! The boundary to the protocol engine.
//!
//! The engine owns every piece of protocol semantics: handshake, packet
//! protection, congestion control, retransmission and connection id
//! derivation. This crate only feeds it datagrams and collects what it wants
//! to send. Engine callbacks (stream opened, data arrived, closed by peer...)
//! are queued by the engine and pulled with [`Engine::poll_event`], so no
//! engine code ever holds a pointer into transport state.

use std::{fmt, hash::Hash, net::SocketAddr, time::Duration};

use bytes::Bytes;
use thiserror::Error;

use crate::cid::ConnectionId;

/// A datagram the engine wants on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub dst: SocketAddr,
    pub payload: Bytes,
}

impl Datagram {
    pub fn new(dst: SocketAddr, payload: impl Into<Bytes>) -> Self {
        Self {
            dst,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// A long header packet that may open a connection (Initial, 0-RTT).
    Initial,
    /// Any other long header packet (Handshake, Retry, ...).
    Long,
    /// A short header packet of an established connection.
    Short,
}

impl PacketKind {
    pub fn is_long_header(&self) -> bool {
        matches!(self, Self::Initial | Self::Long)
    }
}

/// What the demultiplexer needs to know about a decoded packet.
pub trait Packet {
    fn kind(&self) -> PacketKind;

    /// The version of a long header packet, `None` for short headers.
    fn version(&self) -> Option<u32>;

    /// The destination connection id, empty if the packet carries none.
    fn dcid(&self) -> &ConnectionId;
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed with a transport error.
    Transport {
        code: u64,
        frame_type: u64,
        reason: String,
    },
    /// The peer application closed the connection.
    Application { code: u64, reason: String },
    /// The peer answered with a stateless reset.
    StatelessReset,
    /// The engine's idle timer fired.
    IdleTimeout,
    /// Closed on this side, explicitly or because of a local failure.
    Local { code: u64, reason: String },
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport {
                code,
                frame_type,
                reason,
            } => write!(
                f,
                "transport close: code={code:#x}, frame={frame_type:#x}, reason={reason}"
            ),
            Self::Application { code, reason } => {
                write!(f, "application close: code={code:#x}, reason={reason}")
            }
            Self::StatelessReset => write!(f, "stateless reset"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::Local { code, reason } => {
                write!(f, "local close: code={code:#x}, reason={reason}")
            }
        }
    }
}

/// Notifications the engine queues for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<S> {
    /// The handshake completed.
    Connected,
    /// The peer opened a stream.
    StreamOpened(S),
    /// In-order stream bytes arrived.
    StreamData { stream: S, data: Bytes },
    /// The peer finished its sending side of the stream.
    StreamFinished(S),
    /// The engine can accept stream bytes again after refusing them.
    StreamWritable(S),
    /// The peer reset the stream (RESET_STREAM).
    StreamReset { stream: S, code: u64 },
    /// The peer asked to stop sending on the stream (STOP_SENDING).
    StopSending { stream: S, code: u64 },
    /// Receiving on the stream failed.
    StreamFailed { stream: S, error: EngineError },
    /// The connection is gone.
    Closed(CloseReason),
}

/// The datagram could not be decoded. The rest of it is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed packet: {reason}")]
pub struct DecodeError {
    pub reason: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// The engine rejected a connection-initiation packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcceptError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("invalid token")]
    InvalidToken,
    #[error("not a connection initiation packet")]
    NotInitial,
}

/// The engine could not start an outbound handshake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to connect to {server} ({server_name}): {reason}")]
pub struct ConnectError {
    pub server: SocketAddr,
    pub server_name: String,
    pub reason: String,
}

/// An error reported by the engine for a stream or a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("engine error {code:#x}: {reason}")]
pub struct EngineError {
    pub code: u64,
    pub reason: String,
}

impl EngineError {
    pub fn new(code: u64, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// The opaque protocol engine.
///
/// `Conn` is the engine side of one connection and is owned by the
/// connection table. `Stream` is the engine's handle of a stream, it is only
/// used as a lookup key.
pub trait Engine {
    type Packet: Packet;
    type Conn;
    type Stream: Copy + Eq + Hash + fmt::Debug;

    /// Decode the first packet of `datagram`, return it and the bytes it
    /// spans.
    fn decode(&mut self, datagram: &[u8]) -> Result<(Self::Packet, usize), DecodeError>;

    fn supports_version(&self, version: u32) -> bool;

    /// Build the version negotiation answer to `packet`.
    fn version_negotiation(&mut self, peer: SocketAddr, packet: &Self::Packet)
    -> Option<Datagram>;

    /// Start a connection from a connection-initiation packet.
    ///
    /// Returns the engine connection and the connection id the peer will use
    /// from now on.
    fn accept(
        &mut self,
        packet: Self::Packet,
        peer: SocketAddr,
    ) -> Result<(Self::Conn, ConnectionId), AcceptError>;

    /// Start an outbound handshake. Must not block.
    fn connect(
        &mut self,
        server: SocketAddr,
        server_name: &str,
    ) -> Result<(Self::Conn, ConnectionId), ConnectError>;

    /// Feed a packet that was routed to `conn`.
    fn deliver(&mut self, conn: &mut Self::Conn, packet: Self::Packet) -> Result<(), EngineError>;

    /// Pull the next queued notification of `conn`.
    fn poll_event(&mut self, conn: &mut Self::Conn) -> Option<Event<Self::Stream>>;

    /// Open a locally initiated stream.
    fn open_stream(&mut self, conn: &mut Self::Conn) -> Result<Self::Stream, EngineError>;

    /// Hand stream bytes to the engine for framing, return how many it took.
    ///
    /// Taking zero bytes means the stream is blocked, the engine reports
    /// [`Event::StreamWritable`] once it takes bytes again.
    fn send_stream(
        &mut self,
        conn: &mut Self::Conn,
        stream: Self::Stream,
        data: &[u8],
    ) -> Result<usize, EngineError>;

    /// End the sending side of a stream once everything handed over was sent.
    fn finish_stream(
        &mut self,
        conn: &mut Self::Conn,
        stream: Self::Stream,
    ) -> Result<(), EngineError>;

    /// Move up to `max` pending datagrams of `conn` into `out`.
    fn drain_pending(
        &mut self,
        conn: &mut Self::Conn,
        max: usize,
        out: &mut Vec<Datagram>,
    ) -> Result<(), EngineError>;

    /// When the engine wants to be woken up for `conn` next.
    fn next_timeout(&self, conn: &Self::Conn) -> Option<Duration>;

    /// The timer scheduled from [`Engine::next_timeout`] expired.
    fn on_timeout(&mut self, conn: &mut Self::Conn) {
        let _ = conn;
    }

    /// Close the connection, the close is sent by the next drain.
    fn close(&mut self, conn: &mut Self::Conn, code: u64, reason: &str);

    /// Whether the packet's destination id carries the structure of an id
    /// this engine issued.
    fn is_authenticated(&self, packet: &Self::Packet) -> bool;

    /// Build a stateless reset answering `packet`.
    fn stateless_reset(&mut self, peer: SocketAddr, packet: &Self::Packet) -> Option<Datagram>;
}
