//! Bridges a readiness-based event loop to an opaque QUIC-like engine.
//!
//! One [`Acceptor`] owns one shared datagram socket, the [`Engine`] and a
//! [`ConnectionTable`]. On socket readiness it receives datagrams, lets the
//! engine decode them, and routes each packet to its [`Connection`], accepting
//! new connections on demand. Every connection carries streams with
//! byte-stream semantics ([`StreamTransport`]): reads are delivered once their
//! [`ReceivePolicy`] is satisfied, writes are queued and handed to the engine
//! when the socket is writable.
//!
//! The event loop itself stays outside: it is the [`Reactor`] capability the
//! bridge reports readiness edges and timers to. The `handy` feature brings a
//! tokio-based one.

pub mod acceptor;
pub mod cid;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
#[cfg(feature = "handy")]
pub mod handy;
pub mod reactor;
pub mod table;
pub mod transport;

pub use acceptor::Acceptor;
pub use cid::{ConnectionId, Signpost};
pub use config::AcceptorConfig;
pub use connection::{ConnIo, ConnState, Connection, Handler, StreamIo};
pub use engine::{
    AcceptError, CloseReason, ConnectError, Datagram, DecodeError, Engine, EngineError, Event,
    Packet, PacketKind,
};
pub use error::{Error, ErrorKind};
pub use qbuf::{ReceiveFlag, ReceivePolicy};
pub use reactor::{Reactor, StreamKey, Token};
pub use table::ConnectionTable;
pub use transport::{ReadState, StreamTransport, WriteState};

pub mod prelude {
    pub use crate::{
        Acceptor, AcceptorConfig, CloseReason, ConnIo, Engine, Error, ErrorKind, Handler,
        ReceivePolicy, Reactor, Signpost, StreamIo, Token,
    };
    #[cfg(feature = "handy")]
    pub use crate::handy::{TimerReactor, run};
}
