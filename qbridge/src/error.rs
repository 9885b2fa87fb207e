use std::io;

use thiserror::Error;

use crate::{
    cid::Signpost,
    engine::{ConnectError, EngineError},
};

/// Classification of an [`Error`], handed to the handler with the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Receiving on a stream failed.
    Read,
    /// Handing stream bytes to the engine failed.
    Write,
    /// The peer reset the stream.
    Reset,
    /// The peer asked to stop sending on the stream.
    StopSending,
    /// Any other engine failure of the connection.
    Engine,
    Connect,
    UnknownConnection,
    UnknownStream,
    Closed,
    /// The shared socket failed, the whole acceptor is gone.
    FatalSocket,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("read failure on stream: {0}")]
    Read(#[source] EngineError),
    #[error("write failure on stream: {0}")]
    Write(#[source] EngineError),
    #[error("stream reset by peer with code {0:#x}")]
    Reset(u64),
    #[error("peer stopped reading with code {0:#x}")]
    StopSending(u64),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("no connection routed by {0}")]
    UnknownConnection(Signpost),
    #[error("no such stream on the connection")]
    UnknownStream,
    #[error("connection already closed")]
    Closed,
    #[error("shared socket failed: {0}")]
    FatalSocket(#[source] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Read(_) => ErrorKind::Read,
            Error::Write(_) => ErrorKind::Write,
            Error::Reset(_) => ErrorKind::Reset,
            Error::StopSending(_) => ErrorKind::StopSending,
            Error::Engine(_) => ErrorKind::Engine,
            Error::Connect(_) => ErrorKind::Connect,
            Error::UnknownConnection(_) => ErrorKind::UnknownConnection,
            Error::UnknownStream => ErrorKind::UnknownStream,
            Error::Closed => ErrorKind::Closed,
            Error::FatalSocket(_) => ErrorKind::FatalSocket,
        }
    }

    /// Whether the error ends the whole acceptor rather than one stream or
    /// connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::FatalSocket(_))
    }
}
