use std::{fmt, net::SocketAddr, ops::Deref};

use bytes::BufMut;
use nom::{IResult, Parser, multi::length_data, number::complete::be_u8};
use rand::Rng;

/// The longest id a packet header may carry.
pub const MAX_CID_SIZE: usize = 20;

/// An opaque connection identifier handed out by the engine.
///
/// An empty id is valid, packets carrying one are routed by peer address.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct ConnectionId {
    buf: [u8; MAX_CID_SIZE],
    len: u8,
}

impl ConnectionId {
    /// Slices longer than [`MAX_CID_SIZE`] are truncated.
    pub fn from_slice(bytes: &[u8]) -> Self {
        debug_assert!(
            bytes.len() <= MAX_CID_SIZE,
            "connection id of {} bytes",
            bytes.len()
        );
        let n = bytes.len().min(MAX_CID_SIZE);
        let mut cid = Self::default();
        cid.buf[..n].copy_from_slice(&bytes[..n]);
        cid.len = n as u8;
        cid
    }

    /// A random id of `len` bytes. Uniqueness is up to the caller, the
    /// connection table refuses ids already in use.
    pub fn random_gen(len: usize) -> Self {
        let mut cid = Self {
            len: len.min(MAX_CID_SIZE) as u8,
            ..Self::default()
        };
        let n = usize::from(cid.len);
        rand::rng().fill(&mut cid.buf[..n]);
        cid
    }

    /// Bytes the id takes on the wire, length prefix included.
    pub fn encoding_size(&self) -> usize {
        1 + self.len()
    }
}

impl Deref for ConnectionId {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf[..usize::from(self.len)]
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.iter().try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({self})")
    }
}

/// Parse a connection id prefixed by its one byte length.
pub fn be_connection_id(input: &[u8]) -> IResult<&[u8], ConnectionId> {
    let (_, len) = be_u8(input)?;
    if usize::from(len) > MAX_CID_SIZE {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::TooLarge,
        )));
    }
    length_data(be_u8)
        .map(ConnectionId::from_slice)
        .parse(input)
}

/// Write a [`ConnectionId`] the way [`be_connection_id`] reads it.
pub trait WriteConnectionId: BufMut {
    fn put_connection_id(&mut self, cid: &ConnectionId) {
        self.put_u8(cid.len);
        self.put_slice(cid);
    }
}

impl<T: BufMut> WriteConnectionId for T {}

/// The routing key of a connection on the shared socket.
///
/// A connection is found by its connection id. Before ids can be derived
/// (the engine hands out an empty id, or the packet carries none), the peer
/// address stands in.
#[derive(PartialEq, Clone, Copy, Eq, Hash)]
pub struct Signpost {
    cid: ConnectionId,
    peer: Option<SocketAddr>,
}

impl Signpost {
    /// The routing key of a packet: its destination id, or the source address
    /// if it carries none.
    pub fn route(dcid: &ConnectionId, source: SocketAddr) -> Self {
        if dcid.is_empty() {
            Self::from(source)
        } else {
            Self::from(*dcid)
        }
    }

    pub fn cid(&self) -> &ConnectionId {
        &self.cid
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl From<ConnectionId> for Signpost {
    fn from(value: ConnectionId) -> Self {
        Self {
            cid: value,
            peer: None,
        }
    }
}

impl From<SocketAddr> for Signpost {
    fn from(value: SocketAddr) -> Self {
        Self {
            cid: ConnectionId::default(),
            peer: Some(value),
        }
    }
}

impl fmt::Display for Signpost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer {
            Some(peer) => write!(f, "peer:{peer}"),
            None => write!(f, "cid:{}", self.cid),
        }
    }
}

impl fmt::Debug for Signpost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signpost({self})")
    }
}
