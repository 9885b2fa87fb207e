//! The one datagram socket shared by every logical connection.
//!
//! [`DatagramSocket`] is the non-blocking surface the acceptor drives: one
//! call moves at most one datagram, and a call that would block returns
//! [`io::ErrorKind::WouldBlock`] instead of waiting. Readiness comes from the
//! reactor, never from blocking inside these calls.

use std::{
    io,
    net::SocketAddr,
    task::{Context, Poll},
};

use socket2::{Domain, Protocol, Socket, Type};

/// The largest payload a UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65527;

/// Non-blocking datagram I/O, recvmsg/sendmsg semantics.
pub trait DatagramSocket {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Receive one datagram and its source address.
    ///
    /// Returns [`io::ErrorKind::WouldBlock`] if no datagram is queued.
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Send one datagram to `dst`.
    fn try_send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize>;
}

/// A UDP socket configured for datagram demultiplexing, registered with the
/// tokio reactor.
#[derive(Debug)]
pub struct UdpSocketController {
    io: tokio::net::UdpSocket,
}

impl UdpSocketController {
    /// Bind a non-blocking UDP socket with `SO_REUSEADDR` set.
    ///
    /// Must be called inside a tokio runtime.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        Self::config(&socket, addr)?;
        socket.bind(&addr.into())?;
        let io = tokio::net::UdpSocket::from_std(socket.into())?;
        tracing::debug!(local = %io.local_addr()?, "bound shared datagram socket");
        Ok(Self { io })
    }

    fn config(socket: &Socket, addr: SocketAddr) -> io::Result<()> {
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            // accept v4-mapped peers too
            if let Err(error) = socket.set_only_v6(false) {
                tracing::warn!(%error, "failed to clear IPV6_V6ONLY");
            }
        }
        Ok(())
    }

    /// Wait until the socket may be readable.
    pub async fn readable(&self) -> io::Result<()> {
        self.io.readable().await
    }

    /// Wait until the socket may be writable.
    pub async fn writable(&self) -> io::Result<()> {
        self.io.writable().await
    }

    pub fn poll_recv_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.io.poll_recv_ready(cx)
    }

    pub fn poll_send_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.io.poll_send_ready(cx)
    }
}

impl DatagramSocket for UdpSocketController {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.local_addr()
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.io.try_recv_from(buf)
    }

    fn try_send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        self.io.try_send_to(buf, dst)
    }
}

/// A plain std socket works too, as long as it was put in non-blocking mode.
impl DatagramSocket for std::net::UdpSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        std::net::UdpSocket::local_addr(self)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf)
    }

    fn try_send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        self.send_to(buf, dst)
    }
}
