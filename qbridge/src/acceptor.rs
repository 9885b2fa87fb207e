use std::{io, net::SocketAddr};

use qsock::DatagramSocket;

use crate::{
    cid::Signpost,
    config::AcceptorConfig,
    connection::{ConnState, Connection, Handler, StreamIo},
    engine::{Datagram, Engine, Packet, PacketKind},
    error::Error,
    reactor::{Reactor, Registration, Token, WriteInterest},
    table::ConnectionTable,
};

/// Builds the handler of a connection the peer initiated.
pub type NewHandler<E> = Box<dyn FnMut(&Signpost, SocketAddr) -> Box<dyn Handler<E>>>;

/// Owns the shared socket, the engine and every connection on the socket.
///
/// The reactor calls [`Acceptor::on_readable`], [`Acceptor::on_writable`]
/// and [`Acceptor::on_timeout`]. Each entry point runs to completion without
/// blocking. Connections and streams never touch the socket themselves, all
/// sends go through the pump of the affected connection.
pub struct Acceptor<E: Engine, S> {
    config: AcceptorConfig,
    engine: E,
    socket: S,
    interest: WriteInterest,
    table: ConnectionTable<E>,
    new_handler: NewHandler<E>,
    rcvbuf: Vec<u8>,
    outbox: Vec<Datagram>,
}

impl<E: Engine, S: DatagramSocket> Acceptor<E, S> {
    pub fn new(
        config: AcceptorConfig,
        engine: E,
        socket: S,
        token: Token,
        new_handler: impl FnMut(&Signpost, SocketAddr) -> Box<dyn Handler<E>> + 'static,
    ) -> Self {
        Self {
            rcvbuf: vec![0; config.recv_buffer_size()],
            outbox: Vec::with_capacity(config.drain_batch()),
            config,
            engine,
            socket,
            interest: WriteInterest::new(token),
            table: ConnectionTable::new(),
            new_handler: Box::new(new_handler),
        }
    }

    /// Ask the reactor for readable events of the shared socket.
    pub fn register(&mut self, reactor: &mut dyn Reactor) {
        reactor.register_read(self.interest.token());
    }

    pub fn config(&self) -> &AcceptorConfig {
        &self.config
    }

    pub fn token(&self) -> Token {
        self.interest.token()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn table(&self) -> &ConnectionTable<E> {
        &self.table
    }

    pub fn connection(&self, signpost: &Signpost) -> Option<&Connection<E>> {
        self.table.get(signpost)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Whether some stream waits for the socket to become writable.
    pub fn wants_write(&self) -> bool {
        self.interest.is_enabled()
    }

    /// The shared socket is readable.
    ///
    /// Receives up to `max_datagrams_per_event` datagrams and processes each
    /// one. Returns how many datagrams were received. Only a failure of the
    /// socket itself is returned, after every connection was closed.
    pub fn on_readable(&mut self, reactor: &mut dyn Reactor) -> Result<usize, Error> {
        let mut buf = std::mem::take(&mut self.rcvbuf);
        let result = self.receive(&mut buf, reactor);
        self.rcvbuf = buf;
        result
    }

    fn receive(&mut self, buf: &mut [u8], reactor: &mut dyn Reactor) -> Result<usize, Error> {
        let mut received = 0;
        let mut attempts = 0;
        while attempts < self.config.max_datagrams_per_event() {
            attempts += 1;
            match self.socket.try_recv_from(buf) {
                Ok((len, peer)) => {
                    received += 1;
                    let touched = self.process_datagram(&buf[..len], peer);
                    for signpost in touched {
                        self.pump(&signpost, reactor);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail(e, reactor)),
            }
        }
        Ok(received)
    }

    /// Decode every packet of one datagram and route it.
    ///
    /// Returns the connections that got packets, which have to be pumped.
    fn process_datagram(&mut self, datagram: &[u8], peer: SocketAddr) -> Vec<Signpost> {
        let mut touched = Vec::new();
        let mut offset = 0;
        while offset < datagram.len() {
            let (packet, consumed) = match self.engine.decode(&datagram[offset..]) {
                Ok(decoded) => decoded,
                Err(error) => {
                    tracing::debug!(%peer, offset, len = datagram.len(), %error, "dropping the rest of the datagram");
                    break;
                }
            };
            if consumed == 0 {
                tracing::debug!(%peer, offset, "engine decoded an empty packet");
                break;
            }
            offset += consumed;

            if let Some(version) = packet.version() {
                if !self.engine.supports_version(version) {
                    tracing::debug!(%peer, version, "unsupported version");
                    if datagram.len() < self.config.min_initial_datagram_size() {
                        tracing::debug!(%peer, len = datagram.len(), "no version negotiation for an undersized datagram");
                    } else if self.config.version_negotiation() {
                        if let Some(answer) = self.engine.version_negotiation(peer, &packet) {
                            send(&self.socket, &answer);
                        }
                    }
                    break;
                }
            }

            let signpost = Signpost::route(packet.dcid(), peer);
            if let Some(primary) = self.table.route(&signpost) {
                if let Some(connection) = self.table.get_mut(&primary) {
                    connection.deliver(&mut self.engine, packet);
                    if !touched.contains(&primary) {
                        touched.push(primary);
                    }
                }
                continue;
            }

            match packet.kind() {
                PacketKind::Initial => {
                    if datagram.len() < self.config.min_initial_datagram_size() {
                        tracing::debug!(%peer, len = datagram.len(), "initial packet in an undersized datagram");
                        break;
                    }
                    if let Some(primary) = self.accept(packet, signpost, peer) {
                        if !touched.contains(&primary) {
                            touched.push(primary);
                        }
                    }
                }
                PacketKind::Long => {
                    tracing::trace!(%peer, %signpost, "long header packet of no connection");
                }
                PacketKind::Short => {
                    self.answer_stray(&packet, peer);
                    // the rest of the datagram belongs to the same unknown connection
                    break;
                }
            }
        }
        touched
    }

    fn accept(
        &mut self,
        packet: E::Packet,
        original: Signpost,
        peer: SocketAddr,
    ) -> Option<Signpost> {
        let (conn, cid) = match self.engine.accept(packet, peer) {
            Ok(accepted) => accepted,
            Err(error) => {
                tracing::warn!(%peer, %error, "failed to accept connection");
                return None;
            }
        };

        let signpost = Signpost::route(&cid, peer);
        let handler = (self.new_handler)(&signpost, peer);
        let policy = self.config.default_receive_policy();
        let connection = Connection::new(signpost, peer, conn, policy, handler);
        match self.table.insert(connection, [original]) {
            Ok(_) => {
                tracing::info!(%signpost, %original, %peer, "accepted connection");
                Some(signpost)
            }
            Err(mut connection) => {
                tracing::warn!(%signpost, %peer, "connection id already in use, dropping connection");
                self.engine.close(connection.conn_mut(), 0, "connection id in use");
                None
            }
        }
    }

    /// A short header packet matching no connection.
    fn answer_stray(&mut self, packet: &E::Packet, peer: SocketAddr) {
        if !self.config.stateless_reset() {
            return;
        }
        if self.engine.is_authenticated(packet) {
            tracing::trace!(%peer, dcid = %packet.dcid(), "stray packet of an issued id, ignored");
            return;
        }
        if let Some(reset) = self.engine.stateless_reset(peer, packet) {
            tracing::debug!(%peer, dcid = %packet.dcid(), "answering stray packet with stateless reset");
            send(&self.socket, &reset);
        }
    }

    /// Dispatch the engine events of one connection, send what the engine
    /// wants to send, rearm its timer and remove it if it closed.
    fn pump(&mut self, signpost: &Signpost, reactor: &mut dyn Reactor) {
        let Some(connection) = self.table.get_mut(signpost) else {
            return;
        };
        let mut reg = Registration::new(&mut self.interest, reactor);
        connection.process_events(&mut self.engine, &mut reg);
        if connection.is_connected() {
            connection.write_streams(&mut self.engine, &mut reg);
            // the writes may have completed the connection
            connection.process_events(&mut self.engine, &mut reg);
        }
        drop(reg);

        let batch = self.config.drain_batch();
        let mut backlogged = false;
        for _ in 0..self.config.max_drain_rounds() {
            self.outbox.clear();
            let drained = self
                .engine
                .drain_pending(connection.conn_mut(), batch, &mut self.outbox);
            if let Err(error) = drained {
                tracing::debug!(%signpost, %error, "failed to drain pending datagrams");
                backlogged = false;
                break;
            }
            for datagram in &self.outbox {
                send(&self.socket, datagram);
            }
            backlogged = self.outbox.len() >= batch;
            if !backlogged {
                break;
            }
        }
        self.outbox.clear();

        let signpost = connection.signpost();
        if connection.is_closed() {
            self.remove(&signpost, reactor);
            return;
        }
        // a full last batch: the engine may hold more, drain again once writable
        if backlogged {
            tracing::trace!(%signpost, "pump stopped with datagrams left");
            self.interest.start_backlog(signpost, reactor);
        } else {
            self.interest.stop_backlog(&signpost, reactor);
        }
        match self.engine.next_timeout(connection.conn()) {
            Some(after) => reactor.schedule_timeout(&signpost, after),
            None => reactor.cancel_timeout(&signpost),
        }
    }

    fn remove(&mut self, signpost: &Signpost, reactor: &mut dyn Reactor) {
        let Some(mut connection) = self.table.remove(signpost) else {
            return;
        };
        self.interest.stop_connection(signpost, reactor);
        reactor.cancel_timeout(signpost);
        tracing::debug!(%signpost, remaining = self.table.len(), "removed connection");
        connection.notify_closed();
    }

    /// The shared socket is writable: hand queued stream bytes to the engine
    /// and send what it framed.
    pub fn on_writable(&mut self, reactor: &mut dyn Reactor) {
        for signpost in self.interest.connections() {
            let Some(connection) = self.table.get_mut(&signpost) else {
                continue;
            };
            if connection.state() == ConnState::Handshaking {
                // nothing goes to the engine before the handshake completed
                let mut reg = Registration::new(&mut self.interest, reactor);
                connection.write_streams(&mut self.engine, &mut reg);
                drop(reg);
                if !self.interest.is_backlogged(&signpost) {
                    continue;
                }
            }
            self.pump(&signpost, reactor);
        }
    }

    /// The timer of one connection expired.
    pub fn on_timeout(&mut self, signpost: &Signpost, reactor: &mut dyn Reactor) {
        let Some(connection) = self.table.get_mut(signpost) else {
            return;
        };
        self.engine.on_timeout(connection.conn_mut());
        self.pump(signpost, reactor);
    }

    /// Start an outbound connection.
    ///
    /// The connection begins in [`ConnState::Handshaking`], its first flight
    /// is sent right away. The handshake completes through later readable and
    /// timer events.
    pub fn connect(
        &mut self,
        server: SocketAddr,
        server_name: &str,
        handler: Box<dyn Handler<E>>,
        reactor: &mut dyn Reactor,
    ) -> Result<Signpost, Error> {
        let (conn, cid) = self.engine.connect(server, server_name)?;
        let signpost = Signpost::route(&cid, server);
        let policy = self.config.default_receive_policy();
        let connection = Connection::new(signpost, server, conn, policy, handler);
        if let Err(mut connection) = self.table.insert(connection, []) {
            self.engine.close(connection.conn_mut(), 0, "connection id in use");
            return Err(Error::Closed);
        }
        tracing::info!(%signpost, %server, server_name, "connecting");
        self.pump(&signpost, reactor);
        Ok(signpost)
    }

    /// Close a connection from this side.
    ///
    /// The close is handed to the engine and sent, then the connection leaves
    /// the table and its handler sees [`CloseReason::Local`].
    pub fn shutdown(
        &mut self,
        signpost: &Signpost,
        code: u64,
        reason: &str,
        reactor: &mut dyn Reactor,
    ) -> Result<(), Error> {
        let connection = self
            .table
            .get_mut(signpost)
            .ok_or(Error::UnknownConnection(*signpost))?;
        let primary = connection.signpost();
        let mut reg = Registration::new(&mut self.interest, reactor);
        connection.close(&mut self.engine, code, reason, &mut reg);
        drop(reg);
        tracing::info!(%primary, code, reason, "shutdown");
        self.pump(&primary, reactor);
        Ok(())
    }

    /// Open a stream on a connection.
    pub fn open_stream(&mut self, signpost: &Signpost) -> Result<E::Stream, Error> {
        let connection = self
            .table
            .get_mut(signpost)
            .ok_or(Error::UnknownConnection(*signpost))?;
        connection.open_stream(&mut self.engine)
    }

    /// Access one stream of a connection from outside a handler callback.
    pub fn with_stream<R>(
        &mut self,
        signpost: &Signpost,
        stream: E::Stream,
        reactor: &mut dyn Reactor,
        f: impl FnOnce(&mut StreamIo<'_, E::Stream>) -> R,
    ) -> Result<R, Error> {
        let connection = self
            .table
            .get_mut(signpost)
            .ok_or(Error::UnknownConnection(*signpost))?;
        let reg = Registration::new(&mut self.interest, reactor);
        let mut io = connection.stream_io(stream, reg)?;
        Ok(f(&mut io))
    }

    /// Write to the primary stream of a connection and flush it.
    ///
    /// The primary stream is opened by the first write.
    pub fn write(
        &mut self,
        signpost: &Signpost,
        data: &[u8],
        reactor: &mut dyn Reactor,
    ) -> Result<usize, Error> {
        let connection = self
            .table
            .get_mut(signpost)
            .ok_or(Error::UnknownConnection(*signpost))?;
        let stream = connection.primary_stream(&mut self.engine)?;
        self.with_stream(signpost, stream, reactor, |io| {
            let written = io.write(data)?;
            io.flush();
            Ok(written)
        })?
    }

    /// The shared socket failed, on receive or while waiting for readiness.
    ///
    /// Every connection is force-closed, each handler sees the error and the
    /// close. Returns the error for the reactor to surface.
    pub fn fail(&mut self, error: io::Error, reactor: &mut dyn Reactor) -> Error {
        tracing::error!(%error, connections = self.table.len(), "shared socket failed");
        self.close_all(&error, reactor);
        Error::FatalSocket(error)
    }

    fn close_all(&mut self, error: &io::Error, reactor: &mut dyn Reactor) {
        if self.interest.is_enabled() {
            reactor.disable_write(self.interest.token());
        }
        self.interest.clear();
        let reason = error.to_string();
        let mut reg = Registration::new(&mut self.interest, reactor);
        for mut connection in self.table.drain() {
            connection.close(&mut self.engine, 0, &reason, &mut reg);
            let error = Error::FatalSocket(io::Error::new(error.kind(), reason.clone()));
            connection.handler_mut().on_error(None, &error);
            reg.reactor().cancel_timeout(&connection.signpost());
            connection.notify_closed();
        }
    }
}

fn send<S: DatagramSocket>(socket: &S, datagram: &Datagram) {
    match socket.try_send_to(&datagram.payload, datagram.dst) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            tracing::trace!(dst = %datagram.dst, "socket busy, datagram dropped");
        }
        Err(e) => {
            tracing::debug!(dst = %datagram.dst, error = %e, "failed to send datagram");
        }
    }
}
