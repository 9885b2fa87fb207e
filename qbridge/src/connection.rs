use std::{collections::HashMap, net::SocketAddr};

use bytes::Bytes;
use qbuf::ReceivePolicy;

use crate::{
    cid::Signpost,
    engine::{CloseReason, Engine, Event},
    error::Error,
    reactor::{Registration, StreamKey},
    transport::StreamTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// The handshake is running. Writes are queued, not handed to the
    /// engine.
    Handshaking,
    Connected,
    Closed,
}

/// The application side of a connection.
///
/// Every callback runs to completion on the reactor's thread. The `io`
/// argument gives access to the stream the callback is about, writes issued
/// through it are drained on the next writable event.
pub trait Handler<E: Engine> {
    fn on_connected(&mut self, conn: &mut ConnIo<'_, E>) {
        let _ = conn;
    }

    fn on_stream_opened(&mut self, stream: &mut StreamIo<'_, E::Stream>) {
        let _ = stream;
    }

    /// Called once per satisfied receive policy.
    fn on_data(&mut self, stream: &mut StreamIo<'_, E::Stream>, data: Bytes);

    /// A stream or the connection failed. `stream` is `None` for failures
    /// of the whole connection.
    fn on_error(&mut self, stream: Option<E::Stream>, error: &Error) {
        tracing::debug!(?stream, %error, "unhandled error");
    }

    fn on_closed(&mut self, reason: &CloseReason) {
        let _ = reason;
    }
}

/// The engine connection and its streams.
///
/// Stream handles of the engine map to owned transports here, an engine
/// notification about a stream is resolved by lookup.
pub struct Streams<E: Engine> {
    signpost: Signpost,
    conn: E::Conn,
    connected: bool,
    transports: HashMap<E::Stream, StreamTransport<E::Stream>>,
    primary: Option<E::Stream>,
    next_slot: u64,
    policy: ReceivePolicy,
}

impl<E: Engine> Streams<E> {
    fn new(signpost: Signpost, conn: E::Conn, policy: ReceivePolicy) -> Self {
        Self {
            signpost,
            conn,
            connected: false,
            transports: HashMap::new(),
            primary: None,
            next_slot: 0,
            policy,
        }
    }

    fn insert(&mut self, stream: E::Stream) -> &mut StreamTransport<E::Stream> {
        let key = StreamKey {
            signpost: self.signpost,
            slot: self.next_slot,
        };
        let policy = self.policy;
        let next_slot = &mut self.next_slot;
        self.transports.entry(stream).or_insert_with(|| {
            *next_slot += 1;
            StreamTransport::new(key, stream, policy)
        })
    }

    fn open(&mut self, engine: &mut E) -> Result<E::Stream, Error> {
        let stream = engine.open_stream(&mut self.conn)?;
        self.insert(stream);
        tracing::debug!(signpost = %self.signpost, ?stream, "opened stream");
        Ok(stream)
    }

    /// The stream used by plain connection writes, opened on first use.
    fn primary(&mut self, engine: &mut E) -> Result<E::Stream, Error> {
        match self.primary {
            Some(stream) if self.transports.contains_key(&stream) => Ok(stream),
            _ => {
                let stream = self.open(engine)?;
                self.primary = Some(stream);
                Ok(stream)
            }
        }
    }

    fn remove(&mut self, stream: &E::Stream, reg: &mut Registration<'_>) {
        if let Some(mut transport) = self.transports.remove(stream) {
            transport.teardown(reg);
        }
        if self.primary.as_ref() == Some(stream) {
            self.primary = None;
        }
    }
}

/// Connection access handed to [`Handler::on_connected`].
pub struct ConnIo<'a, E: Engine> {
    engine: &'a mut E,
    streams: &'a mut Streams<E>,
    reg: Registration<'a>,
}

impl<'a, E: Engine> ConnIo<'a, E> {
    pub(crate) fn new(
        engine: &'a mut E,
        streams: &'a mut Streams<E>,
        reg: Registration<'a>,
    ) -> Self {
        Self {
            engine,
            streams,
            reg,
        }
    }

    pub fn signpost(&self) -> Signpost {
        self.streams.signpost
    }

    pub fn is_connected(&self) -> bool {
        self.streams.connected
    }

    pub fn open_stream(&mut self) -> Result<E::Stream, Error> {
        self.streams.open(self.engine)
    }

    /// Access one stream of the connection.
    pub fn stream(&mut self, stream: E::Stream) -> Option<StreamIo<'_, E::Stream>> {
        let transport = self.streams.transports.get_mut(&stream)?;
        Some(StreamIo::new(transport, self.reg.reborrow()))
    }

    /// Write to the connection's primary stream and flush it.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        let stream = self.streams.primary(self.engine)?;
        let mut io = self.stream(stream).ok_or(Error::UnknownStream)?;
        let written = io.write(data)?;
        io.flush();
        Ok(written)
    }
}

/// Stream access handed to the handler.
pub struct StreamIo<'a, S> {
    transport: &'a mut StreamTransport<S>,
    reg: Registration<'a>,
}

impl<'a, S: Copy> StreamIo<'a, S> {
    pub(crate) fn new(transport: &'a mut StreamTransport<S>, reg: Registration<'a>) -> Self {
        Self { transport, reg }
    }

    pub fn id(&self) -> S {
        self.transport.stream()
    }

    pub fn key(&self) -> StreamKey {
        self.transport.key()
    }

    pub fn policy(&self) -> ReceivePolicy {
        self.transport.policy()
    }

    /// Takes effect for the read being collected.
    pub fn configure_read(&mut self, policy: ReceivePolicy) {
        self.transport.configure_read(policy);
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.transport.write(data)
    }

    /// Returns `true` if this flush enabled write interest.
    pub fn flush(&mut self) -> bool {
        self.transport.flush(&mut self.reg)
    }

    /// End the sending side after the queued bytes.
    pub fn finish(&mut self) {
        self.transport.finish(&mut self.reg);
    }

    pub fn transport(&self) -> &StreamTransport<S> {
        self.transport
    }
}

/// One logical connection on the shared socket.
pub struct Connection<E: Engine> {
    signpost: Signpost,
    peer: SocketAddr,
    state: ConnState,
    on_close: Option<CloseReason>,
    streams: Streams<E>,
    handler: Box<dyn Handler<E>>,
}

impl<E: Engine> Connection<E> {
    pub fn new(
        signpost: Signpost,
        peer: SocketAddr,
        conn: E::Conn,
        policy: ReceivePolicy,
        handler: Box<dyn Handler<E>>,
    ) -> Self {
        Self {
            signpost,
            peer,
            state: ConnState::Handshaking,
            on_close: None,
            streams: Streams::new(signpost, conn, policy),
            handler,
        }
    }

    pub fn signpost(&self) -> Signpost {
        self.signpost
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.on_close.as_ref()
    }

    pub fn conn(&self) -> &E::Conn {
        &self.streams.conn
    }

    pub fn conn_mut(&mut self) -> &mut E::Conn {
        &mut self.streams.conn
    }

    pub fn stream_count(&self) -> usize {
        self.streams.transports.len()
    }

    pub fn transport(&self, stream: &E::Stream) -> Option<&StreamTransport<E::Stream>> {
        self.streams.transports.get(stream)
    }

    pub fn open_stream(&mut self, engine: &mut E) -> Result<E::Stream, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.streams.open(engine)
    }

    pub fn primary_stream(&mut self, engine: &mut E) -> Result<E::Stream, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.streams.primary(engine)
    }

    pub fn stream_io<'a>(
        &'a mut self,
        stream: E::Stream,
        reg: Registration<'a>,
    ) -> Result<StreamIo<'a, E::Stream>, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let transport = self
            .streams
            .transports
            .get_mut(&stream)
            .ok_or(Error::UnknownStream)?;
        Ok(StreamIo::new(transport, reg))
    }

    /// Feed a routed packet to the engine.
    pub fn deliver(&mut self, engine: &mut E, packet: E::Packet) {
        if self.is_closed() {
            return;
        }
        if let Err(error) = engine.deliver(&mut self.streams.conn, packet) {
            tracing::debug!(signpost = %self.signpost, %error, "engine rejected packet");
            self.handler.on_error(None, &Error::Engine(error));
        }
    }

    /// Dispatch every notification the engine queued for this connection.
    pub fn process_events(&mut self, engine: &mut E, reg: &mut Registration<'_>) {
        while !self.is_closed() {
            let Some(event) = engine.poll_event(&mut self.streams.conn) else {
                break;
            };
            self.on_event(engine, event, reg);
        }
    }

    fn on_event(&mut self, engine: &mut E, event: Event<E::Stream>, reg: &mut Registration<'_>) {
        let signpost = self.signpost;
        match event {
            Event::Connected => {
                tracing::info!(%signpost, peer = %self.peer, "connection established");
                self.state = ConnState::Connected;
                self.streams.connected = true;
                for transport in self.streams.transports.values_mut() {
                    transport.resume(reg);
                }
                let mut io = ConnIo::new(engine, &mut self.streams, reg.reborrow());
                self.handler.on_connected(&mut io);
            }
            Event::StreamOpened(stream) => {
                tracing::debug!(%signpost, ?stream, "peer opened stream");
                let transport = self.streams.insert(stream);
                let mut io = StreamIo::new(transport, reg.reborrow());
                self.handler.on_stream_opened(&mut io);
            }
            Event::StreamData { stream, data } => {
                // streams are created by the open, data of a torn down one is late
                let Some(transport) = self.streams.transports.get_mut(&stream) else {
                    tracing::trace!(%signpost, ?stream, len = data.len(), "data for a removed stream, dropped");
                    return;
                };
                transport.ingest(&data);
                while let Some(data) = transport.deliver() {
                    let mut io = StreamIo::new(&mut *transport, reg.reborrow());
                    self.handler.on_data(&mut io, data);
                }
            }
            Event::StreamFinished(stream) => {
                let Some(transport) = self.streams.transports.get_mut(&stream) else {
                    return;
                };
                transport.close_read();
                while let Some(data) = transport.deliver_tail() {
                    let mut io = StreamIo::new(&mut *transport, reg.reborrow());
                    self.handler.on_data(&mut io, data);
                }
                if transport.is_done() {
                    self.streams.remove(&stream, reg);
                }
            }
            Event::StreamWritable(stream) => {
                if let Some(transport) = self.streams.transports.get_mut(&stream) {
                    transport.resume(reg);
                }
            }
            Event::StreamReset { stream, code } => {
                tracing::debug!(%signpost, ?stream, code, "stream reset by peer");
                self.streams.remove(&stream, reg);
                self.handler.on_error(Some(stream), &Error::Reset(code));
            }
            Event::StopSending { stream, code } => {
                tracing::debug!(%signpost, ?stream, code, "peer stopped reading");
                if let Some(transport) = self.streams.transports.get_mut(&stream) {
                    transport.stop_sending(reg);
                    if transport.is_done() {
                        self.streams.remove(&stream, reg);
                    }
                }
                self.handler.on_error(Some(stream), &Error::StopSending(code));
            }
            Event::StreamFailed { stream, error } => {
                tracing::debug!(%signpost, ?stream, %error, "stream read failure");
                self.streams.remove(&stream, reg);
                self.handler.on_error(Some(stream), &Error::Read(error));
            }
            Event::Closed(reason) => {
                tracing::info!(%signpost, %reason, "connection closed");
                self.mark_closed(reason, reg);
            }
        }
    }

    /// Hand the queued bytes of every writing stream to the engine.
    ///
    /// A failing stream is torn down and reported alone, its siblings keep
    /// going.
    pub fn write_streams(&mut self, engine: &mut E, reg: &mut Registration<'_>) -> usize {
        if self.is_closed() {
            return 0;
        }
        let connected = self.streams.connected;
        let Streams {
            conn, transports, ..
        } = &mut self.streams;

        let mut total = 0;
        let mut failed = Vec::new();
        let mut done = Vec::new();
        for (stream, transport) in transports.iter_mut() {
            if !reg.is_writing(&transport.key()) {
                continue;
            }
            match transport.write_some(engine, conn, connected, reg) {
                Ok(written) => total += written,
                Err(error) => {
                    tracing::debug!(signpost = %self.signpost, ?stream, %error, "write failure");
                    failed.push((*stream, error));
                    continue;
                }
            }
            if transport.is_done() {
                done.push(*stream);
            }
        }

        for stream in done {
            self.streams.remove(&stream, reg);
        }
        for (stream, error) in failed {
            self.streams.remove(&stream, reg);
            self.handler.on_error(Some(stream), &error);
        }
        total
    }

    /// Ask the engine to close, the close is sent by the next pump.
    pub fn close(&mut self, engine: &mut E, code: u64, reason: &str, reg: &mut Registration<'_>) {
        if self.is_closed() {
            return;
        }
        engine.close(&mut self.streams.conn, code, reason);
        self.mark_closed(
            CloseReason::Local {
                code,
                reason: reason.to_owned(),
            },
            reg,
        );
    }

    fn mark_closed(&mut self, reason: CloseReason, reg: &mut Registration<'_>) {
        self.state = ConnState::Closed;
        self.streams.connected = false;
        for (_, mut transport) in self.streams.transports.drain() {
            transport.teardown(reg);
        }
        self.streams.primary = None;
        self.on_close.get_or_insert(reason);
    }

    /// Report the close to the handler, called once the connection left the
    /// table.
    pub fn notify_closed(&mut self) {
        let reason = self.on_close.clone().unwrap_or(CloseReason::Local {
            code: 0,
            reason: String::new(),
        });
        self.handler.on_closed(&reason);
    }

    pub fn handler_mut(&mut self) -> &mut dyn Handler<E> {
        self.handler.as_mut()
    }
}
