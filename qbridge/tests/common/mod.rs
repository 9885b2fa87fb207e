// common is submod for every integration test
#![allow(unused)]

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet, VecDeque},
    io,
    net::SocketAddr,
    rc::Rc,
    sync::LazyLock,
    time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult, Parser,
    bytes::complete::take,
    number::complete::{be_u8, be_u16, be_u32, be_u64},
};
use qbridge::{
    cid::{WriteConnectionId, be_connection_id},
    *,
};
use qsock::DatagramSocket;
use tracing::level_filters::LevelFilter;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub fn init_tracing() {
    static TRACING: LazyLock<()> = LazyLock::new(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_max_level(LevelFilter::DEBUG)
            .init();
    });
    LazyLock::force(&TRACING);
}

pub const SIM_VERSION: u32 = 1;
pub const CID_LEN: usize = 8;
/// First byte of every id a simulated engine issues.
pub const ISSUED: u8 = 0x5a;

const INITIAL: u8 = 0xc0;
const HANDSHAKE: u8 = 0xc1;
const SHORT: u8 = 0x40;
const VERSION_NEGOTIATION: u8 = 0x80;

const PADDING: u8 = 0x00;
const RESET_STREAM: u8 = 0x04;
const STOP_SENDING: u8 = 0x05;
const HELLO: u8 = 0x06;
const STREAM: u8 = 0x08;
const CLOSE: u8 = 0x1c;

const MAX_PAYLOAD: usize = 1180;
const MAX_STREAM_CHUNK: usize = 1000;

pub fn issued_cid() -> ConnectionId {
    let mut bytes = [0u8; CID_LEN];
    bytes.copy_from_slice(&ConnectionId::random_gen(CID_LEN));
    bytes[0] = ISSUED;
    ConnectionId::from_slice(&bytes)
}

pub fn long_packet(
    ty: u8,
    version: u32,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(ty);
    buf.put_u32(version);
    buf.put_connection_id(dcid);
    buf.put_connection_id(scid);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    buf.to_vec()
}

pub fn short_packet(dcid: &ConnectionId, payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(dcid.len(), CID_LEN);
    let mut buf = BytesMut::new();
    buf.put_u8(SHORT);
    buf.put_slice(dcid);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    buf.to_vec()
}

/// An initial packet, padded so the datagram is `pad_to` bytes long.
pub fn initial_datagram(
    version: u32,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    pad_to: usize,
) -> Vec<u8> {
    let header = 1 + 4 + dcid.encoding_size() + scid.encoding_size() + 2;
    let mut payload = vec![HELLO];
    if pad_to > header + 1 {
        payload.resize(pad_to - header, PADDING);
    }
    long_packet(INITIAL, version, dcid, scid, &payload)
}

#[derive(Debug, Clone)]
pub struct SimPacket {
    ty: u8,
    version: Option<u32>,
    dcid: ConnectionId,
    scid: ConnectionId,
    payload: Bytes,
}

impl Packet for SimPacket {
    fn kind(&self) -> PacketKind {
        match self.ty {
            INITIAL => PacketKind::Initial,
            SHORT => PacketKind::Short,
            _ => PacketKind::Long,
        }
    }

    fn version(&self) -> Option<u32> {
        self.version
    }

    fn dcid(&self) -> &ConnectionId {
        &self.dcid
    }
}

fn be_sim_packet(input: &[u8]) -> IResult<&[u8], SimPacket> {
    let (remain, ty) = be_u8(input)?;
    match ty {
        INITIAL | HANDSHAKE => {
            let (remain, version) = be_u32(remain)?;
            let (remain, dcid) = be_connection_id(remain)?;
            let (remain, scid) = be_connection_id(remain)?;
            let (remain, len) = be_u16(remain)?;
            let (remain, payload) = take(len as usize).parse(remain)?;
            let packet = SimPacket {
                ty,
                version: Some(version),
                dcid,
                scid,
                payload: Bytes::copy_from_slice(payload),
            };
            Ok((remain, packet))
        }
        SHORT => {
            let (remain, dcid) = take(CID_LEN).parse(remain)?;
            let (remain, len) = be_u16(remain)?;
            let (remain, payload) = take(len as usize).parse(remain)?;
            let packet = SimPacket {
                ty,
                version: None,
                dcid: ConnectionId::from_slice(dcid),
                scid: ConnectionId::default(),
                payload: Bytes::copy_from_slice(payload),
            };
            Ok((remain, packet))
        }
        _ => Err(nom::Err::Error(nom::error::make_error(
            input,
            nom::error::ErrorKind::Tag,
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Frame {
    Padding,
    Hello,
    Stream { id: u64, fin: bool, data: Bytes },
    Reset { id: u64, code: u64 },
    StopSending { id: u64, code: u64 },
    Close { code: u64, reason: String },
}

fn be_frame(input: &[u8]) -> IResult<&[u8], Frame> {
    let (remain, ty) = be_u8(input)?;
    match ty {
        PADDING => Ok((remain, Frame::Padding)),
        HELLO => Ok((remain, Frame::Hello)),
        STREAM => {
            let (remain, id) = be_u64(remain)?;
            let (remain, fin) = be_u8(remain)?;
            let (remain, len) = be_u16(remain)?;
            let (remain, data) = take(len as usize).parse(remain)?;
            let data = Bytes::copy_from_slice(data);
            Ok((remain, Frame::Stream { id, fin: fin != 0, data }))
        }
        RESET_STREAM => {
            let (remain, id) = be_u64(remain)?;
            let (remain, code) = be_u64(remain)?;
            Ok((remain, Frame::Reset { id, code }))
        }
        STOP_SENDING => {
            let (remain, id) = be_u64(remain)?;
            let (remain, code) = be_u64(remain)?;
            Ok((remain, Frame::StopSending { id, code }))
        }
        CLOSE => {
            let (remain, code) = be_u64(remain)?;
            let (remain, len) = be_u8(remain)?;
            let (remain, reason) = take(len as usize).parse(remain)?;
            let reason = String::from_utf8_lossy(reason).into_owned();
            Ok((remain, Frame::Close { code, reason }))
        }
        _ => Err(nom::Err::Error(nom::error::make_error(
            input,
            nom::error::ErrorKind::Tag,
        ))),
    }
}

fn put_frame(buf: &mut Vec<u8>, frame: &Frame) {
    match frame {
        Frame::Padding => buf.put_u8(PADDING),
        Frame::Hello => buf.put_u8(HELLO),
        Frame::Stream { id, fin, data } => {
            buf.put_u8(STREAM);
            buf.put_u64(*id);
            buf.put_u8(*fin as u8);
            buf.put_u16(data.len() as u16);
            buf.put_slice(data);
        }
        Frame::Reset { id, code } => {
            buf.put_u8(RESET_STREAM);
            buf.put_u64(*id);
            buf.put_u64(*code);
        }
        Frame::StopSending { id, code } => {
            buf.put_u8(STOP_SENDING);
            buf.put_u64(*id);
            buf.put_u64(*code);
        }
        Frame::Close { code, reason } => {
            buf.put_u8(CLOSE);
            buf.put_u64(*code);
            buf.put_u8(reason.len() as u8);
            buf.put_slice(reason.as_bytes());
        }
    }
}

#[derive(Debug)]
pub struct SimConn {
    client: bool,
    local_cid: ConnectionId,
    remote_cid: Option<ConnectionId>,
    peer: SocketAddr,
    connected: bool,
    closed: bool,
    events: VecDeque<Event<u64>>,
    datagrams: VecDeque<Datagram>,
    frames: VecDeque<Vec<u8>>,
    streams: HashSet<u64>,
    blocked: HashSet<u64>,
    next_stream: u64,
    idle: Option<Duration>,
}

impl SimConn {
    fn new(
        client: bool,
        local_cid: ConnectionId,
        peer: SocketAddr,
        idle: Option<Duration>,
    ) -> Self {
        Self {
            client,
            local_cid,
            remote_cid: None,
            peer,
            connected: false,
            closed: false,
            events: VecDeque::new(),
            datagrams: VecDeque::new(),
            frames: VecDeque::new(),
            streams: HashSet::new(),
            blocked: HashSet::new(),
            next_stream: if client { 0 } else { 1 },
            idle,
        }
    }

    fn queue_frame(&mut self, frame: &Frame) {
        let mut buf = Vec::new();
        put_frame(&mut buf, frame);
        self.frames.push_back(buf);
    }

    fn has_output(&self) -> bool {
        !self.datagrams.is_empty() || (self.remote_cid.is_some() && !self.frames.is_empty())
    }
}

/// A toy engine speaking a tiny framed protocol.
///
/// Long headers carry a version and both ids, short headers an 8 byte
/// destination id. Ids issued by the engine start with [`ISSUED`], which
/// is the "authenticating structure" a stray packet is checked for.
#[derive(Debug, Default)]
pub struct SimEngine {
    /// Refuse every connection attempt.
    pub refuse: bool,
    /// Bytes `send_stream` still accepts, unlimited if `None`.
    pub send_budget: Option<usize>,
    /// Streams whose sends fail.
    pub fail_streams: HashSet<u64>,
    pub idle_timeout: Option<Duration>,
    /// `next_timeout` ignores queued output and only reports the idle timer.
    pub lazy_timer: bool,
    /// Answer every stream the peer opens with RESET_STREAM.
    pub reset_code: Option<u64>,
    /// Answer every stream the peer opens with STOP_SENDING.
    pub stop_sending_code: Option<u64>,
    /// Stream bytes accepted by `send_stream`.
    pub stream_bytes: usize,
    pub accepted: usize,
}

impl SimEngine {
    fn process_frames(
        &mut self,
        conn: &mut SimConn,
        mut payload: &[u8],
    ) -> Result<(), EngineError> {
        while !payload.is_empty() {
            let (remain, frame) =
                be_frame(payload).map_err(|_| EngineError::new(0x07, "malformed frame"))?;
            payload = remain;
            match frame {
                Frame::Padding | Frame::Hello => {}
                Frame::Stream { id, fin, data } => {
                    if conn.streams.insert(id) {
                        conn.events.push_back(Event::StreamOpened(id));
                        if let Some(code) = self.reset_code {
                            conn.queue_frame(&Frame::Reset { id, code });
                        }
                        if let Some(code) = self.stop_sending_code {
                            conn.queue_frame(&Frame::StopSending { id, code });
                        }
                    }
                    if !data.is_empty() {
                        conn.events.push_back(Event::StreamData { stream: id, data });
                    }
                    if fin {
                        conn.events.push_back(Event::StreamFinished(id));
                    }
                }
                Frame::Reset { id, code } => {
                    conn.events.push_back(Event::StreamReset { stream: id, code });
                }
                Frame::StopSending { id, code } => {
                    conn.events.push_back(Event::StopSending { stream: id, code });
                }
                Frame::Close { code, reason } => {
                    conn.closed = true;
                    conn.events
                        .push_back(Event::Closed(CloseReason::Application { code, reason }));
                }
            }
        }
        Ok(())
    }
}

impl Engine for SimEngine {
    type Packet = SimPacket;
    type Conn = SimConn;
    type Stream = u64;

    fn decode(&mut self, datagram: &[u8]) -> Result<(SimPacket, usize), DecodeError> {
        match be_sim_packet(datagram) {
            Ok((remain, packet)) => Ok((packet, datagram.len() - remain.len())),
            Err(_) => Err(DecodeError::new("not a sim packet")),
        }
    }

    fn supports_version(&self, version: u32) -> bool {
        version == SIM_VERSION
    }

    fn version_negotiation(&mut self, peer: SocketAddr, _: &SimPacket) -> Option<Datagram> {
        let mut payload = vec![VERSION_NEGOTIATION, 0, 0, 0, 0];
        payload.put_u32(SIM_VERSION);
        Some(Datagram::new(peer, payload))
    }

    fn accept(
        &mut self,
        packet: SimPacket,
        peer: SocketAddr,
    ) -> Result<(SimConn, ConnectionId), AcceptError> {
        if packet.kind() != PacketKind::Initial {
            return Err(AcceptError::NotInitial);
        }
        if self.refuse {
            return Err(AcceptError::Refused("refusing connections".into()));
        }
        let cid = issued_cid();
        let mut conn = SimConn::new(false, cid, peer, self.idle_timeout);
        conn.remote_cid = Some(packet.scid);
        conn.connected = true;
        conn.events.push_back(Event::Connected);
        let hello = long_packet(HANDSHAKE, SIM_VERSION, &packet.scid, &cid, &[HELLO]);
        conn.datagrams.push_back(Datagram::new(peer, hello));
        self.process_frames(&mut conn, &packet.payload)
            .map_err(|e| AcceptError::Refused(e.reason))?;
        self.accepted += 1;
        Ok((conn, cid))
    }

    fn connect(
        &mut self,
        server: SocketAddr,
        _server_name: &str,
    ) -> Result<(SimConn, ConnectionId), ConnectError> {
        let cid = issued_cid();
        let original = ConnectionId::random_gen(CID_LEN);
        let mut conn = SimConn::new(true, cid, server, self.idle_timeout);
        let initial = initial_datagram(SIM_VERSION, &original, &cid, 1200);
        conn.datagrams.push_back(Datagram::new(server, initial));
        Ok((conn, cid))
    }

    fn deliver(&mut self, conn: &mut SimConn, packet: SimPacket) -> Result<(), EngineError> {
        if conn.closed {
            return Ok(());
        }
        if conn.client && !conn.connected && packet.ty == HANDSHAKE {
            conn.remote_cid = Some(packet.scid);
            conn.connected = true;
            conn.events.push_back(Event::Connected);
        }
        self.process_frames(conn, &packet.payload)
    }

    fn poll_event(&mut self, conn: &mut SimConn) -> Option<Event<u64>> {
        if self.send_budget != Some(0) {
            for stream in conn.blocked.drain() {
                conn.events.push_back(Event::StreamWritable(stream));
            }
        }
        conn.events.pop_front()
    }

    fn open_stream(&mut self, conn: &mut SimConn) -> Result<u64, EngineError> {
        if conn.closed {
            return Err(EngineError::new(0x01, "connection closed"));
        }
        let id = conn.next_stream;
        conn.next_stream += 4;
        conn.streams.insert(id);
        Ok(id)
    }

    fn send_stream(
        &mut self,
        conn: &mut SimConn,
        stream: u64,
        data: &[u8],
    ) -> Result<usize, EngineError> {
        if self.fail_streams.contains(&stream) {
            return Err(EngineError::new(0x05, format!("stream {stream} refused")));
        }
        let accepted = match &mut self.send_budget {
            Some(budget) => {
                let n = data.len().min(*budget);
                *budget -= n;
                n
            }
            None => data.len(),
        };
        if accepted == 0 {
            conn.blocked.insert(stream);
            return Ok(0);
        }
        for chunk in data[..accepted].chunks(MAX_STREAM_CHUNK) {
            conn.queue_frame(&Frame::Stream {
                id: stream,
                fin: false,
                data: Bytes::copy_from_slice(chunk),
            });
        }
        self.stream_bytes += accepted;
        Ok(accepted)
    }

    fn finish_stream(&mut self, conn: &mut SimConn, stream: u64) -> Result<(), EngineError> {
        conn.queue_frame(&Frame::Stream {
            id: stream,
            fin: true,
            data: Bytes::new(),
        });
        Ok(())
    }

    fn drain_pending(
        &mut self,
        conn: &mut SimConn,
        max: usize,
        out: &mut Vec<Datagram>,
    ) -> Result<(), EngineError> {
        let mut drained = 0;
        while drained < max {
            if let Some(datagram) = conn.datagrams.pop_front() {
                out.push(datagram);
                drained += 1;
                continue;
            }
            let Some(dcid) = conn.remote_cid else {
                break;
            };
            if conn.frames.is_empty() {
                break;
            }
            let mut payload = Vec::new();
            while let Some(frame) = conn.frames.front() {
                if !payload.is_empty() && payload.len() + frame.len() > MAX_PAYLOAD {
                    break;
                }
                payload.extend_from_slice(frame);
                conn.frames.pop_front();
            }
            out.push(Datagram::new(conn.peer, short_packet(&dcid, &payload)));
            drained += 1;
        }
        Ok(())
    }

    fn next_timeout(&self, conn: &SimConn) -> Option<Duration> {
        if conn.has_output() && !self.lazy_timer {
            return Some(Duration::ZERO);
        }
        conn.idle
    }

    fn on_timeout(&mut self, conn: &mut SimConn) {
        if conn.has_output() || conn.closed {
            return;
        }
        if conn.idle.is_some() {
            conn.closed = true;
            conn.events.push_back(Event::Closed(CloseReason::IdleTimeout));
        }
    }

    fn close(&mut self, conn: &mut SimConn, code: u64, reason: &str) {
        if conn.closed {
            return;
        }
        conn.closed = true;
        conn.frames.clear();
        if let Some(dcid) = conn.remote_cid {
            let mut payload = Vec::new();
            put_frame(
                &mut payload,
                &Frame::Close {
                    code,
                    reason: reason.to_owned(),
                },
            );
            conn.datagrams
                .push_back(Datagram::new(conn.peer, short_packet(&dcid, &payload)));
        }
    }

    fn is_authenticated(&self, packet: &SimPacket) -> bool {
        packet.dcid.len() >= 2 && (packet.dcid[0] != 0 || packet.dcid[1] != 0)
    }

    fn stateless_reset(&mut self, peer: SocketAddr, _: &SimPacket) -> Option<Datagram> {
        // too short to decode, a reset never triggers another reset
        Some(Datagram::new(peer, vec![SHORT, 0xee, 0xee, 0xee, 0xee]))
    }
}

/// Datagrams in flight between memory sockets.
#[derive(Debug, Default)]
pub struct Network {
    inboxes: HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    sent: Vec<(SocketAddr, SocketAddr, Vec<u8>)>,
    broken: HashSet<SocketAddr>,
}

pub type SharedNetwork = Rc<RefCell<Network>>;

pub fn network() -> SharedNetwork {
    Rc::new(RefCell::new(Network::default()))
}

impl Network {
    pub fn inject(&mut self, from: SocketAddr, to: SocketAddr, datagram: Vec<u8>) {
        self.inboxes.entry(to).or_default().push_back((from, datagram));
    }

    pub fn is_idle(&self) -> bool {
        self.inboxes.values().all(VecDeque::is_empty)
    }

    pub fn queued(&self, addr: SocketAddr) -> usize {
        self.inboxes.get(&addr).map_or(0, VecDeque::len)
    }

    /// Every datagram `from` sent, with its destination.
    pub fn sent_from(&self, from: SocketAddr) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent
            .iter()
            .filter(|(src, ..)| *src == from)
            .map(|(_, dst, datagram)| (*dst, datagram.clone()))
            .collect()
    }

    /// Reorder the inbox of `addr` by source: `order` lists the source to
    /// take the next datagram from, sources run out independently.
    pub fn interleave(&mut self, addr: SocketAddr, order: &[SocketAddr]) {
        let inbox = self.inboxes.entry(addr).or_default();
        let mut by_source: HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>> = HashMap::new();
        for (src, datagram) in inbox.drain(..) {
            by_source.entry(src).or_default().push_back((src, datagram));
        }
        loop {
            let mut moved = false;
            for src in order {
                if let Some(next) = by_source.get_mut(src).and_then(VecDeque::pop_front) {
                    inbox.push_back(next);
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }
        // sources missing from `order` keep their datagrams, at the end
        for (_, rest) in by_source {
            inbox.extend(rest);
        }
    }

    /// Every later receive on `addr` fails.
    pub fn break_socket(&mut self, addr: SocketAddr) {
        self.broken.insert(addr);
    }
}

#[derive(Debug, Clone)]
pub struct MemorySocket {
    addr: SocketAddr,
    network: SharedNetwork,
}

impl MemorySocket {
    pub fn new(network: &SharedNetwork, addr: SocketAddr) -> Self {
        Self {
            addr,
            network: network.clone(),
        }
    }
}

impl DatagramSocket for MemorySocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut network = self.network.borrow_mut();
        if network.broken.contains(&self.addr) {
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "socket broken"));
        }
        let Some((from, datagram)) = network
            .inboxes
            .get_mut(&self.addr)
            .and_then(VecDeque::pop_front)
        else {
            return Err(io::ErrorKind::WouldBlock.into());
        };
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok((len, from))
    }

    fn try_send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        let mut network = self.network.borrow_mut();
        network.sent.push((self.addr, dst, buf.to_vec()));
        network.inject(self.addr, dst, buf.to_vec());
        Ok(buf.len())
    }
}

/// A reactor that records what the bridge asked for.
#[derive(Debug, Default)]
pub struct RecordingReactor {
    pub registered: Vec<Token>,
    pub enabled: usize,
    pub disabled: usize,
    pub writing: bool,
    pub timers: HashMap<Signpost, Duration>,
    pub scheduled: usize,
    pub cancelled: usize,
}

impl Reactor for RecordingReactor {
    fn register_read(&mut self, token: Token) {
        self.registered.push(token);
    }

    fn enable_write(&mut self, _: Token) {
        assert!(!self.writing, "write interest enabled twice");
        self.enabled += 1;
        self.writing = true;
    }

    fn disable_write(&mut self, _: Token) {
        assert!(self.writing, "write interest disabled twice");
        self.disabled += 1;
        self.writing = false;
    }

    fn schedule_timeout(&mut self, signpost: &Signpost, after: Duration) {
        self.scheduled += 1;
        self.timers.insert(*signpost, after);
    }

    fn cancel_timeout(&mut self, signpost: &Signpost) {
        if self.timers.remove(signpost).is_some() {
            self.cancelled += 1;
        }
    }
}

/// What a [`Recorder`] saw.
#[derive(Debug, Default)]
pub struct Log {
    pub connected: usize,
    pub opened: Vec<u64>,
    pub data: Vec<(u64, Bytes)>,
    pub errors: Vec<(Option<u64>, ErrorKind)>,
    pub closed: Vec<CloseReason>,
}

impl Log {
    /// Every byte received on `stream`, in order.
    pub fn received(&self, stream: u64) -> Vec<u8> {
        self.data
            .iter()
            .filter(|(id, _)| *id == stream)
            .flat_map(|(_, data)| data.iter().copied())
            .collect()
    }

    pub fn all_received(&self) -> Vec<u8> {
        self.data
            .iter()
            .flat_map(|(_, data)| data.iter().copied())
            .collect()
    }
}

pub type SharedLog = Rc<RefCell<Log>>;

#[derive(Debug, Default)]
pub struct Recorder {
    pub log: SharedLog,
    /// Write every received chunk back on its stream.
    pub echo: bool,
    /// Applied to every stream the peer opens.
    pub policy: Option<ReceivePolicy>,
}

impl Recorder {
    pub fn new(log: &SharedLog) -> Self {
        Self {
            log: log.clone(),
            ..Default::default()
        }
    }

    pub fn echo(log: &SharedLog) -> Self {
        Self {
            log: log.clone(),
            echo: true,
            ..Default::default()
        }
    }
}

impl Handler<SimEngine> for Recorder {
    fn on_connected(&mut self, _: &mut ConnIo<'_, SimEngine>) {
        self.log.borrow_mut().connected += 1;
    }

    fn on_stream_opened(&mut self, stream: &mut StreamIo<'_, u64>) {
        self.log.borrow_mut().opened.push(stream.id());
        if let Some(policy) = self.policy {
            stream.configure_read(policy);
        }
    }

    fn on_data(&mut self, stream: &mut StreamIo<'_, u64>, data: Bytes) {
        if self.echo {
            stream.write(&data).unwrap();
            stream.flush();
        }
        self.log.borrow_mut().data.push((stream.id(), data));
    }

    fn on_error(&mut self, stream: Option<u64>, error: &Error) {
        self.log.borrow_mut().errors.push((stream, error.kind()));
    }

    fn on_closed(&mut self, reason: &CloseReason) {
        self.log.borrow_mut().closed.push(reason.clone());
    }
}

pub type SimAcceptor = Acceptor<SimEngine, MemorySocket>;

/// One endpoint on the memory network.
pub struct Node {
    pub acceptor: SimAcceptor,
    pub reactor: RecordingReactor,
    /// The logs of the connections the peers initiated, in accept order.
    pub accepted: Rc<RefCell<Vec<SharedLog>>>,
}

impl Node {
    pub fn new(network: &SharedNetwork, addr: &str, engine: SimEngine) -> Self {
        Self::with_handler(network, addr, engine, Recorder::new)
    }

    /// A node answering every connection with an echo handler.
    pub fn echo_server(network: &SharedNetwork, addr: &str) -> Self {
        Self::with_handler(network, addr, SimEngine::default(), Recorder::echo)
    }

    pub fn with_handler(
        network: &SharedNetwork,
        addr: &str,
        engine: SimEngine,
        handler: fn(&SharedLog) -> Recorder,
    ) -> Self {
        Self::with_config(network, addr, engine, AcceptorConfig::default(), handler)
    }

    pub fn with_config(
        network: &SharedNetwork,
        addr: &str,
        engine: SimEngine,
        config: AcceptorConfig,
        handler: fn(&SharedLog) -> Recorder,
    ) -> Self {
        let addr: SocketAddr = addr.parse().unwrap();
        let socket = MemorySocket::new(network, addr);
        let accepted = Rc::new(RefCell::new(Vec::new()));
        let logs = accepted.clone();
        let mut acceptor = Acceptor::new(config, engine, socket, Token(0), move |_: &Signpost, _| {
            let log = SharedLog::default();
            logs.borrow_mut().push(log.clone());
            Box::new(handler(&log)) as Box<dyn Handler<SimEngine>>
        });
        let mut reactor = RecordingReactor::default();
        acceptor.register(&mut reactor);
        Self {
            acceptor,
            reactor,
            accepted,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.acceptor.local_addr().unwrap()
    }

    /// Connect to `server`, the returned log belongs to the new connection.
    pub fn connect(&mut self, server: SocketAddr) -> (Signpost, SharedLog) {
        let log = SharedLog::default();
        let handler = Box::new(Recorder::new(&log));
        let signpost = self
            .acceptor
            .connect(server, "localhost", handler, &mut self.reactor)
            .unwrap();
        (signpost, log)
    }

    pub fn accepted_log(&self, index: usize) -> SharedLog {
        self.accepted.borrow()[index].clone()
    }

    /// Fire the timers that are due right away.
    pub fn fire_due_timers(&mut self) -> usize {
        let due = self
            .reactor
            .timers
            .iter()
            .filter(|(_, after)| after.is_zero())
            .map(|(signpost, _)| *signpost)
            .collect::<Vec<_>>();
        for signpost in &due {
            self.reactor.timers.remove(signpost);
            self.acceptor.on_timeout(signpost, &mut self.reactor);
        }
        due.len()
    }

    /// Handle whatever is ready, returns whether anything happened.
    pub fn step(&mut self) -> bool {
        let mut busy = false;
        if self.reactor.writing {
            self.acceptor.on_writable(&mut self.reactor);
            busy = true;
        }
        if self.acceptor.on_readable(&mut self.reactor).unwrap() > 0 {
            busy = true;
        }
        if self.fire_due_timers() > 0 {
            busy = true;
        }
        busy
    }
}

/// Step every node until nothing moves anymore.
pub fn settle(network: &SharedNetwork, nodes: &mut [&mut Node]) {
    for _ in 0..10_000 {
        let mut busy = false;
        for node in nodes.iter_mut() {
            busy |= node.step();
        }
        if !busy && network.borrow().is_idle() {
            return;
        }
    }
    panic!("the network did not settle");
}

/// A connected client and an echo server.
pub fn echo_pair(network: &SharedNetwork) -> (Node, Node, Signpost, SharedLog) {
    init_tracing();
    let mut server = Node::echo_server(network, "10.0.0.1:4433");
    let mut client = Node::new(network, "10.0.0.2:50000", SimEngine::default());
    let (signpost, log) = client.connect(server.addr());
    settle(network, &mut [&mut server, &mut client]);
    assert_eq!(log.borrow().connected, 1);
    (server, client, signpost, log)
}
