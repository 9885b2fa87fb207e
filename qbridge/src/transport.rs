use bytes::Bytes;
use qbuf::{Drain, ReceivePolicy, RecvBuf, WriteQueue};

use crate::{
    engine::Engine,
    error::Error,
    reactor::{Registration, StreamKey},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Nothing collected.
    Idle,
    /// Collecting toward the threshold.
    Reading,
    /// The threshold is met, the consumer has to be handed the bytes.
    Delivering,
    /// The peer finished or reset its sending side.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// Nothing queued.
    Idle,
    /// Bytes queued, not flushed yet.
    Writing,
    /// A drain cycle is running.
    Draining,
    /// The sending side was finished or stopped.
    Closed,
}

/// Byte-stream semantics over one engine stream.
///
/// The read and the write direction run independently. Received bytes are
/// collected in a [`RecvBuf`] until the [`ReceivePolicy`] threshold is met.
/// Written bytes are queued in a [`WriteQueue`] and handed to the engine when
/// the shared socket is writable. The transport never touches the socket, it
/// only reports write-interest edges through the connection's
/// [`Registration`].
#[derive(Debug)]
pub struct StreamTransport<S> {
    key: StreamKey,
    stream: S,
    rcvbuf: RecvBuf,
    sndq: WriteQueue,
    // the engine refused bytes, wait for a writable notification
    blocked: bool,
    // queued before the connection was established
    deferred: bool,
    finishing: bool,
    finished: bool,
    stopped: bool,
    recv_closed: bool,
}

impl<S: Copy> StreamTransport<S> {
    pub fn new(key: StreamKey, stream: S, policy: ReceivePolicy) -> Self {
        Self {
            key,
            stream,
            rcvbuf: RecvBuf::new(policy),
            sndq: WriteQueue::new(),
            blocked: false,
            deferred: false,
            finishing: false,
            finished: false,
            stopped: false,
            recv_closed: false,
        }
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    pub fn stream(&self) -> S {
        self.stream
    }

    pub fn policy(&self) -> ReceivePolicy {
        self.rcvbuf.policy()
    }

    pub fn configure_read(&mut self, policy: ReceivePolicy) {
        self.rcvbuf.configure(policy);
    }

    /// Copy bytes the engine delivered for this stream into the receive
    /// buffer.
    pub fn ingest(&mut self, data: &[u8]) {
        if self.recv_closed {
            tracing::debug!(key = %self.key, len = data.len(), "data after the receive side closed");
            return;
        }
        self.rcvbuf.ingest(data);
    }

    /// Whether a satisfied read is waiting for the consumer.
    ///
    /// A read that collected nothing is never delivered, so `Exactly(0)`
    /// pauses delivery instead of handing out empty reads.
    pub fn should_deliver(&self) -> bool {
        self.rcvbuf.collected() > 0 && self.rcvbuf.should_deliver()
    }

    /// Take a satisfied read and rearm the buffer.
    pub fn deliver(&mut self) -> Option<Bytes> {
        self.should_deliver().then(|| self.rcvbuf.take())
    }

    /// The peer finished its side: hand out whatever was collected even if
    /// the threshold is not met.
    pub fn deliver_tail(&mut self) -> Option<Bytes> {
        (self.rcvbuf.collected() > 0).then(|| self.rcvbuf.take())
    }

    pub fn prepare_next_read(&mut self) {
        self.rcvbuf.prepare_next_read();
    }

    pub fn close_read(&mut self) {
        self.recv_closed = true;
    }

    pub fn read_state(&self) -> ReadState {
        if self.recv_closed && self.rcvbuf.is_empty() {
            ReadState::Closed
        } else if self.should_deliver() {
            ReadState::Delivering
        } else if self.rcvbuf.collected() > 0 {
            ReadState::Reading
        } else {
            ReadState::Idle
        }
    }

    /// Append bytes to the write queue, returns how many were queued.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        if self.finishing || self.stopped {
            return Err(Error::Closed);
        }
        Ok(self.sndq.append(data))
    }

    /// Start draining the queued bytes.
    ///
    /// Returns `true` if this flush enabled write interest on the shared
    /// socket. Flushing a queue that is already draining, or an empty one,
    /// changes nothing.
    pub fn flush(&mut self, reg: &mut Registration<'_>) -> bool {
        if !self.sndq.flush() {
            return false;
        }
        if self.blocked {
            return false;
        }
        reg.start_writing(self.key)
    }

    /// End the sending side once everything queued has been handed over.
    pub fn finish(&mut self, reg: &mut Registration<'_>) {
        if self.finishing || self.stopped {
            return;
        }
        self.finishing = true;
        self.sndq.flush();
        if !self.blocked {
            reg.start_writing(self.key);
        }
    }

    /// Hand queued bytes to the engine, called when the shared socket is
    /// writable. Returns the number of bytes the engine accepted.
    ///
    /// Nothing is handed over before the connection is established, the
    /// queue is kept and write interest dropped until [`Self::resume`].
    pub fn write_some<E>(
        &mut self,
        engine: &mut E,
        conn: &mut E::Conn,
        connected: bool,
        reg: &mut Registration<'_>,
    ) -> Result<usize, Error>
    where
        E: Engine<Stream = S>,
    {
        if !connected {
            if !self.sndq.is_empty() || self.finishing {
                self.deferred = true;
            }
            reg.stop_writing(&self.key);
            return Ok(0);
        }
        if self.blocked {
            reg.stop_writing(&self.key);
            return Ok(0);
        }
        if !self.sndq.is_draining() {
            self.finish_if_drained(engine, conn)?;
            reg.stop_writing(&self.key);
            return Ok(0);
        }

        let stream = self.stream;
        let mut total = 0;
        loop {
            let chunk = self.sndq.begin_drain();
            if !chunk.is_empty() {
                let len = chunk.len();
                let accepted = engine
                    .send_stream(conn, stream, chunk)
                    .map_err(Error::Write)?;
                self.sndq.advance(accepted.min(len));
                total += accepted;
                if accepted == 0 {
                    tracing::trace!(key = %self.key, "engine refused stream bytes");
                    self.blocked = true;
                    reg.stop_writing(&self.key);
                    break;
                }
            }
            if !self.sndq.is_drained() {
                continue;
            }
            match self.sndq.complete_drain() {
                Drain::Continue => continue,
                Drain::Idle => {
                    reg.stop_writing(&self.key);
                    self.finish_if_drained(engine, conn)?;
                    break;
                }
            }
        }
        Ok(total)
    }

    fn finish_if_drained<E>(&mut self, engine: &mut E, conn: &mut E::Conn) -> Result<(), Error>
    where
        E: Engine<Stream = S>,
    {
        if self.finishing && !self.finished && self.sndq.is_empty() {
            engine
                .finish_stream(conn, self.stream)
                .map_err(Error::Write)?;
            self.finished = true;
            tracing::trace!(key = %self.key, "stream finished");
        }
        Ok(())
    }

    /// The engine takes bytes again, or the connection got established.
    pub fn resume(&mut self, reg: &mut Registration<'_>) {
        self.blocked = false;
        self.deferred = false;
        if self.sndq.is_draining() || (self.finishing && !self.finished) {
            reg.start_writing(self.key);
        }
    }

    /// The peer does not want more bytes, drop the queue.
    pub fn stop_sending(&mut self, reg: &mut Registration<'_>) {
        self.stopped = true;
        self.sndq.clear();
        reg.stop_writing(&self.key);
    }

    /// Drop all state, the stream is about to be removed.
    pub fn teardown(&mut self, reg: &mut Registration<'_>) {
        self.sndq.clear();
        self.rcvbuf.prepare_next_read();
        self.recv_closed = true;
        self.stopped = true;
        reg.stop_writing(&self.key);
    }

    pub fn write_state(&self) -> WriteState {
        if self.finished || self.stopped {
            WriteState::Closed
        } else if self.sndq.is_draining() {
            WriteState::Draining
        } else if !self.sndq.is_empty() {
            WriteState::Writing
        } else {
            WriteState::Idle
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Bytes queued and not yet accepted by the engine.
    pub fn queued(&self) -> usize {
        self.sndq.len()
    }

    /// Both directions are done, nothing is left to deliver.
    pub fn is_done(&self) -> bool {
        self.write_state() == WriteState::Closed && self.read_state() == ReadState::Closed
    }
}
