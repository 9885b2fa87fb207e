//! The readiness side of the bridge.
//!
//! The reactor owns the event loop and calls back into the
//! [`Acceptor`](crate::acceptor::Acceptor) on socket readability, socket
//! writability and timer expiry. The bridge in turn tells the reactor when it
//! wants to hear about writability, and when each connection's timer is due.

use std::{collections::HashSet, fmt, time::Duration};

use crate::cid::Signpost;

/// The reactor-side handle of the shared socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token(pub usize);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The capabilities a readiness-based event loop offers to the bridge.
pub trait Reactor {
    /// Deliver readable events of `token` to the acceptor.
    fn register_read(&mut self, token: Token);

    /// Start delivering writable events of `token`.
    fn enable_write(&mut self, token: Token);

    /// Stop delivering writable events of `token`.
    fn disable_write(&mut self, token: Token);

    /// Arm the timer of one connection, replacing any armed one.
    fn schedule_timeout(&mut self, signpost: &Signpost, after: Duration);

    /// Disarm the timer of one connection.
    fn cancel_timeout(&mut self, signpost: &Signpost) {
        let _ = signpost;
    }
}

impl<R: Reactor + ?Sized> Reactor for &mut R {
    fn register_read(&mut self, token: Token) {
        (**self).register_read(token)
    }

    fn enable_write(&mut self, token: Token) {
        (**self).enable_write(token)
    }

    fn disable_write(&mut self, token: Token) {
        (**self).disable_write(token)
    }

    fn schedule_timeout(&mut self, signpost: &Signpost, after: Duration) {
        (**self).schedule_timeout(signpost, after)
    }

    fn cancel_timeout(&mut self, signpost: &Signpost) {
        (**self).cancel_timeout(signpost)
    }
}

/// Identifies one stream transport among every stream of every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub signpost: Signpost,
    pub slot: u64,
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.signpost, self.slot)
    }
}

/// Write interest of the one shared socket.
///
/// Every stream that has bytes to drain joins the writer set, as does every
/// connection whose engine still holds framed datagrams after a pump. The
/// reactor is asked to enable write interest when the first entry joins
/// either set, and to disable it when the last one leaves, never in between.
#[derive(Debug, Default)]
pub struct WriteInterest {
    token: Token,
    writers: HashSet<StreamKey>,
    backlog: HashSet<Signpost>,
}

impl WriteInterest {
    pub fn new(token: Token) -> Self {
        Self {
            token,
            writers: HashSet::new(),
            backlog: HashSet::new(),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Whether write interest is enabled on the reactor.
    pub fn is_enabled(&self) -> bool {
        !self.writers.is_empty() || !self.backlog.is_empty()
    }

    pub fn is_writing(&self, key: &StreamKey) -> bool {
        self.writers.contains(key)
    }

    pub fn writers(&self) -> impl Iterator<Item = &StreamKey> {
        self.writers.iter()
    }

    /// Whether the engine still holds datagrams of `signpost`.
    pub fn is_backlogged(&self, signpost: &Signpost) -> bool {
        self.backlog.contains(signpost)
    }

    /// The connections that have something to send, each one once.
    pub fn connections(&self) -> Vec<Signpost> {
        let mut signposts = Vec::new();
        let streams = self.writers.iter().map(|key| &key.signpost);
        for signpost in streams.chain(self.backlog.iter()) {
            if !signposts.contains(signpost) {
                signposts.push(*signpost);
            }
        }
        signposts
    }

    /// Returns `true` if this call enabled write interest.
    pub fn start(&mut self, key: StreamKey, reactor: &mut dyn Reactor) -> bool {
        let was_enabled = self.is_enabled();
        self.writers.insert(key);
        self.enabled_edge(was_enabled, reactor)
    }

    /// Returns `true` if this call disabled write interest.
    pub fn stop(&mut self, key: &StreamKey, reactor: &mut dyn Reactor) -> bool {
        let was_enabled = self.is_enabled();
        self.writers.remove(key);
        self.disabled_edge(was_enabled, reactor)
    }

    /// The pump of `signpost` left datagrams inside the engine.
    pub fn start_backlog(&mut self, signpost: Signpost, reactor: &mut dyn Reactor) -> bool {
        let was_enabled = self.is_enabled();
        self.backlog.insert(signpost);
        self.enabled_edge(was_enabled, reactor)
    }

    /// Every datagram of `signpost` left the engine.
    pub fn stop_backlog(&mut self, signpost: &Signpost, reactor: &mut dyn Reactor) -> bool {
        let was_enabled = self.is_enabled();
        self.backlog.remove(signpost);
        self.disabled_edge(was_enabled, reactor)
    }

    /// Drop every writer of one connection.
    pub fn stop_connection(&mut self, signpost: &Signpost, reactor: &mut dyn Reactor) {
        let was_enabled = self.is_enabled();
        self.writers.retain(|key| key.signpost != *signpost);
        self.backlog.remove(signpost);
        self.disabled_edge(was_enabled, reactor);
    }

    /// Forget every writer without telling the reactor.
    pub fn clear(&mut self) {
        self.writers.clear();
        self.backlog.clear();
    }

    fn enabled_edge(&self, was_enabled: bool, reactor: &mut dyn Reactor) -> bool {
        if was_enabled || !self.is_enabled() {
            return false;
        }
        tracing::trace!(token = %self.token, "enable write interest");
        reactor.enable_write(self.token);
        true
    }

    fn disabled_edge(&self, was_enabled: bool, reactor: &mut dyn Reactor) -> bool {
        if !was_enabled || self.is_enabled() {
            return false;
        }
        tracing::trace!(token = %self.token, "disable write interest");
        reactor.disable_write(self.token);
        true
    }
}

/// The write interest of the shared socket, borrowed together with the
/// reactor it reports to.
///
/// Handed down to stream transports so they can signal readiness edges
/// without owning either.
pub struct Registration<'a> {
    interest: &'a mut WriteInterest,
    reactor: &'a mut dyn Reactor,
}

impl<'a> Registration<'a> {
    pub fn new(interest: &'a mut WriteInterest, reactor: &'a mut dyn Reactor) -> Self {
        Self { interest, reactor }
    }

    pub fn start_writing(&mut self, key: StreamKey) -> bool {
        self.interest.start(key, &mut *self.reactor)
    }

    pub fn stop_writing(&mut self, key: &StreamKey) -> bool {
        self.interest.stop(key, &mut *self.reactor)
    }

    pub fn is_writing(&self, key: &StreamKey) -> bool {
        self.interest.is_writing(key)
    }

    pub fn reactor(&mut self) -> &mut dyn Reactor {
        &mut *self.reactor
    }

    /// Reborrow for a shorter scope.
    pub fn reborrow(&mut self) -> Registration<'_> {
        Registration {
            interest: &mut *self.interest,
            reactor: &mut *self.reactor,
        }
    }
}
