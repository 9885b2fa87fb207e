//! A ready-made reactor on top of tokio.
//!
//! [`TimerReactor`] keeps the write-interest flag and one deadline per
//! connection, [`run`] waits on whatever is due and calls back into the
//! [`Acceptor`].

use std::{collections::HashMap, convert::Infallible, time::Duration};

use qsock::UdpSocketController;
use tokio::time::Instant;

use crate::{
    acceptor::Acceptor,
    cid::Signpost,
    engine::Engine,
    error::Error,
    reactor::{Reactor, Token},
};

#[derive(Debug, Default)]
pub struct TimerReactor {
    registered: Option<Token>,
    writing: bool,
    timers: HashMap<Signpost, Instant>,
}

impl TimerReactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.is_some()
    }

    pub fn wants_write(&self) -> bool {
        self.writing
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().min().copied()
    }

    /// Remove and return the timers that expired at `now`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Signpost> {
        let expired = self
            .timers
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(signpost, _)| *signpost)
            .collect::<Vec<_>>();
        for signpost in &expired {
            self.timers.remove(signpost);
        }
        expired
    }
}

impl Reactor for TimerReactor {
    fn register_read(&mut self, token: Token) {
        self.registered = Some(token);
    }

    fn enable_write(&mut self, _: Token) {
        self.writing = true;
    }

    fn disable_write(&mut self, _: Token) {
        self.writing = false;
    }

    fn schedule_timeout(&mut self, signpost: &Signpost, after: Duration) {
        self.timers.insert(*signpost, Instant::now() + after);
    }

    fn cancel_timeout(&mut self, signpost: &Signpost) {
        self.timers.remove(signpost);
    }
}

/// Drive an acceptor until its socket fails.
///
/// A failed readiness wait closes every connection before the error is
/// returned, the same as a failed receive.
pub async fn run<E: Engine>(
    acceptor: &mut Acceptor<E, UdpSocketController>,
    reactor: &mut TimerReactor,
) -> Result<Infallible, Error> {
    acceptor.register(reactor);
    loop {
        let deadline = reactor.next_deadline();
        let wants_write = reactor.wants_write();
        tokio::select! {
            ready = acceptor.socket().readable() => {
                if let Err(error) = ready {
                    return Err(acceptor.fail(error, reactor));
                }
                acceptor.on_readable(reactor)?;
            }
            ready = acceptor.socket().writable(), if wants_write => {
                if let Err(error) = ready {
                    return Err(acceptor.fail(error, reactor));
                }
                acceptor.on_writable(reactor);
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                for signpost in reactor.take_expired(Instant::now()) {
                    acceptor.on_timeout(&signpost, reactor);
                }
            }
        }
    }
}
