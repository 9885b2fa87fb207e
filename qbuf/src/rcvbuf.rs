use bytes::{Buf, Bytes, BytesMut};

use crate::policy::ReceivePolicy;

/// The receiving buffer of a stream transport.
///
/// Bytes are copied into a contiguous region sized by the configured
/// [`ReceivePolicy`], at the `collected` offset. Once `collected` reaches the
/// policy's threshold the read is deliverable. [`RecvBuf::take`] hands out the
/// collected bytes and rearms the buffer for the next read.
///
/// Bytes that arrive while the region is full are kept in a backlog, in
/// arrival order, and moved into the region when it is rearmed. Nothing the
/// engine delivered is ever dropped here.
///
/// Invariants:
/// - `collected <= capacity()`
/// - `should_deliver() == (collected >= threshold)`
///
/// ``` rust
/// # use qbuf::{RecvBuf, ReceivePolicy};
/// let mut rcvbuf = RecvBuf::new(ReceivePolicy::exactly(4));
/// rcvbuf.ingest(b"hel");
/// assert!(!rcvbuf.should_deliver());
/// rcvbuf.ingest(b"lo!");
/// assert!(rcvbuf.should_deliver());
/// assert_eq!(rcvbuf.take(), &b"hell"[..]);
/// // rearmed, the overflow moved in
/// assert_eq!(rcvbuf.collected(), 2);
/// ```
#[derive(Debug)]
pub struct RecvBuf {
    policy: ReceivePolicy,
    buf: Vec<u8>,
    collected: usize,
    threshold: usize,
    backlog: BytesMut,
}

impl Default for RecvBuf {
    fn default() -> Self {
        Self::new(ReceivePolicy::default())
    }
}

impl RecvBuf {
    pub fn new(policy: ReceivePolicy) -> Self {
        let mut rcvbuf = Self {
            policy,
            buf: Vec::new(),
            collected: 0,
            threshold: 0,
            backlog: BytesMut::new(),
        };
        rcvbuf.apply_policy();
        rcvbuf
    }

    pub fn policy(&self) -> ReceivePolicy {
        self.policy
    }

    /// Install a new policy and recompute the threshold and buffer size.
    ///
    /// If the new buffer is smaller than what has been collected, the excess
    /// moves to the front of the backlog.
    pub fn configure(&mut self, policy: ReceivePolicy) {
        self.policy = policy;
        let size = policy.buffer_size();
        if self.collected > size {
            let mut backlog = BytesMut::with_capacity(self.collected - size + self.backlog.len());
            backlog.extend_from_slice(&self.buf[size..self.collected]);
            backlog.extend_from_slice(&self.backlog);
            self.backlog = backlog;
            self.collected = size;
        }
        self.apply_policy();
        self.refill();
    }

    fn apply_policy(&mut self) {
        let size = self.policy.buffer_size();
        // only reallocate when the size really changes
        if self.buf.len() != size {
            self.buf.resize(size, 0);
        }
        self.threshold = self.policy.threshold();
    }

    /// Copy a span delivered by the engine into the buffer.
    ///
    /// Returns how many bytes landed in the buffer directly, the rest is
    /// queued in the backlog.
    pub fn ingest(&mut self, data: &[u8]) -> usize {
        if !self.backlog.is_empty() {
            self.backlog.extend_from_slice(data);
            return 0;
        }
        let n = data.len().min(self.buf.len() - self.collected);
        self.buf[self.collected..self.collected + n].copy_from_slice(&data[..n]);
        self.collected += n;
        if n < data.len() {
            self.backlog.extend_from_slice(&data[n..]);
        }
        n
    }

    pub fn should_deliver(&self) -> bool {
        self.collected >= self.threshold
    }

    /// Hand out the collected bytes and rearm the buffer.
    pub fn take(&mut self) -> Bytes {
        let data = Bytes::copy_from_slice(&self.buf[..self.collected]);
        self.prepare_next_read();
        data
    }

    /// Reset `collected`, re-apply the policy's sizing and refill from the
    /// backlog.
    pub fn prepare_next_read(&mut self) {
        self.collected = 0;
        self.apply_policy();
        self.refill();
    }

    fn refill(&mut self) {
        let n = self.backlog.len().min(self.buf.len() - self.collected);
        if n > 0 {
            self.buf[self.collected..self.collected + n].copy_from_slice(&self.backlog[..n]);
            self.backlog.advance(n);
            self.collected += n;
        }
    }

    pub fn collected(&self) -> usize {
        self.collected
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// The size of the collecting region.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes waiting for the next rearm.
    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collected == 0 && self.backlog.is_empty()
    }
}
