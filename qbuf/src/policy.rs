/// How a read collects bytes before it is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiveFlag {
    /// Deliver exactly `size` bytes.
    Exactly,
    /// Deliver as soon as any byte arrived, up to `size` bytes.
    AtMost,
    /// Deliver once at least `size` bytes arrived, with some slack above it.
    AtLeast,
}

/// A receive policy, the pair of a [`ReceiveFlag`] and a size.
///
/// The policy derives two numbers: the delivery threshold and the size of
/// the buffer the bytes are collected into.
///
/// ``` rust
/// # use qbuf::ReceivePolicy;
/// let policy = ReceivePolicy::at_least(1000);
/// assert_eq!(policy.threshold(), 1000);
/// assert_eq!(policy.buffer_size(), 1100);
///
/// let policy = ReceivePolicy::at_most(1024);
/// assert_eq!(policy.threshold(), 1);
/// assert_eq!(policy.buffer_size(), 1024);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceivePolicy {
    flag: ReceiveFlag,
    size: usize,
}

/// Minimum slack added on top of an [`ReceiveFlag::AtLeast`] size.
pub const AT_LEAST_MIN_SLACK: usize = 100;

impl ReceivePolicy {
    pub fn new(flag: ReceiveFlag, size: usize) -> Self {
        Self { flag, size }
    }

    /// Deliver reads of exactly `size` bytes.
    ///
    /// `exactly(0)` is satisfied by an empty buffer, but a stream transport
    /// never hands out empty reads: delivery pauses until the consumer picks
    /// another policy.
    pub fn exactly(size: usize) -> Self {
        Self::new(ReceiveFlag::Exactly, size)
    }

    pub fn at_most(size: usize) -> Self {
        Self::new(ReceiveFlag::AtMost, size)
    }

    pub fn at_least(size: usize) -> Self {
        Self::new(ReceiveFlag::AtLeast, size)
    }

    pub fn flag(&self) -> ReceiveFlag {
        self.flag
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The number of collected bytes at which the read is deliverable.
    pub fn threshold(&self) -> usize {
        match self.flag {
            ReceiveFlag::Exactly | ReceiveFlag::AtLeast => self.size,
            ReceiveFlag::AtMost => 1,
        }
    }

    /// The size the receive buffer is resized to under this policy.
    ///
    /// `AtLeast(n)` reads up to 10% more, but allows at least
    /// [`AT_LEAST_MIN_SLACK`] bytes more.
    pub fn buffer_size(&self) -> usize {
        match self.flag {
            ReceiveFlag::Exactly | ReceiveFlag::AtMost => self.size,
            ReceiveFlag::AtLeast => self.size + AT_LEAST_MIN_SLACK.max(self.size / 10),
        }
    }
}

impl Default for ReceivePolicy {
    fn default() -> Self {
        Self::at_most(1024)
    }
}
