use std::collections::VecDeque;

use bytes::BytesMut;

/// What happened when the active buffer was fully drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// The pending buffer was swapped in, keep writing.
    Continue,
    /// Nothing left, the queue is idle and write interest can be dropped.
    Idle,
}

/// Double-buffered queue of outgoing bytes of one stream.
///
/// While the queue is idle, appended bytes go to the `active` buffer. Once a
/// drain cycle started, `active` is frozen and new bytes are staged in
/// `pending`. When `active` has been handed out completely,
/// [`WriteQueue::complete_drain`] swaps `pending` in. Every appended byte leaves
/// the queue exactly once, in append order.
///
/// The queue only tells the caller about readiness edges: [`WriteQueue::flush`]
/// returns `true` when write interest should be enabled, and
/// [`WriteQueue::complete_drain`] returns [`Drain::Idle`] when it should be
/// disabled.
///
/// ``` rust
/// # use qbuf::{Drain, WriteQueue};
/// let mut queue = WriteQueue::default();
/// queue.append(b"C");
/// assert!(queue.flush());
/// // C is being drained, A and B are staged
/// queue.append(b"A");
/// queue.append(b"B");
/// assert_eq!(queue.begin_drain(), b"C");
/// queue.advance(1);
/// assert_eq!(queue.complete_drain(), Drain::Continue);
/// assert_eq!(queue.begin_drain(), b"AB");
/// ```
#[derive(Debug, Default)]
pub struct WriteQueue {
    active: BytesMut,
    pending: BytesMut,
    // lengths of the logical writes concatenated in `active` / `pending`
    active_marks: VecDeque<usize>,
    pending_marks: VecDeque<usize>,
    // bytes of `active` already accepted by the consumer of the drain
    written: usize,
    // offset into the front mark
    mark_offset: usize,
    draining: bool,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one logical write, return the number of bytes queued.
    pub fn append(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        if self.draining {
            self.pending.extend_from_slice(data);
            self.pending_marks.push_back(data.len());
        } else {
            self.active.extend_from_slice(data);
            self.active_marks.push_back(data.len());
        }
        data.len()
    }

    /// Start a drain cycle if the queue is idle and holds data.
    ///
    /// Returns `true` only on the idle to draining edge, which is when the
    /// caller has to enable write interest.
    pub fn flush(&mut self) -> bool {
        if self.draining || self.is_empty() {
            return false;
        }
        if self.active.is_empty() {
            self.swap_pending();
        }
        self.draining = true;
        true
    }

    /// The bytes of the active buffer that have not been accepted yet.
    ///
    /// Marks the queue as draining.
    pub fn begin_drain(&mut self) -> &[u8] {
        self.draining = true;
        &self.active[self.written..]
    }

    /// Account `n` bytes of the active buffer as accepted.
    ///
    /// Returns how many logical writes were fully accepted by this call.
    pub fn advance(&mut self, n: usize) -> usize {
        debug_assert!(
            self.written + n <= self.active.len(),
            "advance({n}) beyond the active buffer"
        );
        let n = n.min(self.active.len() - self.written);
        self.written += n;

        let mut completed = 0;
        let mut left = n;
        while let Some(&mark) = self.active_marks.front() {
            let remain = mark - self.mark_offset;
            if left < remain {
                self.mark_offset += left;
                break;
            }
            left -= remain;
            self.mark_offset = 0;
            self.active_marks.pop_front();
            completed += 1;
        }
        completed
    }

    /// Whether the active buffer has been handed out completely.
    pub fn is_drained(&self) -> bool {
        self.written == self.active.len()
    }

    /// Finish the current drain cycle.
    ///
    /// The active buffer is cleared. If bytes were staged meanwhile they
    /// become the new active buffer and the cycle continues, otherwise the
    /// queue goes idle.
    pub fn complete_drain(&mut self) -> Drain {
        self.active.clear();
        self.active_marks.clear();
        self.written = 0;
        self.mark_offset = 0;
        if self.pending.is_empty() {
            self.draining = false;
            Drain::Idle
        } else {
            self.swap_pending();
            Drain::Continue
        }
    }

    fn swap_pending(&mut self) {
        std::mem::swap(&mut self.active, &mut self.pending);
        std::mem::swap(&mut self.active_marks, &mut self.pending_marks);
        self.pending.clear();
        self.pending_marks.clear();
    }

    /// Drop everything queued and go idle.
    ///
    /// Returns `true` if the queue was draining, the caller then has to drop
    /// write interest.
    pub fn clear(&mut self) -> bool {
        let was_draining = self.draining;
        self.active.clear();
        self.pending.clear();
        self.active_marks.clear();
        self.pending_marks.clear();
        self.written = 0;
        self.mark_offset = 0;
        self.draining = false;
        was_draining
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Bytes of the active buffer already accepted in this cycle.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Size of the active buffer, the bytes of the current cycle.
    pub fn size(&self) -> usize {
        self.active.len()
    }

    /// Bytes not yet accepted, over both buffers.
    pub fn len(&self) -> usize {
        self.active.len() - self.written + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logical writes not yet fully accepted.
    pub fn queued_writes(&self) -> usize {
        self.active_marks.len() + self.pending_marks.len()
    }
}
