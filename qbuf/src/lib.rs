//! Buffers owned by one stream transport.
//!
//! - [`ReceivePolicy`] says how many bytes a read must collect before it is delivered.
//! - [`RecvBuf`] collects bytes under a policy and hands them out once the threshold is met.
//! - [`WriteQueue`] is the double-buffered (active/pending) queue of outgoing bytes.
//!
//! None of these types perform I/O. They only tell the caller when to deliver
//! and when write interest should be turned on or off.

pub mod policy;
pub mod queue;
pub mod rcvbuf;

pub use policy::{ReceiveFlag, ReceivePolicy};
pub use queue::{Drain, WriteQueue};
pub use rcvbuf::RecvBuf;
