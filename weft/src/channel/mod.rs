//! Fiber channels and the work queue.
//!
//! - [`BoundedChannel`] — power-of-two ring, many senders, one receiver;
//!   senders spin-yield on full, the receiver blocks on the channel's
//!   optional [`Signal`](crate::sync::Signal).
//! - [`UnboundedChannel`] — MPSC-FIFO-backed, many senders, one receiver;
//!   strict global FIFO over completed sends, allocation-free with
//!   caller-owned [`Node`]s.
//! - [`SpChannel`] — the single-producer flavour, strict FIFO, wait-free
//!   on both ends.
//! - [`MultiChannel`] — mutex-guarded ring allowing many senders *and*
//!   many receivers.
//! - [`WorkQueue`] — elects the first producer of a burst as the sole
//!   worker that drains it.
//! - [`Selector`] — round-robin receive over several channels sharing one
//!   signal.

mod bounded;
mod multi;
mod selector;
mod unbounded;
mod work_queue;

pub use bounded::BoundedChannel;
pub use multi::MultiChannel;
pub use selector::{Select, Selector};
pub use unbounded::{SpChannel, UnboundedChannel};
pub use work_queue::{GetWork, Push, WorkQueue};

/// Caller-allocatable message node for the unbounded channels.
pub use weft_lockfree::Node;
