//! An M:N stackful fiber runtime.
//!
//! Many lightweight fibers run over a small pool of OS worker threads.
//! Suspension is always voluntary — an explicit [`yield_now`], a wait on
//! a [`sync`] primitive or [`channel`], a [`sleep`](event::sleep), or
//! fiber-aware [`io`] that would block — and is converted into a
//! cooperative context switch; when a worker runs out of runnable fibers
//! it steals from its peers, and when the whole pool is idle it parks in
//! the event bridge.
//!
//! ```no_run
//! let rt = weft::Runtime::start(weft::Config::default()).unwrap();
//!
//! let handle = weft::spawn(|| {
//!     weft::yield_now();
//!     42
//! });
//! assert_eq!(handle.join().unwrap(), 42);
//!
//! rt.shutdown();
//! ```
//!
//! ## Blocking without blocking
//!
//! Every "blocking" operation here parks the calling *fiber*: the worker
//! thread switches to the next runnable fiber, and the parked one is
//! rescheduled — possibly on a different worker — once woken. The only
//! spins are short, bounded handshakes (see [`Stats`]).

mod config;
mod error;
mod fiber;
mod runtime;
mod scheduler;
mod stats;
mod worker;

pub mod channel;
pub mod event;
pub mod io;
pub mod sync;

pub use crate::config::{Config, DEFAULT_STACK_SIZE, DEFAULT_TICK};
pub use crate::error::Error;
pub use crate::event::sleep;
pub use crate::fiber::{Builder, JoinHandle, spawn, yield_now};
pub use crate::runtime::Runtime;
pub use crate::stats::Stats;
pub use weft_context::StackKind;
