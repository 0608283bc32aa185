//! Fiber-blocking synchronisation primitives.
//!
//! Everything here suspends *fibers*, not OS threads: a blocked fiber
//! yields its worker to other fibers and is woken through the runtime's
//! wait queues. The fast paths are single atomic operations; the slow
//! paths park through the worker's maintenance protocol.

pub(crate) mod mutex;
pub(crate) mod spinlock;

mod barrier;
mod condvar;
mod rwlock;
mod semaphore;
mod signal;

pub use barrier::{Barrier, BarrierWaitResult};
pub use condvar::Condvar;
pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::Semaphore;
pub use signal::{MultiSignal, Signal};
pub use spinlock::{SpinLock, SpinLockGuard};
