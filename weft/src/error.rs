use core::fmt;
use weft_context::ContextError;

/// Errors surfaced by the runtime's fallible operations.
///
/// Internal soft failures — CAS retries, empty steals, an MPSC queue whose
/// producer has not stitched its node yet — are always retried locally and
/// never reach this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Null or malformed input (zero-capacity channel, bad config value).
    InvalidArgument,
    /// Allocation of a fiber, stack or queue node failed.
    OutOfMemory,
    /// A non-blocking try-variant found the primitive unavailable.
    WouldBlock,
    /// An event wait was terminated because the descriptor was closed.
    DescriptorClosed,
    /// The operation does not fit the object's current state: joining a
    /// detached or recycled fiber, waiting on a condvar with a different
    /// mutex than before, shutting a runtime down twice.
    InvalidState,
    /// A fiber operation was attempted on a thread that no runtime has
    /// claimed as a worker.
    NotARuntimeThread,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => f.write_str("invalid argument"),
            Error::OutOfMemory => f.write_str("memory allocation failed"),
            Error::WouldBlock => f.write_str("operation would block"),
            Error::DescriptorClosed => f.write_str("file descriptor closed while waiting"),
            Error::InvalidState => f.write_str("operation invalid in the current state"),
            Error::NotARuntimeThread => f.write_str("current thread is not a runtime worker"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ContextError> for Error {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::OutOfMemory => Error::OutOfMemory,
            ContextError::InvalidArgument => Error::InvalidArgument,
        }
    }
}
