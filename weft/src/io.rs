//! Fiber-aware I/O.
//!
//! The explicit-adapter rendition of the original's libc interception:
//! instead of hijacking symbols, callers invoke these functions directly.
//! Descriptors created here are switched to `O_NONBLOCK` and marked
//! *fiber-aware* in a per-runtime fd table; when an operation on such a
//! descriptor would block, the calling fiber parks in the event bridge
//! until the descriptor is ready and the operation is retried — the
//! caller sees ordinary blocking semantics, the worker keeps running
//! other fibers.
//!
//! Opt-outs: [`set_nonblocking`] clears a descriptor's fiber-blocking bit
//! (the `fcntl(F_SETFL, O_NONBLOCK)` / `ioctl(FIONBIO)` equivalent), and
//! [`lock_thread`] disables the parking behaviour for the whole calling
//! OS thread.

#![allow(clippy::cast_possible_truncation, reason = "libc interfaces")]

use crate::error::Error;
use crate::event::{self, Interest};
use crate::worker::Worker;
use std::cell::Cell;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};

/// The descriptor wants fiber-blocking semantics.
const FLAG_BLOCKING: u8 = 1;
/// The descriptor can be waited on through the event bridge.
const FLAG_WAITABLE: u8 = 2;

/// Upper bound on the fd table size; descriptors beyond it cannot use the
/// event bridge (the rlimit may be effectively unlimited).
const MAX_TRACKED_FDS: usize = 1 << 16;

/// Per-runtime descriptor table, indexed by fd.
pub(crate) struct FdTable {
    flags: Box<[AtomicU8]>,
}

// === impl FdTable ===

impl FdTable {
    pub(crate) fn new() -> Result<Self, Error> {
        let max_fd = max_open_files()?;
        Ok(Self {
            flags: (0..max_fd).map(|_| AtomicU8::new(0)).collect(),
        })
    }

    fn entry(&self, fd: RawFd) -> Option<&AtomicU8> {
        self.flags.get(usize::try_from(fd).ok()?)
    }

    fn register(&self, fd: RawFd) {
        if let Some(flags) = self.entry(fd) {
            flags.store(FLAG_BLOCKING | FLAG_WAITABLE, Ordering::Release);
        }
    }

    fn deregister(&self, fd: RawFd) {
        if let Some(flags) = self.entry(fd) {
            flags.store(0, Ordering::Release);
        }
    }

    fn clear_blocking(&self, fd: RawFd) {
        if let Some(flags) = self.entry(fd) {
            flags.fetch_and(!FLAG_BLOCKING, Ordering::AcqRel);
        }
    }

    fn is_fiber_blocking(&self, fd: RawFd) -> bool {
        self.entry(fd).is_some_and(|flags| {
            flags.load(Ordering::Acquire) == FLAG_BLOCKING | FLAG_WAITABLE
        })
    }
}

/// The soft open-file limit, clamped to something table-friendly.
pub(crate) fn max_open_files() -> Result<usize, Error> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // Safety: plain getrlimit into owned storage.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(Error::InvalidArgument);
    }
    let limit = usize::try_from(limit.rlim_cur).unwrap_or(MAX_TRACKED_FDS);
    Ok(limit.clamp(1024, MAX_TRACKED_FDS))
}

thread_local! {
    static THREAD_LOCKED: Cell<bool> = const { Cell::new(false) };
}

/// Disables fiber-aware behaviour on the calling OS thread: operations
/// return `EWOULDBLOCK` to the caller instead of parking the fiber.
pub fn lock_thread() {
    THREAD_LOCKED.with(|locked| locked.set(true));
}

/// Re-enables fiber-aware behaviour on the calling OS thread.
pub fn unlock_thread() {
    THREAD_LOCKED.with(|locked| locked.set(false));
}

/// Should an `EWOULDBLOCK` on `fd` park the calling fiber?
fn should_wait(fd: RawFd) -> bool {
    if THREAD_LOCKED.with(Cell::get) {
        return false;
    }
    Worker::try_current().is_some_and(|worker| worker.rt().io.is_fiber_blocking(fd))
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Maps an event-bridge error onto the errno a blocking syscall would
/// have produced for a descriptor closed under it.
fn closed_error(err: Error) -> io::Error {
    debug_assert_eq!(err, Error::DescriptorClosed);
    io::Error::from_raw_os_error(libc::EBADF)
}

/// Runs `op` until it stops returning `EWOULDBLOCK`, parking the fiber on
/// `fd` readiness between attempts.
fn retry<F>(fd: RawFd, interest: Interest, mut op: F) -> io::Result<usize>
where
    F: FnMut() -> libc::ssize_t,
{
    loop {
        let ret = op();
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock && should_wait(fd) {
            event::wait_for_event(fd, interest).map_err(closed_error)?;
            continue;
        }
        return Err(err);
    }
}

/// Marks a freshly created descriptor non-blocking and fiber-aware.
fn adopt(fd: RawFd) -> io::Result<()> {
    // Safety: plain fcntl on an owned fd.
    unsafe {
        let flags = cvt(libc::fcntl(fd, libc::F_GETFL))?;
        cvt(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    if let Some(worker) = Worker::try_current() {
        worker.rt().io.register(fd);
    }
    Ok(())
}

/// Creates a socket with `O_NONBLOCK` and `SO_REUSEADDR` set, marked
/// fiber-aware.
pub fn socket(domain: i32, socket_type: i32, protocol: i32) -> io::Result<RawFd> {
    // Safety: plain socket(2).
    let fd = cvt(unsafe { libc::socket(domain, socket_type, protocol) })?;
    let reuse: libc::c_int = 1;
    // Safety: valid fd and option storage.
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&raw const reuse).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    adopt(fd).inspect_err(|_| close_quiet(fd))?;
    Ok(fd)
}

/// A connected pair of fiber-aware sockets.
pub fn socketpair(domain: i32, socket_type: i32, protocol: i32) -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // Safety: plain socketpair(2) into owned storage.
    cvt(unsafe { libc::socketpair(domain, socket_type, protocol, fds.as_mut_ptr()) })?;
    for fd in fds {
        if let Err(err) = adopt(fd) {
            close_quiet(fds[0]);
            close_quiet(fds[1]);
            return Err(err);
        }
    }
    Ok((fds[0], fds[1]))
}

/// A fiber-aware pipe: `(read_end, write_end)`.
pub fn pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // Safety: plain pipe(2) into owned storage.
    cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    for fd in fds {
        if let Err(err) = adopt(fd) {
            close_quiet(fds[0]);
            close_quiet(fds[1]);
            return Err(err);
        }
    }
    Ok((fds[0], fds[1]))
}

/// Accepts a connection, parking the fiber until one arrives. The
/// accepted socket comes back non-blocking and fiber-aware.
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let accepted = retry(fd, Interest::READ, || {
        // Safety: plain accept(2), peer address discarded.
        (unsafe { libc::accept(fd, ptr::null_mut(), ptr::null_mut()) }) as libc::ssize_t
    })? as RawFd;
    adopt(accepted).inspect_err(|_| close_quiet(accepted))?;
    Ok(accepted)
}

/// Connects a fiber-aware socket, parking until the connection resolves.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = sockaddr_from(addr);
    // Safety: valid fd and address storage.
    let ret = unsafe { libc::connect(fd, (&raw const storage).cast(), len) };
    if ret == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    let in_progress = matches!(err.raw_os_error(), Some(libc::EINPROGRESS))
        || err.kind() == io::ErrorKind::WouldBlock;
    if !in_progress || !should_wait(fd) {
        return Err(err);
    }

    event::wait_for_event(fd, Interest::WRITE).map_err(closed_error)?;

    // the connect's fate is in SO_ERROR
    let mut so_error: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    // Safety: valid fd and option storage.
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&raw mut so_error).cast(),
            &mut len,
        )
    })?;
    if so_error != 0 {
        return Err(io::Error::from_raw_os_error(so_error));
    }
    Ok(())
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    retry(fd, Interest::READ, || {
        // Safety: buffer is owned and its length is passed.
        unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) }
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    retry(fd, Interest::WRITE, || {
        // Safety: buffer is owned and its length is passed.
        unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) }
    })
}

pub fn readv(fd: RawFd, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
    retry(fd, Interest::READ, || {
        // Safety: IoSliceMut is ABI-compatible with iovec.
        unsafe { libc::readv(fd, bufs.as_mut_ptr().cast(), bufs.len() as libc::c_int) }
    })
}

pub fn writev(fd: RawFd, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
    retry(fd, Interest::WRITE, || {
        // Safety: IoSlice is ABI-compatible with iovec.
        unsafe { libc::writev(fd, bufs.as_ptr().cast(), bufs.len() as libc::c_int) }
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<usize> {
    retry(fd, Interest::READ, || {
        // Safety: buffer is owned and its length is passed.
        unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags) }
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> io::Result<usize> {
    retry(fd, Interest::WRITE, || {
        // Safety: buffer is owned and its length is passed.
        unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), flags) }
    })
}

pub fn recvfrom(fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<(usize, Option<SocketAddr>)> {
    // Safety: zeroed sockaddr storage is valid.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut addr_len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let received = retry(fd, Interest::READ, || {
        // Safety: valid buffer and address storage.
        unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                flags,
                (&raw mut storage).cast(),
                &mut addr_len,
            )
        }
    })?;
    Ok((received, sockaddr_into(&storage)))
}

pub fn sendto(fd: RawFd, buf: &[u8], flags: i32, addr: &SocketAddr) -> io::Result<usize> {
    let (storage, len) = sockaddr_from(addr);
    retry(fd, Interest::WRITE, || {
        // Safety: valid buffer and address storage.
        unsafe {
            libc::sendto(
                fd,
                buf.as_ptr().cast(),
                buf.len(),
                flags,
                (&raw const storage).cast(),
                len,
            )
        }
    })
}

/// Scatter/gather receive with a caller-built message header.
///
/// # Safety
///
/// `msg` must be a valid `msghdr` whose buffers stay valid for the call.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: i32) -> io::Result<usize> {
    retry(fd, Interest::READ, || {
        // Safety: per the contract.
        unsafe { libc::recvmsg(fd, msg, flags) }
    })
}

/// Scatter/gather send with a caller-built message header.
///
/// # Safety
///
/// `msg` must be a valid `msghdr` whose buffers stay valid for the call.
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: i32) -> io::Result<usize> {
    retry(fd, Interest::WRITE, || {
        // Safety: per the contract.
        unsafe { libc::sendmsg(fd, msg, flags) }
    })
}

/// Opts a descriptor out of fiber-blocking semantics: it stays
/// `O_NONBLOCK` and operations return `EWOULDBLOCK` to the caller.
pub fn set_nonblocking(fd: RawFd) {
    if let Some(worker) = Worker::try_current() {
        worker.rt().io.clear_blocking(fd);
    }
}

/// Closes a descriptor, first force-waking every fiber parked on it (they
/// see an error) and dropping its table entry.
pub fn close(fd: RawFd) -> io::Result<()> {
    event::fd_closed(fd);
    if let Some(worker) = Worker::try_current() {
        worker.rt().io.deregister(fd);
    }
    // Safety: the caller owns the fd.
    cvt(unsafe { libc::close(fd) })?;
    Ok(())
}

fn close_quiet(fd: RawFd) {
    // Safety: the fd was created by us and is being abandoned.
    unsafe { libc::close(fd) };
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // Safety: zeroed sockaddr storage is valid.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // Safety: sockaddr_in fits in sockaddr_storage.
            unsafe { ptr::write((&raw mut storage).cast(), sin) };
            size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // Safety: sockaddr_in6 fits in sockaddr_storage.
            unsafe { ptr::write((&raw mut storage).cast(), sin6) };
            size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn sockaddr_into(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match i32::from(storage.ss_family) {
        libc::AF_INET => {
            // Safety: the kernel filled an AF_INET address.
            let sin: &libc::sockaddr_in = unsafe { &*ptr::from_ref(storage).cast() };
            Some(SocketAddr::from((
                sin.sin_addr.s_addr.to_ne_bytes(),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // Safety: the kernel filled an AF_INET6 address.
            let sin6: &libc::sockaddr_in6 = unsafe { &*ptr::from_ref(storage).cast() };
            Some(SocketAddr::from((
                sin6.sin6_addr.s6_addr,
                u16::from_be(sin6.sin6_port),
            )))
        }
        _ => None,
    }
}
