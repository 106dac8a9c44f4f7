//! Cooperative input/output.
//!
//! The wrappers in this module look like the blocking syscalls they stand in
//! for, but under a running [`Reactor`] they only ever block the calling
//! *fiber*: on `EAGAIN` the fiber parks on fd readiness (plus an optional
//! condition timer when the fd carries a receive/send timeout), the worker
//! thread moves on to other fibers, and the call retries once the kernel
//! reports the fd ready. Return values and error codes match what the plain
//! syscall would eventually have produced; a timeout surfaces as
//! `ETIMEDOUT`.
//!
//! Outside a reactor — or with the per-thread switch turned off via
//! [`set_enabled`] — every wrapper degrades to the plain syscall, so the same
//! code runs hooked and unhooked.
//!
//! Non-socket fds are passed straight through: regular file I/O does not
//! report `EAGAIN` usefully and is not converted. Sockets are forced
//! non-blocking at the kernel level the moment they are registered (see
//! [`crate::fd`]); the application-visible non-blocking flag is tracked
//! separately and composed back into [`get_flags`] results.
//!
//! [`CoStream`] and [`CoListener`] wrap the raw calls into `std::io`-shaped
//! types for the common TCP case.

use std::cell::Cell;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libc::{c_int, c_void, socklen_t};

use crate::fd::{fd_manager, TimeoutKind, NO_TIMEOUT};
use crate::fiber;
use crate::reactor::{Event, Reactor};
use crate::util;

thread_local! {
    static COOP_ENABLED: Cell<bool> = Cell::new(true);
}

/// Whether cooperative interception is enabled on this thread.
pub fn is_enabled() -> bool {
    COOP_ENABLED.with(Cell::get)
}

/// Turn cooperative interception on or off for this thread. The runtime's
/// own plumbing (and tests) use this to reach the plain syscalls.
pub fn set_enabled(flag: bool) {
    COOP_ENABLED.with(|c| c.set(flag));
}

/// Timeout state shared between a parked operation and its condition timer.
struct IoToken {
    /// 0, or the errno the timer cancelled us with.
    cancelled: AtomicI32,
}

fn ret(n: isize) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn ret_unit(rc: c_int) -> io::Result<()> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// The master template every read/write-shaped wrapper goes through.
///
/// `op` is the raw syscall; it is retried on `EINTR`, parked on `EAGAIN`
/// and re-issued on readiness until it produces a result. When the fd
/// carries a timeout for `timeout_kind`, a condition timer cancels the
/// parked event and the call reports `ETIMEDOUT`.
fn do_io<F>(
    fd: RawFd,
    name: &'static str,
    event: Event,
    timeout_kind: TimeoutKind,
    mut op: F,
) -> io::Result<usize>
where
    F: FnMut() -> isize,
{
    if !is_enabled() {
        return ret(op());
    }
    let ctx = match fd_manager().get(fd, false) {
        Some(ctx) => ctx,
        None => return ret(op()),
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() && ctx.user_nonblock() {
        return ret(op());
    }
    let timeout_ms = ctx.timeout(timeout_kind);
    let token = Arc::new(IoToken {
        cancelled: AtomicI32::new(0),
    });

    loop {
        let mut n = op();
        while n == -1 && util::errno() == libc::EINTR {
            n = op();
        }
        if n >= 0 {
            return Ok(n as usize);
        }
        if util::errno() != libc::EAGAIN {
            return Err(io::Error::last_os_error());
        }

        let iom = match Reactor::current() {
            Some(iom) => iom,
            // No reactor on this thread: nothing to park on, surface the
            // would-block to the caller.
            None => return Err(io::Error::last_os_error()),
        };

        let timer = if timeout_ms != NO_TIMEOUT {
            let weak = Arc::downgrade(&token);
            let canceller = iom.clone();
            Some(iom.add_condition_timer(
                timeout_ms,
                move || {
                    let token = match weak.upgrade() {
                        Some(t) => t,
                        None => return,
                    };
                    if token.cancelled.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    token.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    canceller.cancel_event(fd, event);
                },
                Arc::downgrade(&token),
                false,
            ))
        } else {
            None
        };

        if let Err(e) = iom.add_event(fd, event) {
            log::error!("{}: arming {:?} on fd {} failed: {}", name, event, fd, e);
            if let Some(t) = &timer {
                t.cancel();
            }
            return Err(match e {
                crate::Error::Io(io_err) => io_err,
                other => io::Error::new(io::ErrorKind::Other, other),
            });
        }

        fiber::yield_to_hold();

        if let Some(t) = &timer {
            t.cancel();
        }
        let cancelled = token.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            return Err(io::Error::from_raw_os_error(cancelled));
        }
        // Readiness fired; go around and retry the syscall.
    }
}

////////////////////////////////////////////////////////////////////////////////
// Sleeping
////////////////////////////////////////////////////////////////////////////////

/// Put the current fiber to sleep for at least `dur`.
///
/// The worker thread keeps running other fibers; a timer requeues this one.
/// Sub-millisecond remainders round up to the timer granularity. Without a
/// reactor (or with interception disabled) the whole thread sleeps instead.
pub fn sleep(dur: Duration) {
    let iom = match Reactor::current() {
        Some(iom) if is_enabled() => iom,
        _ => return std::thread::sleep(dur),
    };
    let cur = fiber::current();
    let requeue = iom.clone();
    iom.add_timer(
        duration_to_ms(dur),
        move || requeue.schedule_fiber(cur.clone()),
        false,
    );
    fiber::yield_to_hold();
}

fn duration_to_ms(d: Duration) -> u64 {
    let millis = d.as_millis();
    let millis = if millis > u64::MAX as u128 {
        u64::MAX
    } else {
        millis as u64
    };
    if d.subsec_nanos() % 1_000_000 != 0 {
        millis.saturating_add(1)
    } else {
        millis
    }
}

////////////////////////////////////////////////////////////////////////////////
// Socket lifecycle
////////////////////////////////////////////////////////////////////////////////

/// `socket(2)`, registering the new fd with the runtime.
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if is_enabled() {
        fd_manager().get(fd, true);
    }
    Ok(fd)
}

/// Cooperative `connect(2)` with an explicit timeout in milliseconds
/// ([`NO_TIMEOUT`] to wait indefinitely).
///
/// On a registered socket the kernel-level non-blocking connect is driven
/// to completion through the reactor: `EINPROGRESS` parks the fiber on
/// writability, and the final status comes from `SO_ERROR`.
pub fn connect_timeout(fd: RawFd, addr: &SocketAddr, timeout_ms: u64) -> io::Result<()> {
    let (storage, len) = sockaddr_from(addr);
    let raw_connect =
        || unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };

    if !is_enabled() {
        return ret_unit(raw_connect());
    }
    let ctx = match fd_manager().get(fd, false) {
        Some(ctx) => ctx,
        None => return ret_unit(raw_connect()),
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return ret_unit(raw_connect());
    }

    if raw_connect() == 0 {
        return Ok(());
    }
    if util::errno() != libc::EINPROGRESS {
        return Err(io::Error::last_os_error());
    }

    let iom = match Reactor::current() {
        Some(iom) => iom,
        None => return Err(io::Error::last_os_error()),
    };
    let token = Arc::new(IoToken {
        cancelled: AtomicI32::new(0),
    });
    let timer = if timeout_ms != NO_TIMEOUT {
        let weak = Arc::downgrade(&token);
        let canceller = iom.clone();
        Some(iom.add_condition_timer(
            timeout_ms,
            move || {
                let token = match weak.upgrade() {
                    Some(t) => t,
                    None => return,
                };
                if token.cancelled.load(Ordering::SeqCst) != 0 {
                    return;
                }
                token.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                canceller.cancel_event(fd, Event::WRITE);
            },
            Arc::downgrade(&token),
            false,
        ))
    } else {
        None
    };

    if let Err(e) = iom.add_event(fd, Event::WRITE) {
        log::error!("connect: arming WRITE on fd {} failed: {}", fd, e);
        if let Some(t) = &timer {
            t.cancel();
        }
        return Err(match e {
            crate::Error::Io(io_err) => io_err,
            other => io::Error::new(io::ErrorKind::Other, other),
        });
    }

    fiber::yield_to_hold();

    if let Some(t) = &timer {
        t.cancel();
    }
    if token.cancelled.load(Ordering::SeqCst) != 0 {
        return Err(io::Error::from_raw_os_error(
            token.cancelled.load(Ordering::SeqCst),
        ));
    }

    let mut so_error: c_int = 0;
    let mut so_len = mem::size_of::<c_int>() as socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut _ as *mut c_void,
            &mut so_len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if so_error == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(so_error))
    }
}

/// Cooperative `connect(2)` without a timeout.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    connect_timeout(fd, addr, NO_TIMEOUT)
}

/// Cooperative `accept(2)`, registering the accepted fd with the runtime.
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let client = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::accept(fd, ptr::null_mut(), ptr::null_mut()) as isize
    })?;
    let client = client as RawFd;
    if is_enabled() {
        fd_manager().get(client, true);
    }
    Ok(client)
}

/// Cooperative `close(2)`: tears down any parked waiters on the fd and drops
/// the runtime's metadata before closing.
pub fn close(fd: RawFd) -> io::Result<()> {
    if is_enabled() {
        if fd_manager().get(fd, false).is_some() {
            if let Some(iom) = Reactor::current() {
                iom.cancel_all(fd);
            }
            fd_manager().del(fd);
        }
    }
    ret_unit(unsafe { libc::close(fd) })
}

////////////////////////////////////////////////////////////////////////////////
// Read side
////////////////////////////////////////////////////////////////////////////////

/// Cooperative `read(2)`.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) as isize
    })
}

/// Cooperative `readv(2)`.
pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, bufs.as_mut_ptr() as *mut libc::iovec, bufs.len() as c_int) as isize
    })
}

/// Cooperative `recv(2)`.
pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> io::Result<usize> {
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags) as isize
    })
}

/// Cooperative `recvfrom(2)`.
///
/// # Safety
/// `src_addr`/`addrlen` must be null or valid for the kernel to fill in, as
/// with the raw syscall.
pub unsafe fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> io::Result<usize> {
    do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, || {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            flags,
            src_addr,
            addrlen,
        ) as isize
    })
}

/// Cooperative `recvmsg(2)`.
///
/// # Safety
/// `msg` must point to a valid `msghdr` for the duration of the call.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: c_int) -> io::Result<usize> {
    do_io(fd, "recvmsg", Event::READ, TimeoutKind::Recv, || {
        libc::recvmsg(fd, msg, flags) as isize
    })
}

////////////////////////////////////////////////////////////////////////////////
// Write side
////////////////////////////////////////////////////////////////////////////////

/// Cooperative `write(2)`.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) as isize
    })
}

/// Cooperative `writev(2)`.
pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::writev(fd, bufs.as_ptr() as *const libc::iovec, bufs.len() as c_int) as isize
    })
}

/// Cooperative `send(2)`.
pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> io::Result<usize> {
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags) as isize
    })
}

/// Cooperative `sendto(2)`.
///
/// # Safety
/// `dest_addr` must be null or a valid address of length `addrlen`.
pub unsafe fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> io::Result<usize> {
    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, || {
        libc::sendto(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            flags,
            dest_addr,
            addrlen,
        ) as isize
    })
}

/// Cooperative `sendmsg(2)`.
///
/// # Safety
/// `msg` must point to a valid `msghdr` for the duration of the call.
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: c_int) -> io::Result<usize> {
    do_io(fd, "sendmsg", Event::WRITE, TimeoutKind::Send, || {
        libc::sendmsg(fd, msg, flags) as isize
    })
}

////////////////////////////////////////////////////////////////////////////////
// Fd control
////////////////////////////////////////////////////////////////////////////////

/// `fcntl(F_GETFL)` through the runtime's eyes: the `O_NONBLOCK` bit
/// reflects what the application configured, not the forced kernel flag.
pub fn get_flags(fd: RawFd) -> io::Result<c_int> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if !is_enabled() {
        return Ok(flags);
    }
    match fd_manager().get(fd, false) {
        Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
            if ctx.user_nonblock() {
                Ok(flags | libc::O_NONBLOCK)
            } else {
                Ok(flags & !libc::O_NONBLOCK)
            }
        }
        _ => Ok(flags),
    }
}

/// `fcntl(F_SETFL)` through the runtime: the application's `O_NONBLOCK`
/// wish is recorded, while registered sockets stay non-blocking at the
/// kernel level regardless.
pub fn set_flags(fd: RawFd, flags: c_int) -> io::Result<()> {
    let mut flags = flags;
    if is_enabled() {
        if let Some(ctx) = fd_manager().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                if ctx.sys_nonblock() {
                    flags |= libc::O_NONBLOCK;
                } else {
                    flags &= !libc::O_NONBLOCK;
                }
            }
        }
    }
    ret_unit(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) })
}

/// `ioctl(FIONBIO)` equivalent: records the application's wish and
/// delegates unchanged.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    if is_enabled() {
        if let Some(ctx) = fd_manager().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(nonblocking);
            }
        }
    }
    let mut value: c_int = nonblocking as c_int;
    ret_unit(unsafe { libc::ioctl(fd, libc::FIONBIO, &mut value) })
}

/// `setsockopt(2)`, intercepting `SO_RCVTIMEO`/`SO_SNDTIMEO` into the
/// runtime's per-fd timeouts so the cooperative calls honour them.
///
/// # Safety
/// `optval`/`optlen` must describe a valid option value, as with the raw
/// syscall.
pub unsafe fn setsockopt(
    fd: RawFd,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> io::Result<()> {
    if is_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
    {
        if let Some(ctx) = fd_manager().get(fd, false) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            // A zero timeval means "never time out" to the kernel.
            let ms = if ms == 0 { NO_TIMEOUT } else { ms };
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout(kind, ms);
        }
    }
    ret_unit(libc::setsockopt(fd, level, optname, optval, optlen))
}

/// `getsockopt(2)` passthrough.
///
/// # Safety
/// As with the raw syscall.
pub unsafe fn getsockopt(
    fd: RawFd,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> io::Result<()> {
    ret_unit(libc::getsockopt(fd, level, optname, optval, optlen))
}

/// Set the runtime-level receive timeout, mirrored to the kernel via
/// `SO_RCVTIMEO`. `None` clears it.
pub fn set_recv_timeout(fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
    let tv = timeval_from(timeout);
    unsafe {
        setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const _ as *const c_void,
            mem::size_of::<libc::timeval>() as socklen_t,
        )
    }
}

/// Set the runtime-level send timeout, mirrored to the kernel via
/// `SO_SNDTIMEO`. `None` clears it.
pub fn set_send_timeout(fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
    let tv = timeval_from(timeout);
    unsafe {
        setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDTIMEO,
            &tv as *const _ as *const c_void,
            mem::size_of::<libc::timeval>() as socklen_t,
        )
    }
}

fn timeval_from(timeout: Option<Duration>) -> libc::timeval {
    match timeout {
        None => libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        Some(d) => libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        },
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            (storage, mem::size_of::<libc::sockaddr_in>() as socklen_t)
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
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            (storage, mem::size_of::<libc::sockaddr_in6>() as socklen_t)
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoStream / CoListener
////////////////////////////////////////////////////////////////////////////////

/// A TCP stream driven through the cooperative calls.
///
/// Reads and writes park the calling fiber instead of the thread; per-fd
/// timeouts set through [`set_read_timeout`](#method.set_read_timeout) and
/// [`set_write_timeout`](#method.set_write_timeout) apply. Dropping the
/// stream closes it through the cooperative [`close`].
pub struct CoStream {
    fd: RawFd,
}

impl CoStream {
    /// Open a TCP connection, trying each resolved address in turn.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<CoStream> {
        Self::connect_impl(addr, NO_TIMEOUT)
    }

    /// Open a TCP connection with a per-attempt timeout.
    pub fn connect_with_timeout<A: ToSocketAddrs>(
        addr: A,
        timeout: Duration,
    ) -> io::Result<CoStream> {
        Self::connect_impl(addr, duration_to_ms(timeout))
    }

    fn connect_impl<A: ToSocketAddrs>(addr: A, timeout_ms: u64) -> io::Result<CoStream> {
        let mut last_err = None;
        for sa in addr.to_socket_addrs()? {
            let domain = match sa {
                SocketAddr::V4(_) => libc::AF_INET,
                SocketAddr::V6(_) => libc::AF_INET6,
            };
            let fd = socket(domain, libc::SOCK_STREAM, 0)?;
            match connect_timeout(fd, &sa, timeout_ms) {
                Ok(()) => return Ok(CoStream { fd }),
                Err(e) => {
                    let _ = close(fd);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no addresses to connect to")
        }))
    }

    /// Adopt an already-connected fd, registering it with the runtime.
    pub fn from_fd(fd: RawFd) -> CoStream {
        if is_enabled() {
            fd_manager().get(fd, true);
        }
        CoStream { fd }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        set_recv_timeout(self.fd, timeout)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        set_send_timeout(self.fd, timeout)
    }
}

impl Read for CoStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read(self.fd, buf)
    }
}

impl Write for CoStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write(self.fd, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for CoStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for CoStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }
}

impl Drop for CoStream {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

/// A TCP listener whose `accept` parks the calling fiber.
pub struct CoListener {
    fd: RawFd,
}

impl CoListener {
    /// Bind and listen, trying each resolved address in turn.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<CoListener> {
        let mut last_err = None;
        for sa in addr.to_socket_addrs()? {
            let domain = match sa {
                SocketAddr::V4(_) => libc::AF_INET,
                SocketAddr::V6(_) => libc::AF_INET6,
            };
            let fd = match socket(domain, libc::SOCK_STREAM, 0) {
                Ok(fd) => fd,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            let one: c_int = 1;
            let _ = unsafe {
                setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_REUSEADDR,
                    &one as *const _ as *const c_void,
                    mem::size_of::<c_int>() as socklen_t,
                )
            };
            let (storage, len) = sockaddr_from(&sa);
            let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
            if rc != 0 {
                last_err = Some(io::Error::last_os_error());
                let _ = close(fd);
                continue;
            }
            if unsafe { libc::listen(fd, 128) } != 0 {
                last_err = Some(io::Error::last_os_error());
                let _ = close(fd);
                continue;
            }
            return Ok(CoListener { fd });
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no addresses to bind")))
    }

    /// Accept one connection, parking the calling fiber until a peer
    /// arrives (or the listener's receive timeout fires).
    pub fn accept(&self) -> io::Result<CoStream> {
        let fd = accept(self.fd)?;
        Ok(CoStream { fd })
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        sockaddr_to(&storage)
    }
}

impl AsRawFd for CoListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for CoListener {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

fn sockaddr_to(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::from((ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::from((ip, u16::from_be(sin6.sin6_port))))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected address family {}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_wrappers_pass_straight_through() {
        set_enabled(false);
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert_eq!(write(fds[1], b"xyz").unwrap(), 3);
        let mut buf = [0u8; 8];
        assert_eq!(read(fds[0], &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"xyz");
        close(fds[0]).unwrap();
        close(fds[1]).unwrap();
        set_enabled(true);
    }

    #[test]
    fn flags_compose_the_user_view() {
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        // Kernel side is non-blocking, user side starts blocking.
        let real = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert_ne!(real & libc::O_NONBLOCK, 0);
        assert_eq!(get_flags(fd).unwrap() & libc::O_NONBLOCK, 0);

        set_flags(fd, get_flags(fd).unwrap() | libc::O_NONBLOCK).unwrap();
        assert_ne!(get_flags(fd).unwrap() & libc::O_NONBLOCK, 0);

        // Clearing the user flag must not clear the kernel flag.
        set_flags(fd, get_flags(fd).unwrap() & !libc::O_NONBLOCK).unwrap();
        assert_eq!(get_flags(fd).unwrap() & libc::O_NONBLOCK, 0);
        let real = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert_ne!(real & libc::O_NONBLOCK, 0);

        close(fd).unwrap();
    }

    #[test]
    fn socket_timeouts_land_in_the_fd_table() {
        let fd = socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();
        set_recv_timeout(fd, Some(Duration::from_millis(1500))).unwrap();
        let ctx = fd_manager().get(fd, false).unwrap();
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 1500);
        assert_eq!(ctx.timeout(TimeoutKind::Send), NO_TIMEOUT);
        set_recv_timeout(fd, None).unwrap();
        assert_eq!(ctx.timeout(TimeoutKind::Recv), NO_TIMEOUT);
        close(fd).unwrap();
    }

    #[test]
    fn closed_ctx_reports_ebadf() {
        let fd = socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();
        let ctx = fd_manager().get(fd, true).unwrap();
        ctx.set_closed();
        let mut buf = [0u8; 4];
        let err = read(fd, &mut buf).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        fd_manager().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn sockaddr_roundtrip() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let (storage, _len) = sockaddr_from(&addr);
        assert_eq!(sockaddr_to(&storage).unwrap(), addr);
        let addr6: SocketAddr = "[::1]:9090".parse().unwrap();
        let (storage6, _len6) = sockaddr_from(&addr6);
        assert_eq!(sockaddr_to(&storage6).unwrap(), addr6);
    }
}
