//! Per-fd runtime metadata.
//!
//! The cooperative I/O layer needs to know, for every file descriptor it has
//! seen, whether the fd is a socket, whether the *kernel* has it in
//! non-blocking mode, whether the *application* asked for non-blocking mode,
//! and the per-direction timeouts. The two non-blocking flags are distinct
//! on purpose: sockets are forced non-blocking at the kernel level so the
//! reactor can park fibers on them, while `get_flags`/`set_flags` keep
//! showing the application the value it configured.
//!
//! [`FdManager`] is the process-wide fd → [`FdCtx`] table, grown on demand
//! under a readers-writer lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// "No timeout configured".
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Which per-fd timeout an operation consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Read-side operations (`SO_RCVTIMEO`).
    Recv,
    /// Write-side operations (`SO_SNDTIMEO`).
    Send,
}

/// Metadata for one file descriptor.
pub struct FdCtx {
    fd: libc::c_int,
    is_init: bool,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: libc::c_int) -> FdCtx {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(fd, &mut stat) };
        let is_init = rc == 0;
        let is_socket = is_init && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            // The reactor only works against non-blocking fds; force the
            // kernel flag on and remember that we did.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        FdCtx {
            fd,
            is_init,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> libc::c_int {
        self.fd
    }

    pub fn is_init(&self) -> bool {
        self.is_init
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Kernel-level non-blocking flag as the runtime last set it.
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::SeqCst)
    }

    pub(crate) fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::SeqCst);
    }

    /// Non-blocking flag as the application configured it.
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    pub(crate) fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::SeqCst);
    }

    /// Timeout in milliseconds for the given direction, [`NO_TIMEOUT`] when
    /// unset.
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::SeqCst),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::SeqCst),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::SeqCst),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// FdManager
////////////////////////////////////////////////////////////////////////////////

/// Process-wide fd → [`FdCtx`] table.
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

static INSTANCE: Lazy<FdManager> = Lazy::new(|| FdManager {
    slots: RwLock::new({
        let mut v = Vec::new();
        v.resize(64, None);
        v
    }),
});

/// The process-wide instance.
pub fn fd_manager() -> &'static FdManager {
    &INSTANCE
}

impl FdManager {
    /// Fetch the context for `fd`, creating (and probing) it when
    /// `auto_create` is set.
    pub fn get(&self, fd: libc::c_int, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        {
            let slots = self.slots.read().unwrap();
            if let Some(Some(ctx)) = slots.get(fd as usize) {
                return Some(ctx.clone());
            }
        }
        if !auto_create {
            return None;
        }

        let ctx = Arc::new(FdCtx::new(fd));
        let mut slots = self.slots.write().unwrap();
        let index = fd as usize;
        if index >= slots.len() {
            let grown = index + index / 2;
            slots.resize(grown, None);
        }
        // Someone may have raced us here; first write wins.
        match &slots[index] {
            Some(existing) => Some(existing.clone()),
            None => {
                slots[index] = Some(ctx.clone());
                Some(ctx)
            }
        }
    }

    /// Forget `fd`. Outstanding holders of the context observe it closed.
    pub fn del(&self, fd: libc::c_int) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.set_closed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_is_probed_and_forced_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let ctx = fd_manager().get(fd, true).unwrap();
        assert!(ctx.is_init());
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
        fd_manager().del(fd);
        assert!(ctx.is_closed());
        assert!(fd_manager().get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn non_socket_keeps_blocking_mode() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ctx = fd_manager().get(fds[0], true).unwrap();
        assert!(ctx.is_init());
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());
        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL, 0) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);
        fd_manager().del(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn missing_fd_without_auto_create_is_none() {
        assert!(fd_manager().get(1022, false).is_none());
        assert!(fd_manager().get(-1, true).is_none());
    }

    #[test]
    fn user_nonblock_is_tracked_separately() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        let ctx = fd_manager().get(fd, true).unwrap();
        ctx.set_user_nonblock(true);
        assert!(ctx.user_nonblock());
        assert!(ctx.sys_nonblock());
        ctx.set_user_nonblock(false);
        assert!(!ctx.user_nonblock());
        // The kernel flag is untouched by the user-visible setting.
        assert!(ctx.sys_nonblock());
        fd_manager().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn timeouts_default_to_none_and_stick() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        let ctx = fd_manager().get(fd, true).unwrap();
        assert_eq!(ctx.timeout(TimeoutKind::Recv), NO_TIMEOUT);
        ctx.set_timeout(TimeoutKind::Recv, 500);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 500);
        assert_eq!(ctx.timeout(TimeoutKind::Send), NO_TIMEOUT);
        fd_manager().del(fd);
        unsafe { libc::close(fd) };
    }
}
