use std::io;

/// Kernel thread id of the calling thread.
///
/// Unlike `std::thread::ThreadId` this is the value the kernel knows the
/// thread by, which makes it usable as a scheduling affinity key and
/// readable in `ps`/`top` output.
#[inline]
pub fn thread_id() -> i64 {
    unsafe { libc::syscall(libc::SYS_gettid) as i64 }
}

/// Last `errno` as a raw value, defaulting to 0 when the error carries none.
#[inline]
pub(crate) fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
