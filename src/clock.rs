//! The `clock` module returns time values derived from the Posix / C
//! [CLOCK_GETTIME](http://pubs.opengroup.org/onlinepubs/9699919799/functions/clock_getres.html)
//! function.
//!
//! - [monotonic()](fn.monotonic.html) - Get the monotonic time as a `Duration`
//! - [monotonic_ms()](fn.monotonic_ms.html) - Get the monotonic time in milliseconds
//! - [realtime_ms()](fn.realtime_ms.html) - Get the wall clock time in milliseconds
//!
//! Monotonic milliseconds are the runtime's timebase: timer deadlines and
//! per-fd timeouts are all expressed in them.

use std::time::Duration;

#[inline]
fn gettime(clock: libc::clockid_t) -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    assert_eq!(rc, 0, "clock_gettime");
    ts
}

/// The monotonic time.
///
/// Derived from `clock_gettime(CLOCK_MONOTONIC)`. Monotonic time is not
/// affected by clock adjustments, which makes it the right choice for
/// measuring elapsed time and for timer deadlines.
#[inline]
pub fn monotonic() -> Duration {
    let ts = gettime(libc::CLOCK_MONOTONIC);
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Monotonic time in milliseconds since an unspecified epoch (boot).
///
/// See: [monotonic()](fn.monotonic.html)
#[inline]
pub fn monotonic_ms() -> u64 {
    let ts = gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// The wall clock time in milliseconds since 1970-01-01 00:00:00.
///
/// Derived from `clock_gettime(CLOCK_REALTIME)`. Subject to adjustments by
/// the system administrator; do not use it for deadlines.
#[inline]
pub fn realtime_ms() -> u64 {
    let ts = gettime(libc::CLOCK_REALTIME);
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}
