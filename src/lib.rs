//! Stackful fiber runtime for Rust.
//! This library contains the following building blocks:
//!
//! - [Fibers: stackful coroutines, yields, fiber conditions](fiber)
//! - [M:N scheduler: worker threads, task queue, thread affinity](scheduler)
//! - [Reactor: epoll event loop, fd interests, wake pipe](reactor)
//! - [Timers: one-shot, recurring and condition timers](timer)
//! - [Cooperative I/O](coio)
//! - [Per-fd runtime metadata](fd)
//! - [Clock](clock)
//! - [Configuration](config)
//! - [Logging](https://docs.rs/log/) (the `log` facade; bring your own sink)
//! - [Error handling](error)
//!
//! The runtime is built around one type, [`reactor::Reactor`]: it owns a pool
//! of worker threads, a shared epoll instance and an ordered timer set.
//! Closures and [`fiber::Fiber`]s scheduled onto it run cooperatively; the
//! [`coio`] wrappers make blocking-style I/O calls park the calling fiber on
//! fd readiness (or a timeout) instead of blocking the worker thread, so
//! other fibers keep running.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let iom = fibrio::reactor::Reactor::new(2, false, "main").unwrap();
//! iom.schedule(|| {
//!     fibrio::coio::sleep(Duration::from_secs(1));
//!     println!("one second later, without holding a worker hostage");
//! });
//! iom.stop();
//! ```
//!
//! ### Prerequisites
//!
//! - rustc 1.71 or newer
//! - Linux with glibc (`ucontext` and `epoll` are load-bearing)

pub mod clock;
pub mod coio;
pub mod config;
pub mod error;
pub mod fd;
pub mod fiber;
pub mod reactor;
pub mod scheduler;
pub mod timer;
mod util;

pub use error::{Error, Result};
