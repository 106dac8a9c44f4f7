//! The epoll reactor.
//!
//! A [`Reactor`] is a [scheduler](crate::scheduler) whose workers, instead of
//! busy-yielding when the queue is empty, block in `epoll_wait` on one shared
//! epoll instance. Fibers (or plain callbacks) park against fd readiness with
//! [`Reactor::add_event`] and are handed back to their scheduler when the
//! kernel reports the fd ready — or when someone cancels the interest.
//!
//! A [timer set](crate::timer) is folded into the same loop: the earliest
//! deadline bounds the `epoll_wait` timeout (capped at one second), and
//! expired callbacks are dispatched as ordinary fiber work. A self-pipe
//! registered edge-triggered on the epoll set lets `tickle` wake a blocked
//! worker when new work or a nearer deadline arrives.
//!
//! Every worker runs the same idle loop over the same epoll fd; the kernel
//! distributes readiness reports across the waiters. Edge-triggered mode
//! plus the no-duplicate-registration invariant keep one readiness event
//! from waking two workers for the same parked fiber.

use std::cell::RefCell;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::fiber::{self, Fiber, Job, State};
use crate::scheduler::{self, Dispatch, SchedCore, Task};
use crate::timer::{Timer, TimerManager, TimerNotify, NO_TIMER};
use crate::Result;

bitflags::bitflags! {
    /// Readiness interests, expressed in the kernel's own bit values.
    pub struct Event: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

const EPOLLET_BITS: u32 = libc::EPOLLET as u32;

thread_local! {
    static CURRENT_REACTOR: RefCell<Option<Weak<ReactorInner>>> = RefCell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// Fd records
////////////////////////////////////////////////////////////////////////////////

/// One parked unit of work: the scheduler that owns it plus exactly one of
/// {fiber, callback}.
struct EventSlot {
    owner: Option<Weak<dyn Dispatch>>,
    fiber: Option<Arc<Fiber>>,
    job: Option<Job>,
}

impl EventSlot {
    fn empty() -> EventSlot {
        EventSlot {
            owner: None,
            fiber: None,
            job: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.owner.is_none() && self.fiber.is_none() && self.job.is_none()
    }

    fn reset(&mut self) {
        self.owner = None;
        self.fiber = None;
        self.job = None;
    }
}

/// Per-fd reactor state: the armed event bits and one slot per direction,
/// all under the fd's own mutex.
struct FdRecord {
    fd: RawFd,
    inner: Mutex<FdEvents>,
}

struct FdEvents {
    events: Event,
    read: EventSlot,
    write: EventSlot,
}

impl FdRecord {
    fn new(fd: RawFd) -> FdRecord {
        FdRecord {
            fd,
            inner: Mutex::new(FdEvents {
                events: Event::empty(),
                read: EventSlot::empty(),
                write: EventSlot::empty(),
            }),
        }
    }
}

impl FdEvents {
    fn slot_mut(&mut self, event: Event) -> &mut EventSlot {
        if event == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }

    /// Hand the parked work back to its scheduler and clear the slot.
    ///
    /// The bit is cleared *before* scheduling so a woken fiber re-arming the
    /// same event observes the fd as free.
    fn trigger(&mut self, fd: RawFd, event: Event) {
        assert!(self.events.contains(event));
        self.events.remove(event);
        let slot = self.slot_mut(event);
        let owner = slot.owner.take();
        let task = if let Some(job) = slot.job.take() {
            Task::from_job(job)
        } else if let Some(f) = slot.fiber.take() {
            Task::from_fiber(f)
        } else {
            unreachable!("armed event bit without a bound fiber or callback");
        };
        match owner.and_then(|w| w.upgrade()) {
            Some(owner) => owner.schedule_task(task),
            None => log::warn!("dropping parked work for fd {}: its scheduler is gone", fd),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// ReactorInner
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct ReactorInner {
    core: SchedCore,
    timers: TimerManager,
    epfd: RawFd,
    tickle_fds: [RawFd; 2],
    pending: AtomicUsize,
    fds: RwLock<Vec<Arc<FdRecord>>>,
}

impl ReactorInner {
    /// Fetch the record for `fd`, growing the table if needed
    /// (1.5× the requested fd, never below 32 slots).
    fn fd_record(&self, fd: RawFd) -> Arc<FdRecord> {
        assert!(fd >= 0, "invalid fd {}", fd);
        {
            let fds = self.fds.read().unwrap();
            if let Some(record) = fds.get(fd as usize) {
                return record.clone();
            }
        }
        let mut fds = self.fds.write().unwrap();
        let wanted = std::cmp::max(fd as usize + 1, fd as usize * 3 / 2);
        grow_table(&mut fds, wanted);
        fds[fd as usize].clone()
    }

    /// Like [`fd_record`](Self::fd_record) but without growing.
    fn lookup(&self, fd: RawFd) -> Option<Arc<FdRecord>> {
        if fd < 0 {
            return None;
        }
        self.fds.read().unwrap().get(fd as usize).cloned()
    }

    fn add_event(this: &Arc<ReactorInner>, fd: RawFd, event: Event, job: Option<Job>) -> Result<()> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "register exactly one event at a time"
        );
        let record = this.fd_record(fd);
        let mut state = record.inner.lock().unwrap();
        // A second registration for an armed event is a caller bug: the
        // slot holds exactly one parked unit of work. This is usually hit
        // from inside a fiber's job, where a panic would be swallowed by the
        // trampoline's catch — keep it fatal.
        if state.events.contains(event) {
            log::error!(
                "event {:?} already registered for fd {} (armed: {:?})",
                event,
                fd,
                state.events
            );
            std::process::abort();
        }

        let op = if state.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        epoll_ctl(this.epfd, op, fd, EPOLLET_BITS | state.events.bits() | event.bits())?;

        this.pending.fetch_add(1, Ordering::SeqCst);
        state.events.insert(event);

        let owner = scheduler::current_dispatch().unwrap_or_else(|| {
            let this_dyn: Arc<dyn Dispatch> = this.clone();
            let fallback: Weak<dyn Dispatch> = Arc::downgrade(&this_dyn);
            fallback
        });
        let slot = state.slot_mut(event);
        debug_assert!(slot.is_empty());
        slot.owner = Some(owner);
        match job {
            Some(job) => slot.job = Some(job),
            None => {
                let cur = fiber::current();
                assert_eq!(
                    cur.state(),
                    State::Exec,
                    "parking requires a running fiber"
                );
                slot.fiber = Some(cur);
            }
        }
        Ok(())
    }

    /// Drop the interest without running the parked work.
    fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let record = match self.lookup(fd) {
            Some(r) => r,
            None => return false,
        };
        let mut state = record.inner.lock().unwrap();
        if !state.events.contains(event) {
            return false;
        }
        let remaining = state.events - event;
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if epoll_ctl(self.epfd, op, fd, EPOLLET_BITS | remaining.bits()).is_err() {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        state.events = remaining;
        state.slot_mut(event).reset();
        true
    }

    /// Drop the interest and run the parked work anyway, so the waiter does
    /// not hang. The waiter can tell cancellation from readiness through
    /// whatever flag it shares with the canceller.
    fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let record = match self.lookup(fd) {
            Some(r) => r,
            None => return false,
        };
        let mut state = record.inner.lock().unwrap();
        if !state.events.contains(event) {
            return false;
        }
        let remaining = state.events - event;
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if epoll_ctl(self.epfd, op, fd, EPOLLET_BITS | remaining.bits()).is_err() {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        state.trigger(fd, event);
        true
    }

    /// Remove the fd from the epoll set and run both parked sides. Invoked
    /// by the cooperative `close`.
    fn cancel_all(&self, fd: RawFd) -> bool {
        let record = match self.lookup(fd) {
            Some(r) => r,
            None => return false,
        };
        let mut state = record.inner.lock().unwrap();
        if state.events.is_empty() {
            return false;
        }
        if epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, 0).is_err() {
            return false;
        }
        if state.events.contains(Event::READ) {
            state.trigger(fd, Event::READ);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if state.events.contains(Event::WRITE) {
            state.trigger(fd, Event::WRITE);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        assert!(state.events.is_empty());
        true
    }
}

impl Dispatch for ReactorInner {
    fn core(&self) -> &SchedCore {
        &self.core
    }

    /// Wake a blocked worker, if there is one to wake.
    fn tickle(&self) {
        if !self.core.has_idle_workers() {
            return;
        }
        let rc = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const libc::c_void, 1) };
        debug_assert_eq!(rc, 1, "tickle write");
    }

    /// The reactor may only die once nothing can ever wake again: no queued
    /// work, no running fiber, no armed fd event, no pending deadline.
    fn stopping(&self) -> bool {
        self.timers.next_timer_ms() == NO_TIMER
            && self.pending.load(Ordering::SeqCst) == 0
            && self.core.base_stopping()
    }

    fn idle(&self) {
        const MAX_EVENTS: usize = 64;
        const MAX_TIMEOUT_MS: u64 = 1000;
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };

        loop {
            if self.stopping() {
                log::info!("reactor {} idle stopping exit", self.core.name());
                break;
            }

            let timeout = std::cmp::min(self.timers.next_timer_ms(), MAX_TIMEOUT_MS);
            let ready = loop {
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as libc::c_int,
                        timeout as libc::c_int,
                    )
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                log::error!("epoll_wait({}) failed: {}", self.epfd, err);
                break 0;
            };

            let expired = self.timers.expired_callbacks();
            if !expired.is_empty() {
                let tasks = expired
                    .into_iter()
                    .map(|cb| Task::from_job(Box::new(move || cb())))
                    .collect();
                self.schedule_all(tasks);
            }

            for event in &events[..ready] {
                let fd = event.u64 as RawFd;
                if fd == self.tickle_fds[0] {
                    // Edge-triggered: drain every wake byte at once.
                    let mut buf = [0u8; 256];
                    loop {
                        let n = unsafe {
                            libc::read(
                                self.tickle_fds[0],
                                buf.as_mut_ptr() as *mut libc::c_void,
                                buf.len(),
                            )
                        };
                        if n <= 0 {
                            break;
                        }
                    }
                    continue;
                }

                let record = match self.lookup(fd) {
                    Some(r) => r,
                    None => continue,
                };
                let mut state = record.inner.lock().unwrap();

                let mut raw = event.events;
                // Errors and hangups wake both directions so the parked
                // fiber retries and reads the real error from the syscall.
                if raw & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    raw |= (libc::EPOLLIN | libc::EPOLLOUT) as u32;
                }
                let mut real = Event::empty();
                if raw & libc::EPOLLIN as u32 != 0 {
                    real |= Event::READ;
                }
                if raw & libc::EPOLLOUT as u32 != 0 {
                    real |= Event::WRITE;
                }
                if (state.events & real).is_empty() {
                    // Stale: the interest was cancelled while this report
                    // was in flight.
                    continue;
                }

                let remaining = state.events - real;
                let op = if remaining.is_empty() {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };
                if epoll_ctl(self.epfd, op, fd, EPOLLET_BITS | remaining.bits()).is_err() {
                    continue;
                }

                if real.contains(Event::READ) {
                    state.trigger(fd, Event::READ);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                if real.contains(Event::WRITE) {
                    state.trigger(fd, Event::WRITE);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Back to the run loop; it re-enters us when the queue is empty
            // again.
            fiber::yield_to_hold();
        }
    }

    fn install(self: Arc<Self>) {
        CURRENT_REACTOR.with(|c| *c.borrow_mut() = Some(Arc::downgrade(&self)));
    }
}

impl TimerNotify for ReactorInner {
    /// A new earliest deadline: re-tighten a blocked worker's `epoll_wait`.
    fn on_timer_inserted_at_front(&self) {
        self.tickle();
    }
}

impl Drop for ReactorInner {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

fn grow_table(fds: &mut Vec<Arc<FdRecord>>, wanted: usize) {
    let new_len = std::cmp::max(32, wanted);
    if fds.len() >= new_len {
        return;
    }
    let mut next = fds.len();
    fds.resize_with(new_len, || {
        let record = Arc::new(FdRecord::new(next as RawFd));
        next += 1;
        record
    });
}

fn epoll_ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, bits: u32) -> io::Result<()> {
    let mut event = libc::epoll_event {
        events: bits,
        u64: fd as u64,
    };
    let rc = unsafe { libc::epoll_ctl(epfd, op, fd, &mut event) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        log::error!(
            "epoll_ctl({}, {}, {}, {:#x}) failed: {}",
            epfd,
            op,
            fd,
            bits,
            err
        );
        return Err(err);
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Reactor
////////////////////////////////////////////////////////////////////////////////

/// Scheduler plus epoll loop plus timers, behind one cheaply clonable
/// handle. Workers are running as soon as `new` returns.
///
/// At most one reactor should be active per thread: the thread-local
/// "current reactor" slot used by the cooperative I/O layer is single-valued.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

impl Reactor {
    /// Create a reactor with `threads` workers and start them. With
    /// `use_caller`, the constructing thread is one of the workers and
    /// contributes its share while blocked in [`stop`](#method.stop).
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Reactor> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            let err = io::Error::last_os_error();
            log::error!("epoll_create1 failed: {}", err);
            return Err(err.into());
        }

        let mut pipe_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            log::error!("pipe failed: {}", err);
            unsafe { libc::close(epfd) };
            return Err(err.into());
        }

        let close_all = |e: io::Error| {
            unsafe {
                libc::close(epfd);
                libc::close(pipe_fds[0]);
                libc::close(pipe_fds[1]);
            }
            Err(e.into())
        };

        let flags = unsafe { libc::fcntl(pipe_fds[0], libc::F_GETFL, 0) };
        if flags < 0
            || unsafe { libc::fcntl(pipe_fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
        {
            let err = io::Error::last_os_error();
            log::error!("fcntl on the wake pipe failed: {}", err);
            return close_all(err);
        }

        if let Err(err) = epoll_ctl(
            epfd,
            libc::EPOLL_CTL_ADD,
            pipe_fds[0],
            libc::EPOLLIN as u32 | EPOLLET_BITS,
        ) {
            return close_all(err);
        }

        let inner = Arc::new(ReactorInner {
            core: SchedCore::new(threads, use_caller, name),
            timers: TimerManager::new(),
            epfd,
            tickle_fds: pipe_fds,
            pending: AtomicUsize::new(0),
            fds: RwLock::new(Vec::new()),
        });
        grow_table(&mut inner.fds.write().unwrap(), 32);
        let inner_dyn: Arc<dyn TimerNotify> = inner.clone();
        let notify: Weak<dyn TimerNotify> = Arc::downgrade(&inner_dyn);
        inner.timers.set_notify(notify);
        if use_caller {
            scheduler::bind_caller(&inner);
        }
        scheduler::start(&inner);
        Ok(Reactor { inner })
    }

    /// The reactor driving the current thread, if any.
    pub fn current() -> Option<Reactor> {
        CURRENT_REACTOR.with(|c| {
            c.borrow()
                .as_ref()
                .and_then(Weak::upgrade)
                .map(|inner| Reactor { inner })
        })
    }

    pub fn name(&self) -> &str {
        self.inner.core().name()
    }

    /// Restart after a [`stop`](#method.stop). Idempotent while running.
    pub fn start(&self) {
        scheduler::start(&self.inner);
    }

    /// Drain all work — queued tasks, armed events, pending timers — and
    /// join the workers. If the constructing thread participates, it must
    /// be the one calling `stop`.
    pub fn stop(&self) {
        scheduler::stop(&self.inner);
    }

    /// Queue a closure for execution on any worker.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.schedule_task(Task::from_job(Box::new(f)));
    }

    /// Queue a closure pinned to the worker with kernel thread id `thread`.
    pub fn schedule_to<F>(&self, thread: i64, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .schedule_task(Task::from_job_to(Box::new(f), thread));
    }

    /// Queue an existing fiber for (re)execution.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.inner.schedule_task(Task::from_fiber(fiber));
    }

    /// Park the current fiber until `fd` reports `event`.
    ///
    /// The fiber is resumed by readiness, [`cancel_event`](#method.cancel_event)
    /// or [`cancel_all`](#method.cancel_all); it cannot tell readiness from
    /// cancellation on its own (pair the call with a shared flag when that
    /// matters). Registering an already-armed event is a caller bug and
    /// aborts.
    pub fn add_event(&self, fd: RawFd, event: Event) -> Result<()> {
        ReactorInner::add_event(&self.inner, fd, event, None)
    }

    /// Arm `fd`/`event` with a callback instead of parking the caller.
    pub fn add_event_with<F>(&self, fd: RawFd, event: Event, cb: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        ReactorInner::add_event(&self.inner, fd, event, Some(Box::new(cb)))
    }

    /// Disarm `fd`/`event` without running the parked work. Returns whether
    /// anything was armed.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.inner.del_event(fd, event)
    }

    /// Disarm `fd`/`event` and schedule the parked work now.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.inner.cancel_event(fd, event)
    }

    /// Disarm everything on `fd`, scheduling both parked sides.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.inner.cancel_all(fd)
    }

    /// Run `cb` in `delay_ms` milliseconds (repeatedly, if `recurring`).
    pub fn add_timer<F>(&self, delay_ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.timers.add_timer(delay_ms, cb, recurring)
    }

    /// Run `cb` in `delay_ms` milliseconds, but only if `cond` is still
    /// alive by then. See [`TimerManager::add_condition_timer`].
    pub fn add_condition_timer<F, T>(
        &self,
        delay_ms: u64,
        cb: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.inner
            .timers
            .add_condition_timer(delay_ms, cb, cond, recurring)
    }

    /// Milliseconds until the earliest pending deadline
    /// ([`NO_TIMER`](crate::timer::NO_TIMER) when none).
    pub fn next_timer_ms(&self) -> u64 {
        self.inner.timers.next_timer_ms()
    }

    pub fn has_timer(&self) -> bool {
        self.inner.timers.has_timer()
    }

    /// Number of armed fd events across all fds.
    pub fn pending_events(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("name", &self.name())
            .field("pending_events", &self.pending_events())
            .finish_non_exhaustive()
    }
}
