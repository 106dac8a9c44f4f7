//! M:N fiber scheduler.
//!
//! A [`Scheduler`] owns a fixed pool of worker threads and a FIFO queue of
//! [`Task`]s — fibers or plain closures, each with an optional worker
//! affinity. Workers pull compatible tasks in submission order, lift
//! closures into a reusable callback fiber, and switch into the task fiber;
//! when the fiber yields back they either requeue it (`Ready`), park it
//! (`Hold`, to be requeued by whoever holds a reference) or retire it.
//!
//! The calling thread can participate as an extra worker (`use_caller`): its
//! run loop lives in a *root fiber* that executes while the caller blocks in
//! [`Scheduler::stop`].
//!
//! The scheduler by itself never sleeps — its idle fiber busy-yields until
//! shutdown. The [reactor](crate::reactor) overrides the idle/tickle/stop
//! seams to block in `epoll_wait` instead; the base behaviour exists so the
//! queue mechanics are testable without a reactor.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use crate::fiber::{self, Fiber, Job, State};
use crate::util;

/// Affinity wildcard: the task may run on any worker.
pub const ANY_WORKER: i64 = -1;

thread_local! {
    /// The scheduler driving this thread, type-erased to its dispatch seams.
    static CURRENT_DISPATCH: RefCell<Option<Weak<dyn Dispatch>>> = RefCell::new(None);
    /// The fiber a yielding task fiber returns to on this thread: the
    /// thread-main fiber on plain workers, the root fiber on the caller.
    static SCHED_FIBER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

pub(crate) fn current_dispatch() -> Option<Weak<dyn Dispatch>> {
    CURRENT_DISPATCH.with(|c| c.borrow().clone())
}

pub(crate) fn main_fiber() -> Option<Arc<Fiber>> {
    SCHED_FIBER.with(|c| c.borrow().clone())
}

fn set_current_dispatch(d: Weak<dyn Dispatch>) {
    CURRENT_DISPATCH.with(|c| *c.borrow_mut() = Some(d));
}

fn set_main_fiber(f: Arc<Fiber>) {
    SCHED_FIBER.with(|c| *c.borrow_mut() = Some(f));
}

////////////////////////////////////////////////////////////////////////////////
// Task
////////////////////////////////////////////////////////////////////////////////

/// A queue entry: a fiber or a closure, plus a worker affinity
/// ([`ANY_WORKER`] or a worker's kernel thread id).
pub(crate) struct Task {
    pub(crate) fiber: Option<Arc<Fiber>>,
    pub(crate) job: Option<Job>,
    pub(crate) thread: i64,
}

impl Task {
    pub(crate) fn from_fiber(fiber: Arc<Fiber>) -> Task {
        Task {
            fiber: Some(fiber),
            job: None,
            thread: ANY_WORKER,
        }
    }

    pub(crate) fn from_fiber_to(fiber: Arc<Fiber>, thread: i64) -> Task {
        Task {
            fiber: Some(fiber),
            job: None,
            thread,
        }
    }

    pub(crate) fn from_job(job: Job) -> Task {
        Task {
            fiber: None,
            job: Some(job),
            thread: ANY_WORKER,
        }
    }

    pub(crate) fn from_job_to(job: Job, thread: i64) -> Task {
        Task {
            fiber: None,
            job: Some(job),
            thread,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Dispatch
////////////////////////////////////////////////////////////////////////////////

/// The scheduler's variance seams.
///
/// The queue mechanics are shared; what differs between the base scheduler
/// and the reactor is how workers are woken (`tickle`), when the run loop is
/// allowed to die (`stopping`) and what a worker does with an empty queue
/// (`idle`). The reactor overrides all three, plus `install` to publish
/// itself in its own thread-local slot.
pub(crate) trait Dispatch: Send + Sync + 'static {
    fn core(&self) -> &SchedCore;

    /// Wake one idle worker. The base scheduler has no blocking idle, so
    /// there is nobody to wake.
    fn tickle(&self) {
        log::trace!("tickle");
    }

    /// Whether the run loops may exit.
    fn stopping(&self) -> bool {
        self.core().base_stopping()
    }

    /// Body of the idle fiber. The base implementation busy-yields; only
    /// the reactor's override is appropriate for production use.
    fn idle(&self) {
        log::info!("scheduler {} idle", self.core().name);
        while !self.stopping() {
            fiber::yield_to_hold();
        }
    }

    /// Publish any extra thread-local state on a freshly bound worker.
    fn install(self: Arc<Self>)
    where
        Self: Sized,
    {
    }

    /// Enqueue one task, waking a worker if the queue was empty.
    fn schedule_task(&self, task: Task) {
        if self.core().enqueue(task) {
            self.tickle();
        }
    }

    /// Enqueue a batch atomically, waking at most once.
    fn schedule_all(&self, tasks: Vec<Task>) {
        let mut need_tickle = false;
        {
            let mut queue = self.core().queue.lock().unwrap();
            for task in tasks {
                need_tickle = need_tickle || queue.is_empty();
                queue.push_back(task);
            }
        }
        if need_tickle {
            self.tickle();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// SchedCore
////////////////////////////////////////////////////////////////////////////////

/// State shared by every scheduler flavour.
pub(crate) struct SchedCore {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    thread_count: usize,
    active: AtomicUsize,
    idle_workers: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    root_thread: i64,
}

impl SchedCore {
    pub(crate) fn new(threads: usize, use_caller: bool, name: &str) -> SchedCore {
        assert!(threads > 0);
        let thread_count = threads - use_caller as usize;
        SchedCore {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_count,
            active: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            root_fiber: Mutex::new(None),
            root_thread: if use_caller { util::thread_id() } else { -1 },
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&self, task: Task) -> bool {
        let mut queue = self.queue.lock().unwrap();
        let was_empty = queue.is_empty();
        queue.push_back(task);
        was_empty
    }

    pub(crate) fn has_idle_workers(&self) -> bool {
        self.idle_workers.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.stopping.load(Ordering::SeqCst)
            && self.queue.lock().unwrap().is_empty()
            && self.active.load(Ordering::SeqCst) == 0
    }
}

/// Wire the calling thread up as a participating worker: materialize its
/// thread-main fiber, create the root fiber that will execute the run loop
/// during `stop()`, and publish the scheduler in this thread's slots.
pub(crate) fn bind_caller<D: Dispatch>(this: &Arc<D>) {
    fiber::current();
    let weak = Arc::downgrade(this);
    let root = Fiber::new_inner(
        Box::new(move || {
            if let Some(s) = weak.upgrade() {
                run(&s);
            }
        }),
        0,
        true,
    )
    .expect("failed to allocate the caller root fiber");
    set_main_fiber(root.clone());
    *this.core().root_fiber.lock().unwrap() = Some(root);
    let this_dyn: Arc<dyn Dispatch> = this.clone();
    set_current_dispatch(Arc::downgrade(&this_dyn));
    Arc::clone(this).install();
}

/// Spawn the worker threads. Idempotent: a scheduler that is not stopped
/// ignores further calls.
pub(crate) fn start<D: Dispatch>(this: &Arc<D>) {
    let core = this.core();
    let mut threads = core.threads.lock().unwrap();
    if !core.stopping.load(Ordering::SeqCst) {
        return;
    }
    core.stopping.store(false, Ordering::SeqCst);

    assert!(threads.is_empty());
    for i in 0..core.thread_count {
        let worker = Arc::clone(this);
        let handle = thread::Builder::new()
            .name(format!("{}_{}", core.name, i))
            .spawn(move || run(&worker))
            .expect("failed to spawn a scheduler worker");
        threads.push(handle);
    }
}

/// Drain and shut down: wake every worker, run the caller's root fiber if it
/// participates, then join the pool.
pub(crate) fn stop<D: Dispatch>(this: &Arc<D>) {
    let core = this.core();
    log::info!("scheduler {} stop", core.name);
    core.auto_stop.store(true, Ordering::SeqCst);

    let root = core.root_fiber.lock().unwrap().clone();
    if let Some(root) = &root {
        if core.thread_count == 0 && matches!(root.state(), State::Term | State::Init) {
            core.stopping.store(true, Ordering::SeqCst);
            if this.stopping() {
                log::info!("scheduler {} stopped", core.name);
                return;
            }
        }
    }

    core.stopping.store(true, Ordering::SeqCst);
    for _ in 0..core.thread_count {
        this.tickle();
    }
    if root.is_some() {
        this.tickle();
    }

    if let Some(root) = root {
        if !this.stopping() {
            Fiber::call(&root);
        }
    }

    let workers = std::mem::take(&mut *core.threads.lock().unwrap());
    for worker in workers {
        let _ = worker.join();
    }
    log::info!("scheduler {} stopped", core.name);
}

/// The worker run loop.
pub(crate) fn run<D: Dispatch>(this: &Arc<D>) {
    let core = this.core();
    let tid = util::thread_id();
    log::info!("scheduler {} worker {} run", core.name, tid);
    let this_dyn: Arc<dyn Dispatch> = this.clone();
    set_current_dispatch(Arc::downgrade(&this_dyn));
    Arc::clone(this).install();
    if tid != core.root_thread {
        // Plain workers return yields to their native stack; the caller
        // thread already returns them to the root fiber.
        set_main_fiber(fiber::current());
    }

    let weak = Arc::downgrade(this);
    let idle_fiber = Fiber::new_inner(
        Box::new(move || {
            if let Some(s) = weak.upgrade() {
                s.idle();
            }
        }),
        0,
        false,
    )
    .expect("failed to allocate the idle fiber");
    let mut cb_fiber: Option<Arc<Fiber>> = None;

    loop {
        let mut task: Option<Task> = None;
        let mut tickle_me = false;
        {
            let mut queue = core.queue.lock().unwrap();
            let mut i = 0;
            while i < queue.len() {
                let candidate = &queue[i];
                if candidate.thread != ANY_WORKER && candidate.thread != tid {
                    // Not ours; make sure its worker hears about it.
                    tickle_me = true;
                    i += 1;
                    continue;
                }
                debug_assert!(candidate.fiber.is_some() || candidate.job.is_some());
                if let Some(f) = &candidate.fiber {
                    if f.state() == State::Exec {
                        // Still running on another worker; retry later.
                        i += 1;
                        continue;
                    }
                }
                task = queue.remove(i);
                core.active.fetch_add(1, Ordering::SeqCst);
                break;
            }
            tickle_me = tickle_me || !queue.is_empty();
        }
        if tickle_me {
            this.tickle();
        }

        match task {
            Some(Task { fiber: Some(f), .. }) => {
                if !matches!(f.state(), State::Term | State::Except) {
                    Fiber::swap_in(&f);
                    match f.state() {
                        State::Ready => this.schedule_task(Task::from_fiber(f)),
                        State::Term | State::Except => {}
                        // Parked: reachable only through whoever holds a
                        // reference (event slot, timer, cond).
                        _ => f.set_state(State::Hold),
                    }
                }
                core.active.fetch_sub(1, Ordering::SeqCst);
            }
            Some(Task { job: Some(job), .. }) => {
                let f = match cb_fiber.take() {
                    Some(f) => {
                        f.reset_job(job);
                        f
                    }
                    None => Fiber::new_inner(job, 0, false)
                        .expect("failed to allocate the callback fiber"),
                };
                Fiber::swap_in(&f);
                match f.state() {
                    State::Ready => this.schedule_task(Task::from_fiber(f)),
                    // Finished: keep the fiber around for the next closure.
                    State::Term | State::Except => cb_fiber = Some(f),
                    _ => {
                        f.set_state(State::Hold);
                    }
                }
                core.active.fetch_sub(1, Ordering::SeqCst);
            }
            Some(_) => {
                core.active.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                // Both settled states end this worker; resuming a settled
                // fiber would land past its completion switch.
                if matches!(idle_fiber.state(), State::Term | State::Except) {
                    log::info!(
                        "scheduler {} worker {} idle fiber {:?}",
                        core.name,
                        tid,
                        idle_fiber.state()
                    );
                    break;
                }
                core.idle_workers.fetch_add(1, Ordering::SeqCst);
                Fiber::swap_in(&idle_fiber);
                core.idle_workers.fetch_sub(1, Ordering::SeqCst);
                if !matches!(idle_fiber.state(), State::Term | State::Except) {
                    idle_fiber.set_state(State::Hold);
                }
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Scheduler
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct SchedInner {
    core: SchedCore,
}

impl Dispatch for SchedInner {
    fn core(&self) -> &SchedCore {
        &self.core
    }
}

/// The base M:N scheduler.
///
/// Cheap to clone; all clones drive the same worker pool.
///
/// ```no_run
/// let sched = fibrio::scheduler::Scheduler::new(2, false, "work");
/// sched.start();
/// sched.schedule(|| println!("hello from a fiber"));
/// sched.stop();
/// ```
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedInner>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers. With `use_caller` the
    /// constructing thread counts as one of them and contributes its share
    /// while blocked in [`stop`](#method.stop).
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        let inner = Arc::new(SchedInner {
            core: SchedCore::new(threads, use_caller, name),
        });
        if use_caller {
            bind_caller(&inner);
        }
        Scheduler { inner }
    }

    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    /// Spawn the workers. Idempotent.
    pub fn start(&self) {
        start(&self.inner);
    }

    /// Drain all queued work and join the workers. If the constructing
    /// thread participates, it must be the one calling `stop`.
    pub fn stop(&self) {
        stop(&self.inner);
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
        self.inner.schedule_task(Task::from_job_to(Box::new(f), thread));
    }

    /// Queue an existing fiber for (re)execution.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.inner.schedule_task(Task::from_fiber(fiber));
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_reports_wake_need() {
        let core = SchedCore::new(1, false, "t");
        assert!(core.enqueue(Task::from_job(Box::new(|| {}))));
        assert!(!core.enqueue(Task::from_job(Box::new(|| {}))));
    }

    #[test]
    fn base_stopping_requires_all_conditions() {
        let core = SchedCore::new(1, false, "t");
        assert!(!core.base_stopping());
        core.auto_stop.store(true, Ordering::SeqCst);
        // `stopping` starts true before start(); queue empty, none active.
        assert!(core.base_stopping());
        core.enqueue(Task::from_job(Box::new(|| {})));
        assert!(!core.base_stopping());
    }
}
