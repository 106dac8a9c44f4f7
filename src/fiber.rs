//! Сooperative multitasking module
//!
//! With the fiber module, you can:
//! - create and run [fibers](struct.Fiber.html) — stackful coroutines with
//!   explicit suspension points,
//! - yield control back to the scheduler with [yield_to_ready()] and
//!   [yield_to_hold()],
//! - use a synchronization mechanism for fibers similar to condition
//!   variables ([Cond]).
//!
//! A fiber owns a fixed-size, guard-paged stack and a saved machine context.
//! Switching into a fiber is a plain `swapcontext` — no syscall into the
//! scheduler, no thread handoff. A fiber runs until it yields or returns;
//! fibers never preempt each other.
//!
//! Every thread that touches fibers has a distinguished *thread-main* fiber:
//! a fiber wrapper around the thread's native stack, materialized lazily by
//! [current()]. It has no allocated stack and no job; it exists so that
//! switching is uniform in both directions.
//!
//! [yield_to_ready()]: fn.yield_to_ready.html
//! [yield_to_hold()]: fn.yield_to_hold.html
//! [Cond]: struct.Cond.html
//! [current()]: fn.current.html

use std::cell::{RefCell, UnsafeCell};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::config;
use crate::scheduler;
use crate::Result;

pub mod cond;
pub use cond::Cond;

mod stack;
use stack::Stack;

/// A unit of work liftable into a fiber.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// The fiber currently executing on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    /// This thread's thread-main fiber.
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// State
////////////////////////////////////////////////////////////////////////////////

/// Life cycle of a fiber.
///
/// ```text
/// Init ──► Exec ──► Term
///           │ ▲       (or Except, if the job panicked)
///           ▼ │
///       Ready/Hold
/// ```
///
/// `Ready` means "requeue me immediately"; `Hold` means "park me — somebody
/// holding a reference (an event slot, a timer callback) will requeue me".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Init = 0,
    Ready = 1,
    Exec = 2,
    Hold = 3,
    Term = 4,
    Except = 5,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Init,
            1 => State::Ready,
            2 => State::Exec,
            3 => State::Hold,
            4 => State::Term,
            5 => State::Except,
            _ => unreachable!("invalid fiber state {}", v),
        }
    }

    /// States in which a fiber may be destroyed or rebound.
    fn is_settled(self) -> bool {
        matches!(self, State::Init | State::Term | State::Except)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

/// A stackful coroutine.
///
/// Fibers are shared (`Arc`) between the scheduler's queue and whatever
/// parked them (an event slot, a timer); the last holder's release frees the
/// stack. A fiber with no allocated stack is the thread-main fiber.
pub struct Fiber {
    id: u64,
    stack: Option<Stack>,
    state: AtomicU8,
    ctx: UnsafeCell<libc::ucontext_t>,
    job: UnsafeCell<Option<Job>>,
    /// Selects the completion trampoline: `true` returns to the thread-main
    /// fiber, `false` to the scheduler fiber.
    caller_return: bool,
}

// Safety: `ctx` and `job` are only touched by the single thread that has the
// fiber in `Exec` (or by the scheduler owner while the fiber is settled);
// `state` is atomic. The run loop's EXEC-skip guarantees a fiber is never
// resumed on two threads at once.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber running `f`, with the default stack size
    /// (`fiber.stack_size`, 1 MiB unless configured).
    ///
    /// The fiber starts in [`State::Init`]; nothing runs until it is
    /// scheduled or resumed.
    pub fn new<F>(f: F) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new_inner(Box::new(f), 0, false)
    }

    /// Create a fiber with an explicit stack size in bytes.
    pub fn with_stack_size<F>(stack_size: usize, f: F) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new_inner(Box::new(f), stack_size, false)
    }

    pub(crate) fn new_inner(job: Job, stack_size: usize, caller_return: bool) -> Result<Arc<Fiber>> {
        let stack_size = if stack_size == 0 {
            config::fiber_stack_size()
        } else {
            stack_size
        };
        let stack = Stack::new(stack_size)?;
        let fiber = Arc::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            stack: Some(stack),
            state: AtomicU8::new(State::Init as u8),
            ctx: UnsafeCell::new(unsafe { mem::zeroed() }),
            job: UnsafeCell::new(Some(job)),
            caller_return,
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        // The context must be initialized at the fiber's final address:
        // glibc's ucontext_t points into its own FPU save area, so the
        // struct may not move between getcontext and swapcontext.
        unsafe { fiber.init_context() };
        log::debug!("fiber {} created", fiber.id);
        Ok(fiber)
    }

    /// The thread-main fiber: no stack, no job, born running.
    fn thread_main_raw() -> Fiber {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            stack: None,
            state: AtomicU8::new(State::Exec as u8),
            ctx: UnsafeCell::new(unsafe { mem::zeroed() }),
            job: UnsafeCell::new(None),
            caller_return: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    /// Rebind the fiber to a new job, reusing its stack.
    ///
    /// Only legal while the fiber is settled (`Init`, `Term` or `Except`);
    /// anything else is a caller bug and aborts.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_job(Box::new(f))
    }

    pub(crate) fn reset_job(&self, job: Job) {
        assert!(self.stack.is_some(), "the thread-main fiber cannot be reset");
        let state = self.state();
        assert!(state.is_settled(), "fiber {} reset in state {:?}", self.id, state);
        // Safety: the fiber is settled, so no other thread is in its context
        // or touching its job slot.
        unsafe {
            *self.job.get() = Some(job);
            self.init_context();
        }
        self.set_state(State::Init);
    }

    /// # Safety
    /// The fiber must be at its final address and not currently executing.
    unsafe fn init_context(&self) {
        let ctx = self.ctx.get();
        let rc = libc::getcontext(ctx);
        assert_eq!(rc, 0, "getcontext");
        let stack = self.stack.as_ref().expect("context init requires a stack");
        (*ctx).uc_link = ptr::null_mut();
        (*ctx).uc_stack.ss_sp = stack.bottom() as *mut libc::c_void;
        (*ctx).uc_stack.ss_size = stack.size();
        if self.caller_return {
            libc::makecontext(ctx, caller_entry, 0);
        } else {
            libc::makecontext(ctx, main_entry, 0);
        }
    }

    /// Resume this fiber from the scheduler fiber.
    ///
    /// Returns when the fiber yields or terminates. The caller must keep a
    /// strong reference alive across the switch.
    pub(crate) fn swap_in(this: &Arc<Fiber>) {
        set_current(this.clone());
        assert_ne!(this.state(), State::Exec, "fiber {} resumed while running", this.id);
        this.set_state(State::Exec);
        let from = scheduler_return_target();
        unsafe { switch(&from, this) };
    }

    /// Switch from this fiber back to the scheduler fiber. The fiber's state
    /// must already be set (`Ready`/`Hold`/`Term`/`Except`).
    pub(crate) fn swap_out(&self) {
        let to = scheduler_return_target();
        set_current(to.clone());
        unsafe { switch(self, &to) };
    }

    /// Resume this fiber from the thread-main fiber (the caller-thread path,
    /// used by `stop()` to drain work on the constructing thread).
    pub(crate) fn call(this: &Arc<Fiber>) {
        set_current(this.clone());
        this.set_state(State::Exec);
        let main = ensure_thread_main();
        unsafe { switch(&main, this) };
    }

    /// Switch from this fiber back to the thread-main fiber.
    pub(crate) fn back(&self) {
        let main = ensure_thread_main();
        set_current(main.clone());
        unsafe { switch(self, &main) };
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            let state = self.state();
            assert!(
                state.is_settled(),
                "fiber {} dropped in state {:?}",
                self.id,
                state
            );
        } else {
            debug_assert!(unsafe { (*self.job.get()).is_none() });
        }
        log::debug!("fiber {} destroyed", self.id);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A failed context switch leaves both stacks in an unknown state; there is
/// nothing sensible to recover. This must stay fatal even when reached from
/// inside a fiber's job, where a panic would be caught by the trampoline and
/// misreported as an ordinary fiber failure — so abort instead of unwinding.
unsafe fn switch(from: &Fiber, to: &Fiber) {
    if libc::swapcontext(from.ctx.get(), to.ctx.get()) != 0 {
        log::error!(
            "swapcontext failed: {}",
            std::io::Error::last_os_error()
        );
        std::process::abort();
    }
}

/// Where a yielding fiber returns to: the scheduler fiber if this thread
/// runs a scheduler, the thread-main fiber otherwise.
fn scheduler_return_target() -> Arc<Fiber> {
    scheduler::main_fiber().unwrap_or_else(ensure_thread_main)
}

fn set_current(f: Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(f));
}

fn ensure_thread_main() -> Arc<Fiber> {
    if let Some(f) = THREAD_MAIN.with(|c| c.borrow().clone()) {
        return f;
    }
    let main = Arc::new(Fiber::thread_main_raw());
    let rc = unsafe { libc::getcontext(main.ctx.get()) };
    assert_eq!(rc, 0, "getcontext");
    THREAD_MAIN.with(|c| *c.borrow_mut() = Some(main.clone()));
    CURRENT.with(|c| {
        let mut cur = c.borrow_mut();
        if cur.is_none() {
            *cur = Some(main.clone());
        }
    });
    log::debug!("fiber {} is the thread-main fiber", main.id);
    main
}

////////////////////////////////////////////////////////////////////////////////
// Free functions
////////////////////////////////////////////////////////////////////////////////

/// The fiber currently executing on this thread.
///
/// On a thread that has not run any fiber yet this materializes the
/// thread-main fiber and returns it.
pub fn current() -> Arc<Fiber> {
    if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
        return f;
    }
    ensure_thread_main()
}

/// Id of the current fiber, or 0 when the thread has none yet.
pub fn current_id() -> u64 {
    CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id).unwrap_or(0))
}

/// Number of live fibers in the process (thread-main fibers included).
pub fn count() -> u64 {
    FIBER_COUNT.load(Ordering::Relaxed)
}

/// Yield to the scheduler and requeue the current fiber immediately.
pub fn yield_to_ready() {
    let cur = current();
    assert!(cur.stack.is_some(), "the thread-main fiber cannot yield");
    cur.set_state(State::Ready);
    yield_out(cur);
}

/// Yield to the scheduler and park.
///
/// The fiber will only run again when whoever holds a reference to it (an
/// event slot, a timer callback, a [`Cond`]) reschedules it.
pub fn yield_to_hold() {
    let cur = current();
    assert!(cur.stack.is_some(), "the thread-main fiber cannot yield");
    cur.set_state(State::Hold);
    yield_out(cur);
}

fn yield_out(cur: Arc<Fiber>) {
    // Drop our own strong reference before switching away: a parked fiber
    // that kept a reference on its own stack could never be freed by its
    // external holders. The resumer's reference keeps the fiber alive across
    // the switch itself.
    let raw: *const Fiber = Arc::as_ptr(&cur);
    drop(cur);
    unsafe { (*raw).swap_out() };
}

////////////////////////////////////////////////////////////////////////////////
// Trampolines
////////////////////////////////////////////////////////////////////////////////

extern "C" fn main_entry() {
    finish(run_job(), false)
}

extern "C" fn caller_entry() {
    finish(run_job(), true)
}

/// Run the fiber's job, converting a panic into the `Except` state. Returns
/// the raw fiber pointer with the strong reference already dropped.
fn run_job() -> *const Fiber {
    let cur = current();
    let job = unsafe { (*cur.job.get()).take() };
    match job {
        Some(f) => match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => cur.set_state(State::Term),
            Err(payload) => {
                cur.set_state(State::Except);
                log::error!("fiber {} panicked: {}", cur.id, panic_message(&payload));
            }
        },
        None => {
            cur.set_state(State::Except);
            log::error!("fiber {} resumed without a job", cur.id);
        }
    }
    let raw: *const Fiber = Arc::as_ptr(&cur);
    // The resumer still holds a strong reference until the switch below
    // returns control to it, so `raw` stays valid.
    drop(cur);
    raw
}

fn finish(raw: *const Fiber, to_caller: bool) {
    unsafe {
        if to_caller {
            (*raw).back();
        } else {
            (*raw).swap_out();
        }
    }
    unreachable!("terminated fiber resumed");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
