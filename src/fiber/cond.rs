//! Conditional variable for cooperative multitasking (fibers).
//!
//! A cond (short for "condition variable") is a synchronization primitive
//! that allows fibers to yield until some predicate is satisfied. Fiber
//! conditions have two basic operations - [wait()](struct.Cond.html#method.wait)
//! and [signal()](struct.Cond.html#method.signal). `wait()` suspends
//! execution of the current fiber (i.e. parks it) until `signal()` is
//! called; `signal()` requeues one parked fiber on the scheduler it was
//! running on.
//!
//! Like pthread conds, waiters must tolerate spurious wake ups: re-check the
//! actual predicate in a loop around `wait()`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use crate::fiber;
use crate::scheduler::{self, Dispatch, Task};

/// A waiter is the parked fiber plus the scheduler that owns it.
struct Waiter {
    owner: Weak<dyn Dispatch>,
    fiber: Arc<fiber::Fiber>,
}

/// Condition variable for fibers.
///
/// ```no_run
/// use std::sync::Arc;
/// use fibrio::fiber::Cond;
///
/// let cond = Arc::new(Cond::new());
/// // fiber A:
/// cond.wait();
/// // fiber B (same scheduler):
/// cond.signal();
/// ```
#[derive(Default)]
pub struct Cond {
    waiters: Mutex<VecDeque<Waiter>>,
}

impl Cond {
    /// Instantiate a new fiber cond object.
    pub fn new() -> Self {
        Cond {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Park the current fiber until [signal()](#method.signal) is called.
    ///
    /// Must be called from a fiber running on a scheduler; the thread-main
    /// fiber cannot park.
    pub fn wait(&self) {
        let owner = scheduler::current_dispatch()
            .expect("Cond::wait requires a scheduler on this thread");
        let cur = fiber::current();
        self.waiters.lock().unwrap().push_back(Waiter {
            owner,
            fiber: cur,
        });
        fiber::yield_to_hold();
    }

    /// Wake one parked fiber. Does nothing if no one is waiting. Does not
    /// yield.
    pub fn signal(&self) {
        let waiter = self.waiters.lock().unwrap().pop_front();
        if let Some(w) = waiter {
            wake(w);
        }
    }

    /// Wake all parked fibers. Does not yield.
    pub fn broadcast(&self) {
        let drained: Vec<Waiter> = self.waiters.lock().unwrap().drain(..).collect();
        for w in drained {
            wake(w);
        }
    }
}

fn wake(w: Waiter) {
    if let Some(owner) = w.owner.upgrade() {
        owner.schedule_task(Task::from_fiber(w.fiber));
    } else {
        log::warn!(
            "cond waiter fiber {} dropped: its scheduler is gone",
            w.fiber.id()
        );
    }
}

impl std::fmt::Debug for Cond {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cond").finish_non_exhaustive()
    }
}
