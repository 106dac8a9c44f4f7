//! Timer management.
//!
//! A [`TimerManager`] keeps an ordered set of absolute deadlines (monotonic
//! milliseconds) and hands out [`Timer`] handles that can be cancelled,
//! re-anchored ([`Timer::refresh`]) or re-armed with a new period
//! ([`Timer::reset`]). The reactor embeds one manager and asks it for the
//! earliest deadline to bound its `epoll_wait`, then harvests expired
//! callbacks in batches and schedules them as ordinary fiber work.
//!
//! Timers at identical deadlines are totally ordered by a stable identity,
//! so harvesting is a single range split. A timer is due once its deadline
//! is strictly in the past; a deadline equal to the current tick reports a
//! zero wait and is collected on the next pass.

use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use once_cell::sync::OnceCell;

use crate::clock;

/// A monotonic clock regression larger than this flushes every pending
/// timer once (the clock has jumped; deadlines are meaningless).
const ROLLOVER_MS: u64 = 60 * 60 * 1000;

/// "No timer pending".
pub const NO_TIMER: u64 = u64::MAX;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type TimerCb = Arc<dyn Fn() + Send + Sync + 'static>;

/// Implemented by the reactor: called when an insertion produced a new
/// earliest deadline, so the `epoll_wait` timeout can be re-tightened.
pub(crate) trait TimerNotify: Send + Sync {
    fn on_timer_inserted_at_front(&self);
}

struct TimerShared {
    id: u64,
    recurring: bool,
    /// Interval for recurring timers, initial delay otherwise.
    period_ms: AtomicU64,
    /// Absolute deadline; only mutated under the owning set's write lock.
    deadline_ms: AtomicU64,
    /// `None` once fired (non-recurring) or cancelled.
    cb: Mutex<Option<TimerCb>>,
}

struct TimerSet {
    entries: BTreeMap<(u64, u64), Arc<TimerShared>>,
    previous_ms: u64,
}

pub(crate) struct TimerCore {
    set: RwLock<TimerSet>,
    /// True while a front-insertion notification is already pending, to
    /// avoid waking the reactor once per insertion.
    tickled: AtomicBool,
    notify: OnceCell<Weak<dyn TimerNotify>>,
}

////////////////////////////////////////////////////////////////////////////////
// Timer
////////////////////////////////////////////////////////////////////////////////

/// Handle to a pending timer.
///
/// Holds only a weak reference to its manager: a timer cannot keep a dead
/// reactor alive, and every operation on a handle whose manager is gone is a
/// no-op reporting `false`.
#[derive(Clone)]
pub struct Timer {
    shared: Arc<TimerShared>,
    core: Weak<TimerCore>,
}

impl Timer {
    /// Cancel the timer.
    ///
    /// Returns `false` if it already fired (and was not recurring), was
    /// already cancelled, or was harvested into a dispatch batch — a batched
    /// callback will still run once.
    pub fn cancel(&self) -> bool {
        let core = match self.core.upgrade() {
            Some(c) => c,
            None => return false,
        };
        let mut set = core.set.write().unwrap();
        let mut cb = self.shared.cb.lock().unwrap();
        if cb.is_none() {
            return false;
        }
        *cb = None;
        set.entries
            .remove(&(self.shared.deadline_ms.load(Ordering::SeqCst), self.shared.id));
        true
    }

    /// Re-anchor the deadline to `now + period` without changing the period.
    pub fn refresh(&self) -> bool {
        let core = match self.core.upgrade() {
            Some(c) => c,
            None => return false,
        };
        let at_front;
        {
            let mut set = core.set.write().unwrap();
            if self.shared.cb.lock().unwrap().is_none() {
                return false;
            }
            let old_key = (self.shared.deadline_ms.load(Ordering::SeqCst), self.shared.id);
            if set.entries.remove(&old_key).is_none() {
                return false;
            }
            let deadline = clock::monotonic_ms() + self.shared.period_ms.load(Ordering::SeqCst);
            self.shared.deadline_ms.store(deadline, Ordering::SeqCst);
            at_front = insert_locked(&core, &mut set, self.shared.clone());
        }
        if at_front {
            notify(&core);
        }
        true
    }

    /// Re-arm with a new period. With `from_now` the new deadline counts
    /// from the current time, otherwise from the timer's original anchor.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        if period_ms == self.shared.period_ms.load(Ordering::SeqCst) && !from_now {
            return false;
        }
        let core = match self.core.upgrade() {
            Some(c) => c,
            None => return false,
        };
        let at_front;
        {
            let mut set = core.set.write().unwrap();
            if self.shared.cb.lock().unwrap().is_none() {
                return false;
            }
            let old_deadline = self.shared.deadline_ms.load(Ordering::SeqCst);
            let old_key = (old_deadline, self.shared.id);
            if set.entries.remove(&old_key).is_none() {
                return false;
            }
            let start = if from_now {
                clock::monotonic_ms()
            } else {
                old_deadline - self.shared.period_ms.load(Ordering::SeqCst)
            };
            self.shared.period_ms.store(period_ms, Ordering::SeqCst);
            self.shared
                .deadline_ms
                .store(start + period_ms, Ordering::SeqCst);
            at_front = insert_locked(&core, &mut set, self.shared.clone());
        }
        if at_front {
            notify(&core);
        }
        true
    }

    /// Absolute deadline in monotonic milliseconds.
    pub fn deadline_ms(&self) -> u64 {
        self.shared.deadline_ms.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.shared.id)
            .field("deadline_ms", &self.deadline_ms())
            .field("recurring", &self.shared.recurring)
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// TimerManager
////////////////////////////////////////////////////////////////////////////////

/// An ordered set of deadlines with batch expiration.
pub struct TimerManager {
    core: Arc<TimerCore>,
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            core: Arc::new(TimerCore {
                set: RwLock::new(TimerSet {
                    entries: BTreeMap::new(),
                    previous_ms: clock::monotonic_ms(),
                }),
                tickled: AtomicBool::new(false),
                notify: OnceCell::new(),
            }),
        }
    }

    /// Bind the front-insertion hook. May be set at most once.
    pub(crate) fn set_notify(&self, notify: Weak<dyn TimerNotify>) {
        let _ = self.core.notify.set(notify);
    }

    /// Schedule `cb` to run once (or every, if `recurring`) `delay_ms`
    /// milliseconds from now.
    pub fn add_timer<F>(&self, delay_ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_cb(delay_ms, Arc::new(cb), recurring)
    }

    pub(crate) fn add_timer_cb(&self, delay_ms: u64, cb: TimerCb, recurring: bool) -> Timer {
        let shared = Arc::new(TimerShared {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            recurring,
            period_ms: AtomicU64::new(delay_ms),
            deadline_ms: AtomicU64::new(clock::monotonic_ms() + delay_ms),
            cb: Mutex::new(Some(cb)),
        });
        let timer = Timer {
            shared: shared.clone(),
            core: Arc::downgrade(&self.core),
        };
        let at_front;
        {
            let mut set = self.core.set.write().unwrap();
            at_front = insert_locked(&self.core, &mut set, shared);
        }
        if at_front {
            notify(&self.core);
        }
        timer
    }

    /// Like [`add_timer`](#method.add_timer), but the callback only fires
    /// while `cond` can still be upgraded. Used to couple a timeout to a
    /// pending operation: once the operation completes and drops the strong
    /// reference, the timeout quietly degrades to a no-op.
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
        self.add_timer(
            delay_ms,
            move || {
                if cond.upgrade().is_some() {
                    cb()
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline: 0 if already due,
    /// [`NO_TIMER`] if the set is empty.
    pub fn next_timer_ms(&self) -> u64 {
        let set = self.core.set.read().unwrap();
        self.core.tickled.store(false, Ordering::SeqCst);
        match set.entries.keys().next() {
            None => NO_TIMER,
            Some(&(deadline, _)) => {
                let now = clock::monotonic_ms();
                if now >= deadline {
                    0
                } else {
                    deadline - now
                }
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.core.set.read().unwrap().entries.is_empty()
    }

    /// Harvest every expired timer's callback.
    ///
    /// Recurring timers are re-anchored to `now + period` and reinserted;
    /// one-shot timers give up their callback. A detected clock rollover
    /// treats the entire set as expired.
    pub(crate) fn expired_callbacks(&self) -> Vec<TimerCb> {
        let now_ms = clock::monotonic_ms();
        {
            let set = self.core.set.read().unwrap();
            if set.entries.is_empty() {
                return Vec::new();
            }
        }

        let mut set = self.core.set.write().unwrap();
        let rollover = detect_rollover(now_ms, set.previous_ms);
        if rollover {
            log::warn!(
                "monotonic clock went back {} ms; flushing all timers",
                set.previous_ms.saturating_sub(now_ms)
            );
        }
        set.previous_ms = now_ms;

        let due = if rollover {
            mem::take(&mut set.entries)
        } else {
            // Split strictly below `now`: id 0 is never allocated, so the
            // split point sorts before every real entry at `now` itself.
            let rest = set.entries.split_off(&(now_ms, 0));
            mem::replace(&mut set.entries, rest)
        };

        let mut cbs = Vec::with_capacity(due.len());
        for (_, timer) in due {
            let mut cb_slot = timer.cb.lock().unwrap();
            if timer.recurring {
                if let Some(cb) = cb_slot.as_ref() {
                    cbs.push(cb.clone());
                }
                drop(cb_slot);
                let deadline = now_ms + timer.period_ms.load(Ordering::SeqCst);
                timer.deadline_ms.store(deadline, Ordering::SeqCst);
                set.entries.insert((deadline, timer.id), timer);
            } else if let Some(cb) = cb_slot.take() {
                drop(cb_slot);
                cbs.push(cb);
            }
        }
        cbs
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_locked(core: &TimerCore, set: &mut TimerSet, shared: Arc<TimerShared>) -> bool {
    let key = (shared.deadline_ms.load(Ordering::SeqCst), shared.id);
    set.entries.insert(key, shared);
    let is_front = set.entries.keys().next() == Some(&key);
    let at_front = is_front && !core.tickled.load(Ordering::SeqCst);
    if at_front {
        core.tickled.store(true, Ordering::SeqCst);
    }
    at_front
}

fn notify(core: &TimerCore) {
    if let Some(n) = core.notify.get().and_then(Weak::upgrade) {
        n.on_timer_inserted_at_front();
    }
}

fn detect_rollover(now_ms: u64, previous_ms: u64) -> bool {
    now_ms < previous_ms.saturating_sub(ROLLOVER_MS)
}
