use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fibrio::fiber;
use fibrio::scheduler::Scheduler;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn runs_closures_queued_before_start() {
    init_logs();
    let sched = Scheduler::new(2, false, "pre_start");
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let h = hits.clone();
        sched.schedule(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
    }
    sched.start();
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 10);
}

#[test]
fn start_stop_without_work_is_a_noop() {
    init_logs();
    let sched = Scheduler::new(2, false, "empty");
    sched.start();
    sched.stop();
}

#[test]
fn fifo_order_on_a_single_worker() {
    init_logs();
    let sched = Scheduler::new(1, false, "fifo");
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..8 {
        let o = order.clone();
        sched.schedule(move || {
            o.lock().unwrap().push(i);
        });
    }
    sched.start();
    sched.stop();
    assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
}

#[test]
fn caller_thread_drains_the_queue_in_stop() {
    init_logs();
    let sched = Scheduler::new(1, true, "caller");
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let h = hits.clone();
        sched.schedule(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
    }
    sched.start();
    // No worker threads exist; the work runs here, inside stop().
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 5);
}

#[test]
fn yield_to_ready_requeues_behind_later_work() {
    init_logs();
    let sched = Scheduler::new(1, false, "yield");
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    sched.schedule(move || {
        o.lock().unwrap().push("a1");
        fiber::yield_to_ready();
        o.lock().unwrap().push("a2");
    });
    let o = order.clone();
    sched.schedule(move || {
        o.lock().unwrap().push("b");
    });

    sched.start();
    sched.stop();
    assert_eq!(*order.lock().unwrap(), vec!["a1", "b", "a2"]);
}

#[test]
fn scheduled_fibers_run_like_closures() {
    init_logs();
    let sched = Scheduler::new(1, false, "fibers");
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let f = fibrio::fiber::Fiber::new(move || {
        h.fetch_add(7, Ordering::SeqCst);
    })
    .unwrap();
    sched.schedule_fiber(f);
    sched.start();
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 7);
}
