use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use fibrio::reactor::Reactor;
use fibrio::timer::Timer;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn one_shot_timer_fires_once() {
    init_logs();
    let iom = Reactor::new(1, false, "timer_once").unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    iom.add_timer(
        100,
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    thread::sleep(Duration::from_millis(400));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    iom.stop();
}

#[test]
fn recurring_timer_fires_thrice_then_cancels_itself() {
    init_logs();
    let iom = Reactor::new(1, false, "timer_rec").unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));

    let c = count.clone();
    let s = slot.clone();
    let timer = iom.add_timer(
        200,
        move || {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 3 {
                if let Some(t) = s.lock().unwrap().as_ref() {
                    assert!(t.cancel());
                }
            }
        },
        true,
    );
    *slot.lock().unwrap() = Some(timer);

    // Fires at ~200/400/600 ms; a fourth firing would land at ~800 ms.
    thread::sleep(Duration::from_millis(1100));
    assert_eq!(count.load(Ordering::SeqCst), 3);
    iom.stop();
}

#[test]
fn cancelled_timer_never_fires() {
    init_logs();
    let iom = Reactor::new(1, false, "timer_cancel").unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let timer = iom.add_timer(
        150,
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    assert!(timer.cancel());
    assert!(!timer.cancel());
    thread::sleep(Duration::from_millis(400));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    iom.stop();
}

#[test]
fn condition_timer_noops_once_the_condition_dies() {
    init_logs();
    let iom = Reactor::new(1, false, "timer_cond").unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let cond = Arc::new(());
    let f = fired.clone();
    iom.add_condition_timer(
        80,
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        Arc::downgrade(&cond),
        false,
    );
    drop(cond);

    let live = Arc::new(());
    let f = fired.clone();
    iom.add_condition_timer(
        80,
        move || {
            f.fetch_add(10, Ordering::SeqCst);
        },
        Arc::downgrade(&live),
        false,
    );

    thread::sleep(Duration::from_millis(400));
    assert_eq!(fired.load(Ordering::SeqCst), 10);
    drop(live);
    iom.stop();
}

#[test]
fn refresh_pushes_the_deadline_out() {
    init_logs();
    let iom = Reactor::new(1, false, "timer_refresh").unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let timer = iom.add_timer(
        300,
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    thread::sleep(Duration::from_millis(200));
    assert!(timer.refresh());
    // Without the refresh this would have fired at ~300 ms.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    thread::sleep(Duration::from_millis(250));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    iom.stop();
}
