use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fibrio::coio::{self, CoListener, CoStream};
use fibrio::fd::fd_manager;
use fibrio::fiber;
use fibrio::reactor::{Event, Reactor};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Two fibers sleeping 1 s and 1.5 s on one worker overlap instead of
/// serializing: the whole run takes about as long as the longest sleep.
#[test]
fn sleeps_overlap_on_a_single_worker() {
    init_logs();
    let iom = Reactor::new(1, false, "hook_sleep").unwrap();
    let t0 = Instant::now();
    let first_ms = Arc::new(AtomicU64::new(0));
    let second_ms = Arc::new(AtomicU64::new(0));

    let f = first_ms.clone();
    iom.schedule(move || {
        coio::sleep(Duration::from_millis(1000));
        f.store(t0.elapsed().as_millis() as u64, Ordering::SeqCst);
    });
    let s = second_ms.clone();
    let t1 = Instant::now();
    iom.schedule(move || {
        coio::sleep(Duration::from_millis(1500));
        s.store(t1.elapsed().as_millis() as u64, Ordering::SeqCst);
    });

    iom.stop();
    let total = t0.elapsed();

    let first = first_ms.load(Ordering::SeqCst);
    let second = second_ms.load(Ordering::SeqCst);
    assert!(first >= 1000, "first sleep resumed after {} ms", first);
    assert!(second >= 1500, "second sleep resumed after {} ms", second);
    assert!(
        total >= Duration::from_millis(1500) && total < Duration::from_millis(2400),
        "sleeps serialized: total {:?}",
        total
    );
}

/// A cooperative TCP client against a plain blocking server: connect rides
/// writable-readiness, send/recv park the fiber, the reply arrives intact.
#[test]
fn cooperative_tcp_client_roundtrip() {
    init_logs();
    let iom = Reactor::new(1, false, "hook_tcp").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        assert!(buf[..n].starts_with(b"GET / HTTP/1.0"));
        stream.write_all(b"HTTP/1.0 200 OK\r\n\r\nhello").unwrap();
    });

    let done = Arc::new(AtomicBool::new(false));
    let d = done.clone();
    iom.schedule(move || {
        let mut stream = CoStream::connect(addr).unwrap();
        stream.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).unwrap();
        assert!(reply.starts_with(b"HTTP/1.0 200 OK"));
        assert!(reply.ends_with(b"hello"));
        d.store(true, Ordering::SeqCst);
    });

    iom.stop();
    server.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
}

/// A receive timeout resumes the parked fiber with `ETIMEDOUT`; data that
/// arrives in time makes the very same call succeed and the condition timer
/// a no-op.
#[test]
fn recv_times_out_and_early_data_wins() {
    init_logs();
    let iom = Reactor::new(1, false, "hook_timeout").unwrap();

    // Case 1: a mute server; the 400 ms receive timeout must fire.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mute = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        // Hold the connection open past the client timeout.
        thread::sleep(Duration::from_millis(1200));
        drop(stream);
    });

    let timed_out = Arc::new(AtomicBool::new(false));
    let t = timed_out.clone();
    iom.schedule(move || {
        let mut stream = CoStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(400)))
            .unwrap();
        let start = Instant::now();
        let mut buf = [0u8; 16];
        let err = stream.read(&mut buf).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ETIMEDOUT));
        assert!(start.elapsed() >= Duration::from_millis(380));
        t.store(true, Ordering::SeqCst);
    });

    // Case 2: data arrives before the timeout; read returns it.
    let listener2 = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr2 = listener2.local_addr().unwrap();
    let chatty = thread::spawn(move || {
        let (mut stream, _) = listener2.accept().unwrap();
        thread::sleep(Duration::from_millis(150));
        stream.write_all(b"ping").unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let got_data = Arc::new(AtomicBool::new(false));
    let g = got_data.clone();
    iom.schedule(move || {
        let mut stream = CoStream::connect(addr2).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(1000)))
            .unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        g.store(true, Ordering::SeqCst);
    });

    iom.stop();
    mute.join().unwrap();
    chatty.join().unwrap();
    assert!(timed_out.load(Ordering::SeqCst));
    assert!(got_data.load(Ordering::SeqCst));
}

/// A fiber-side listener accepts a connection from a plain client and
/// echoes one message.
#[test]
fn cooperative_listener_accepts_and_echoes() {
    init_logs();
    let iom = Reactor::new(1, false, "hook_accept").unwrap();

    let listener = CoListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let served = Arc::new(AtomicBool::new(false));
    let s = served.clone();
    iom.schedule(move || {
        let mut stream = listener.accept().unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).unwrap();
        stream.write_all(&buf[..n]).unwrap();
        s.store(true, Ordering::SeqCst);
    });

    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"echo").unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"echo");
    });

    client.join().unwrap();
    iom.stop();
    assert!(served.load(Ordering::SeqCst));
}

/// With `use_caller` the constructing thread is the only worker: sleeps
/// and timers drain while it is blocked in `stop()`.
#[test]
fn caller_thread_reactor_drains_in_stop() {
    init_logs();
    let iom = Reactor::new(1, true, "hook_caller").unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let d = done.clone();
    iom.schedule(move || {
        coio::sleep(Duration::from_millis(300));
        d.store(true, Ordering::SeqCst);
    });
    assert!(!done.load(Ordering::SeqCst));
    let t0 = Instant::now();
    iom.stop();
    assert!(done.load(Ordering::SeqCst));
    assert!(t0.elapsed() >= Duration::from_millis(300));
}

/// Closing an fd with parked readers *and* writers resumes both, and the
/// runtime forgets the fd.
#[test]
fn close_resumes_both_parked_sides() {
    init_logs();
    let iom = Reactor::new(2, false, "hook_close").unwrap();

    let mut sv = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sv.as_mut_ptr()) };
    assert_eq!(rc, 0);
    let (fd, peer) = (sv[0], sv[1]);
    let ctx = fd_manager().get(fd, true).unwrap();

    // Stuff the send buffer so a WRITE interest genuinely parks.
    let small: libc::c_int = 4096;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &small as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    let junk = [0u8; 4096];
    loop {
        let n = unsafe {
            libc::send(
                fd,
                junk.as_ptr() as *const libc::c_void,
                junk.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if n < 0 {
            break;
        }
    }

    let reader_woke = Arc::new(AtomicBool::new(false));
    let writer_woke = Arc::new(AtomicBool::new(false));

    let worker = iom.clone();
    let r = reader_woke.clone();
    iom.schedule(move || {
        worker.add_event(fd, Event::READ).unwrap();
        fiber::yield_to_hold();
        r.store(true, Ordering::SeqCst);
    });
    let worker = iom.clone();
    let w = writer_woke.clone();
    iom.schedule(move || {
        worker.add_event(fd, Event::WRITE).unwrap();
        fiber::yield_to_hold();
        w.store(true, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(300));
    assert_eq!(iom.pending_events(), 2);
    assert!(!reader_woke.load(Ordering::SeqCst));
    assert!(!writer_woke.load(Ordering::SeqCst));

    // Close from inside the reactor, like a hooked close would run.
    iom.schedule(move || {
        coio::close(fd).unwrap();
    });

    thread::sleep(Duration::from_millis(300));
    assert!(reader_woke.load(Ordering::SeqCst));
    assert!(writer_woke.load(Ordering::SeqCst));
    assert_eq!(iom.pending_events(), 0);
    assert!(ctx.is_closed());

    iom.stop();
    unsafe { libc::close(peer) };
}
