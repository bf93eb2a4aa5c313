//! Reactor event registration, cancellation and timer dispatch.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use weft_io::{IoEvent, IoManager};

fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn write_byte(fd: RawFd) {
    assert_eq!(
        unsafe { libc::write(fd, b"x".as_ptr() as *const libc::c_void, 1) },
        1
    );
}

fn close_fd(fd: RawFd) {
    unsafe { libc::close(fd) };
}

#[test]
fn readiness_schedules_callback() {
    let mgr = IoManager::new(2, false, "io-ready").unwrap();
    let (r, w) = pipe_pair();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    mgr.add_event(r, IoEvent::Read, Some(Box::new(move || {
        h.fetch_add(1, Ordering::SeqCst);
    })))
    .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    write_byte(w);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    mgr.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn registration_is_one_shot() {
    let mgr = IoManager::new(1, false, "io-oneshot").unwrap();
    let (r, w) = pipe_pair();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    mgr.add_event(r, IoEvent::Read, Some(Box::new(move || {
        h.fetch_add(1, Ordering::SeqCst);
    })))
    .unwrap();

    write_byte(w);
    std::thread::sleep(Duration::from_millis(100));
    write_byte(w);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    mgr.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn cancel_event_runs_handler() {
    let mgr = IoManager::new(1, false, "io-cancel").unwrap();
    let (r, w) = pipe_pair();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    mgr.add_event(r, IoEvent::Read, Some(Box::new(move || {
        h.fetch_add(1, Ordering::SeqCst);
    })))
    .unwrap();

    // No data was ever written; cancellation fires the handler anyway.
    mgr.cancel_event(r, IoEvent::Read).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert!(mgr.cancel_event(r, IoEvent::Read).is_err());

    mgr.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn del_event_discards_handler() {
    let mgr = IoManager::new(1, false, "io-del").unwrap();
    let (r, w) = pipe_pair();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    mgr.add_event(r, IoEvent::Read, Some(Box::new(move || {
        h.fetch_add(1, Ordering::SeqCst);
    })))
    .unwrap();
    mgr.del_event(r, IoEvent::Read).unwrap();

    write_byte(w);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    assert!(mgr.del_event(r, IoEvent::Read).is_err());

    mgr.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn hangup_wakes_read_waiter() {
    let mgr = IoManager::new(1, false, "io-hup").unwrap();

    let mut fds = [0 as RawFd; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
        0
    );
    let (a, b) = (fds[0], fds[1]);

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    mgr.add_event(a, IoEvent::Read, Some(Box::new(move || {
        h.fetch_add(1, Ordering::SeqCst);
    })))
    .unwrap();

    // Peer close raises EPOLLHUP; it must surface as read readiness.
    close_fd(b);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    mgr.stop();
    close_fd(a);
}

#[test]
fn cancel_all_fires_pending_handlers() {
    let mgr = IoManager::new(1, false, "io-cancel-all").unwrap();
    let (r, w) = pipe_pair();

    let hits = Arc::new(AtomicUsize::new(0));
    let h1 = hits.clone();
    mgr.add_event(r, IoEvent::Read, Some(Box::new(move || {
        h1.fetch_add(1, Ordering::SeqCst);
    })))
    .unwrap();
    let h2 = hits.clone();
    mgr.add_event(w, IoEvent::Write, Some(Box::new(move || {
        h2.fetch_add(10, Ordering::SeqCst);
    })))
    .unwrap();

    // An empty pipe's write end is immediately writable.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 10);

    mgr.cancel_all(r).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 11);

    mgr.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn ready_direction_fires_other_stays_registered() {
    let mgr = IoManager::new(1, false, "io-both").unwrap();

    let mut fds = [0 as RawFd; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
        0
    );
    let (a, b) = (fds[0], fds[1]);

    let reads = Arc::new(AtomicUsize::new(0));
    let writes = Arc::new(AtomicUsize::new(0));

    let r = reads.clone();
    mgr.add_event(a, IoEvent::Read, Some(Box::new(move || {
        r.fetch_add(1, Ordering::SeqCst);
    })))
    .unwrap();
    let w = writes.clone();
    mgr.add_event(a, IoEvent::Write, Some(Box::new(move || {
        w.fetch_add(1, Ordering::SeqCst);
    })))
    .unwrap();

    // The socket is writable but has nothing to read: only the write
    // handler fires; the read registration survives it.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(writes.load(Ordering::SeqCst), 1);
    assert_eq!(reads.load(Ordering::SeqCst), 0);

    write_byte(b);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(reads.load(Ordering::SeqCst), 1);

    mgr.stop();
    close_fd(a);
    close_fd(b);
}

#[test]
fn timer_callbacks_run_on_workers() {
    let mgr = IoManager::new(1, false, "io-timer").unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    mgr.timers().add_timer(
        50,
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    mgr.stop();
}

#[test]
fn recurring_timer_fires_until_cancelled() {
    let mgr = IoManager::new(1, false, "io-recur").unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let handle = mgr.timers().add_timer(
        20,
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    std::thread::sleep(Duration::from_millis(250));
    assert!(mgr.timers().cancel(handle));
    let fired = hits.load(Ordering::SeqCst);
    assert!(fired >= 3, "recurring timer fired {} times", fired);

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), fired);

    mgr.stop();
}
