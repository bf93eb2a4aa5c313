//! End-to-end scheduler behavior across worker threads.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use weft_runtime::{yield_ready, Fiber, Scheduler, Work};

#[test]
fn callbacks_all_run_and_stop_drains() {
    let sched = Scheduler::new(3, false, "drain");
    sched.start().unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let h = hits.clone();
        sched.schedule_fn(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
    }

    // stop() must not return until every queued callback ran.
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 100);
}

#[test]
fn work_spreads_across_workers() {
    let sched = Scheduler::new(4, false, "spread");
    sched.start().unwrap();

    let seen = Arc::new(Mutex::new(HashSet::new()));
    for _ in 0..200 {
        let s = seen.clone();
        sched.schedule_fn(move || {
            if let Some(id) = Scheduler::current_worker_id() {
                s.lock().unwrap().insert(id);
            }
            std::thread::sleep(std::time::Duration::from_micros(200));
        });
    }
    sched.stop();

    // With 200 tasks across 4 workers at least two should get work.
    assert!(seen.lock().unwrap().len() >= 2);
}

#[test]
fn caller_thread_drains_during_start() {
    let sched = Scheduler::new(1, true, "caller");
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let h = hits.clone();
        sched.schedule_fn(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
    }

    // The sole worker is this thread; start() drains the early work.
    sched.start().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 10);

    let h = hits.clone();
    sched.schedule_fn(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 11);
}

#[test]
fn affinity_pins_to_worker() {
    let sched = Scheduler::new(3, false, "pin");
    sched.start().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..20 {
        let s = seen.clone();
        sched.schedule_with_affinity(
            Work::Callback(Box::new(move || {
                s.lock().unwrap().push(Scheduler::current_worker_id());
            })),
            Some(1),
        );
    }
    sched.stop();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 20);
    assert!(seen.iter().all(|id| *id == Some(1)));
}

#[test]
fn ready_yield_resumes_on_scheduler() {
    let sched = Scheduler::new(2, false, "yield");
    sched.start().unwrap();

    let steps = Arc::new(AtomicUsize::new(0));
    let s = steps.clone();
    sched.schedule_fn(move || {
        s.fetch_add(1, Ordering::SeqCst);
        yield_ready();
        s.fetch_add(1, Ordering::SeqCst);
        yield_ready();
        s.fetch_add(1, Ordering::SeqCst);
    });
    sched.stop();
    assert_eq!(steps.load(Ordering::SeqCst), 3);
}

#[test]
fn scheduled_fiber_runs_to_completion() {
    let sched = Scheduler::new(2, false, "fiber");
    sched.start().unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let fiber = Fiber::new(
        move || {
            h.fetch_add(1, Ordering::SeqCst);
            yield_ready();
            h.fetch_add(1, Ordering::SeqCst);
        },
        None,
    );
    sched.schedule(fiber);
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn panicking_task_does_not_kill_worker() {
    let sched = Scheduler::new(1, false, "panic");
    sched.start().unwrap();

    sched.schedule_fn(|| {
        panic!("task failure");
    });

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    sched.schedule_fn(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    sched.stop();

    // The worker survived the panic and ran the next task.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn self_reschedule_resumes_after_park() {
    let sched = Scheduler::new(2, false, "resched");
    sched.start().unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let sd = sched.clone();
    sched.schedule_fn(move || {
        h.fetch_add(1, Ordering::SeqCst);
        if h.load(Ordering::SeqCst) < 5 {
            // Requeue ourselves; the dispatch loop skips us until the
            // switch completes.
            if let Some(me) = weft_runtime::current() {
                sd.schedule(me);
            }
            weft_runtime::yield_held();
            h.fetch_add(1, Ordering::SeqCst);
        }
    });

    // Give the chain time to run before draining.
    std::thread::sleep(std::time::Duration::from_millis(200));
    sched.stop();
    assert!(hits.load(Ordering::SeqCst) >= 2);
}

#[test]
fn current_scheduler_visible_from_tasks() {
    let sched = Scheduler::new(1, false, "current");
    sched.start().unwrap();

    let name = Arc::new(Mutex::new(String::new()));
    let n = name.clone();
    sched.schedule_fn(move || {
        if let Some(s) = Scheduler::current() {
            *n.lock().unwrap() = s.name().to_string();
        }
    });
    sched.stop();
    assert_eq!(&*name.lock().unwrap(), "current");
}
