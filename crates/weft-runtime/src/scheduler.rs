//! N:M cooperative scheduler
//!
//! A `Scheduler` owns a shared run queue and a set of worker threads, each
//! driving the same dispatch loop. Work items are fibers or plain
//! callbacks (wrapped in a fiber on first dispatch), optionally pinned to
//! one worker.
//!
//! The idle/wakeup policy lives behind the [`Driver`] trait so an I/O
//! reactor can park workers in `epoll_wait` instead of a condvar; the
//! default [`ParkDriver`] just parks. Each worker parks inside a dedicated
//! idle fiber so the dispatch loop itself never blocks.
//!
//! With `include_caller_thread` the constructing thread becomes worker 0:
//! its dispatch loop runs on a scheduling fiber that drains ready work
//! during `start`, suspends back to the caller whenever the queue is
//! empty, and is driven to completion by `stop`.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::Duration;

use weft_core::{env_get, wdebug, winfo, FiberState, WeftError, WeftResult};

use crate::fiber::{self, Fiber};
use crate::tls;

/// A unit of schedulable work.
pub enum Work {
    /// A fiber to resume (fresh or previously parked).
    Fiber(Arc<Fiber>),
    /// A bare callback; the dispatch loop wraps it in a fiber.
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

impl From<Arc<Fiber>> for Work {
    fn from(f: Arc<Fiber>) -> Self {
        Work::Fiber(f)
    }
}

struct Task {
    work: Work,
    /// Worker index this task is pinned to, if any.
    affinity: Option<usize>,
}

/// Idle/wakeup policy of a scheduler.
///
/// `idle` is called on a worker's idle fiber and must perform one bounded
/// wait, then return; the dispatch loop re-checks the queue between calls.
/// `tickle` must wake at least the workers a new task could run on.
/// `stopping` extends the base drain condition with the driver's own
/// pending work (a reactor only lets workers exit once no events or
/// timers remain).
pub trait Driver: Send + Sync + 'static {
    fn tickle(&self, sched: &Scheduler);
    fn idle(&self, sched: &Scheduler);
    fn stopping(&self, sched: &Scheduler) -> bool;
    /// Downcast support, for recovering the concrete driver from a
    /// scheduler.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Default driver: parks idle workers on a condvar.
pub struct ParkDriver {
    park_timeout: Duration,
}

impl ParkDriver {
    pub fn new() -> ParkDriver {
        ParkDriver {
            park_timeout: Duration::from_millis(env_get("WEFT_PARK_TIMEOUT_MS", 100u64)),
        }
    }
}

impl Default for ParkDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for ParkDriver {
    fn tickle(&self, sched: &Scheduler) {
        sched.parked.notify_all();
    }

    fn idle(&self, sched: &Scheduler) {
        // Checked before taking the queue lock; stopping() takes it too.
        if self.stopping(sched) {
            return;
        }
        let queue = sched.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.is_empty() {
            // Bounded: a missed tickle costs at most one timeout.
            let _ = sched.parked.wait_timeout(queue, self.park_timeout);
        }
    }

    fn stopping(&self, sched: &Scheduler) -> bool {
        sched.stopping()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct Scheduler {
    name: String,
    worker_count: usize,
    caller_is_worker: bool,
    queue: Mutex<VecDeque<Task>>,
    parked: Condvar,
    /// Workers currently inside a task.
    active: AtomicUsize,
    /// Workers currently inside their idle fiber.
    idle_workers: AtomicUsize,
    started: AtomicBool,
    stop_requested: AtomicBool,
    stopped: AtomicBool,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    /// Worker 0's scheduling fiber when the caller participates.
    caller_fiber: Mutex<Option<Arc<Fiber>>>,
    driver: OnceLock<Arc<dyn Driver>>,
    weak_self: Weak<Scheduler>,
}

thread_local! {
    static CURRENT_SCHED: std::cell::RefCell<Weak<Scheduler>> =
        const { std::cell::RefCell::new(Weak::new()) };
}

impl Scheduler {
    /// Create a scheduler with `worker_count` workers. With
    /// `include_caller_thread` the constructing thread is worker 0 and
    /// only `worker_count - 1` threads are spawned.
    pub fn new(worker_count: usize, include_caller_thread: bool, name: &str) -> Arc<Scheduler> {
        assert!(worker_count > 0, "scheduler needs at least one worker");
        Arc::new_cyclic(|weak| Scheduler {
            name: name.to_string(),
            worker_count,
            caller_is_worker: include_caller_thread,
            queue: Mutex::new(VecDeque::new()),
            parked: Condvar::new(),
            active: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            caller_fiber: Mutex::new(None),
            driver: OnceLock::new(),
            weak_self: weak.clone(),
        })
    }

    /// The scheduler driving the calling thread, if it is a worker.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHED.with(|c| c.borrow().upgrade())
    }

    /// Index of the calling worker thread within its scheduler.
    pub fn current_worker_id() -> Option<usize> {
        tls::worker_id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Install a custom idle/wakeup driver. Must be called before
    /// `start`; later calls are ignored.
    pub fn install_driver(&self, driver: Arc<dyn Driver>) {
        let _ = self.driver.set(driver);
    }

    pub fn driver(&self) -> Arc<dyn Driver> {
        self.driver
            .get_or_init(|| Arc::new(ParkDriver::new()))
            .clone()
    }

    /// Enqueue work runnable on any worker.
    pub fn schedule(&self, work: impl Into<Work>) {
        self.schedule_with_affinity(work, None);
    }

    /// Enqueue a plain callback.
    pub fn schedule_fn(&self, cb: impl FnOnce() + Send + 'static) {
        self.schedule_with_affinity(Work::Callback(Box::new(cb)), None);
    }

    /// Enqueue work, optionally pinned to one worker index.
    ///
    /// Safe from any thread, including from inside a running fiber.
    ///
    /// # Panics
    ///
    /// Panics if the scheduler has fully stopped.
    pub fn schedule_with_affinity(&self, work: impl Into<Work>, affinity: Option<usize>) {
        assert!(
            !self.stopped.load(Ordering::Acquire),
            "schedule on stopped scheduler {}",
            self.name
        );
        let was_empty = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            let was_empty = queue.is_empty();
            queue.push_back(Task {
                work: work.into(),
                affinity,
            });
            was_empty
        };
        if was_empty {
            self.driver().tickle(self);
        }
    }

    /// Spawn the worker threads. With caller participation this also
    /// drains any already-queued work on the calling thread before
    /// returning.
    pub fn start(self: &Arc<Self>) -> WeftResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(WeftError::Stopped);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(WeftError::AlreadyStarted);
        }
        winfo!("scheduler {} starting {} workers", self.name, self.worker_count);
        // Ensure the driver exists before any worker runs.
        let _ = self.driver();

        let spawn_count = if self.caller_is_worker {
            self.worker_count - 1
        } else {
            self.worker_count
        };
        let mut handles = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        for i in 0..spawn_count {
            let worker_id = if self.caller_is_worker { i + 1 } else { i };
            let sched = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", self.name, worker_id))
                .spawn(move || sched.run(worker_id, false))
                .map_err(|e| {
                    WeftError::Io(weft_core::IoError::Syscall(e.raw_os_error().unwrap_or(0)))
                })?;
            handles.push(handle);
        }
        drop(handles);

        if self.caller_is_worker {
            fiber::init_thread();
            let sched = Arc::clone(self);
            let run_fiber = Fiber::new(move || sched.run(0, true), None);
            *self.caller_fiber.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(run_fiber.clone());
            // Runs the dispatch loop until the queue drains, then suspends
            // back here. stop() re-enters it.
            run_fiber.resume();
        }
        Ok(())
    }

    /// Request a stop, drain remaining work and join every worker.
    /// Idempotent. With caller participation this must be called on the
    /// thread that called `start`.
    pub fn stop(self: &Arc<Self>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        winfo!("scheduler {} stopping", self.name);
        self.stop_requested.store(true, Ordering::Release);

        let driver = self.driver();
        for _ in 0..=self.worker_count {
            driver.tickle(self);
        }

        let caller = self
            .caller_fiber
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(run_fiber) = caller {
            if !run_fiber.state().is_terminated() {
                run_fiber.resume();
            }
        }

        let handles = std::mem::take(&mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.join();
        }
        self.stopped.store(true, Ordering::Release);
        winfo!("scheduler {} stopped", self.name);
    }

    /// Base drain condition: a stop was requested, the queue is empty and
    /// no worker is inside a task. Drivers may extend this.
    pub fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
            && self.active.load(Ordering::Acquire) == 0
            && self
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty()
    }

    /// Whether a stop has been requested (the queue may still hold work).
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// True while at least one worker sits in its idle fiber.
    pub fn has_idle_workers(&self) -> bool {
        self.idle_workers.load(Ordering::Acquire) > 0
    }

    /// Pop the first task this worker may run. Skips tasks pinned
    /// elsewhere (reporting them) and fibers still switching out on
    /// another worker.
    fn take_task(&self, worker_id: usize) -> (Option<Task>, bool) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let mut foreign_affinity = false;
        let mut idx = 0;
        while idx < queue.len() {
            let task = &queue[idx];
            if let Some(pin) = task.affinity {
                if pin != worker_id {
                    foreign_affinity = true;
                    idx += 1;
                    continue;
                }
            }
            if let Work::Fiber(f) = &task.work {
                // Scheduled by itself and not yet fully switched out;
                // leave it for a later pass.
                if f.state() == FiberState::Executing {
                    idx += 1;
                    continue;
                }
            }
            return (queue.remove(idx), foreign_affinity);
        }
        (None, foreign_affinity)
    }

    /// The dispatch loop every worker runs.
    fn run(self: &Arc<Self>, worker_id: usize, caller_mode: bool) {
        wdebug!("scheduler {} worker {} running", self.name, worker_id);
        tls::set_worker_id(worker_id);
        CURRENT_SCHED.with(|c| *c.borrow_mut() = self.weak_self.clone());
        fiber::init_thread();
        if caller_mode {
            // We are on a dedicated scheduling fiber.
            tls::set_sched_fiber(tls::current_ptr());
        } else {
            // The thread's root context is the scheduling fiber.
            tls::set_sched_fiber(tls::thread_fiber_ptr());
        }

        let driver = self.driver();
        let idle_fiber = {
            let sched = Arc::clone(self);
            let drv = driver.clone();
            Fiber::new(
                move || loop {
                    if drv.stopping(&sched) {
                        wdebug!("scheduler {} worker idle fiber exiting", sched.name);
                        break;
                    }
                    drv.idle(&sched);
                    fiber::yield_held();
                },
                None,
            )
        };

        let mut cb_fiber: Option<Arc<Fiber>> = None;
        loop {
            let (task, foreign_affinity) = self.take_task(worker_id);
            if foreign_affinity {
                // Someone else's pinned work is waiting; make sure they
                // are awake.
                driver.tickle(self);
            }

            match task {
                Some(Task {
                    work: Work::Fiber(f),
                    ..
                }) => {
                    self.active.fetch_add(1, Ordering::AcqRel);
                    f.resume();
                    self.active.fetch_sub(1, Ordering::AcqRel);
                    match f.state() {
                        FiberState::Ready => self.schedule(f),
                        s if s.is_terminated() => {}
                        // Parked; its continuation owns it now.
                        _ => f.set_state(FiberState::Held),
                    }
                }
                Some(Task {
                    work: Work::Callback(cb),
                    ..
                }) => {
                    let f = match cb_fiber.take() {
                        Some(f) => {
                            f.reset(cb);
                            f
                        }
                        None => Fiber::new(cb, None),
                    };
                    self.active.fetch_add(1, Ordering::AcqRel);
                    f.resume();
                    self.active.fetch_sub(1, Ordering::AcqRel);
                    match f.state() {
                        FiberState::Ready => self.schedule(f),
                        s if s.is_terminated() => cb_fiber = Some(f),
                        _ => f.set_state(FiberState::Held),
                    }
                }
                None => {
                    if caller_mode && !self.stop_requested() {
                        // Queue drained; hand the thread back to the
                        // caller until stop() re-enters us.
                        fiber::yield_held();
                        continue;
                    }
                    if idle_fiber.state().is_terminated() {
                        break;
                    }
                    self.idle_workers.fetch_add(1, Ordering::AcqRel);
                    idle_fiber.resume();
                    self.idle_workers.fetch_sub(1, Ordering::AcqRel);
                    if !idle_fiber.state().is_terminated() {
                        idle_fiber.set_state(FiberState::Held);
                    }
                }
            }
        }
        wdebug!("scheduler {} worker {} exiting", self.name, worker_id);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        debug_assert!(
            !self.started.load(Ordering::Acquire) || self.stopped.load(Ordering::Acquire),
            "scheduler {} dropped while running",
            self.name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_twice_fails() {
        let sched = Scheduler::new(1, false, "twice");
        sched.start().unwrap();
        assert_eq!(sched.start(), Err(WeftError::AlreadyStarted));
        sched.stop();
    }

    #[test]
    fn test_start_after_stop_fails() {
        let sched = Scheduler::new(1, false, "restart");
        sched.start().unwrap();
        sched.stop();
        assert_eq!(sched.start(), Err(WeftError::Stopped));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let sched = Scheduler::new(2, false, "idem");
        sched.start().unwrap();
        sched.stop();
        sched.stop();
    }
}
