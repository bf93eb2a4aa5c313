//! epoll reactor driving a scheduler
//!
//! `IoManager` couples a [`Scheduler`] with an edge-triggered epoll
//! instance and a [`TimerManager`]. Workers park inside `epoll_wait`
//! (bounded by the earliest timer deadline) instead of a condvar; a pipe
//! serves as the wake channel for `tickle`.
//!
//! Registrations are one-shot: when a readiness event fires, the handler
//! is unregistered and scheduled. At most one handler per direction per
//! descriptor may be armed; arming a second is a caller bug and asserts.

use std::any::Any;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use weft_core::{werror, wtrace, FiberState, IoError, WeftError, WeftResult};
use weft_runtime::{
    fiber,
    scheduler::{Driver, Scheduler, Work},
    timer::TimerManager,
    Fiber,
};

use crate::sys;

/// Cap on a single idle wait, so stop requests and missed wakeups are
/// noticed within a bounded time.
const MAX_IDLE_TIMEOUT_MS: u64 = 3000;

const EVENT_BUF_SIZE: usize = 256;

thread_local! {
    // One event buffer per worker, reused across idle passes. idle()
    // never reenters itself on a thread, so the borrow is exclusive.
    static EVENT_BUF: RefCell<Vec<libc::epoll_event>> = const { RefCell::new(Vec::new()) };
}

/// One readiness direction on a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    Read,
    Write,
}

impl IoEvent {
    #[inline]
    fn bits(self) -> u32 {
        match self {
            IoEvent::Read => libc::EPOLLIN as u32,
            IoEvent::Write => libc::EPOLLOUT as u32,
        }
    }
}

/// What to do when a registered event fires.
enum EventHandler {
    /// Requeue a parked fiber.
    Fiber { sched: Arc<Scheduler>, fiber: Arc<Fiber> },
    /// Run a callback as fresh work.
    Callback {
        sched: Arc<Scheduler>,
        cb: Box<dyn FnOnce() + Send + 'static>,
    },
}

#[derive(Default)]
struct FdEvents {
    /// EPOLLIN/EPOLLOUT bits currently armed in the epoll set.
    registered: u32,
    read: Option<EventHandler>,
    write: Option<EventHandler>,
}

struct FdContext {
    fd: RawFd,
    inner: Mutex<FdEvents>,
}

pub struct IoManager {
    scheduler: Arc<Scheduler>,
    timers: TimerManager,
    epfd: RawFd,
    tickle_r: RawFd,
    tickle_w: RawFd,
    contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
    /// Armed (not yet fired) event registrations.
    pending: AtomicUsize,
}

impl IoManager {
    /// Create the reactor, wire it into a new scheduler as its driver and
    /// start the workers.
    pub fn new(
        worker_count: usize,
        include_caller_thread: bool,
        name: &str,
    ) -> WeftResult<Arc<IoManager>> {
        let epfd = sys::epoll_create()?;
        let (tickle_r, tickle_w) = match sys::wake_pipe() {
            Ok(p) => p,
            Err(e) => {
                unsafe { libc::close(epfd) };
                return Err(e);
            }
        };
        // Edge-triggered so one byte in the pipe wakes one parked worker.
        sys::epoll_ctl(
            epfd,
            libc::EPOLL_CTL_ADD,
            tickle_r,
            (libc::EPOLLIN | libc::EPOLLET) as u32,
        )?;

        let scheduler = Scheduler::new(worker_count, include_caller_thread, name);
        let mgr = Arc::new(IoManager {
            scheduler: scheduler.clone(),
            timers: TimerManager::new(),
            epfd,
            tickle_r,
            tickle_w,
            contexts: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
        });

        // A new earliest deadline must shorten an in-flight epoll_wait.
        let weak = Arc::downgrade(&mgr);
        mgr.timers.set_front_waker(move || {
            if let Some(mgr) = weak.upgrade() {
                mgr.wake();
            }
        });

        scheduler.install_driver(mgr.clone());
        scheduler.start()?;
        Ok(mgr)
    }

    /// The reactor driving the calling thread's scheduler, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        let sched = Scheduler::current()?;
        sched.driver().as_any().downcast::<IoManager>().ok()
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Enqueue work on the underlying scheduler.
    pub fn schedule(&self, work: impl Into<Work>) {
        self.scheduler.schedule(work);
    }

    pub fn schedule_fn(&self, cb: impl FnOnce() + Send + 'static) {
        self.scheduler.schedule_fn(cb);
    }

    /// Stop the scheduler once queued work, armed events and timers have
    /// drained.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    fn context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let contexts = self.contexts.read().unwrap_or_else(|e| e.into_inner());
        contexts.get(fd as usize).cloned().flatten()
    }

    fn ensure_context(&self, fd: RawFd) -> WeftResult<Arc<FdContext>> {
        if fd < 0 {
            return Err(IoError::BadDescriptor.into());
        }
        if let Some(ctx) = self.context(fd) {
            return Ok(ctx);
        }
        let mut contexts = self.contexts.write().unwrap_or_else(|e| e.into_inner());
        let idx = fd as usize;
        if idx >= contexts.len() {
            let new_len = (idx + 1).max(contexts.len() * 3 / 2);
            contexts.resize(new_len, None);
        }
        if contexts[idx].is_none() {
            contexts[idx] = Some(Arc::new(FdContext {
                fd,
                inner: Mutex::new(FdEvents::default()),
            }));
        }
        Ok(contexts[idx].clone().unwrap_or_else(|| unreachable!()))
    }

    /// Register interest in one readiness direction of `fd`.
    ///
    /// With a callback, it is scheduled when the event fires; without one,
    /// the currently running fiber is parked-and-requeued (the caller must
    /// `yield_held` right after). The registration is one-shot.
    ///
    /// # Panics
    ///
    /// Panics if the direction is already armed for this descriptor, or
    /// if no callback is given and the caller is not inside a fiber.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: IoEvent,
        cb: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> WeftResult<()> {
        let ctx = self.ensure_context(fd)?;
        let mut inner = ctx.inner.lock().unwrap_or_else(|e| e.into_inner());

        assert!(
            inner.registered & event.bits() == 0,
            "event {:?} already registered for fd {}",
            event,
            fd
        );

        let sched = Scheduler::current().unwrap_or_else(|| self.scheduler.clone());
        let handler = match cb {
            Some(cb) => EventHandler::Callback { sched, cb },
            None => {
                let fiber = fiber::current()
                    .unwrap_or_else(|| panic!("add_event without callback outside a fiber"));
                assert_eq!(fiber.state(), FiberState::Executing);
                EventHandler::Fiber { sched, fiber }
            }
        };

        let op = if inner.registered == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let new_events = inner.registered | event.bits();
        sys::epoll_ctl(self.epfd, op, fd, libc::EPOLLET as u32 | new_events)?;

        inner.registered = new_events;
        match event {
            IoEvent::Read => inner.read = Some(handler),
            IoEvent::Write => inner.write = Some(handler),
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        wtrace!("fd {} armed {:?}", fd, event);
        Ok(())
    }

    /// Unregister one direction without running its handler.
    pub fn del_event(&self, fd: RawFd, event: IoEvent) -> WeftResult<()> {
        let ctx = self.context(fd).ok_or(WeftError::Io(IoError::EventMissing))?;
        let mut inner = ctx.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.registered & event.bits() == 0 {
            return Err(IoError::EventMissing.into());
        }
        self.disarm(&mut inner, fd, event.bits())?;
        let dropped = match event {
            IoEvent::Read => inner.read.take(),
            IoEvent::Write => inner.write.take(),
        };
        drop(dropped);
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Unregister one direction and run its handler as if the event had
    /// fired.
    pub fn cancel_event(&self, fd: RawFd, event: IoEvent) -> WeftResult<()> {
        let ctx = self.context(fd).ok_or(WeftError::Io(IoError::EventMissing))?;
        let mut inner = ctx.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.registered & event.bits() == 0 {
            return Err(IoError::EventMissing.into());
        }
        self.disarm(&mut inner, fd, event.bits())?;
        self.fire(&mut inner, event);
        Ok(())
    }

    /// Cancel every registration on `fd`, running the handlers.
    pub fn cancel_all(&self, fd: RawFd) -> WeftResult<()> {
        let ctx = self.context(fd).ok_or(WeftError::Io(IoError::EventMissing))?;
        let mut inner = ctx.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.registered == 0 {
            return Err(IoError::EventMissing.into());
        }
        let bits = inner.registered;
        self.disarm(&mut inner, fd, bits)?;
        if bits & IoEvent::Read.bits() != 0 {
            self.fire(&mut inner, IoEvent::Read);
        }
        if bits & IoEvent::Write.bits() != 0 {
            self.fire(&mut inner, IoEvent::Write);
        }
        debug_assert_eq!(inner.registered, 0);
        Ok(())
    }

    /// Remove `bits` from the armed set, updating the epoll registration.
    fn disarm(&self, inner: &mut FdEvents, fd: RawFd, bits: u32) -> WeftResult<()> {
        let remaining = inner.registered & !bits;
        let op = if remaining == 0 {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        sys::epoll_ctl(self.epfd, op, fd, libc::EPOLLET as u32 | remaining)?;
        inner.registered = remaining;
        Ok(())
    }

    /// Hand a direction's handler to its scheduler. The armed bit must
    /// already be cleared.
    fn fire(&self, inner: &mut FdEvents, event: IoEvent) {
        let handler = match event {
            IoEvent::Read => inner.read.take(),
            IoEvent::Write => inner.write.take(),
        };
        let Some(handler) = handler else { return };
        self.pending.fetch_sub(1, Ordering::AcqRel);
        match handler {
            EventHandler::Fiber { sched, fiber } => sched.schedule(fiber),
            EventHandler::Callback { sched, cb } => sched.schedule(Work::Callback(cb)),
        }
    }

    /// Poke one parked worker out of `epoll_wait`.
    fn wake(&self) {
        let buf = [b'T'];
        unsafe { libc::write(self.tickle_w, buf.as_ptr() as *const libc::c_void, 1) };
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.tickle_r,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Process one batch of ready descriptors.
    fn dispatch_events(&self, events: &[libc::epoll_event]) {
        for ev in events {
            let fd = ev.u64 as RawFd;
            if fd == self.tickle_r {
                self.drain_wake_pipe();
                continue;
            }
            let Some(ctx) = self.context(fd) else { continue };
            let mut inner = ctx.inner.lock().unwrap_or_else(|e| e.into_inner());

            // An error or hangup must wake whoever is waiting, whichever
            // direction they registered.
            let mut real = ev.events;
            if real & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                real |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.registered;
            }
            let firing =
                real & inner.registered & (libc::EPOLLIN | libc::EPOLLOUT) as u32;
            if firing == 0 {
                continue;
            }

            if let Err(e) = self.disarm(&mut inner, ctx.fd, firing) {
                werror!("disarm of fd {} failed: {}", ctx.fd, e);
                continue;
            }
            if firing & IoEvent::Read.bits() != 0 {
                self.fire(&mut inner, IoEvent::Read);
            }
            if firing & IoEvent::Write.bits() != 0 {
                self.fire(&mut inner, IoEvent::Write);
            }
        }
    }
}

impl Driver for IoManager {
    fn tickle(&self, sched: &Scheduler) {
        // No one is parked in epoll_wait; the queue will be seen on the
        // next dispatch pass.
        if !sched.has_idle_workers() {
            return;
        }
        self.wake();
    }

    fn idle(&self, sched: &Scheduler) {
        let timeout = self
            .timers
            .next_timeout()
            .map(|t| t.min(MAX_IDLE_TIMEOUT_MS))
            .unwrap_or(MAX_IDLE_TIMEOUT_MS) as i32;

        EVENT_BUF.with(|buf| {
            let mut events = buf.borrow_mut();
            if events.len() < EVENT_BUF_SIZE {
                events.resize(EVENT_BUF_SIZE, unsafe {
                    std::mem::zeroed::<libc::epoll_event>()
                });
            }

            let n = sys::epoll_wait(self.epfd, events.as_mut_slice(), timeout);
            if n < 0 {
                let e = sys::errno();
                if e != libc::EINTR {
                    werror!("epoll_wait failed (errno {})", e);
                }
                return;
            }

            let mut expired = Vec::new();
            self.timers.collect_expired(&mut expired);
            for cb in expired {
                sched.schedule_fn(move || cb());
            }

            self.dispatch_events(&events[..n as usize]);
        });
    }

    fn stopping(&self, sched: &Scheduler) -> bool {
        sched.stopping() && self.pending.load(Ordering::Acquire) == 0 && !self.timers.has_timers()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_r);
            libc::close(self.tickle_w);
        }
    }
}
