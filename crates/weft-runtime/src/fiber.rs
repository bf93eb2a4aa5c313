//! Stackful fibers
//!
//! A `Fiber` owns a guard-paged stack and a saved register set. Switching
//! is always explicit: `resume` enters a fiber, `yield_ready`/`yield_held`
//! leave it. A suspending fiber returns to the thread's scheduling fiber
//! if one is registered (and it is not itself that fiber), otherwise to
//! the thread's root fiber. The runtime never preempts.
//!
//! Root fibers are created lazily per thread by `init_thread` and have no
//! own stack; they represent the OS thread's original context.

use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use weft_core::{werror, wtrace, FiberId, FiberState};

use crate::arch::{self, Registers};
use crate::stack::Stack;
use crate::tls;

type FiberFn = Box<dyn FnOnce() + Send + 'static>;

/// Live fiber count across the process, root fibers included.
static TOTAL_FIBERS: AtomicU64 = AtomicU64::new(0);

/// Number of fibers currently alive in the process.
pub fn total_fibers() -> u64 {
    TOTAL_FIBERS.load(Ordering::Relaxed)
}

/// A cooperatively scheduled stackful coroutine.
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// `None` for root fibers, which run on the OS thread's own stack.
    stack: Option<Stack>,
    ctx: UnsafeCell<Registers>,
    /// Taken (and thereby cleared) when the fiber first runs, so a parked
    /// fiber never keeps captured values alive through a retain cycle.
    callback: Mutex<Option<FiberFn>>,
}

// `ctx` is only touched by the thread performing the switch, and the state
// word is atomic; everything else is behind the Mutex.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber that will run `cb` when first resumed.
    ///
    /// `stack_size` of `None` uses the process-wide default.
    pub fn new(cb: impl FnOnce() + Send + 'static, stack_size: Option<usize>) -> Arc<Fiber> {
        let size = stack_size.unwrap_or_else(weft_core::default_stack_size);
        let stack = Stack::alloc(size);
        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Init as u8),
            stack: Some(stack),
            ctx: UnsafeCell::new(Registers::default()),
            callback: Mutex::new(Some(Box::new(cb))),
        });
        fiber.init_context();
        TOTAL_FIBERS.fetch_add(1, Ordering::Relaxed);
        wtrace!("fiber {} created", fiber.id);
        fiber
    }

    /// Root fiber representing an OS thread's original context.
    fn root() -> Arc<Fiber> {
        TOTAL_FIBERS.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Executing as u8),
            stack: None,
            ctx: UnsafeCell::new(Registers::default()),
            callback: Mutex::new(None),
        })
    }

    /// Point the saved context at the trampoline, passing our own address.
    ///
    /// The address is stable: fibers only exist behind an `Arc`.
    fn init_context(self: &Arc<Self>) {
        let stack = self
            .stack
            .as_ref()
            .unwrap_or_else(|| unreachable!("root fiber context is never initialized"));
        unsafe {
            arch::init_context(
                self.ctx.get(),
                stack.top(),
                fiber_main as usize,
                Arc::as_ptr(self) as usize,
            );
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, s: FiberState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Give a finished (or never-started) fiber a new callback, reusing its
    /// stack. The fiber id is kept.
    ///
    /// # Panics
    ///
    /// Panics on a root fiber or when the fiber is in a non-resettable
    /// state; both are caller bugs.
    pub fn reset(self: &Arc<Self>, cb: impl FnOnce() + Send + 'static) {
        assert!(self.stack.is_some(), "cannot reset a root fiber");
        assert!(
            self.state().is_resettable(),
            "reset of fiber {} in state {}",
            self.id,
            self.state()
        );
        *self
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Box::new(cb));
        self.init_context();
        self.set_state(FiberState::Init);
    }

    /// Switch the calling thread into this fiber.
    ///
    /// Returns when the fiber yields, parks or finishes. The caller must
    /// keep its `Arc` alive for the whole time the fiber may run.
    ///
    /// # Panics
    ///
    /// Panics when the fiber is already executing, has finished, or is the
    /// caller itself.
    pub fn resume(self: &Arc<Self>) {
        let mut prev = tls::current_ptr();
        if prev.is_null() {
            init_thread();
            prev = tls::current_ptr();
        }
        let me = Arc::as_ptr(self);
        assert!(!ptr::eq(prev, me), "fiber {} cannot resume itself", self.id);
        let state = self.state();
        assert!(
            state != FiberState::Executing,
            "resume of executing fiber {}",
            self.id
        );
        assert!(
            !state.is_terminated(),
            "resume of finished fiber {} ({})",
            self.id,
            state
        );

        self.set_state(FiberState::Executing);
        tls::set_current(me);
        unsafe {
            arch::context_switch((*prev).ctx.get(), self.ctx.get());
        }
        // Back on the previous context; whoever switched here already set
        // CURRENT back to us.
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        TOTAL_FIBERS.fetch_sub(1, Ordering::Relaxed);
        wtrace!("fiber {} dropped in state {}", self.id, self.state());
    }
}

/// Entry point every fiber starts in, reached via the arch trampoline.
///
/// Runs the callback behind a panic barrier, records the outcome and
/// performs the final switch away. Never returns.
extern "C" fn fiber_main(arg: usize) {
    // The scheduler (or other resumer) holds an owning Arc for as long as
    // this fiber can run, so the raw pointer stays valid. The fiber holds
    // no Arc to itself.
    let fiber = unsafe { &*(arg as *const Fiber) };

    let cb = fiber
        .callback
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    match cb {
        Some(cb) => match panic::catch_unwind(AssertUnwindSafe(cb)) {
            Ok(()) => fiber.set_state(FiberState::Terminated),
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                werror!(
                    "fiber {} panicked: {}\n{}",
                    fiber.id,
                    msg,
                    std::backtrace::Backtrace::force_capture()
                );
                fiber.set_state(FiberState::Failed);
            }
        },
        None => {
            // Resumed without a callback; nothing to run.
            fiber.set_state(FiberState::Terminated);
        }
    }

    switch_out();
    unreachable!("finished fiber {} was resumed", fiber.id);
}

/// Suspend the current fiber back to its return point: the thread's
/// scheduling fiber, unless the current fiber *is* the scheduling fiber,
/// in which case the thread's root fiber.
pub(crate) fn switch_out() {
    let cur = tls::current_ptr();
    assert!(!cur.is_null(), "switch_out outside any fiber");

    let sched = tls::sched_fiber_ptr();
    let target = if !sched.is_null() && !ptr::eq(cur, sched) {
        sched
    } else {
        tls::thread_fiber_ptr()
    };
    assert!(
        !target.is_null() && !ptr::eq(cur, target),
        "fiber has no return point to suspend to"
    );

    tls::set_current(target);
    unsafe {
        arch::context_switch((*cur).ctx.get(), (*target).ctx.get());
    }
}

/// Yield the current fiber, leaving it runnable.
///
/// Under a scheduler the fiber is requeued and resumed later; the call
/// then returns and execution continues. Outside any fiber this degrades
/// to an OS-level yield.
pub fn yield_ready() {
    let cur = tls::current_ptr();
    if cur.is_null() || ptr::eq(cur, tls::thread_fiber_ptr()) {
        std::thread::yield_now();
        return;
    }
    unsafe { &*cur }.set_state(FiberState::Ready);
    switch_out();
}

/// Park the current fiber. It will not run again until something holding
/// its `Arc` schedules or resumes it. Outside any fiber this degrades to
/// an OS-level yield.
pub fn yield_held() {
    let cur = tls::current_ptr();
    if cur.is_null() || ptr::eq(cur, tls::thread_fiber_ptr()) {
        std::thread::yield_now();
        return;
    }
    unsafe { &*cur }.set_state(FiberState::Held);
    switch_out();
}

/// True when the calling context can actually suspend: inside a fiber
/// other than the thread's root fiber. From the root fiber (or outside
/// any fiber) the yield functions degrade to an OS-level yield, so a
/// caller that needs a real park must check this first.
pub fn can_park() -> bool {
    let cur = tls::current_ptr();
    !cur.is_null() && !ptr::eq(cur, tls::thread_fiber_ptr())
}

/// Ensure this thread has a root fiber, creating it on first call.
/// Idempotent; returns the root fiber.
pub fn init_thread() -> Arc<Fiber> {
    if let Some(f) = tls::thread_fiber() {
        return f;
    }
    let root = Fiber::root();
    tls::install_thread_fiber(root.clone());
    if tls::current_ptr().is_null() {
        tls::set_current(Arc::as_ptr(&root));
    }
    root
}

/// The fiber currently running on this thread, if any.
pub fn current() -> Option<Arc<Fiber>> {
    let p = tls::current_ptr();
    if p.is_null() {
        return None;
    }
    // Every Fiber lives inside an Arc allocation, so reconstructing a
    // clone from the raw pointer is sound.
    unsafe {
        Arc::increment_strong_count(p);
        Some(Arc::from_raw(p))
    }
}

/// Id of the currently running fiber, or the "no fiber" sentinel.
pub fn current_id() -> FiberId {
    let p = tls::current_ptr();
    if p.is_null() {
        FiberId::NONE
    } else {
        unsafe { &*p }.id()
    }
}
