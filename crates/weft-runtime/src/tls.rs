//! Thread-local fiber state
//!
//! Each OS thread tracks the fiber it is currently running, its root
//! ("thread") fiber, and the scheduling fiber suspends return to. Raw
//! pointers are used for the hot paths; owners keep the `Arc`s alive.

use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::Arc;

use crate::fiber::Fiber;

thread_local! {
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static SCHED_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
    static WORKER_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

#[inline]
pub(crate) fn current_ptr() -> *const Fiber {
    CURRENT_FIBER.with(|c| c.get())
}

#[inline]
pub(crate) fn set_current(ptr: *const Fiber) {
    CURRENT_FIBER.with(|c| c.set(ptr));
}

pub(crate) fn thread_fiber() -> Option<Arc<Fiber>> {
    THREAD_FIBER.with(|t| t.borrow().clone())
}

pub(crate) fn thread_fiber_ptr() -> *const Fiber {
    THREAD_FIBER.with(|t| {
        t.borrow()
            .as_ref()
            .map(|f| Arc::as_ptr(f))
            .unwrap_or(ptr::null())
    })
}

pub(crate) fn install_thread_fiber(fiber: Arc<Fiber>) {
    THREAD_FIBER.with(|t| {
        *t.borrow_mut() = Some(fiber);
    });
}

#[inline]
pub(crate) fn sched_fiber_ptr() -> *const Fiber {
    SCHED_FIBER.with(|c| c.get())
}

#[inline]
pub(crate) fn set_sched_fiber(ptr: *const Fiber) {
    SCHED_FIBER.with(|c| c.set(ptr));
}

#[inline]
pub(crate) fn worker_id() -> Option<usize> {
    WORKER_ID.with(|c| c.get())
}

#[inline]
pub(crate) fn set_worker_id(id: usize) {
    WORKER_ID.with(|c| c.set(Some(id)));
}
