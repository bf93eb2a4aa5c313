//! # weft
//!
//! A cooperative fiber runtime: stackful fibers multiplexed N:M over
//! worker threads, an epoll reactor with millisecond timers, and
//! libc-shaped syscall wrappers that park fibers instead of blocking
//! threads.
//!
//! ```no_run
//! use weft::IoManager;
//!
//! let mgr = IoManager::new(4, false, "main").unwrap();
//! mgr.schedule_fn(|| {
//!     // Intercepted I/O in here suspends the fiber, not the thread.
//! });
//! mgr.stop();
//! ```

pub use weft_core::{
    connect_timeout_ms, default_stack_size, env_get, env_get_bool, env_get_opt, init_logging,
    set_connect_timeout_ms, set_default_stack_size, set_flush_enabled, set_log_level, FiberId,
    FiberState, IoError, LogLevel, MemoryError, WeftError, WeftResult, TIMEOUT_INFINITE,
};
pub use weft_core::{wdebug, werror, winfo, wprintln, wtrace, wwarn};

pub use weft_runtime::{
    current, current_id, init_thread, now_ms, total_fibers, yield_held, yield_ready, Driver, Fiber,
    ParkDriver, Scheduler, TimerCallback, TimerHandle, TimerManager, Work,
};

pub use weft_io::{fd_table, hook, hook_enabled, set_hook_enabled, sys, FdEntry, FdTable, IoEvent,
    IoManager};
