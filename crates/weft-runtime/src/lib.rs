//! # weft-runtime
//!
//! Stackful fibers, a cooperative N:M scheduler and a timer manager.
//! Linux-only: stacks come from `mmap` and the I/O layer above assumes
//! epoll.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod arch;
        pub mod fiber;
        pub mod scheduler;
        pub mod stack;
        pub mod timer;
        mod tls;

        pub use fiber::{can_park, current, current_id, init_thread, total_fibers, yield_held, yield_ready, Fiber};
        pub use scheduler::{Driver, ParkDriver, Scheduler, Work};
        pub use timer::{now_ms, TimerCallback, TimerHandle, TimerManager};
    } else {
        compile_error!("weft-runtime only supports Linux");
    }
}
