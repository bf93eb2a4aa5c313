//! # weft-io
//!
//! epoll reactor (`IoManager`), per-descriptor bookkeeping and the
//! cooperative syscall wrappers that park fibers instead of blocking
//! worker threads.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod fd_table;
        pub mod hook;
        pub mod reactor;
        pub mod sys;

        pub use fd_table::{fd_table, FdEntry, FdTable};
        pub use hook::{hook_enabled, set_hook_enabled};
        pub use reactor::{IoEvent, IoManager};
    } else {
        compile_error!("weft-io only supports Linux");
    }
}
