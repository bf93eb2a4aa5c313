//! # weft-core
//!
//! Platform-agnostic core types for the weft fiber runtime:
//! ids, fiber states, error types, env helpers, log macros and
//! process-wide tunables.

pub mod env;
pub mod error;
pub mod id;
pub mod state;
pub mod tunables;
pub mod wlog;

pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{IoError, MemoryError, WeftError, WeftResult};
pub use id::FiberId;
pub use state::FiberState;
pub use tunables::{
    connect_timeout_ms, default_stack_size, set_connect_timeout_ms, set_default_stack_size,
    TIMEOUT_INFINITE,
};
pub use wlog::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};
