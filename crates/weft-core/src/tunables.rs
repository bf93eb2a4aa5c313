//! Process-wide runtime tunables
//!
//! Defaults come from the environment at first access; both values can be
//! changed at runtime and take effect for subsequently created fibers and
//! connections only.
//!
//! - `WEFT_STACK_SIZE` - default fiber stack size in bytes (default 1 MiB)
//! - `WEFT_CONNECT_TIMEOUT_MS` - default connect() timeout (default 5000 ms)

use crate::env::env_get;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

const DEFAULT_STACK_SIZE: usize = 1024 * 1024;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Connect timeout value meaning "no timeout".
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

struct Tunables {
    stack_size: AtomicUsize,
    connect_timeout_ms: AtomicU64,
}

static TUNABLES: OnceLock<Tunables> = OnceLock::new();

fn tunables() -> &'static Tunables {
    TUNABLES.get_or_init(|| Tunables {
        stack_size: AtomicUsize::new(env_get("WEFT_STACK_SIZE", DEFAULT_STACK_SIZE)),
        connect_timeout_ms: AtomicU64::new(env_get(
            "WEFT_CONNECT_TIMEOUT_MS",
            DEFAULT_CONNECT_TIMEOUT_MS,
        )),
    })
}

/// Default stack size for new fibers, in bytes.
#[inline]
pub fn default_stack_size() -> usize {
    tunables().stack_size.load(Ordering::Relaxed)
}

/// Change the default stack size for fibers created after this call.
pub fn set_default_stack_size(bytes: usize) {
    tunables().stack_size.store(bytes, Ordering::Relaxed);
}

/// Default timeout applied to intercepted `connect()` calls, in ms.
#[inline]
pub fn connect_timeout_ms() -> u64 {
    tunables().connect_timeout_ms.load(Ordering::Relaxed)
}

/// Change the default connect timeout for connections made after this call.
pub fn set_connect_timeout_ms(ms: u64) {
    tunables().connect_timeout_ms.store(ms, Ordering::Relaxed);
}
