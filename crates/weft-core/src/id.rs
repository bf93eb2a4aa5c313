//! Fiber identifiers
//!
//! Ids are handed out from a process-wide monotonic counter and are never
//! reused for the lifetime of the process.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Next fiber id. Id 0 is reserved for "no fiber".
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    /// The "no fiber" sentinel (root fibers of threads that never ran one).
    pub const NONE: FiberId = FiberId(0);

    /// Allocate a fresh id from the process-wide counter.
    pub fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert!(b > a);
        assert!(!a.is_none());
    }

    #[test]
    fn test_none_sentinel() {
        assert!(FiberId::NONE.is_none());
        assert_eq!(FiberId::NONE.as_u64(), 0);
    }
}
