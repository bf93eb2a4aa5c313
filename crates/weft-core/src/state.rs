//! Fiber state machine
//!
//! `Init -> Executing -> {Held, Ready} -> Executing -> {Terminated, Failed}`,
//! with `reset` allowed only from `Terminated`, `Init` or `Failed`.

use core::fmt;

/// State of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created (or reset) with a callback, never resumed yet
    Init = 0,

    /// Runnable, waiting in a scheduler queue
    Ready = 1,

    /// Currently running on some worker thread
    Executing = 2,

    /// Parked until explicitly resumed (blocked on I/O, timer, ...)
    Held = 3,

    /// Callback returned normally
    Terminated = 4,

    /// Callback panicked; failure was logged at the trampoline boundary
    Failed = 5,
}

impl FiberState {
    /// Fiber has finished, one way or the other.
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Terminated | FiberState::Failed)
    }

    /// A fiber in this state may be given a new callback via `reset`.
    #[inline]
    pub const fn is_resettable(&self) -> bool {
        matches!(
            self,
            FiberState::Init | FiberState::Terminated | FiberState::Failed
        )
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Executing,
            3 => FiberState::Held,
            4 => FiberState::Terminated,
            _ => FiberState::Failed,
        }
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FiberState::Init => "INIT",
            FiberState::Ready => "READY",
            FiberState::Executing => "EXECUTING",
            FiberState::Held => "HELD",
            FiberState::Terminated => "TERMINATED",
            FiberState::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(FiberState::Terminated.is_terminated());
        assert!(FiberState::Failed.is_terminated());
        assert!(!FiberState::Held.is_terminated());
        assert!(!FiberState::Executing.is_terminated());
    }

    #[test]
    fn test_resettable_states() {
        assert!(FiberState::Init.is_resettable());
        assert!(FiberState::Terminated.is_resettable());
        assert!(FiberState::Failed.is_resettable());
        assert!(!FiberState::Ready.is_resettable());
        assert!(!FiberState::Executing.is_resettable());
        assert!(!FiberState::Held.is_resettable());
    }

    #[test]
    fn test_round_trip_u8() {
        for s in [
            FiberState::Init,
            FiberState::Ready,
            FiberState::Executing,
            FiberState::Held,
            FiberState::Terminated,
            FiberState::Failed,
        ] {
            assert_eq!(FiberState::from(s as u8), s);
        }
    }
}
