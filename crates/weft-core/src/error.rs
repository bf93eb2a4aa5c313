//! Error types for the weft runtime

use core::fmt;

/// Result type for runtime operations
pub type WeftResult<T> = Result<T, WeftError>;

/// Errors that can occur in runtime operations
///
/// Contract violations (resuming an executing fiber, double event
/// registration) panic instead; timeouts on intercepted syscalls surface
/// as errno. This enum covers only what the runtime actually returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeftError {
    /// Scheduler started twice
    AlreadyStarted,

    /// Scheduler has fully stopped
    Stopped,

    /// Stack memory error
    Memory(MemoryError),

    /// Descriptor event registration error
    Io(IoError),
}

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeftError::AlreadyStarted => write!(f, "scheduler already started"),
            WeftError::Stopped => write!(f, "scheduler stopped"),
            WeftError::Memory(e) => write!(f, "memory error: {}", e),
            WeftError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for WeftError {}

/// Stack allocation / protection errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    AllocationFailed,

    /// mprotect of the guard page failed
    ProtectionFailed,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "stack allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "guard page protection failed"),
        }
    }
}

impl From<MemoryError> for WeftError {
    fn from(e: MemoryError) -> Self {
        WeftError::Memory(e)
    }
}

/// Descriptor event registration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// Event not registered on this descriptor
    EventMissing,

    /// Descriptor is outside the reactor's table
    BadDescriptor,

    /// epoll_ctl (or another syscall) failed; carries errno
    Syscall(i32),
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::EventMissing => write!(f, "event not registered"),
            IoError::BadDescriptor => write!(f, "bad descriptor"),
            IoError::Syscall(errno) => write!(f, "syscall failed (errno {})", errno),
        }
    }
}

impl From<IoError> for WeftError {
    fn from(e: IoError) -> Self {
        WeftError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = WeftError::Stopped;
        assert_eq!(format!("{}", e), "scheduler stopped");

        let e = WeftError::Memory(MemoryError::AllocationFailed);
        assert_eq!(format!("{}", e), "memory error: stack allocation failed");

        let e: WeftError = MemoryError::ProtectionFailed.into();
        assert_eq!(format!("{}", e), "memory error: guard page protection failed");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = IoError::Syscall(9);
        let err: WeftError = io_err.into();
        assert!(matches!(err, WeftError::Io(IoError::Syscall(9))));
    }
}
