//! Per-descriptor bookkeeping for the interception layer
//!
//! A process-wide table records, for every descriptor the hooks have
//! touched: whether it is a socket, whether the *system* level O_NONBLOCK
//! is set (the hooks force it on sockets), whether the *user* asked for
//! non-blocking behavior, and per-direction timeouts. The user-level flag
//! is what `fcntl`/`ioctl` report back, so applications keep seeing the
//! blocking semantics they asked for.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use weft_core::TIMEOUT_INFINITE;

use crate::sys;

/// Tracked state of one descriptor.
pub struct FdEntry {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdEntry {
    /// Probe the descriptor; sockets are switched to system-level
    /// non-blocking immediately.
    fn new(fd: RawFd) -> FdEntry {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut stat) } == 0
            && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        FdEntry {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(TIMEOUT_INFINITE),
            send_timeout_ms: AtomicU64::new(TIMEOUT_INFINITE),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    pub fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::Relaxed);
    }

    /// The non-blocking flag as the application sees it.
    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Relaxed);
    }

    /// Timeout for the given direction; `SO_RCVTIMEO` governs reads,
    /// `SO_SNDTIMEO` writes.
    pub fn timeout_ms(&self, write: bool) -> u64 {
        if write {
            self.send_timeout_ms.load(Ordering::Relaxed)
        } else {
            self.recv_timeout_ms.load(Ordering::Relaxed)
        }
    }

    pub fn set_timeout_ms(&self, write: bool, ms: u64) {
        if write {
            self.send_timeout_ms.store(ms, Ordering::Relaxed);
        } else {
            self.recv_timeout_ms.store(ms, Ordering::Relaxed);
        }
    }
}

/// Process-wide descriptor table, grown on demand.
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdEntry>>>>,
}

static FD_TABLE: OnceLock<FdTable> = OnceLock::new();

/// The process-wide table.
pub fn fd_table() -> &'static FdTable {
    FD_TABLE.get_or_init(|| FdTable {
        slots: RwLock::new(Vec::new()),
    })
}

impl FdTable {
    /// Look up a descriptor, creating the entry when `auto_create` and the
    /// fd looks valid.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdEntry>> {
        if fd < 0 {
            return None;
        }
        {
            let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
            if let Some(Some(entry)) = slots.get(fd as usize) {
                return Some(entry.clone());
            }
        }
        if !auto_create {
            return None;
        }
        // Reject dead descriptors before allocating an entry.
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 && sys::errno() == libc::EBADF {
            return None;
        }

        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let idx = fd as usize;
        if idx >= slots.len() {
            let new_len = (idx + 1).max(slots.len() * 3 / 2);
            slots.resize(new_len, None);
        }
        if let Some(entry) = &slots[idx] {
            return Some(entry.clone());
        }
        let entry = Arc::new(FdEntry::new(fd));
        slots[idx] = Some(entry.clone());
        Some(entry)
    }

    /// Forget a descriptor (on close).
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(entry) = slot.take() {
                entry.mark_closed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_entry_forced_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let entry = fd_table().get(fd, true).unwrap();
        assert!(entry.is_socket());
        assert!(entry.sys_nonblock());
        assert!(!entry.user_nonblock());

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);

        fd_table().remove(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_non_socket_untouched() {
        let (r, w) = crate::sys::wake_pipe().unwrap();
        // The write end was left blocking by wake_pipe.
        let entry = fd_table().get(w, true).unwrap();
        assert!(!entry.is_socket());
        let flags = unsafe { libc::fcntl(w, libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK == 0);
        fd_table().remove(w);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_bad_fd_not_created() {
        assert!(fd_table().get(-1, true).is_none());
        assert!(fd_table().get(1_000_000_000, false).is_none());
    }

    #[test]
    fn test_timeouts_per_direction() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        let entry = fd_table().get(fd, true).unwrap();
        assert_eq!(entry.timeout_ms(false), TIMEOUT_INFINITE);
        entry.set_timeout_ms(false, 250);
        assert_eq!(entry.timeout_ms(false), 250);
        assert_eq!(entry.timeout_ms(true), TIMEOUT_INFINITE);
        fd_table().remove(fd);
        unsafe { libc::close(fd) };
    }
}
