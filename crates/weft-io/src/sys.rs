//! Thin libc seam: errno helpers and epoll plumbing.

use std::os::unix::io::RawFd;

use nix::errno::Errno;

use weft_core::{IoError, WeftResult};

#[inline]
pub fn errno() -> i32 {
    Errno::last_raw()
}

#[inline]
pub fn set_errno(e: i32) {
    Errno::set_raw(e);
}

pub(crate) fn epoll_create() -> WeftResult<RawFd> {
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if fd < 0 {
        return Err(IoError::Syscall(errno()).into());
    }
    Ok(fd)
}

pub(crate) fn epoll_ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, events: u32) -> WeftResult<()> {
    let mut ev = libc::epoll_event {
        events,
        u64: fd as u64,
    };
    let rc = unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) };
    if rc != 0 {
        return Err(IoError::Syscall(errno()).into());
    }
    Ok(())
}

/// Returns the number of ready events, or -1 with errno set.
pub(crate) fn epoll_wait(epfd: RawFd, events: &mut [libc::epoll_event], timeout_ms: i32) -> i32 {
    unsafe {
        libc::epoll_wait(
            epfd,
            events.as_mut_ptr(),
            events.len() as libc::c_int,
            timeout_ms,
        )
    }
}

/// Anonymous pipe with a non-blocking read end, for in-process wakeups.
pub(crate) fn wake_pipe() -> WeftResult<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(IoError::Syscall(errno()).into());
    }
    let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        let e = errno();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        return Err(IoError::Syscall(e).into());
    }
    Ok((fds[0], fds[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_round_trip() {
        set_errno(libc::ETIMEDOUT);
        assert_eq!(errno(), libc::ETIMEDOUT);
        set_errno(0);
    }

    #[test]
    fn test_wake_pipe_read_end_nonblocking() {
        let (r, w) = wake_pipe().unwrap();
        let mut buf = [0u8; 1];
        let n = unsafe { libc::read(r, buf.as_mut_ptr() as *mut libc::c_void, 1) };
        assert_eq!(n, -1);
        assert_eq!(errno(), libc::EAGAIN);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
