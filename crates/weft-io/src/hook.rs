//! Cooperative syscall wrappers
//!
//! libc-shaped wrappers that turn would-block conditions into fiber
//! suspensions. On `EAGAIN` the calling fiber registers for readiness on
//! the thread's [`IoManager`], optionally arms a timeout timer, and parks;
//! it retries once the reactor requeues it. `EINTR` is always retried.
//! Return conventions match libc: `-1` with errno set on failure.
//!
//! Interception is per thread: unless overridden with
//! [`set_hook_enabled`], it is active exactly on `IoManager` worker
//! threads. With interception off, or for non-sockets and descriptors the
//! user explicitly made non-blocking, every wrapper degrades to the plain
//! syscall.

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use weft_core::{werror, TIMEOUT_INFINITE};
use weft_runtime::fiber;

use crate::fd_table::fd_table;
use crate::reactor::{IoEvent, IoManager};
use crate::sys;

thread_local! {
    /// `None` means "auto": hooked iff this thread is an IoManager worker.
    static HOOK_OVERRIDE: Cell<Option<bool>> = const { Cell::new(None) };
}

/// Whether syscall interception is active on this thread.
pub fn hook_enabled() -> bool {
    match HOOK_OVERRIDE.with(|c| c.get()) {
        Some(v) => v,
        None => IoManager::current().is_some(),
    }
}

/// Force interception on or off for the calling thread.
pub fn set_hook_enabled(enabled: bool) {
    HOOK_OVERRIDE.with(|c| c.set(Some(enabled)));
}

/// Set by a fired timeout timer; checked after the fiber is requeued.
struct TimerCond {
    cancelled: AtomicI32,
}

fn retry_eintr(mut op: impl FnMut() -> isize) -> isize {
    loop {
        let n = op();
        if n == -1 && sys::errno() == libc::EINTR {
            continue;
        }
        return n;
    }
}

/// True when the caller can actually suspend: interception on, inside a
/// parkable fiber, on a reactor thread. A thread's root fiber cannot
/// park (its yields degrade to an OS yield), so calls made from it fall
/// through to the plain syscall even on a caller-participating reactor.
fn in_hooked_fiber() -> bool {
    hook_enabled() && fiber::can_park() && IoManager::current().is_some()
}

/// Common path of every I/O wrapper: retry, and on EAGAIN park on the
/// reactor until `fd` is ready in `event`'s direction or the descriptor's
/// timeout for that direction fires (then `-1`/`ETIMEDOUT`).
fn do_io(fd: RawFd, event: IoEvent, write_dir: bool, mut op: impl FnMut() -> isize) -> isize {
    if !in_hooked_fiber() {
        return retry_eintr(&mut op);
    }
    let Some(entry) = fd_table().get(fd, true) else {
        return retry_eintr(&mut op);
    };
    if entry.is_closed() {
        sys::set_errno(libc::EBADF);
        return -1;
    }
    if !entry.is_socket() || entry.user_nonblock() {
        return retry_eintr(&mut op);
    }

    let mgr = match IoManager::current() {
        Some(m) => m,
        None => return retry_eintr(&mut op),
    };
    let timeout_ms = entry.timeout_ms(write_dir);

    loop {
        let n = retry_eintr(&mut op);
        if n != -1 || sys::errno() != libc::EAGAIN {
            return n;
        }

        match park_until_ready(&mgr, fd, event, timeout_ms) {
            Ok(()) => continue,
            Err(errno) => {
                sys::set_errno(errno);
                return -1;
            }
        }
    }
}

/// Register for `event` on `fd`, park the current fiber and wait for
/// readiness, cancellation or timeout. `Err` carries the errno to report.
fn park_until_ready(
    mgr: &Arc<IoManager>,
    fd: RawFd,
    event: IoEvent,
    timeout_ms: u64,
) -> Result<(), i32> {
    let cond = Arc::new(TimerCond {
        cancelled: AtomicI32::new(0),
    });

    let timer = if timeout_ms != TIMEOUT_INFINITE {
        let weak = Arc::downgrade(&cond);
        let mgr2 = mgr.clone();
        Some(mgr.timers().add_conditional_timer(
            timeout_ms,
            move || {
                if let Some(c) = weak.upgrade() {
                    c.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    // Triggers the parked fiber; it observes `cancelled`.
                    let _ = mgr2.cancel_event(fd, event);
                }
            },
            Arc::downgrade(&cond),
            false,
        ))
    } else {
        None
    };

    if let Err(e) = mgr.add_event(fd, event, None) {
        if let Some(t) = timer {
            mgr.timers().cancel(t);
        }
        werror!("event registration for fd {} failed: {}", fd, e);
        return Err(match e {
            weft_core::WeftError::Io(weft_core::IoError::Syscall(errno)) => errno,
            _ => libc::EINVAL,
        });
    }

    fiber::yield_held();

    if let Some(t) = timer {
        mgr.timers().cancel(t);
    }
    let cancelled = cond.cancelled.load(Ordering::SeqCst);
    if cancelled != 0 {
        return Err(cancelled);
    }
    Ok(())
}

/// Park the current fiber for `ms` milliseconds on the reactor's timers.
fn sleep_ms(mgr: &Arc<IoManager>, ms: u64) {
    let sched = mgr.scheduler().clone();
    let me = match fiber::current() {
        Some(f) => f,
        None => return,
    };
    mgr.timers().add_timer(
        ms,
        move || {
            sched.schedule(me.clone());
        },
        false,
    );
    fiber::yield_held();
}

// ---- sleep family -------------------------------------------------------

pub fn sleep(seconds: u32) -> u32 {
    match IoManager::current() {
        Some(mgr) if in_hooked_fiber() => {
            sleep_ms(&mgr, seconds as u64 * 1000);
            0
        }
        _ => unsafe { libc::sleep(seconds) },
    }
}

pub fn usleep(usec: u64) -> i32 {
    match IoManager::current() {
        Some(mgr) if in_hooked_fiber() => {
            sleep_ms(&mgr, usec / 1000);
            0
        }
        _ => unsafe { libc::usleep(usec as libc::useconds_t) },
    }
}

pub fn nanosleep(req: &libc::timespec) -> i32 {
    match IoManager::current() {
        Some(mgr) if in_hooked_fiber() => {
            let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
            sleep_ms(&mgr, ms);
            0
        }
        _ => unsafe { libc::nanosleep(req, std::ptr::null_mut()) },
    }
}

// ---- socket lifecycle ---------------------------------------------------

pub fn socket(domain: i32, ty: i32, protocol: i32) -> RawFd {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd >= 0 && hook_enabled() {
        let _ = fd_table().get(fd, true);
    }
    fd
}

/// `connect` with an explicit timeout. `TIMEOUT_INFINITE` waits forever.
///
/// # Safety
///
/// `addr` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: u64,
) -> i32 {
    if !in_hooked_fiber() {
        return libc::connect(fd, addr, addrlen);
    }
    let Some(entry) = fd_table().get(fd, true) else {
        sys::set_errno(libc::EBADF);
        return -1;
    };
    if entry.is_closed() {
        sys::set_errno(libc::EBADF);
        return -1;
    }
    if !entry.is_socket() || entry.user_nonblock() {
        return libc::connect(fd, addr, addrlen);
    }

    let n = libc::connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || sys::errno() != libc::EINPROGRESS {
        return n as i32;
    }

    // In progress: wait for writability, then read the real outcome.
    let mgr = match IoManager::current() {
        Some(m) => m,
        None => return -1,
    };
    if let Err(errno) = park_until_ready(&mgr, fd, IoEvent::Write, timeout_ms) {
        sys::set_errno(errno);
        return -1;
    }

    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len,
    ) != 0
    {
        return -1;
    }
    if err == 0 {
        0
    } else {
        sys::set_errno(err);
        -1
    }
}

/// # Safety
///
/// `addr` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> i32 {
    connect_with_timeout(fd, addr, addrlen, weft_core::connect_timeout_ms())
}

/// # Safety
///
/// `addr`/`addrlen`, when non-null, follow the usual `accept` contract.
pub unsafe fn accept(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> RawFd {
    let n = do_io(fd, IoEvent::Read, false, || {
        libc::accept(fd, addr, addrlen) as isize
    });
    if n >= 0 && hook_enabled() {
        let _ = fd_table().get(n as RawFd, true);
    }
    n as RawFd
}

pub fn close(fd: RawFd) -> i32 {
    if hook_enabled() {
        if fd_table().get(fd, false).is_some() {
            if let Some(mgr) = IoManager::current() {
                let _ = mgr.cancel_all(fd);
            }
            fd_table().remove(fd);
        }
    }
    unsafe { libc::close(fd) }
}

// ---- read side ----------------------------------------------------------

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    do_io(fd, IoEvent::Read, false, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: RawFd, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, IoEvent::Read, false, || libc::readv(fd, iov, iovcnt))
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> isize {
    do_io(fd, IoEvent::Read, false, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
    })
}

/// # Safety
///
/// `addr`/`addrlen`, when non-null, follow the usual `recvfrom` contract.
pub unsafe fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: i32,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    do_io(fd, IoEvent::Read, false, || {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            flags,
            addr,
            addrlen,
        )
    })
}

/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: i32) -> isize {
    do_io(fd, IoEvent::Read, false, || libc::recvmsg(fd, msg, flags))
}

// ---- write side ---------------------------------------------------------

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    do_io(fd, IoEvent::Write, true, || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: RawFd, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, IoEvent::Write, true, || libc::writev(fd, iov, iovcnt))
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> isize {
    do_io(fd, IoEvent::Write, true, || unsafe {
        libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
    })
}

/// # Safety
///
/// `addr` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: i32,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> isize {
    do_io(fd, IoEvent::Write, true, || {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            flags,
            addr,
            addrlen,
        )
    })
}

/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: i32) -> isize {
    do_io(fd, IoEvent::Write, true, || libc::sendmsg(fd, msg, flags))
}

// ---- descriptor control -------------------------------------------------

/// `fcntl(F_SETFL)`: the user's O_NONBLOCK wish is recorded, while tracked
/// sockets stay non-blocking at the system level.
pub fn fcntl_setfl(fd: RawFd, flags: i32) -> i32 {
    match fd_table().get(fd, false) {
        Some(entry) if entry.is_socket() && !entry.is_closed() => {
            entry.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            let real = if entry.sys_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            };
            unsafe { libc::fcntl(fd, libc::F_SETFL, real) }
        }
        _ => unsafe { libc::fcntl(fd, libc::F_SETFL, flags) },
    }
}

/// `fcntl(F_GETFL)`: reports the O_NONBLOCK flag as the user set it, not
/// as the system has it.
pub fn fcntl_getfl(fd: RawFd) -> i32 {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return flags;
    }
    match fd_table().get(fd, false) {
        Some(entry) if entry.is_socket() && !entry.is_closed() => {
            if entry.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => flags,
    }
}

/// `ioctl(FIONBIO)`: like `fcntl_setfl`, tracked sockets keep system-level
/// non-blocking regardless of the user's wish.
pub fn ioctl_fionbio(fd: RawFd, nonblocking: bool) -> i32 {
    match fd_table().get(fd, false) {
        Some(entry) if entry.is_socket() && !entry.is_closed() => {
            entry.set_user_nonblock(nonblocking);
            let mut on: libc::c_int = i32::from(entry.sys_nonblock() || nonblocking);
            unsafe { libc::ioctl(fd, libc::FIONBIO, &mut on) }
        }
        _ => {
            let mut on: libc::c_int = i32::from(nonblocking);
            unsafe { libc::ioctl(fd, libc::FIONBIO, &mut on) }
        }
    }
}

/// `setsockopt`: SO_RCVTIMEO/SO_SNDTIMEO are recorded for the suspension
/// path (a zero timeval, meaning "block forever", maps to no timeout),
/// then passed through.
///
/// # Safety
///
/// `optval` must point to `optlen` valid bytes for the given option.
pub unsafe fn setsockopt(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> i32 {
    if hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(entry) = fd_table().get(fd, true) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let ms = if ms == 0 { TIMEOUT_INFINITE } else { ms };
            entry.set_timeout_ms(optname == libc::SO_SNDTIMEO, ms);
        }
    }
    libc::setsockopt(fd, level, optname, optval, optlen)
}

/// # Safety
///
/// `optval`/`optlen` follow the usual `getsockopt` contract.
pub unsafe fn getsockopt(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> i32 {
    libc::getsockopt(fd, level, optname, optval, optlen)
}
