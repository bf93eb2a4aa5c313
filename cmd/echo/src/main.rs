//! TCP echo server on the weft runtime
//!
//! One fiber accepts; every connection gets its own fiber. The syscall
//! wrappers park fibers on the reactor, so a handful of worker threads
//! serve any number of idle connections.
//!
//! ```text
//! WEFT_LOG_LEVEL=debug cargo run -p weft-echo -- 8020
//! ```

use std::sync::Arc;

use weft::{hook, winfo, wwarn, IoManager};

fn listen(port: u16) -> i32 {
    let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    assert!(fd >= 0, "socket failed");

    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0, "bind to port {} failed", port);
    assert_eq!(unsafe { libc::listen(fd, 128) }, 0, "listen failed");
    fd
}

fn serve_connection(conn: i32) {
    let mut buf = [0u8; 4096];
    loop {
        let n = hook::recv(conn, &mut buf, 0);
        if n <= 0 {
            if n < 0 {
                wwarn!("recv on fd {} failed (errno {})", conn, weft::sys::errno());
            }
            break;
        }
        let mut sent = 0usize;
        while sent < n as usize {
            let m = hook::send(conn, &buf[sent..n as usize], 0);
            if m <= 0 {
                hook::close(conn);
                return;
            }
            sent += m as usize;
        }
    }
    hook::close(conn);
}

fn main() {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(8020);

    let mgr = IoManager::new(4, false, "echo").unwrap();
    let acceptor = Arc::clone(&mgr);
    mgr.schedule_fn(move || {
        let listener = listen(port);
        winfo!("echo server listening on port {}", port);
        loop {
            let conn = unsafe { hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
            if conn < 0 {
                wwarn!("accept failed (errno {})", weft::sys::errno());
                continue;
            }
            acceptor.schedule_fn(move || serve_connection(conn));
        }
    });

    // Serve until killed.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}
