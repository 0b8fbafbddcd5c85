//! Listener setup and the acceptor loop.
//!
//! The listener carries forced 8 MiB send/receive buffers (well above
//! the caravan capacity, so a full caravan always fits the socket in
//! steady state) and a 128-entry backlog. A dedicated thread blocks in
//! `accept4` and distributes accepted sockets over the workers with a
//! rotating cursor, waking each worker through its poll waker.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{info, warn};

use crate::metrics;
use crate::worker::WorkerMsg;

/// Configuration for the acceptor thread.
pub(crate) struct AcceptorConfig {
    /// The listening socket fd.
    pub listen_fd: RawFd,
    /// Per-worker channels for accepted (fd, peer_addr) pairs.
    pub worker_channels: Vec<Sender<WorkerMsg>>,
    /// Per-worker poll wakers.
    pub worker_wakers: Vec<Arc<mio::Waker>>,
    /// Shared flag set by ShutdownHandle to stop the acceptor.
    pub shutdown_flag: Arc<AtomicBool>,
    /// Whether to set TCP_NODELAY on accepted connections.
    pub tcp_nodelay: bool,
}

/// Run the acceptor loop. Terminates when the listen fd closes or every
/// worker has exited.
pub(crate) fn run_acceptor(config: AcceptorConfig) {
    let num_workers = config.worker_channels.len();
    if num_workers == 0 {
        return;
    }

    // Rotating placement cursor over the workers.
    let mut last_worker = 0usize;
    let mut addr_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut alive = vec![true; num_workers];
    let mut alive_count = num_workers;

    loop {
        let mut addr_len: libc::socklen_t =
            std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let fd = unsafe {
            libc::accept4(
                config.listen_fd,
                &mut addr_storage as *mut _ as *mut libc::sockaddr,
                &mut addr_len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };

        if fd < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EMFILE) | Some(libc::ENFILE) => {
                    // Too many open files — back off briefly.
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    continue;
                }
                _ => {
                    if !config.shutdown_flag.load(Ordering::Relaxed) {
                        warn!("accept failed: {err}");
                    }
                    return;
                }
            }
        }

        if config.tcp_nodelay {
            let optval: libc::c_int = 1;
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_NODELAY,
                    &optval as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
            }
        }

        // Discard anything sitting in the transmit queue on close so a
        // restored network connection never sees stale bytes.
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            );
        }

        let peer_addr = sockaddr_to_socket_addr(&addr_storage)
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

        // Rotate to the next live worker. Try up to num_workers times.
        let mut sent = false;
        for _ in 0..num_workers {
            let worker_idx = last_worker % num_workers;
            last_worker = last_worker.wrapping_add(1);

            if !alive[worker_idx] {
                continue;
            }

            if config.worker_channels[worker_idx]
                .send(WorkerMsg::Conn(fd, peer_addr))
                .is_err()
            {
                // Worker has exited — mark dead.
                alive[worker_idx] = false;
                alive_count -= 1;
                if alive_count == 0 {
                    unsafe {
                        libc::close(fd);
                    }
                    return;
                }
                continue;
            }

            let _ = config.worker_wakers[worker_idx].wake();
            metrics::QUEUES_ACCEPTED.increment();
            sent = true;
            break;
        }

        if !sent {
            // All workers dead.
            unsafe {
                libc::close(fd);
            }
            return;
        }
    }
}

/// Create the listening socket: SO_REUSEADDR, forced send/receive
/// buffers, bind, listen. Left blocking for the acceptor thread.
pub(crate) fn create_listener(
    addr: SocketAddr,
    backlog: i32,
    sock_buf_size: u32,
) -> Result<RawFd, crate::error::Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(crate::error::Error::Io(io::Error::last_os_error()));
    }

    let close_with = |msg: &str| -> crate::error::Error {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        crate::error::Error::ListenerSetup(format!("{msg}: {err}"))
    };

    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    // Fixed-size send/receive buffers, inherited by accepted sockets.
    // The FORCE variants bypass the net.core.{r,w}mem_max ceilings so
    // the full size sticks; they need CAP_NET_ADMIN, so fall back to
    // the clamped option when denied.
    let buf: libc::c_int = sock_buf_size as libc::c_int;
    for (force_opt, opt) in [
        (libc::SO_SNDBUFFORCE, libc::SO_SNDBUF),
        (libc::SO_RCVBUFFORCE, libc::SO_RCVBUF),
    ] {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                force_opt,
                &buf as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            warn!(
                "socket buffer force denied ({}), using clamped size",
                io::Error::last_os_error()
            );
            let ret = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    opt,
                    &buf as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(close_with("set socket buffer size"));
            }
        }
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(addr, &mut storage);

    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        return Err(close_with("bind"));
    }

    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        return Err(close_with("listen"));
    }

    info!(%addr, "enabling port");
    Ok(fd)
}

/// Read back the listener's bound address (for port 0 binds and
/// discovery transport address reporting).
pub(crate) fn listener_addr(fd: RawFd) -> Result<SocketAddr, crate::error::Error> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret =
        unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(crate::error::Error::Io(io::Error::last_os_error()));
    }
    sockaddr_to_socket_addr(&storage)
        .ok_or_else(|| crate::error::Error::ListenerSetup("unsupported address family".into()))
}

/// Convert a `sockaddr_storage` to a Rust `SocketAddr`.
fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Some(SocketAddr::from((ip, port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Some(SocketAddr::from((ip, port)))
        }
        _ => None,
    }
}

/// Fill a `sockaddr_storage` from a Rust `SocketAddr`; returns the
/// address length for bind.
fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sa = unsafe { &mut *(storage as *mut _ as *mut libc::sockaddr_in) };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = unsafe { &mut *(storage as *mut _ as *mut libc::sockaddr_in6) };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_flowinfo = v6.flowinfo();
            sa.sin6_scope_id = v6.scope_id();
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}
