//! Reactor backends.
//!
//! A [`Reactor`] multiplexes a loop's I/O handles against the OS. Three
//! implementations exist: an io_uring completion ring, an epoll readiness
//! multiplexer, and a portable selector. The event-loop core owns one and
//! only talks through this trait; socket code arms operations and reacts
//! to the [`IoEvent`]s the backend reports.
//!
//! Readiness backends report `Readable`/`Writable` and leave the syscall
//! to the channel; the completion ring reports `ReadDone`/`WriteDone`
//! with the kernel result, the bytes already moved.

pub(crate) mod epoll;
pub(crate) mod portable;
pub(crate) mod uring;

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ReactorKind;

/// One multiplexer observation, dispatched by the loop to its channels.
#[derive(Debug, Clone, Copy)]
pub(crate) enum IoEvent {
    /// Cross-thread nudge observed; the loop drains its submit queue.
    Wakeup,
    /// The park timeout fired; the loop re-checks its timer heap.
    TimerFired,
    /// Readiness: the fd has bytes (or an accepted connection) pending.
    Readable { fd: RawFd },
    /// Readiness: the fd accepts writes (or finished connecting).
    Writable { fd: RawFd },
    /// Readiness: error/hangup condition on the fd.
    Failed { fd: RawFd },
    /// Completion: an armed read finished. `result` is bytes read, 0 for
    /// EOF, or a negated errno.
    ReadDone { fd: RawFd, result: i32 },
    /// Completion: an armed vectored write finished.
    WriteDone { fd: RawFd, result: i32 },
    /// Completion: an armed accept finished. `result` is the new fd or a
    /// negated errno.
    AcceptDone { fd: RawFd, result: i32 },
    /// Completion: an armed connect finished.
    ConnectDone { fd: RawFd, result: i32 },
}

/// How `poll` may block.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ParkMode {
    /// Collect whatever is ready; never enter a kernel wait.
    NoWait,
    /// Park at most this long (earliest timer deadline).
    Timeout(Duration),
    /// Park until woken.
    Wait,
}

/// Cross-thread nudge that unparks a loop. The single cross-thread
/// synchronization primitive besides the `wakeup_needed` handshake.
pub(crate) trait Wakener: Send + Sync {
    fn wake(&self);
}

/// eventfd-backed wakener shared by the uring and epoll backends. Owns
/// the fd; the reactor reads it, producers write it.
pub(crate) struct EventFdWakener {
    fd: RawFd,
}

impl EventFdWakener {
    pub(crate) fn new() -> io::Result<Arc<EventFdWakener>> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Arc::new(EventFdWakener { fd }))
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Wakener for EventFdWakener {
    fn wake(&self) {
        let one: u64 = 1;
        // A full eventfd counter or a closed loop only means the wakeup
        // is already pending or moot.
        unsafe {
            libc::write(self.fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }
}

impl Drop for EventFdWakener {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Backend interface the loop core drives.
pub(crate) trait Reactor {
    fn kind(&self) -> ReactorKind;

    /// Handle other threads use to unpark this reactor.
    fn wakener(&self) -> Arc<dyn Wakener>;

    /// Add an fd to the interest set (no operations armed yet).
    fn register(&mut self, fd: RawFd) -> io::Result<()>;

    /// Remove an fd; in-flight completions for it are ignored on arrival.
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Arm a receive. Completion backend: `buf`/`len` locate the spare
    /// region and must stay valid until `ReadDone`. Readiness backends
    /// only record read interest.
    fn arm_read(&mut self, fd: RawFd, buf: *mut u8, len: usize) -> io::Result<()>;

    /// Arm a vectored send. Completion backend: the iovec array must stay
    /// valid until `WriteDone`. Readiness backends record write interest.
    fn arm_write(&mut self, fd: RawFd, iov: *const libc::iovec, iovcnt: usize) -> io::Result<()>;

    /// Readiness backends: drop write interest once the chain drained.
    fn disarm_write(&mut self, fd: RawFd) -> io::Result<()>;

    /// Arm an accept on a listening fd. Completion backend: the sockaddr
    /// storage must stay valid until `AcceptDone`.
    fn arm_accept(
        &mut self,
        fd: RawFd,
        addr: *mut libc::sockaddr_storage,
        len: *mut libc::socklen_t,
    ) -> io::Result<()>;

    /// Arm a connect. Completion backend: the sockaddr must stay valid
    /// until `ConnectDone`. Readiness backends issue the nonblocking
    /// `connect` in socket code and only record write interest here.
    fn arm_connect(
        &mut self,
        fd: RawFd,
        addr: *const libc::sockaddr_storage,
        len: libc::socklen_t,
    ) -> io::Result<()>;

    /// Cancel in-flight operations on `fd`. Completion backend only: the
    /// cancelled operations still deliver their completions (with
    /// `ECANCELED`), which the caller must wait out before releasing the
    /// memory they reference.
    fn cancel_ops(&mut self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    /// Push pending kernel submissions without waiting.
    fn submit(&mut self) -> io::Result<()>;

    /// Collect events into `events`, blocking per `park`.
    fn poll(&mut self, park: ParkMode, events: &mut Vec<IoEvent>) -> io::Result<()>;
}

/// Construct the configured backend.
pub(crate) fn open(
    config: &crate::config::Config,
) -> Result<Box<dyn Reactor + Send>, crate::error::Error> {
    match config.reactor {
        ReactorKind::CompletionRing => Ok(Box::new(uring::UringReactor::new(config.ring_size)?)),
        ReactorKind::Readiness => Ok(Box::new(epoll::EpollReactor::new()?)),
        ReactorKind::Portable => Ok(Box::new(portable::PortableReactor::new()?)),
    }
}

/// Write a `SocketAddr` into a `sockaddr_storage`, returning the length.
pub(crate) fn socket_addr_to_sockaddr(
    addr: std::net::SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    use std::net::SocketAddr;
    unsafe {
        std::ptr::write_bytes(
            storage as *mut _ as *mut u8,
            0,
            std::mem::size_of::<libc::sockaddr_storage>(),
        );
    }
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

/// Convert a `sockaddr_storage` back into a `SocketAddr`.
pub(crate) fn sockaddr_to_socket_addr(
    addr: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> Option<std::net::SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
    match addr.ss_family as libc::c_int {
        libc::AF_INET if len as usize >= std::mem::size_of::<libc::sockaddr_in>() => {
            let sa = unsafe { &*(addr as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sa.sin_port))))
        }
        libc::AF_INET6 if len as usize >= std::mem::size_of::<libc::sockaddr_in6>() => {
            let sa = unsafe { &*(addr as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sa.sin6_port),
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }
        _ => None,
    }
}
