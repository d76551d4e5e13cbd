//! Readiness backend over epoll.
//!
//! The wakeup eventfd is registered edge-triggered so a parked loop gets
//! exactly one notification per wakeup burst without reading the counter.
//! Sockets are level-triggered: read interest is permanent, write
//! interest is armed only while an outbound chain is pending. The park
//! budget is a millisecond-ceiling `epoll_wait` timeout.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::config::ReactorKind;

use super::{EventFdWakener, IoEvent, ParkMode, Reactor, Wakener};

const EVENT_BATCH: usize = 1024;

pub(crate) struct EpollReactor {
    epfd: RawFd,
    wakener: Arc<EventFdWakener>,
    /// Current interest mask per registered fd.
    interests: HashMap<RawFd, u32>,
    events: Vec<libc::epoll_event>,
}

impl EpollReactor {
    pub(crate) fn new() -> Result<EpollReactor, crate::error::Error> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(crate::error::Error::Io(io::Error::last_os_error()));
        }
        let wakener = EventFdWakener::new().map_err(|e| {
            unsafe { libc::close(epfd) };
            crate::error::Error::Io(e)
        })?;
        let reactor = EpollReactor {
            epfd,
            wakener,
            interests: HashMap::new(),
            events: vec![unsafe { std::mem::zeroed() }; EVENT_BATCH],
        };
        reactor.ctl(
            libc::EPOLL_CTL_ADD,
            reactor.wakener.fd(),
            (libc::EPOLLIN | libc::EPOLLET) as u32,
        )?;
        Ok(reactor)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_interest(&mut self, fd: RawFd, mask: u32) -> io::Result<()> {
        match self.interests.get_mut(&fd) {
            Some(current) if *current == mask => Ok(()),
            Some(current) => {
                *current = mask;
                self.ctl(libc::EPOLL_CTL_MOD, fd, mask)
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "fd not registered with reactor",
            )),
        }
    }

    fn update(&mut self, fd: RawFd, add: u32, remove: u32) -> io::Result<()> {
        let current = *self
            .interests
            .get(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "fd not registered"))?;
        self.set_interest(fd, (current | add) & !remove)
    }
}

impl Reactor for EpollReactor {
    fn kind(&self) -> ReactorKind {
        ReactorKind::Readiness
    }

    fn wakener(&self) -> Arc<dyn Wakener> {
        self.wakener.clone()
    }

    fn register(&mut self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, 0)?;
        self.interests.insert(fd, 0);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.interests.remove(&fd);
        // The fd may already be closed; removal is best effort.
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        Ok(())
    }

    fn arm_read(&mut self, fd: RawFd, _buf: *mut u8, _len: usize) -> io::Result<()> {
        self.update(fd, libc::EPOLLIN as u32, 0)
    }

    fn arm_write(&mut self, fd: RawFd, _iov: *const libc::iovec, _iovcnt: usize) -> io::Result<()> {
        self.update(fd, libc::EPOLLOUT as u32, 0)
    }

    fn disarm_write(&mut self, fd: RawFd) -> io::Result<()> {
        self.update(fd, 0, libc::EPOLLOUT as u32)
    }

    fn arm_accept(
        &mut self,
        fd: RawFd,
        _addr: *mut libc::sockaddr_storage,
        _len: *mut libc::socklen_t,
    ) -> io::Result<()> {
        self.update(fd, libc::EPOLLIN as u32, 0)
    }

    fn arm_connect(
        &mut self,
        fd: RawFd,
        _addr: *const libc::sockaddr_storage,
        _len: libc::socklen_t,
    ) -> io::Result<()> {
        // The nonblocking connect was issued by socket code; writability
        // reports the outcome.
        self.update(fd, libc::EPOLLOUT as u32, 0)
    }

    fn submit(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn poll(&mut self, park: ParkMode, events: &mut Vec<IoEvent>) -> io::Result<()> {
        let timeout_ms: libc::c_int = match park {
            ParkMode::NoWait => 0,
            ParkMode::Wait => -1,
            ParkMode::Timeout(d) => {
                let ms = d.as_nanos().div_ceil(1_000_000);
                ms.clamp(1, libc::c_int::MAX as u128) as libc::c_int
            }
        };
        let ready = loop {
            let ret = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    self.events.as_mut_ptr(),
                    self.events.len() as libc::c_int,
                    timeout_ms,
                )
            };
            if ret >= 0 {
                break ret as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        if ready == 0 {
            if matches!(park, ParkMode::Timeout(_)) {
                events.push(IoEvent::TimerFired);
            }
            return Ok(());
        }

        for i in 0..ready {
            let ev = self.events[i];
            let fd = ev.u64 as RawFd;
            if fd == self.wakener.fd() {
                events.push(IoEvent::Wakeup);
                continue;
            }
            if !self.interests.contains_key(&fd) {
                // Event for an fd this loop no longer tracks: drop it
                // from the interest set so it cannot fire again.
                warn!("epoll event for unknown fd {fd}, deregistering");
                let _ = self.deregister(fd);
                continue;
            }
            let mask = ev.events;
            let readable = mask & libc::EPOLLIN as u32 != 0;
            let writable = mask & libc::EPOLLOUT as u32 != 0;
            let failed = mask & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
            if readable {
                events.push(IoEvent::Readable { fd });
            }
            if writable {
                events.push(IoEvent::Writable { fd });
            }
            if failed && !readable && !writable {
                events.push(IoEvent::Failed { fd });
            }
        }
        Ok(())
    }
}

impl Drop for EpollReactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn wakeup_unparks_wait() {
        let mut reactor = EpollReactor::new().unwrap();
        let wakener = reactor.wakener();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            wakener.wake();
        });
        let mut events = Vec::new();
        reactor.poll(ParkMode::Wait, &mut events).unwrap();
        handle.join().unwrap();
        assert!(events.iter().any(|e| matches!(e, IoEvent::Wakeup)));
    }

    #[test]
    fn park_timeout_elapses() {
        let mut reactor = EpollReactor::new().unwrap();
        let mut events = Vec::new();
        let start = Instant::now();
        reactor
            .poll(ParkMode::Timeout(Duration::from_millis(25)), &mut events)
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(events.iter().any(|e| matches!(e, IoEvent::TimerFired)));
    }

    #[test]
    fn pipe_readability_reported() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        let mut reactor = EpollReactor::new().unwrap();
        reactor.register(rd).unwrap();
        reactor.arm_read(rd, std::ptr::null_mut(), 0).unwrap();

        assert_eq!(
            unsafe { libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1) },
            1
        );
        let mut events = Vec::new();
        reactor
            .poll(ParkMode::Timeout(Duration::from_secs(1)), &mut events)
            .unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, IoEvent::Readable { fd } if *fd == rd)));

        reactor.deregister(rd).unwrap();
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
