//! Portable selector backend over the `polling` crate.
//!
//! Runs wherever `polling` does (epoll, kqueue, event ports, IOCP). The
//! cross-thread wakeup is `Poller::notify`, the crate's self-pipe
//! equivalent. Sockets are watched in level mode; write interest is
//! toggled like the epoll backend.

use std::collections::HashMap;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use polling::{Event, Events, PollMode, Poller};

use crate::config::ReactorKind;

use super::{IoEvent, ParkMode, Reactor, Wakener};

struct PollerWakener {
    poller: Arc<Poller>,
}

impl Wakener for PollerWakener {
    fn wake(&self) {
        // A failed notify means the poller is gone; the loop is too.
        let _ = self.poller.notify();
    }
}

#[derive(Clone, Copy, Default)]
struct Interest {
    readable: bool,
    writable: bool,
}

pub(crate) struct PortableReactor {
    poller: Arc<Poller>,
    events: Events,
    interests: HashMap<RawFd, Interest>,
}

impl PortableReactor {
    pub(crate) fn new() -> Result<PortableReactor, crate::error::Error> {
        let poller = Poller::new()
            .map_err(|e| crate::error::Error::ReactorSetup(format!("poller: {e}")))?;
        Ok(PortableReactor {
            poller: Arc::new(poller),
            events: Events::new(),
            interests: HashMap::new(),
        })
    }

    fn apply(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = Event::none(fd as usize);
        event.readable = interest.readable;
        event.writable = interest.writable;
        // Safety: the fd outlives its registration; `deregister` runs
        // before the owning channel closes it.
        let source = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller.modify_with_mode(source, event, PollMode::Level)
    }

    fn update(&mut self, fd: RawFd, f: impl FnOnce(&mut Interest)) -> io::Result<()> {
        let mut interest = *self
            .interests
            .get(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "fd not registered"))?;
        let before = (interest.readable, interest.writable);
        f(&mut interest);
        if before == (interest.readable, interest.writable) {
            return Ok(());
        }
        self.apply(fd, interest)?;
        self.interests.insert(fd, interest);
        Ok(())
    }
}

impl Reactor for PortableReactor {
    fn kind(&self) -> ReactorKind {
        ReactorKind::Portable
    }

    fn wakener(&self) -> Arc<dyn Wakener> {
        Arc::new(PollerWakener {
            poller: self.poller.clone(),
        })
    }

    fn register(&mut self, fd: RawFd) -> io::Result<()> {
        // Safety: as in `apply`; the source is only recorded by the poller.
        unsafe {
            self.poller
                .add_with_mode(fd, Event::none(fd as usize), PollMode::Level)?;
        }
        self.interests.insert(fd, Interest::default());
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.interests.remove(&fd);
        let source = unsafe { BorrowedFd::borrow_raw(fd) };
        // Best effort: the fd may already be gone.
        let _ = self.poller.delete(source);
        Ok(())
    }

    fn arm_read(&mut self, fd: RawFd, _buf: *mut u8, _len: usize) -> io::Result<()> {
        self.update(fd, |i| i.readable = true)
    }

    fn arm_write(&mut self, fd: RawFd, _iov: *const libc::iovec, _iovcnt: usize) -> io::Result<()> {
        self.update(fd, |i| i.writable = true)
    }

    fn disarm_write(&mut self, fd: RawFd) -> io::Result<()> {
        self.update(fd, |i| i.writable = false)
    }

    fn arm_accept(
        &mut self,
        fd: RawFd,
        _addr: *mut libc::sockaddr_storage,
        _len: *mut libc::socklen_t,
    ) -> io::Result<()> {
        self.update(fd, |i| i.readable = true)
    }

    fn arm_connect(
        &mut self,
        fd: RawFd,
        _addr: *const libc::sockaddr_storage,
        _len: libc::socklen_t,
    ) -> io::Result<()> {
        self.update(fd, |i| i.writable = true)
    }

    fn submit(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn poll(&mut self, park: ParkMode, events: &mut Vec<IoEvent>) -> io::Result<()> {
        let timeout = match park {
            ParkMode::NoWait => Some(Duration::ZERO),
            ParkMode::Wait => None,
            ParkMode::Timeout(d) => Some(d),
        };
        self.events.clear();
        self.poller.wait(&mut self.events, timeout)?;

        if self.events.is_empty() {
            // Either the park budget elapsed or a notify unparked us; the
            // loop treats both as a chance to re-check timers and queues.
            match park {
                ParkMode::Timeout(_) => events.push(IoEvent::TimerFired),
                ParkMode::Wait => events.push(IoEvent::Wakeup),
                ParkMode::NoWait => {}
            }
            return Ok(());
        }

        let batch: Vec<(RawFd, bool, bool, bool)> = self
            .events
            .iter()
            .map(|ev| {
                (
                    ev.key as RawFd,
                    ev.readable,
                    ev.writable,
                    ev.is_err().unwrap_or(false),
                )
            })
            .collect();
        for (fd, readable, writable, is_err) in batch {
            if !self.interests.contains_key(&fd) {
                warn!("selector event for unknown fd {fd}, deregistering");
                let _ = self.deregister(fd);
                continue;
            }
            if readable {
                events.push(IoEvent::Readable { fd });
            }
            if writable {
                events.push(IoEvent::Writable { fd });
            }
            if is_err && !readable && !writable {
                events.push(IoEvent::Failed { fd });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn notify_unparks_wait() {
        let mut reactor = PortableReactor::new().unwrap();
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
        let mut reactor = PortableReactor::new().unwrap();
        let mut events = Vec::new();
        let start = Instant::now();
        reactor
            .poll(ParkMode::Timeout(Duration::from_millis(25)), &mut events)
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
