//! Completion-ring backend over io_uring.
//!
//! Operations are submitted as SQEs tagged through [`UserData`]; CQEs are
//! drained in batches and dispatched by fd. An always-armed eventfd read
//! supplies the cross-thread wakeup; its completion re-arms itself. The
//! park budget rides a timeout SQE whose timespec stays alive in the
//! reactor until its CQE arrives.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use io_uring::types::{Fd, Timespec};
use io_uring::{opcode, squeue, IoUring};

use crate::config::ReactorKind;

use super::{EventFdWakener, IoEvent, ParkMode, Reactor, Wakener};

/// Operation tags encoded in the upper 8 bits of user_data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum OpTag {
    Read = 0,
    Writev = 1,
    Accept = 2,
    Connect = 3,
    /// Always-armed eventfd read backing `wakeup()`.
    EventFdRead = 4,
    /// Park-budget timeout; completion unparks the loop.
    ParkTimeout = 5,
    /// Cancel of a stale park timeout (informational CQE only).
    Cancel = 6,
}

impl OpTag {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(OpTag::Read),
            1 => Some(OpTag::Writev),
            2 => Some(OpTag::Accept),
            3 => Some(OpTag::Connect),
            4 => Some(OpTag::EventFdRead),
            5 => Some(OpTag::ParkTimeout),
            6 => Some(OpTag::Cancel),
            _ => None,
        }
    }
}

/// Encoded user_data: tag in bits 63..56, fd in bits 31..0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UserData(pub u64);

impl UserData {
    const TAG_SHIFT: u64 = 56;

    #[inline]
    pub(crate) fn encode(tag: OpTag, fd: RawFd) -> Self {
        UserData(((tag as u64) << Self::TAG_SHIFT) | (fd as u32 as u64))
    }

    #[inline]
    pub(crate) fn tag(self) -> Option<OpTag> {
        OpTag::from_u8((self.0 >> Self::TAG_SHIFT) as u8)
    }

    #[inline]
    pub(crate) fn fd(self) -> RawFd {
        self.0 as u32 as RawFd
    }

    #[inline]
    pub(crate) fn raw(self) -> u64 {
        self.0
    }
}

pub(crate) struct UringReactor {
    ring: IoUring,
    wakener: Arc<EventFdWakener>,
    eventfd_buf: Box<[u8; 8]>,
    /// Timespec for the in-flight park timeout. Boxed so the pointer
    /// handed to the kernel stays stable.
    park_ts: Box<Timespec>,
    park_armed: bool,
    park_deadline: Option<Instant>,
    /// CQE batch, drained before dispatch so handlers can submit freely.
    cqe_batch: Vec<(u64, i32)>,
}

impl UringReactor {
    pub(crate) fn new(ring_size: u32) -> Result<UringReactor, crate::error::Error> {
        let ring = IoUring::new(ring_size)
            .map_err(|e| crate::error::Error::ReactorSetup(format!("io_uring: {e}")))?;
        let wakener = EventFdWakener::new()?;
        let mut reactor = UringReactor {
            ring,
            wakener,
            eventfd_buf: Box::new([0u8; 8]),
            park_ts: Box::new(Timespec::new()),
            park_armed: false,
            park_deadline: None,
            cqe_batch: Vec::with_capacity(ring_size as usize),
        };
        reactor.arm_eventfd_read()?;
        Ok(reactor)
    }

    fn arm_eventfd_read(&mut self) -> io::Result<()> {
        let ud = UserData::encode(OpTag::EventFdRead, self.wakener.fd());
        let entry = opcode::Read::new(
            Fd(self.wakener.fd()),
            self.eventfd_buf.as_mut_ptr(),
            8,
        )
        .build()
        .user_data(ud.raw());
        self.push_sqe(entry)
    }

    /// Push an SQE; on a full submission queue, submit first to make room.
    fn push_sqe(&mut self, entry: squeue::Entry) -> io::Result<()> {
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.ring.submit()?;
                if self.ring.submission().push(&entry).is_err() {
                    return Err(io::Error::other("submission queue full after submit"));
                }
            }
        }
        Ok(())
    }

    fn drain_cq(&mut self, events: &mut Vec<IoEvent>) -> io::Result<()> {
        self.cqe_batch.clear();
        for cqe in self.ring.completion() {
            self.cqe_batch.push((cqe.user_data(), cqe.result()));
        }
        for i in 0..self.cqe_batch.len() {
            let (raw, result) = self.cqe_batch[i];
            let ud = UserData(raw);
            let tag = match ud.tag() {
                Some(t) => t,
                None => continue,
            };
            match tag {
                OpTag::Read => events.push(IoEvent::ReadDone { fd: ud.fd(), result }),
                OpTag::Writev => events.push(IoEvent::WriteDone { fd: ud.fd(), result }),
                OpTag::Accept => events.push(IoEvent::AcceptDone { fd: ud.fd(), result }),
                OpTag::Connect => events.push(IoEvent::ConnectDone { fd: ud.fd(), result }),
                OpTag::EventFdRead => {
                    self.arm_eventfd_read()?;
                    events.push(IoEvent::Wakeup);
                }
                OpTag::ParkTimeout => {
                    self.park_armed = false;
                    self.park_deadline = None;
                    if result == -libc::ETIME {
                        events.push(IoEvent::TimerFired);
                    }
                }
                OpTag::Cancel => {}
            }
        }
        Ok(())
    }

    /// Arm (or reuse) the park timeout for `timeout` from now, then wait.
    /// A stale later deadline is cancelled and the park degrades to a
    /// plain submit for one iteration.
    fn park_with_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        if self.park_armed {
            match self.park_deadline {
                Some(existing) if existing <= deadline => {
                    // Existing timeout fires first; it bounds this park.
                    self.ring.submitter().submit_and_wait(1)?;
                    return Ok(());
                }
                _ => {
                    let target = UserData::encode(OpTag::ParkTimeout, self.wakener.fd());
                    let cancel = opcode::AsyncCancel::new(target.raw())
                        .build()
                        .user_data(UserData::encode(OpTag::Cancel, 0).raw());
                    self.push_sqe(cancel)?;
                    self.ring.submit()?;
                    return Ok(());
                }
            }
        }
        *self.park_ts = Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());
        let ud = UserData::encode(OpTag::ParkTimeout, self.wakener.fd());
        let entry = opcode::Timeout::new(&*self.park_ts as *const Timespec)
            .build()
            .user_data(ud.raw());
        self.push_sqe(entry)?;
        self.park_armed = true;
        self.park_deadline = Some(deadline);
        self.ring.submitter().submit_and_wait(1)?;
        Ok(())
    }
}

impl Reactor for UringReactor {
    fn kind(&self) -> ReactorKind {
        ReactorKind::CompletionRing
    }

    fn wakener(&self) -> Arc<dyn Wakener> {
        self.wakener.clone()
    }

    fn register(&mut self, _fd: RawFd) -> io::Result<()> {
        // Nothing to pre-register; interest is expressed per operation.
        Ok(())
    }

    fn deregister(&mut self, _fd: RawFd) -> io::Result<()> {
        // In-flight SQEs on a closed fd complete with an error and are
        // dropped by the dispatcher, which no longer knows the fd.
        Ok(())
    }

    fn arm_read(&mut self, fd: RawFd, buf: *mut u8, len: usize) -> io::Result<()> {
        let ud = UserData::encode(OpTag::Read, fd);
        let entry = opcode::Read::new(Fd(fd), buf, len as u32)
            .build()
            .user_data(ud.raw());
        self.push_sqe(entry)
    }

    fn arm_write(&mut self, fd: RawFd, iov: *const libc::iovec, iovcnt: usize) -> io::Result<()> {
        let ud = UserData::encode(OpTag::Writev, fd);
        let entry = opcode::Writev::new(Fd(fd), iov, iovcnt as u32)
            .build()
            .user_data(ud.raw());
        self.push_sqe(entry)
    }

    fn disarm_write(&mut self, _fd: RawFd) -> io::Result<()> {
        // Completion model: nothing armed beyond the in-flight writev.
        Ok(())
    }

    fn arm_accept(
        &mut self,
        fd: RawFd,
        addr: *mut libc::sockaddr_storage,
        len: *mut libc::socklen_t,
    ) -> io::Result<()> {
        let ud = UserData::encode(OpTag::Accept, fd);
        let entry = opcode::Accept::new(Fd(fd), addr as *mut libc::sockaddr, len)
            .flags(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
            .build()
            .user_data(ud.raw());
        self.push_sqe(entry)
    }

    fn arm_connect(
        &mut self,
        fd: RawFd,
        addr: *const libc::sockaddr_storage,
        len: libc::socklen_t,
    ) -> io::Result<()> {
        let ud = UserData::encode(OpTag::Connect, fd);
        let entry = opcode::Connect::new(Fd(fd), addr as *const libc::sockaddr, len)
            .build()
            .user_data(ud.raw());
        self.push_sqe(entry)
    }

    fn cancel_ops(&mut self, fd: RawFd) -> io::Result<()> {
        for tag in [OpTag::Read, OpTag::Writev, OpTag::Accept, OpTag::Connect] {
            let target = UserData::encode(tag, fd);
            let entry = opcode::AsyncCancel::new(target.raw())
                .build()
                .user_data(UserData::encode(OpTag::Cancel, fd).raw());
            self.push_sqe(entry)?;
        }
        self.ring.submit()?;
        Ok(())
    }

    fn submit(&mut self) -> io::Result<()> {
        self.ring.submit()?;
        Ok(())
    }

    fn poll(&mut self, park: ParkMode, events: &mut Vec<IoEvent>) -> io::Result<()> {
        match park {
            ParkMode::NoWait => {}
            ParkMode::Wait => {
                self.ring.submitter().submit_and_wait(1)?;
            }
            ParkMode::Timeout(timeout) => {
                self.park_with_timeout(timeout)?;
            }
        }
        self.drain_cq(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_round_trip() {
        for tag in [
            OpTag::Read,
            OpTag::Writev,
            OpTag::Accept,
            OpTag::Connect,
            OpTag::EventFdRead,
            OpTag::ParkTimeout,
        ] {
            let ud = UserData::encode(tag, 0x7FFF_1234);
            assert_eq!(ud.tag(), Some(tag));
            assert_eq!(ud.fd(), 0x7FFF_1234);
        }
    }

    #[test]
    fn invalid_tag_decodes_to_none() {
        let ud = UserData(0xFFu64 << 56);
        assert_eq!(ud.tag(), None);
    }

    #[test]
    fn wakeup_unparks_wait() {
        // io_uring may be unavailable (seccomp, old kernel); skip then.
        let mut reactor = match UringReactor::new(64) {
            Ok(r) => r,
            Err(_) => return,
        };
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
    fn park_timeout_fires() {
        let mut reactor = match UringReactor::new(64) {
            Ok(r) => r,
            Err(_) => return,
        };
        let mut events = Vec::new();
        let start = Instant::now();
        reactor
            .poll(ParkMode::Timeout(Duration::from_millis(30)), &mut events)
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert!(events.iter().any(|e| matches!(e, IoEvent::TimerFired)));
    }
}
