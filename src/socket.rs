//! Asynchronous TCP sockets bound to one event loop.
//!
//! An [`AsyncSocket`] is a connection-oriented byte duplex owned by
//! exactly one loop after [`activate`](AsyncSocket::activate); every
//! callback (read handler, connect completion, closed listener) fires on
//! that loop's thread. The cross-thread surface is narrow: `write`
//! appends to a mutex-guarded pending queue with an atomic byte budget,
//! `flush` posts a drain task (or drains inline from the owner thread),
//! `close` is idempotent.
//!
//! Loop-local connection state lives in the loop's fd-indexed channel
//! table. Readiness backends drive nonblocking `read`/`writev`/`accept4`
//! syscalls from readiness events; the completion backend arms kernel
//! operations and reacts to their results. Buffer ownership: a queued
//! [`IoBuffer`] reference is released exactly once, when its last byte
//! is written or the socket closes.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use log::warn;

use crate::config::ReactorKind;
use crate::error::Error;
use crate::eventloop::{current_if, EventLoop, LoopCore};
use crate::iobuffer::IoBuffer;
use crate::metrics;
use crate::reactor::{sockaddr_to_socket_addr, socket_addr_to_sockaddr};

/// Gather limit per vectored write.
const MAX_IOVECS: usize = 64;
/// Minimum spare receive capacity before a read is issued.
const READ_CHUNK: usize = 4096;
/// Outbound byte budget used until activation installs the configured one.
const DEFAULT_OUTBOUND_LIMIT: usize = 1 << 20;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Frame consumer installed on a socket before activation.
///
/// `on_read` receives the receive accumulator positioned at the first
/// unconsumed byte and must decode zero or more *complete* frames,
/// returning once no full frame remains. Partial frames must not be
/// consumed. Runs on the owning loop thread; must not block.
pub trait ReadHandler: Send {
    fn on_read(&mut self, socket: &AsyncSocket, buffer: &mut IoBuffer);

    /// The socket closed; `cause` is the I/O error, if any.
    fn on_close(&mut self, _socket: &AsyncSocket, _cause: Option<&io::Error>) {}
}

type ClosedListener = Box<dyn FnOnce(Option<io::Error>) + Send>;
type AcceptHandler = Box<dyn FnMut(AsyncSocket) + Send>;

pub(crate) struct SocketShared {
    id: u64,
    fd: RawFd,
    closed: AtomicBool,
    connected: AtomicBool,
    /// Entry present in the owning loop's channel table.
    registered: AtomicBool,
    no_delay: AtomicBool,
    pending: Mutex<VecDeque<IoBuffer>>,
    pending_bytes: AtomicUsize,
    outbound_limit: AtomicUsize,
    eventloop: OnceLock<EventLoop>,
    handler: Mutex<Option<Box<dyn ReadHandler>>>,
    closed_listener: Mutex<Option<ClosedListener>>,
    peer_addr: Mutex<Option<SocketAddr>>,
}

/// Handle to an asynchronous TCP socket. Cheap to clone.
#[derive(Clone)]
pub struct AsyncSocket {
    shared: Arc<SocketShared>,
}

impl AsyncSocket {
    /// Create an unconnected nonblocking IPv4 socket.
    pub fn open() -> io::Result<AsyncSocket> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(AsyncSocket::wrap(fd, false, None))
    }

    fn wrap(fd: RawFd, connected: bool, peer: Option<SocketAddr>) -> AsyncSocket {
        AsyncSocket {
            shared: Arc::new(SocketShared {
                id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
                fd,
                closed: AtomicBool::new(false),
                connected: AtomicBool::new(connected),
                registered: AtomicBool::new(false),
                no_delay: AtomicBool::new(false),
                pending: Mutex::new(VecDeque::new()),
                pending_bytes: AtomicUsize::new(0),
                outbound_limit: AtomicUsize::new(DEFAULT_OUTBOUND_LIMIT),
                eventloop: OnceLock::new(),
                handler: Mutex::new(None),
                closed_listener: Mutex::new(None),
                peer_addr: Mutex::new(peer),
            }),
        }
    }

    pub(crate) fn from_accepted(fd: RawFd, peer: Option<SocketAddr>) -> AsyncSocket {
        AsyncSocket::wrap(fd, true, peer)
    }

    /// Stable identifier, used to correlate in-flight requests.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.shared.fd
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.shared.peer_addr.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Enable or disable Nagle's algorithm.
    pub fn tcp_no_delay(&self, enable: bool) -> io::Result<()> {
        self.shared.no_delay.store(enable, Ordering::Relaxed);
        set_nodelay(self.shared.fd, enable)
    }

    /// Install the frame consumer. Must run before `activate`.
    pub fn read_handler(&self, handler: impl ReadHandler + 'static) {
        *self.shared.handler.lock().unwrap() = Some(Box::new(handler));
    }

    /// One-shot close notification with the cause, if any.
    pub fn set_closed_listener(&self, listener: impl FnOnce(Option<io::Error>) + Send + 'static) {
        *self.shared.closed_listener.lock().unwrap() = Some(Box::new(listener));
    }

    /// Bind this socket to `eventloop`. Registration runs on the loop
    /// thread (posted when called from elsewhere).
    pub fn activate(&self, eventloop: &EventLoop) -> Result<(), Error> {
        if self.shared.eventloop.set(eventloop.clone()).is_err() {
            return Err(Error::InvalidConfig("socket already activated".into()));
        }
        let socket = self.clone();
        if let Some(core) = current_if(eventloop.shared()) {
            return core.register_stream(socket);
        }
        eventloop.submit(Box::new(move |core: &LoopCore| {
            let fd = socket.fd();
            if let Err(e) = core.register_stream(socket) {
                warn!("socket fd {fd} registration failed: {e}");
            }
        }))
    }

    /// Start a TCP connect; the future completes on the owning loop.
    pub fn connect(&self, addr: SocketAddr) -> ConnectFuture {
        let future = ConnectFuture::new();
        let eventloop = match self.shared.eventloop.get() {
            Some(l) => l.clone(),
            None => {
                future.complete(Err(io::Error::other("socket is not activated")));
                return future;
            }
        };
        let fd = self.shared.fd;
        let promise = future.clone();
        let submitted = if let Some(core) = current_if(eventloop.shared()) {
            core.start_connect(fd, addr, promise);
            Ok(())
        } else {
            eventloop.submit(Box::new(move |core: &LoopCore| {
                core.start_connect(fd, addr, promise)
            }))
        };
        if submitted.is_err() {
            future.complete(Err(io::Error::other("event loop is shut down")));
        }
        future
    }

    /// Queue a completed frame for writing. Returns `false`, releasing
    /// the handed-in reference, when the socket is closed or the
    /// outbound byte budget is exhausted; the budget frees up as flush
    /// progress is made.
    pub fn write(&self, buf: IoBuffer) -> bool {
        if self.is_closed() {
            return false;
        }
        let len = buf.remaining();
        let before = self.shared.pending_bytes.fetch_add(len, Ordering::AcqRel);
        if before + len > self.shared.outbound_limit.load(Ordering::Relaxed) {
            self.shared.pending_bytes.fetch_sub(len, Ordering::AcqRel);
            metrics::BACKPRESSURE_REJECTS.increment();
            return false;
        }
        self.shared.pending.lock().unwrap().push_back(buf);
        true
    }

    /// Request that pending writes be drained.
    pub fn flush(&self) {
        let Some(eventloop) = self.shared.eventloop.get() else {
            return;
        };
        let fd = self.shared.fd;
        if let Some(core) = current_if(eventloop.shared()) {
            core.flush_socket(fd);
            return;
        }
        let _ = eventloop.submit(Box::new(move |core: &LoopCore| core.flush_socket(fd)));
    }

    /// `write` + `flush`.
    pub fn write_and_flush(&self, buf: IoBuffer) -> bool {
        if !self.write(buf) {
            return false;
        }
        self.flush();
        true
    }

    /// `write_and_flush` without the cross-thread hop. Legal only on the
    /// owning loop thread; anywhere else is a programming error.
    pub fn unsafe_write_and_flush(&self, buf: IoBuffer) -> bool {
        let eventloop = self
            .shared
            .eventloop
            .get()
            .expect("unsafe_write_and_flush on an unactivated socket");
        let core = current_if(eventloop.shared())
            .expect("unsafe_write_and_flush called off the owning loop thread");
        if !self.write(buf) {
            return false;
        }
        core.flush_socket(self.shared.fd);
        true
    }

    /// Close the socket. Idempotent; queued buffers are released and no
    /// further callbacks fire after the close completes on the loop.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let fd = self.shared.fd;
        if !self.shared.registered.load(Ordering::Acquire) {
            // Never reached a loop: release queued buffers and the fd here.
            self.shared.pending.lock().unwrap().clear();
            self.shared.pending_bytes.store(0, Ordering::Release);
            unsafe { libc::close(fd) };
            if let Some(listener) = self.shared.closed_listener.lock().unwrap().take() {
                listener(None);
            }
            return;
        }
        let eventloop = self.shared.eventloop.get().expect("registered without loop");
        if let Some(core) = current_if(eventloop.shared()) {
            core.close_channel(fd, None);
            return;
        }
        // If the loop is already gone its terminate pass closed the fd.
        let _ = eventloop.submit(Box::new(move |core: &LoopCore| core.close_channel(fd, None)));
    }

    pub(crate) fn shared(&self) -> &Arc<SocketShared> {
        &self.shared
    }
}

impl std::fmt::Debug for AsyncSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSocket")
            .field("id", &self.shared.id)
            .field("fd", &self.shared.fd)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Completion promise for [`AsyncSocket::connect`].
pub struct ConnectFuture {
    state: Arc<(Mutex<Option<io::Result<()>>>, Condvar)>,
}

impl ConnectFuture {
    fn new() -> ConnectFuture {
        ConnectFuture {
            state: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    pub(crate) fn clone(&self) -> ConnectFuture {
        ConnectFuture {
            state: self.state.clone(),
        }
    }

    pub(crate) fn complete(&self, result: io::Result<()>) {
        let (lock, cv) = &*self.state;
        let mut slot = lock.lock().unwrap();
        if slot.is_none() {
            *slot = Some(result);
            cv.notify_all();
        }
    }

    /// Block until the connect resolves.
    pub fn join(self) -> io::Result<()> {
        let (lock, cv) = &*self.state;
        let mut slot = lock.lock().unwrap();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            slot = cv.wait(slot).unwrap();
        }
    }

    /// Block until the connect resolves or `timeout` elapses.
    pub fn join_timeout(self, timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        let (lock, cv) = &*self.state;
        let mut slot = lock.lock().unwrap();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
            }
            let (guard, _) = cv.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
        }
    }
}

// ── Server socket ───────────────────────────────────────────────────

struct ServerShared {
    fd: AtomicI32,
    eventloop: EventLoop,
    closed: AtomicBool,
    registered: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// Listening socket bound to one event loop.
#[derive(Clone)]
pub struct AsyncServerSocket {
    shared: Arc<ServerShared>,
}

impl AsyncServerSocket {
    /// Create a server socket owned by `eventloop`. The listening fd is
    /// created at `bind`, when the address family is known.
    pub fn open(eventloop: &EventLoop) -> AsyncServerSocket {
        AsyncServerSocket {
            shared: Arc::new(ServerShared {
                fd: AtomicI32::new(-1),
                eventloop: eventloop.clone(),
                closed: AtomicBool::new(false),
                registered: AtomicBool::new(false),
                local_addr: Mutex::new(None),
            }),
        }
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let domain = if addr.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        let fd = unsafe {
            libc::socket(
                domain,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
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
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = socket_addr_to_sockaddr(addr, &mut storage);
        let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        // Resolve the ephemeral port, if one was requested.
        let mut bound: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut bound_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(fd, &mut bound as *mut _ as *mut libc::sockaddr, &mut bound_len)
        };
        if ret == 0 {
            *self.shared.local_addr.lock().unwrap() = sockaddr_to_socket_addr(&bound, bound_len);
        }
        self.shared.fd.store(fd, Ordering::Release);
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().unwrap()
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        let fd = self.shared.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Err(io::Error::other("server socket is not bound"));
        }
        let ret = unsafe { libc::listen(fd, backlog) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Start accepting; `handler` runs on the owning loop for every new
    /// connection, which it typically configures and activates.
    pub fn accept(&self, handler: impl FnMut(AsyncSocket) + Send + 'static) -> Result<(), Error> {
        let fd = self.shared.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Err(Error::Io(io::Error::other("server socket is not bound")));
        }
        let server = self.clone();
        let boxed: AcceptHandler = Box::new(handler);
        if let Some(core) = current_if(self.shared.eventloop.shared()) {
            return core.register_listener(server, boxed);
        }
        self.shared.eventloop.submit(Box::new(move |core: &LoopCore| {
            let fd = server.shared.fd.load(Ordering::Acquire);
            if let Err(e) = core.register_listener(server, boxed) {
                warn!("listener fd {fd} registration failed: {e}");
            }
        }))
    }

    /// Stop listening and release the fd. Idempotent; accepts already
    /// dispatched to the handler still complete.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let fd = self.shared.fd.load(Ordering::Acquire);
        if fd < 0 {
            return;
        }
        if !self.shared.registered.load(Ordering::Acquire) {
            unsafe { libc::close(fd) };
            return;
        }
        if let Some(core) = current_if(self.shared.eventloop.shared()) {
            core.close_channel(fd, None);
            return;
        }
        let _ = self
            .shared
            .eventloop
            .submit(Box::new(move |core: &LoopCore| core.close_channel(fd, None)));
    }
}

// ── Loop-local channel state ────────────────────────────────────────

pub(crate) struct StreamChannel {
    socket: AsyncSocket,
    handler: Option<Box<dyn ReadHandler>>,
    recv: IoBuffer,
    /// Outbound chain being written; front buffer offset by `cursor`.
    out: VecDeque<IoBuffer>,
    cursor: usize,
    /// Stable iovec array for an in-flight completion-backend writev.
    iovecs: Vec<libc::iovec>,
    read_armed: bool,
    write_armed: bool,
    connecting: Option<ConnectFuture>,
    /// Stable sockaddr for an in-flight completion-backend connect.
    connect_addr: Box<libc::sockaddr_storage>,
}

pub(crate) struct ListenerChannel {
    server: AsyncServerSocket,
    handler: Option<AcceptHandler>,
    /// Stable accept address storage for the completion backend.
    accept_addr: Box<libc::sockaddr_storage>,
    accept_len: Box<libc::socklen_t>,
    accept_armed: bool,
}

/// A closed channel whose kernel operations are still in flight. The
/// completion backend may hold references into the receive buffer, the
/// iovec array and the sockaddr boxes, so the entry is parked here until
/// the cancelled completions drain; only then is the fd released (which
/// also keeps the fd number from being reused under the table slot).
pub(crate) struct ClosingChannel {
    pending: u8,
    stream: Option<StreamChannel>,
    /// Held only to keep the accept sockaddr storage alive.
    _listener: Option<ListenerChannel>,
}

pub(crate) enum Channel {
    Stream(StreamChannel),
    Listener(ListenerChannel),
    Closing(ClosingChannel),
}

/// fd-indexed arena of channels with O(1) lookup. Entries are owned by
/// the loop; fds are reused only after their entry is removed.
pub(crate) struct ChannelTable {
    entries: Vec<Option<Channel>>,
}

impl ChannelTable {
    pub(crate) fn new() -> ChannelTable {
        ChannelTable {
            entries: Vec::new(),
        }
    }

    fn insert(&mut self, fd: RawFd, channel: Channel) {
        let idx = fd as usize;
        if idx >= self.entries.len() {
            self.entries.resize_with(idx + 1, || None);
        }
        self.entries[idx] = Some(channel);
    }

    fn get_mut(&mut self, fd: RawFd) -> Option<&mut Channel> {
        self.entries.get_mut(fd as usize).and_then(|e| e.as_mut())
    }

    fn remove(&mut self, fd: RawFd) -> Option<Channel> {
        self.entries.get_mut(fd as usize).and_then(|e| e.take())
    }

    pub(crate) fn fds(&self) -> Vec<RawFd> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .map(|(i, _)| i as RawFd)
            .collect()
    }
}

// ── Loop-side socket driving ────────────────────────────────────────

impl LoopCore {
    fn completion_model(&self) -> bool {
        self.reactor.borrow().kind() == ReactorKind::CompletionRing
    }

    pub(crate) fn register_stream(&self, socket: AsyncSocket) -> Result<(), Error> {
        let fd = socket.fd();
        let shared = socket.shared().clone();
        eprintln!("DEBUG register_stream: fd {fd} closed={}", shared.closed.load(Ordering::Acquire));
        if shared.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if shared.no_delay.load(Ordering::Relaxed) {
            let _ = set_nodelay(fd, true);
        }
        shared
            .outbound_limit
            .store(self.config.outbound_limit_bytes, Ordering::Relaxed);
        if let Err(e) = self.reactor.borrow_mut().register(fd) {
            eprintln!("DEBUG register_stream: reactor.register failed for fd {fd}: {e}");
            return Err(e.into());
        }
        let handler = shared.handler.lock().unwrap().take();
        let channel = StreamChannel {
            socket: socket.clone(),
            handler,
            recv: IoBuffer::for_accumulation(self.config.recv_buffer_capacity),
            out: VecDeque::new(),
            cursor: 0,
            iovecs: Vec::with_capacity(MAX_IOVECS),
            read_armed: false,
            write_armed: false,
            connecting: None,
            connect_addr: Box::new(unsafe { std::mem::zeroed() }),
        };
        self.channels.borrow_mut().insert(fd, Channel::Stream(channel));
        shared.registered.store(true, Ordering::Release);
        metrics::CONNECTIONS_ACTIVE.increment();
        if shared.connected.load(Ordering::Acquire) {
            self.arm_read_for(fd)?;
            // Writes queued before activation drain now.
            self.flush_socket(fd);
        }
        Ok(())
    }

    pub(crate) fn register_listener(
        &self,
        server: AsyncServerSocket,
        handler: AcceptHandler,
    ) -> Result<(), Error> {
        let fd = server.shared.fd.load(Ordering::Acquire);
        if server.shared.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let completion = self.completion_model();
        self.reactor.borrow_mut().register(fd)?;
        let mut channel = ListenerChannel {
            server: server.clone(),
            handler: Some(handler),
            accept_addr: Box::new(unsafe { std::mem::zeroed() }),
            accept_len: Box::new(std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t),
            accept_armed: false,
        };
        {
            let mut reactor = self.reactor.borrow_mut();
            reactor.arm_accept(
                fd,
                &mut *channel.accept_addr as *mut libc::sockaddr_storage,
                &mut *channel.accept_len as *mut libc::socklen_t,
            )?;
            channel.accept_armed = completion;
        }
        self.channels
            .borrow_mut()
            .insert(fd, Channel::Listener(channel));
        server.shared.registered.store(true, Ordering::Release);
        Ok(())
    }

    fn arm_read_for(&self, fd: RawFd) -> Result<(), Error> {
        let completion = self.completion_model();
        let mut channels = self.channels.borrow_mut();
        let Some(Channel::Stream(entry)) = channels.get_mut(fd) else {
            return Ok(());
        };
        if completion {
            if entry.read_armed {
                return Ok(());
            }
            entry.recv.ensure_spare(READ_CHUNK);
            let (ptr, len) = entry.recv.spare_mut();
            self.reactor.borrow_mut().arm_read(fd, ptr, len)?;
            entry.read_armed = true;
        } else {
            self.reactor
                .borrow_mut()
                .arm_read(fd, std::ptr::null_mut(), 0)?;
        }
        Ok(())
    }

    // ── Read path ───────────────────────────────────────────────────

    pub(crate) fn handle_readable(self: &Rc<LoopCore>, fd: RawFd) {
        enum Kind {
            Stream,
            Listener,
        }
        let kind = match self.channels.borrow_mut().get_mut(fd) {
            Some(Channel::Stream(_)) => Kind::Stream,
            Some(Channel::Listener(_)) => Kind::Listener,
            Some(Channel::Closing(_)) | None => return,
        };
        match kind {
            Kind::Stream => self.stream_readable(fd),
            Kind::Listener => self.accept_ready(fd),
        }
    }

    fn stream_readable(self: &Rc<LoopCore>, fd: RawFd) {
        let (socket, mut handler, mut recv) = {
            let mut channels = self.channels.borrow_mut();
            let Some(Channel::Stream(entry)) = channels.get_mut(fd) else {
                return;
            };
            if entry.connecting.is_some() {
                // Selector backends may report a failed connect as
                // readable; resolve the handshake instead of reading.
                drop(channels);
                self.finish_connect_readiness(fd);
                return;
            }
            (
                entry.socket.clone(),
                entry.handler.take(),
                std::mem::take(&mut entry.recv),
            )
        };

        let mut eof = false;
        let mut cause: Option<io::Error> = None;
        let mut received = 0usize;
        loop {
            recv.ensure_spare(READ_CHUNK);
            let (ptr, len) = recv.spare_mut();
            let n = unsafe { libc::read(fd, ptr as *mut libc::c_void, len) };
            if n > 0 {
                recv.advance_limit(n as usize);
                received += n as usize;
                continue;
            }
            if n == 0 {
                eof = true;
                break;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => break,
                Some(libc::EINTR) => continue,
                _ => {
                    cause = Some(err);
                    break;
                }
            }
        }

        if received > 0 {
            metrics::BYTES_RECEIVED.add(received as u64);
            if let Some(h) = handler.as_mut() {
                h.on_read(&socket, &mut recv);
            }
        }
        recv.compact();
        self.restore_stream(fd, &socket, handler, recv);

        if eof || cause.is_some() {
            self.close_channel(fd, cause);
        }
    }

    pub(crate) fn handle_read_done(self: &Rc<LoopCore>, fd: RawFd, result: i32) {
        if self.closing_op_done(fd, None) {
            return;
        }
        let (socket, mut handler, mut recv) = {
            let mut channels = self.channels.borrow_mut();
            let Some(Channel::Stream(entry)) = channels.get_mut(fd) else {
                return;
            };
            entry.read_armed = false;
            if result < 0 {
                let errno = -result;
                if errno == libc::ECANCELED || errno == libc::EAGAIN || errno == libc::EINTR {
                    drop(channels);
                    let _ = self.arm_read_for(fd);
                    return;
                }
                drop(channels);
                self.close_channel(fd, Some(io::Error::from_raw_os_error(errno)));
                return;
            }
            if result == 0 {
                drop(channels);
                self.close_channel(fd, None);
                return;
            }
            (
                entry.socket.clone(),
                entry.handler.take(),
                std::mem::take(&mut entry.recv),
            )
        };

        recv.advance_limit(result as usize);
        metrics::BYTES_RECEIVED.add(result as u64);
        if let Some(h) = handler.as_mut() {
            h.on_read(&socket, &mut recv);
        }
        recv.compact();
        self.restore_stream(fd, &socket, handler, recv);
        if let Err(e) = self.arm_read_for(fd) {
            self.close_channel(fd, Some(io::Error::other(e.to_string())));
        }
    }

    /// Put handler and accumulator back; if the entry vanished (the
    /// handler closed its own socket) notify and drop them.
    fn restore_stream(
        &self,
        fd: RawFd,
        socket: &AsyncSocket,
        mut handler: Option<Box<dyn ReadHandler>>,
        recv: IoBuffer,
    ) {
        let mut channels = self.channels.borrow_mut();
        match channels.get_mut(fd) {
            Some(Channel::Stream(entry)) if entry.socket.id() == socket.id() => {
                entry.handler = handler;
                entry.recv = recv;
            }
            _ => {
                drop(channels);
                if let Some(h) = handler.as_mut() {
                    h.on_close(socket, None);
                }
            }
        }
    }

    // ── Write path ──────────────────────────────────────────────────

    pub(crate) fn flush_socket(&self, fd: RawFd) {
        let connected = {
            let mut channels = self.channels.borrow_mut();
            let Some(Channel::Stream(entry)) = channels.get_mut(fd) else {
                return;
            };
            entry.connecting.is_none()
                && entry.socket.shared().connected.load(Ordering::Acquire)
        };
        if !connected {
            // The connect completion re-runs the flush.
            return;
        }
        if self.completion_model() {
            self.submit_writev(fd);
        } else {
            self.drain_readiness(fd);
        }
    }

    pub(crate) fn handle_writable(self: &Rc<LoopCore>, fd: RawFd) {
        let connecting = {
            let mut channels = self.channels.borrow_mut();
            match channels.get_mut(fd) {
                Some(Channel::Stream(entry)) => entry.connecting.is_some(),
                _ => return,
            }
        };
        if connecting {
            self.finish_connect_readiness(fd);
        } else {
            self.drain_readiness(fd);
        }
    }

    fn drain_readiness(&self, fd: RawFd) {
        loop {
            let mut channels = self.channels.borrow_mut();
            let Some(Channel::Stream(entry)) = channels.get_mut(fd) else {
                return;
            };
            let shared = entry.socket.shared().clone();
            {
                let mut pending = shared.pending.lock().unwrap();
                entry.out.extend(pending.drain(..));
            }
            if entry.out.is_empty() {
                if entry.write_armed {
                    entry.write_armed = false;
                    let _ = self.reactor.borrow_mut().disarm_write(fd);
                }
                return;
            }

            let mut iovecs: [libc::iovec; MAX_IOVECS] = unsafe { std::mem::zeroed() };
            let mut count = 0usize;
            for (i, buf) in entry.out.iter().enumerate() {
                if count == MAX_IOVECS {
                    break;
                }
                let slice = buf.as_read_slice();
                let offset = if i == 0 { entry.cursor } else { 0 };
                iovecs[count] = libc::iovec {
                    iov_base: slice[offset..].as_ptr() as *mut libc::c_void,
                    iov_len: slice.len() - offset,
                };
                count += 1;
            }
            let n = unsafe { libc::writev(fd, iovecs.as_ptr(), count as libc::c_int) };
            if n >= 0 {
                Self::advance_out(entry, &shared, n as usize);
                continue;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => {
                    entry.write_armed = true;
                    if let Err(e) = self.reactor.borrow_mut().arm_write(fd, std::ptr::null(), 0) {
                        warn!("arming write interest on fd {fd} failed: {e}");
                    }
                    return;
                }
                Some(libc::EINTR) => continue,
                _ => {
                    drop(channels);
                    self.close_channel_raw(fd, Some(err));
                    return;
                }
            }
        }
    }

    fn submit_writev(&self, fd: RawFd) {
        let mut channels = self.channels.borrow_mut();
        let Some(Channel::Stream(entry)) = channels.get_mut(fd) else {
            return;
        };
        if entry.write_armed {
            return;
        }
        let shared = entry.socket.shared().clone();
        {
            let mut pending = shared.pending.lock().unwrap();
            entry.out.extend(pending.drain(..));
        }
        if entry.out.is_empty() {
            return;
        }
        entry.iovecs.clear();
        for (i, buf) in entry.out.iter().enumerate() {
            if entry.iovecs.len() == MAX_IOVECS {
                break;
            }
            let slice = buf.as_read_slice();
            let offset = if i == 0 { entry.cursor } else { 0 };
            entry.iovecs.push(libc::iovec {
                iov_base: slice[offset..].as_ptr() as *mut libc::c_void,
                iov_len: slice.len() - offset,
            });
        }
        let ptr = entry.iovecs.as_ptr();
        let count = entry.iovecs.len();
        match self.reactor.borrow_mut().arm_write(fd, ptr, count) {
            Ok(()) => entry.write_armed = true,
            Err(e) => {
                drop(channels);
                self.close_channel_raw(fd, Some(e));
            }
        }
    }

    pub(crate) fn handle_write_done(self: &Rc<LoopCore>, fd: RawFd, result: i32) {
        if self.closing_op_done(fd, None) {
            return;
        }
        {
            let mut channels = self.channels.borrow_mut();
            let Some(Channel::Stream(entry)) = channels.get_mut(fd) else {
                return;
            };
            entry.write_armed = false;
            if result < 0 {
                let errno = -result;
                if errno != libc::ECANCELED {
                    drop(channels);
                    self.close_channel(fd, Some(io::Error::from_raw_os_error(errno)));
                }
                return;
            }
            let shared = entry.socket.shared().clone();
            Self::advance_out(entry, &shared, result as usize);
        }
        self.submit_writev(fd);
    }

    /// Retire `written` bytes from the outbound chain: fully written
    /// buffers are released (exactly once, in write order) and the byte
    /// budget is returned.
    fn advance_out(entry: &mut StreamChannel, shared: &Arc<SocketShared>, written: usize) {
        metrics::BYTES_SENT.add(written as u64);
        shared.pending_bytes.fetch_sub(written, Ordering::AcqRel);
        let mut n = written;
        while n > 0 {
            let front_remaining = entry.out[0].remaining() - entry.cursor;
            if n >= front_remaining {
                let done = entry.out.pop_front().expect("chain accounting");
                done.release();
                entry.cursor = 0;
                n -= front_remaining;
            } else {
                entry.cursor += n;
                n = 0;
            }
        }
    }

    // ── Accept path ─────────────────────────────────────────────────

    fn accept_ready(self: &Rc<LoopCore>, fd: RawFd) {
        let mut handler = {
            let mut channels = self.channels.borrow_mut();
            let Some(Channel::Listener(entry)) = channels.get_mut(fd) else {
                return;
            };
            entry.handler.take()
        };
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let n = unsafe {
                libc::accept4(
                    fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if n >= 0 {
                metrics::CONNECTIONS_ACCEPTED.increment();
                let peer = sockaddr_to_socket_addr(&storage, len);
                let socket = AsyncSocket::from_accepted(n, peer);
                if let Some(h) = handler.as_mut() {
                    h(socket);
                } else {
                    socket.close();
                }
                continue;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => break,
                Some(libc::EINTR) | Some(libc::ECONNABORTED) => continue,
                _ => {
                    warn!("accept on fd {fd} failed: {err}");
                    break;
                }
            }
        }
        let mut channels = self.channels.borrow_mut();
        if let Some(Channel::Listener(entry)) = channels.get_mut(fd) {
            if handler.is_some() {
                entry.handler = handler;
            }
        }
    }

    pub(crate) fn handle_accept_done(self: &Rc<LoopCore>, fd: RawFd, result: i32) {
        let accepted = if result >= 0 { Some(result) } else { None };
        if self.closing_op_done(fd, accepted) {
            return;
        }
        let (mut handler, peer) = {
            let mut channels = self.channels.borrow_mut();
            let Some(Channel::Listener(entry)) = channels.get_mut(fd) else {
                return;
            };
            entry.accept_armed = false;
            if result < 0 {
                let errno = -result;
                if errno == libc::ECANCELED {
                    return;
                }
                warn!(
                    "accept on fd {fd} failed: {}",
                    io::Error::from_raw_os_error(errno)
                );
                // Fall through to re-arm below with the handler in place.
                (None, None)
            } else {
                let peer = sockaddr_to_socket_addr(&entry.accept_addr, *entry.accept_len);
                (entry.handler.take(), peer)
            }
        };
        if result >= 0 {
            metrics::CONNECTIONS_ACCEPTED.increment();
            let socket = AsyncSocket::from_accepted(result, peer);
            if let Some(h) = handler.as_mut() {
                h(socket);
            } else {
                socket.close();
            }
        }
        let mut channels = self.channels.borrow_mut();
        if let Some(Channel::Listener(entry)) = channels.get_mut(fd) {
            if handler.is_some() {
                entry.handler = handler;
            }
            *entry.accept_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let addr = &mut *entry.accept_addr as *mut libc::sockaddr_storage;
            let len = &mut *entry.accept_len as *mut libc::socklen_t;
            match self.reactor.borrow_mut().arm_accept(fd, addr, len) {
                Ok(()) => entry.accept_armed = true,
                Err(e) => warn!("re-arming accept on fd {fd} failed: {e}"),
            }
        }
    }

    // ── Connect path ────────────────────────────────────────────────

    pub(crate) fn start_connect(&self, fd: RawFd, addr: SocketAddr, promise: ConnectFuture) {
        let completion = self.completion_model();
        let mut channels = self.channels.borrow_mut();
        let Some(Channel::Stream(entry)) = channels.get_mut(fd) else {
            eprintln!("DEBUG start_connect: fd {fd} not in channels, len={}", channels.entries.len());
            promise.complete(Err(io::Error::other("socket is not registered")));
            return;
        };
        *entry.socket.shared().peer_addr.lock().unwrap() = Some(addr);
        let len = socket_addr_to_sockaddr(addr, &mut entry.connect_addr);
        entry.connecting = Some(promise.clone());
        if completion {
            let ptr = &*entry.connect_addr as *const libc::sockaddr_storage;
            if let Err(e) = self.reactor.borrow_mut().arm_connect(fd, ptr, len) {
                entry.connecting = None;
                drop(channels);
                promise.complete(Err(e));
                self.close_channel_raw(fd, None);
            }
            return;
        }
        let ret = unsafe {
            libc::connect(
                fd,
                &*entry.connect_addr as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if ret == 0 {
            drop(channels);
            self.connect_finished(fd, Ok(()));
            return;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            let ptr = &*entry.connect_addr as *const libc::sockaddr_storage;
            if let Err(e) = self.reactor.borrow_mut().arm_connect(fd, ptr, len) {
                entry.connecting = None;
                drop(channels);
                promise.complete(Err(e));
                self.close_channel_raw(fd, None);
            }
            return;
        }
        entry.connecting = None;
        drop(channels);
        promise.complete(Err(err));
        self.close_channel_raw(fd, None);
    }

    fn finish_connect_readiness(self: &Rc<LoopCore>, fd: RawFd) {
        let result = match socket_error(fd) {
            Ok(None) => Ok(()),
            Ok(Some(err)) | Err(err) => Err(err),
        };
        {
            let mut channels = self.channels.borrow_mut();
            if let Some(Channel::Stream(entry)) = channels.get_mut(fd) {
                if entry.write_armed {
                    // Write interest was for the handshake only.
                    entry.write_armed = false;
                }
                let _ = self.reactor.borrow_mut().disarm_write(fd);
            }
        }
        self.connect_finished(fd, result);
    }

    pub(crate) fn handle_connect_done(self: &Rc<LoopCore>, fd: RawFd, result: i32) {
        if self.closing_op_done(fd, None) {
            return;
        }
        let outcome = if result == 0 {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(-result))
        };
        self.connect_finished(fd, outcome);
    }

    fn connect_finished(&self, fd: RawFd, result: io::Result<()>) {
        let promise = {
            let mut channels = self.channels.borrow_mut();
            let Some(Channel::Stream(entry)) = channels.get_mut(fd) else {
                return;
            };
            match entry.connecting.take() {
                Some(p) => p,
                None => return,
            }
        };
        match result {
            Ok(()) => {
                {
                    let mut channels = self.channels.borrow_mut();
                    let Some(Channel::Stream(entry)) = channels.get_mut(fd) else {
                        return;
                    };
                    entry.socket.shared().connected.store(true, Ordering::Release);
                }
                promise.complete(Ok(()));
                if let Err(e) = self.arm_read_for(fd) {
                    self.close_channel(fd, Some(io::Error::other(e.to_string())));
                    return;
                }
                // Drain writes queued while connecting.
                self.flush_socket(fd);
            }
            Err(err) => {
                promise.complete(Err(io::Error::new(err.kind(), err.to_string())));
                self.close_channel(fd, Some(err));
            }
        }
    }

    // ── Failure / close ─────────────────────────────────────────────

    pub(crate) fn handle_failed(self: &Rc<LoopCore>, fd: RawFd) {
        let err = match socket_error(fd) {
            Ok(Some(err)) => err,
            Ok(None) => io::Error::other("socket failed"),
            Err(err) => err,
        };
        self.close_channel(fd, Some(err));
    }

    pub(crate) fn close_channel(&self, fd: RawFd, cause: Option<io::Error>) {
        self.close_channel_raw(fd, cause)
    }

    fn close_channel_raw(&self, fd: RawFd, cause: Option<io::Error>) {
        let channel = match self.channels.borrow_mut().remove(fd) {
            Some(c) => c,
            None => return,
        };
        let _ = self.reactor.borrow_mut().deregister(fd);
        match channel {
            Channel::Stream(mut entry) => {
                let shared = entry.socket.shared().clone();
                shared.closed.store(true, Ordering::Release);
                shared.registered.store(false, Ordering::Release);
                for buf in shared.pending.lock().unwrap().drain(..) {
                    buf.release();
                }
                shared.pending_bytes.store(0, Ordering::Release);
                let connect_in_flight = self.completion_model() && entry.connecting.is_some();
                if let Some(promise) = entry.connecting.take() {
                    promise.complete(Err(match &cause {
                        Some(err) => io::Error::new(err.kind(), err.to_string()),
                        None => io::Error::other("socket closed"),
                    }));
                }
                metrics::CONNECTIONS_ACTIVE.decrement();
                metrics::CONNECTIONS_CLOSED.increment();
                if let Some(mut h) = entry.handler.take() {
                    h.on_close(&entry.socket, cause.as_ref());
                }
                if let Some(listener) = shared.closed_listener.lock().unwrap().take() {
                    listener(cause);
                }

                let pending = entry.read_armed as u8
                    + entry.write_armed as u8
                    + connect_in_flight as u8;
                if self.completion_model() && pending > 0 {
                    // Kernel operations still reference the receive
                    // buffer, the iovec array or the sockaddr box. Park
                    // the entry until their cancelled completions drain.
                    let _ = self.reactor.borrow_mut().cancel_ops(fd);
                    self.channels.borrow_mut().insert(
                        fd,
                        Channel::Closing(ClosingChannel {
                            pending,
                            stream: Some(entry),
                            _listener: None,
                        }),
                    );
                } else {
                    for buf in entry.out.drain(..) {
                        buf.release();
                    }
                    unsafe { libc::close(fd) };
                }
            }
            Channel::Listener(entry) => {
                entry.server.shared.closed.store(true, Ordering::Release);
                entry.server.shared.registered.store(false, Ordering::Release);
                if entry.accept_armed {
                    let _ = self.reactor.borrow_mut().cancel_ops(fd);
                    self.channels.borrow_mut().insert(
                        fd,
                        Channel::Closing(ClosingChannel {
                            pending: 1,
                            stream: None,
                            _listener: Some(entry),
                        }),
                    );
                } else {
                    unsafe { libc::close(fd) };
                }
            }
            Channel::Closing(entry) => {
                // Already draining; put it back untouched.
                self.channels
                    .borrow_mut()
                    .insert(fd, Channel::Closing(entry));
            }
        }
    }

    /// Account one completion arriving for a closing channel. Returns
    /// false when the fd is not in the closing state.
    fn closing_op_done(&self, fd: RawFd, accepted_fd: Option<RawFd>) -> bool {
        let mut channels = self.channels.borrow_mut();
        let Some(Channel::Closing(entry)) = channels.get_mut(fd) else {
            return false;
        };
        if let Some(new_fd) = accepted_fd {
            // A connection raced the cancel; nobody will take it.
            unsafe { libc::close(new_fd) };
        }
        entry.pending = entry.pending.saturating_sub(1);
        if entry.pending == 0 {
            if let Some(Channel::Closing(mut done)) = channels.remove(fd) {
                if let Some(stream) = done.stream.as_mut() {
                    for buf in stream.out.drain(..) {
                        buf.release();
                    }
                }
                unsafe { libc::close(fd) };
            }
        }
        true
    }
}

fn set_nodelay(fd: RawFd, enable: bool) -> io::Result<()> {
    let optval: libc::c_int = if enable { 1 } else { 0 };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Pending SO_ERROR on the socket, consumed by reading it.
fn socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if err == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(err)))
    }
}
