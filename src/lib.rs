//! spindle: thread-per-core I/O and actor engine.
//!
//! spindle runs a partitioned, in-memory RPC core as a set of
//! single-threaded event loops, each pinned to a CPU, driving
//! non-blocking network I/O and partition-affine request dispatch with
//! refcounted zero-copy buffers.
//!
//! Three reactor backends are selected at construction: an io_uring
//! completion ring, an epoll readiness multiplexer, and a portable
//! selector. A parked loop wakes in microseconds on cross-thread submit
//! through the `wakeup_needed`/eventfd handshake.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use spindle::{AsyncServerSocket, AsyncSocket, ConfigBuilder, IoBuffer, ReactorKind,
//!               ReadHandler, TpcEngine, frame};
//!
//! struct Echo;
//!
//! impl ReadHandler for Echo {
//!     fn on_read(&mut self, socket: &AsyncSocket, buffer: &mut IoBuffer) {
//!         while let Ok(Some(request)) = frame::try_decode(buffer, 1 << 20) {
//!             let mut response = IoBuffer::with_capacity(64);
//!             frame::init_frame(&mut response, frame::call_id(&request));
//!             response.write_bytes(frame::payload(&request));
//!             frame::construct_complete(&mut response);
//!             socket.unsafe_write_and_flush(response);
//!         }
//!     }
//! }
//!
//! fn main() -> Result<(), spindle::Error> {
//!     let config = ConfigBuilder::new()
//!         .reactor(ReactorKind::Readiness)
//!         .eventloops(1)
//!         .build()?;
//!     let engine = TpcEngine::new(config)?;
//!     engine.start()?;
//!
//!     let eventloop = engine.eventloop(0).clone();
//!     let server = AsyncServerSocket::open(&eventloop);
//!     server.bind("127.0.0.1:6000".parse().unwrap())?;
//!     server.listen(1024)?;
//!     let accept_loop = eventloop.clone();
//!     server.accept(move |socket| {
//!         let _ = socket.tcp_no_delay(true);
//!         socket.read_handler(Echo);
//!         let _ = socket.activate(&accept_loop);
//!     })?;
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux-first. The completion-ring backend needs io_uring (5.6+), the
//! readiness backend needs epoll; the portable backend runs wherever the
//! `polling` crate does.

// ── Internal modules ────────────────────────────────────────────────
pub(crate) mod reactor;

// ── Public modules ──────────────────────────────────────────────────
pub mod actor;
pub mod config;
pub mod engine;
pub mod error;
pub mod eventloop;
pub mod frame;
pub mod iobuffer;
pub mod metrics;
pub mod scheduler;
pub mod socket;

// ── Re-exports: engine ──────────────────────────────────────────────

/// Engine configuration.
pub use config::Config;
/// Builder for [`Config`] with `build()` validation.
pub use config::ConfigBuilder;
/// Reactor backend selection.
pub use config::ReactorKind;
/// Process-wide handle owning the event loops.
pub use engine::TpcEngine;
/// Handle to one event loop.
pub use eventloop::EventLoop;
/// Loop lifecycle states (NEW → RUNNING → SHUTDOWN → TERMINATED).
pub use eventloop::LoopState;
/// Per-loop cooperative work hook.
pub use scheduler::Scheduler;

// ── Re-exports: sockets ─────────────────────────────────────────────

/// Listening socket bound to one loop.
pub use socket::AsyncServerSocket;
/// Connection-oriented byte duplex bound to one loop.
pub use socket::AsyncSocket;
/// Completion promise for [`AsyncSocket::connect`].
pub use socket::ConnectFuture;
/// Frame consumer installed on a socket.
pub use socket::ReadHandler;

// ── Re-exports: buffers ─────────────────────────────────────────────

/// Refcounted message carrier.
pub use iobuffer::IoBuffer;
/// Per-loop free-list buffer pool.
pub use iobuffer::IoBufferPool;

// ── Re-exports: actors ──────────────────────────────────────────────

/// Connection lookup for remote partition owners.
pub use actor::ConnectionRegistry;
/// Send primitive for one partition.
pub use actor::PartitionActorRef;
/// Partition-owner resolution.
pub use actor::PartitionDirectory;
/// Sockets to one peer node.
pub use actor::PeerConnection;
/// Completion promise for one request.
pub use actor::RequestFuture;
/// Bounded call-id correlation table.
pub use actor::Requests;

// ── Re-exports: errors ──────────────────────────────────────────────

/// Engine construction/control errors.
pub use error::Error;
/// Frame header violations.
pub use error::FrameError;
/// Request failure kinds.
pub use error::RequestError;
