use std::io;

use thiserror::Error;

/// Errors returned by the engine's construction and control surfaces.
#[derive(Debug, Error)]
pub enum Error {
    /// OS-level failure on a file descriptor or syscall.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Reactor backend setup failed (e.g. io_uring unavailable).
    #[error("reactor setup: {0}")]
    ReactorSetup(String),
    /// Configuration value out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The target event loop has been shut down; new work is rejected.
    #[error("event loop is shut down")]
    Shutdown,
    /// The socket was used before `activate()` bound it to a loop.
    #[error("socket is not activated")]
    NotActivated,
}

/// Failure kinds a [`RequestFuture`](crate::RequestFuture) can resolve to.
///
/// I/O failures are never thrown across loops; they surface here as the
/// future's error state.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Partition owner unknown, or it changed while the request was in
    /// flight. The caller retries against the refreshed directory.
    #[error("partition routing failed: {0}")]
    Routing(String),
    /// The remote socket closed with this request outstanding.
    #[error("connection lost")]
    ConnectionLost,
    /// The request deadline elapsed; the correlation slot was vacated.
    #[error("request timed out")]
    Timeout,
    /// The loop or engine is terminating; the request was rejected.
    #[error("engine is shutting down")]
    Shutdown,
    /// The bounded request table or the outbound byte budget is full.
    #[error("request capacity exhausted")]
    Capacity,
    /// The peer violated the frame contract.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Frame header violations detected by the decoder.
///
/// A frame error closes the offending socket; the embedding runtime fails
/// that socket's in-flight requests with [`RequestError::Protocol`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Declared size smaller than the fixed header.
    #[error("frame size {0} below header size")]
    SizeTooSmall(i32),
    /// Declared size above the configured maximum.
    #[error("frame size {0} exceeds limit {1}")]
    SizeTooLarge(i32, usize),
}

impl From<FrameError> for RequestError {
    fn from(e: FrameError) -> Self {
        RequestError::Protocol(e.to_string())
    }
}
