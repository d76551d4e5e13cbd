//! Cooperative per-loop scheduler hook.

use crate::iobuffer::IoBuffer;

/// User work slice invoked once per loop iteration.
///
/// Implementations must not block: the whole core stalls while `tick` or
/// `schedule` run. Requests arrive through [`schedule`](Self::schedule)
/// in submission order per producer; `tick` returns `true` while more
/// work remains so the loop keeps the kernel fed instead of parking.
pub trait Scheduler: Send {
    /// Run one cooperative slice. Return `true` if more work remains.
    fn tick(&mut self) -> bool;

    /// Accept a request buffer routed to this loop via
    /// [`EventLoop::offer`](crate::EventLoop::offer).
    fn schedule(&mut self, request: IoBuffer);
}

/// Default scheduler: no work, offered requests are released.
pub struct NoopScheduler;

impl Scheduler for NoopScheduler {
    fn tick(&mut self) -> bool {
        false
    }

    fn schedule(&mut self, request: IoBuffer) {
        request.release();
    }
}
