//! Partition-affine request dispatch.
//!
//! A [`PartitionActorRef`] routes request frames for one partition: local
//! owners receive them through the owning loop's `offer`, remote owners
//! over a stable socket of the peer connection. The [`Requests`] table
//! correlates call ids with [`RequestFuture`]s and guarantees at-most-once
//! completion; late replies for vacated slots are dropped.
//!
//! The partition-to-loop and partition-to-socket mappings use the same
//! stable hash, so all requests for a partition serialize on one loop of
//! the owning node and one socket of the connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::warn;

use crate::engine::TpcEngine;
use crate::error::RequestError;
use crate::eventloop::{EventLoop, LoopCore};
use crate::frame;
use crate::iobuffer::IoBuffer;
use crate::metrics;
use crate::socket::AsyncSocket;

/// Stable hash-to-index mapping shared by loop and socket selection.
pub fn hash_to_index(hash: i64, length: usize) -> usize {
    debug_assert!(length > 0, "hash_to_index on empty range");
    (hash.unsigned_abs() % length as u64) as usize
}

/// Resolves the current owner address of a partition. External
/// collaborator; the engine never caches its answers.
pub trait PartitionDirectory: Send + Sync {
    fn partition_owner(&self, partition_id: u32) -> Option<SocketAddr>;
}

/// Looks up the connection to a peer node. External collaborator.
pub trait ConnectionRegistry: Send + Sync {
    fn connection(&self, addr: SocketAddr) -> Option<Arc<PeerConnection>>;
}

/// The sockets connected to one peer. Requests for a partition always
/// pick the same socket while the array is unchanged; after a reconnect
/// resizes it, in-flight futures are failed rather than retried and the
/// caller resubmits.
pub struct PeerConnection {
    pub sockets: Vec<AsyncSocket>,
}

struct FutureState {
    slot: Mutex<Option<Result<IoBuffer, RequestError>>>,
    cv: Condvar,
}

impl FutureState {
    fn complete(&self, result: Result<IoBuffer, RequestError>) {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_none() {
            *slot = Some(result);
            self.cv.notify_all();
        }
    }
}

/// Completion promise for one submitted request.
pub struct RequestFuture {
    state: Arc<FutureState>,
}

impl RequestFuture {
    fn new() -> RequestFuture {
        RequestFuture {
            state: Arc::new(FutureState {
                slot: Mutex::new(None),
                cv: Condvar::new(),
            }),
        }
    }

    fn failed(err: RequestError) -> RequestFuture {
        let future = RequestFuture::new();
        future.state.complete(Err(err));
        future
    }

    pub fn is_done(&self) -> bool {
        self.state.slot.lock().unwrap().is_some()
    }

    /// Block until the response or failure arrives.
    pub fn join(self) -> Result<IoBuffer, RequestError> {
        let mut slot = self.state.slot.lock().unwrap();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            slot = self.state.cv.wait(slot).unwrap();
        }
    }

    /// Block until resolution or `timeout`; elapsing yields the timeout
    /// failure kind without vacating the slot.
    pub fn join_timeout(self, timeout: Duration) -> Result<IoBuffer, RequestError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.state.slot.lock().unwrap();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RequestError::Timeout);
            }
            let (guard, _) = self.state.cv.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
        }
    }
}

struct RequestSlot {
    state: Arc<FutureState>,
    /// Reference held for the response correlation; released when the
    /// slot is vacated.
    request: IoBuffer,
    socket_id: Option<u64>,
}

struct RequestsInner {
    slots: Mutex<HashMap<i64, RequestSlot>>,
    next_call_id: AtomicI64,
    capacity: usize,
    timeout: Option<Duration>,
}

/// Bounded client-side correlation table: call id → pending future.
#[derive(Clone)]
pub struct Requests {
    inner: Arc<RequestsInner>,
}

impl Requests {
    pub fn new(capacity: usize) -> Requests {
        Requests::build(capacity, None)
    }

    /// Requests registered here fail with the timeout kind once `timeout`
    /// elapses; the deadline fires as a timer task on the actor's loop.
    pub fn with_timeout(capacity: usize, timeout: Duration) -> Requests {
        Requests::build(capacity, Some(timeout))
    }

    fn build(capacity: usize, timeout: Option<Duration>) -> Requests {
        Requests {
            inner: Arc::new(RequestsInner {
                slots: Mutex::new(HashMap::new()),
                next_call_id: AtomicI64::new(1),
                capacity,
                timeout,
            }),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.slots.lock().unwrap().len()
    }

    /// Assign a call id, stamp it into the frame header, and insert the
    /// slot (which takes its own buffer reference).
    fn register(&self, request: &mut IoBuffer) -> Result<(i64, RequestFuture), RequestError> {
        let call_id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        frame::set_call_id(request, call_id);
        let future = RequestFuture::new();
        let mut slots = self.inner.slots.lock().unwrap();
        if slots.len() >= self.inner.capacity {
            return Err(RequestError::Capacity);
        }
        slots.insert(
            call_id,
            RequestSlot {
                state: future.state.clone(),
                request: request.acquire(),
                socket_id: None,
            },
        );
        Ok((call_id, future))
    }

    fn bind_socket(&self, call_id: i64, socket_id: u64) {
        if let Some(slot) = self.inner.slots.lock().unwrap().get_mut(&call_id) {
            slot.socket_id = Some(socket_id);
        }
    }

    /// Resolve a call with its response. Unknown ids are late replies
    /// whose slot was vacated; the response is dropped.
    pub fn complete(&self, call_id: i64, response: IoBuffer) {
        let slot = self.inner.slots.lock().unwrap().remove(&call_id);
        match slot {
            Some(slot) => {
                metrics::REQUESTS_COMPLETED.increment();
                slot.state.complete(Ok(response));
                slot.request.release();
            }
            None => {
                warn!("dropping reply for unknown call id {call_id}");
                response.release();
            }
        }
    }

    /// Fail a call, vacating its slot. A no-op when already resolved.
    pub fn fail(&self, call_id: i64, err: RequestError) {
        let slot = self.inner.slots.lock().unwrap().remove(&call_id);
        if let Some(slot) = slot {
            if err == RequestError::Timeout {
                metrics::REQUESTS_TIMED_OUT.increment();
            }
            slot.state.complete(Err(err));
            slot.request.release();
        }
    }

    /// Fail every in-flight request correlated to `socket_id` with the
    /// connection-lost kind. Wired from the socket's closed listener.
    pub fn fail_socket(&self, socket_id: u64) {
        let affected: Vec<RequestSlot> = {
            let mut slots = self.inner.slots.lock().unwrap();
            let ids: Vec<i64> = slots
                .iter()
                .filter(|(_, s)| s.socket_id == Some(socket_id))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| slots.remove(&id)).collect()
        };
        for slot in affected {
            slot.state.complete(Err(RequestError::ConnectionLost));
            slot.request.release();
        }
    }

    /// Fail everything outstanding with the shutdown kind.
    pub fn fail_all(&self) {
        let drained: Vec<RequestSlot> = {
            let mut slots = self.inner.slots.lock().unwrap();
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            slot.state.complete(Err(RequestError::Shutdown));
            slot.request.release();
        }
    }
}

/// Send primitive for one partition: routes request frames to the
/// owner's executor and correlates the responses.
pub struct PartitionActorRef {
    partition_id: u32,
    directory: Arc<dyn PartitionDirectory>,
    registry: Arc<dyn ConnectionRegistry>,
    self_addr: SocketAddr,
    requests: Requests,
    eventloop: EventLoop,
}

impl PartitionActorRef {
    /// The home loop is fixed at construction: `hash(partition) mod E`.
    pub fn new(
        partition_id: u32,
        directory: Arc<dyn PartitionDirectory>,
        engine: &TpcEngine,
        registry: Arc<dyn ConnectionRegistry>,
        self_addr: SocketAddr,
        requests: Requests,
    ) -> PartitionActorRef {
        let index = hash_to_index(partition_id as i64, engine.eventloop_count());
        PartitionActorRef {
            partition_id,
            directory,
            registry,
            self_addr,
            requests,
            eventloop: engine.eventloop(index).clone(),
        }
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// Loop this partition's requests serialize on.
    pub fn eventloop(&self) -> &EventLoop {
        &self.eventloop
    }

    /// Submit a completed request frame. Never fails directly: routing,
    /// capacity and shutdown problems resolve the returned future.
    pub fn submit(&self, mut request: IoBuffer) -> RequestFuture {
        let (call_id, future) = match self.requests.register(&mut request) {
            Ok(v) => v,
            Err(err) => return RequestFuture::failed(err),
        };

        match self.directory.partition_owner(self.partition_id) {
            None => {
                self.requests
                    .fail(call_id, RequestError::Routing("partition owner unknown".into()));
            }
            Some(owner) if owner == self.self_addr => {
                if self.eventloop.offer(request).is_err() {
                    self.requests.fail(call_id, RequestError::Shutdown);
                }
            }
            Some(owner) => match self.registry.connection(owner) {
                Some(conn) if !conn.sockets.is_empty() => {
                    let socket =
                        &conn.sockets[hash_to_index(self.partition_id as i64, conn.sockets.len())];
                    self.requests.bind_socket(call_id, socket.id());
                    // The socket consumes this reference once written; the
                    // slot keeps its own for the response correlation.
                    if !socket.write_and_flush(request) {
                        let err = if socket.is_closed() {
                            RequestError::ConnectionLost
                        } else {
                            RequestError::Capacity
                        };
                        self.requests.fail(call_id, err);
                    }
                }
                _ => {
                    self.requests.fail(
                        call_id,
                        RequestError::Routing(format!("no connection to {owner}")),
                    );
                }
            },
        }

        if let Some(timeout) = self.requests.inner.timeout {
            let deadline = Instant::now() + timeout;
            let requests = self.requests.clone();
            let _ = self.eventloop.submit(Box::new(move |core: &LoopCore| {
                core.schedule_local(
                    deadline,
                    Box::new(move |_core| requests.fail(call_id, RequestError::Timeout)),
                );
            }));
        }

        future
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed_frame(payload: i64) -> IoBuffer {
        let mut buf = IoBuffer::with_capacity(64);
        frame::init_frame(&mut buf, 0);
        buf.write_i64(payload);
        frame::construct_complete(&mut buf);
        buf
    }

    #[test]
    fn hash_is_stable_and_in_range() {
        for len in 1..8usize {
            for id in 0..100i64 {
                let a = hash_to_index(id, len);
                assert_eq!(a, hash_to_index(id, len));
                assert!(a < len);
            }
        }
        assert_eq!(hash_to_index(-7, 4), hash_to_index(7, 4));
    }

    #[test]
    fn complete_resolves_future_once() {
        let requests = Requests::new(16);
        let mut request = completed_frame(1);
        let (call_id, future) = requests.register(&mut request).unwrap();
        assert_eq!(requests.outstanding(), 1);

        requests.complete(call_id, completed_frame(2));
        // Second completion hits a vacated slot and is dropped.
        requests.complete(call_id, completed_frame(3));
        assert_eq!(requests.outstanding(), 0);

        let response = future.join().unwrap();
        assert_eq!(response.get_i64(frame::HEADER_BYTES), 2);
        assert_eq!(request.refs(), 1, "slot reference released");
        request.release();
    }

    #[test]
    fn late_reply_after_failure_is_dropped() {
        let requests = Requests::new(16);
        let mut request = completed_frame(1);
        let (call_id, future) = requests.register(&mut request).unwrap();
        requests.fail(call_id, RequestError::Timeout);
        assert_eq!(future.join(), Err(RequestError::Timeout));

        let response = completed_frame(9);
        requests.complete(call_id, response);
        assert_eq!(requests.outstanding(), 0);
    }

    #[test]
    fn capacity_bound_rejects() {
        let requests = Requests::new(1);
        let mut first = completed_frame(1);
        let _held = requests.register(&mut first).unwrap();
        let mut second = completed_frame(2);
        assert!(matches!(
            requests.register(&mut second),
            Err(RequestError::Capacity)
        ));
    }

    #[test]
    fn fail_socket_hits_only_bound_slots() {
        let requests = Requests::new(16);
        let mut a = completed_frame(1);
        let (id_a, fut_a) = requests.register(&mut a).unwrap();
        let mut b = completed_frame(2);
        let (_id_b, fut_b) = requests.register(&mut b).unwrap();
        requests.bind_socket(id_a, 77);

        requests.fail_socket(77);
        assert_eq!(fut_a.join(), Err(RequestError::ConnectionLost));
        assert!(!fut_b.is_done());
        assert_eq!(requests.outstanding(), 1);
    }

    #[test]
    fn fail_all_reports_shutdown() {
        let requests = Requests::new(16);
        let mut a = completed_frame(1);
        let (_, fut) = requests.register(&mut a).unwrap();
        requests.fail_all();
        assert_eq!(fut.join(), Err(RequestError::Shutdown));
        assert_eq!(a.refs(), 1);
    }

    #[test]
    fn register_stamps_distinct_call_ids() {
        let requests = Requests::new(16);
        let mut a = completed_frame(1);
        let (id_a, _fa) = requests.register(&mut a).unwrap();
        let mut b = completed_frame(2);
        let (id_b, _fb) = requests.register(&mut b).unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(frame::call_id(&a), id_a);
        assert_eq!(frame::call_id(&b), id_b);
        assert!(id_a > 0 && id_b > 0);
    }
}
